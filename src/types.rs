//! # Domain Types for OutboxDB
//!
//! This module defines the types that model an outbound message and its
//! delivery lifecycle.
//!
//! ## Design Philosophy: Newtypes for Safety
//!
//! Ids, priorities, QoS levels and timestamps are all integers on disk. Wrapping
//! each one in its own type keeps them from being mixed up at call sites:
//!
//! ```rust
//! use outboxdb::types::{MessageId, Priority, Qos};
//!
//! fn example(id: MessageId, priority: Priority, qos: Qos) {
//!     // id == priority  // Won't compile
//! }
//! ```
//!
//! ## Lifecycle
//!
//! ```text
//!              mark_as_published           mark_as_confirmed (qos > 0)
//! Unpublished ──────────────────► Published ─────────────────────────► Confirmed
//!      ▲                          Unconfirmed
//!      │ unpublish_all_in_flight      │
//!      └──────────────────────────────┤ drop_all_in_flight (qos > 0)
//!                                     ▼
//!                                  Dropped
//! ```
//!
//! `Confirmed`, `Dropped`, and published `qos = 0` rows are purged by the
//! housekeeper once older than the purge age.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

// =============================================================================
// Message Identity
// =============================================================================

/// Store-assigned identifier of a message.
///
/// Ids are unique among the rows currently stored. The generator can be reset
/// after it reaches its limit, so an id may be reused once the row that held
/// it has been purged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageId(i64);

impl MessageId {
    /// Creates an id from its raw database value.
    pub const fn from_raw(raw: i64) -> Self {
        Self(raw)
    }

    /// Returns the raw database value.
    pub const fn as_raw(self) -> i64 {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Priority
// =============================================================================

/// Publishing priority of a message. Lower value means higher priority.
///
/// # Reserved Priorities
///
/// - `0` ([`Priority::LIFECYCLE`]): birth and death certificates
/// - `1` ([`Priority::CONTROL`]): remote management replies
///
/// Messages at a reserved priority bypass the capacity guard, so the gateway
/// can always announce itself even when the store is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(i32);

impl Priority {
    /// Lifecycle traffic (birth/death certificates).
    pub const LIFECYCLE: Priority = Priority(0);

    /// Remote management traffic.
    pub const CONTROL: Priority = Priority(1);

    /// Creates a priority from its raw value.
    pub const fn new(raw: i32) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    pub const fn as_raw(self) -> i32 {
        self.0
    }

    /// Returns true if this priority bypasses the capacity guard.
    pub const fn is_reserved(self) -> bool {
        self.0 == Self::LIFECYCLE.0 || self.0 == Self::CONTROL.0
    }
}

impl From<i32> for Priority {
    fn from(raw: i32) -> Self {
        Self(raw)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Quality of Service
// =============================================================================

/// Delivery guarantee level.
///
/// `0` is fire-and-forget. Anything above zero requires an explicit
/// confirmation from the broker before the message may be purged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Qos(u8);

impl Qos {
    /// At most once.
    pub const AT_MOST_ONCE: Qos = Qos(0);

    /// At least once.
    pub const AT_LEAST_ONCE: Qos = Qos(1);

    /// Exactly once.
    pub const EXACTLY_ONCE: Qos = Qos(2);

    /// Creates a QoS level from its raw value.
    pub const fn new(raw: u8) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    pub const fn as_raw(self) -> u8 {
        self.0
    }

    /// Returns true when the broker must confirm delivery.
    pub const fn requires_confirmation(self) -> bool {
        self.0 > 0
    }
}

impl From<u8> for Qos {
    fn from(raw: u8) -> Self {
        Self(raw)
    }
}

// =============================================================================
// Timestamps
// =============================================================================

/// A UTC instant with millisecond precision, stored as an INTEGER column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Returns the current wall-clock time.
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Self(millis)
    }

    /// Creates a timestamp from milliseconds since the Unix epoch.
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Returns milliseconds since the Unix epoch.
    pub const fn as_millis(self) -> i64 {
        self.0
    }

    /// Returns the instant `age` before this one, saturating at the epoch.
    pub fn saturating_sub(self, age: Duration) -> Self {
        let age_ms = i64::try_from(age.as_millis()).unwrap_or(i64::MAX);
        Self(self.0.saturating_sub(age_ms).max(0))
    }

    /// Returns how long ago this instant was, or zero if it lies in the future.
    pub fn elapsed(self) -> Duration {
        let diff = Self::now().0.saturating_sub(self.0);
        Duration::from_millis(diff.max(0) as u64)
    }
}

impl From<Timestamp> for SystemTime {
    fn from(ts: Timestamp) -> Self {
        UNIX_EPOCH + Duration::from_millis(ts.0.max(0) as u64)
    }
}

// =============================================================================
// Data Transport Token
// =============================================================================

/// Correlates a stored message with its in-flight representation on the
/// transport (e.g. an MQTT packet id within a client session).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DataTransportToken {
    /// Transport-level message id.
    pub message_id: i32,
    /// Transport session the message was sent on.
    pub session_id: String,
}

impl DataTransportToken {
    /// Creates a new token.
    pub fn new(message_id: i32, session_id: impl Into<String>) -> Self {
        Self {
            message_id,
            session_id: session_id.into(),
        }
    }
}

// =============================================================================
// Stored Message
// =============================================================================

/// Delivery state of a stored message, derived from its timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageState {
    /// Queued, not yet handed to the transport.
    Unpublished,
    /// Handed to the transport. Terminal for `qos = 0`.
    PublishedUnconfirmed,
    /// Delivery confirmed by the broker.
    Confirmed,
    /// In-flight message abandoned on disconnect.
    Dropped,
}

impl MessageState {
    /// Returns a short lowercase name, used in log lines.
    pub fn name(&self) -> &'static str {
        match self {
            MessageState::Unpublished => "unpublished",
            MessageState::PublishedUnconfirmed => "published",
            MessageState::Confirmed => "confirmed",
            MessageState::Dropped => "dropped",
        }
    }
}

/// One row of the message store.
///
/// List queries return metadata only: `payload` is `None` for rows obtained
/// from [`get_unpublished_messages`](crate::MessageStore::get_unpublished_messages)
/// and friends, regardless of what is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: MessageId,
    pub topic: String,
    pub payload: Option<Vec<u8>>,
    pub qos: Qos,
    pub retain: bool,
    pub priority: Priority,
    pub created_on: Timestamp,
    pub published_on: Option<Timestamp>,
    pub confirmed_on: Option<Timestamp>,
    pub dropped_on: Option<Timestamp>,
    pub transport_token: Option<DataTransportToken>,
}

impl StoredMessage {
    /// Derives the lifecycle state from the row's timestamps.
    pub fn state(&self) -> MessageState {
        if self.dropped_on.is_some() {
            MessageState::Dropped
        } else if self.confirmed_on.is_some() {
            MessageState::Confirmed
        } else if self.published_on.is_some() {
            MessageState::PublishedUnconfirmed
        } else {
            MessageState::Unpublished
        }
    }

    /// Returns true for a published, unconfirmed, not dropped `qos > 0` message.
    pub fn is_in_flight(&self) -> bool {
        self.qos.requires_confirmation() && self.state() == MessageState::PublishedUnconfirmed
    }
}

// =============================================================================
// Tests
// =============================================================================
