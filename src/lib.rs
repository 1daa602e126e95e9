//! # OutboxDB - Durable Outbound Message Store
//!
//! OutboxDB buffers messages an edge gateway wants to publish until the remote
//! broker has them. It is built on SQLite and provides:
//!
//! - **Priority ordering**: the next message to publish is always the most
//!   urgent, oldest one
//! - **QoS-aware lifecycle**: published, confirmed, dropped and requeued states
//! - **Capacity bound**: admission control that never blocks lifecycle traffic
//! - **Crash tolerance**: transactional writes, identity recovery, and repair of
//!   duplicate ids left by an abnormal shutdown
//! - **Background housekeeping**: periodic purge of delivered messages
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                 Publish/subscribe client                        │
//! │   store · get_next_message · mark_as_* · *_all_in_flight        │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │  (one lock per store)
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       MessageStore                              │
//! │                                                                 │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────────┐ │
//! │  │  Capacity   │  │  Identity   │  │  Housekeeper thread     │ │
//! │  │   guard     │  │  sequence   │  │  (purge/repair/flush)   │ │
//! │  └─────────────┘  └─────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │  ConnectionProvider
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         SQLite                                  │
//! │                   (durable storage)                             │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Confirmation implies publication**: `confirmed_on` is never set on an
//!    unpublished row
//! 2. **Only in-flight rows drop**: `dropped_on` is set only on published,
//!    unconfirmed, `qos > 0` rows
//! 3. **Bounded size**: the row count never exceeds capacity, except through
//!    priorities 0 and 1
//! 4. **Unique ids**: no two stored rows share an id, even after the id
//!    sequence has been reset
//!
//! ## Module Organization
//!
//! - [`error`]: Error type for all failure modes
//! - [`types`]: Domain types (MessageId, Priority, Qos, StoredMessage)
//! - [`config`]: Store and connection configuration
//! - [`provider`]: Connection providers with transactional semantics
//! - [`schema`]: SQLite DDL and collection name validation
//! - [`repair`]: Duplicate-id repair
//! - [`housekeeper`]: Background maintenance thread
//! - [`store`]: The message store (main entry point)

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types for OutboxDB operations.
pub mod error;

/// Domain types for outbound messages.
///
/// Uses the newtype pattern so ids, priorities and QoS levels can't be mixed up.
pub mod types;

/// Configuration surface of the store and the SQLite provider.
pub mod config;

/// Connection providers.
///
/// The store never opens files itself; a provider owns the connection and
/// runs callbacks inside transactions.
pub mod provider;

/// SQLite schema definitions and collection name validation.
pub mod schema;

/// Resettable identity generator.
mod sequence;

/// Duplicate-id detection and repair.
pub mod repair;

/// Background housekeeping thread.
pub mod housekeeper;

/// The message store.
///
/// The main entry point is [`MessageStore`](store::MessageStore).
pub mod store;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::{JournalMode, ProviderOptions, StoreConfig, SyncMode};
pub use error::{Error, Result};
pub use housekeeper::HousekeeperState;
pub use provider::{ConnectionProvider, SqliteProvider};
pub use repair::RepairReport;
pub use schema::CollectionName;
pub use sequence::MAX_MESSAGE_ID;
pub use store::{MessageStore, PurgeReport};

pub use types::{
    DataTransportToken, MessageId, MessageState, Priority, Qos, StoredMessage, Timestamp,
};
