//! # Error Handling for OutboxDB
//!
//! This module defines the error types used throughout OutboxDB. A single
//! error enum ([`Error`]) represents every failure mode of the message store,
//! which keeps function signatures short and lets callers match on the cases
//! they care about.
//!
//! ## Error Categories
//!
//! | Category | Variant | Typical Response |
//! |----------|---------|------------------|
//! | Caller input | [`Error::Validation`] | Fix the call, never retry |
//! | Admission | [`Error::CapacityExceeded`] | Drop, block, or escalate |
//! | Lifecycle | [`Error::StoreUnavailable`] | Start or rebind the store |
//! | Engine | [`Error::Storage`], [`Error::SequenceExhausted`] | Log and investigate |
//! | Maintenance | [`Error::Repair`] | Table unchanged, retry later |
//! | Setup | [`Error::Config`] | Fix configuration |

use thiserror::Error;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in OutboxDB operations.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Caller Errors (never retried)
    // =========================================================================

    /// A required field is empty or an identifier is malformed.
    ///
    /// # When This Happens
    ///
    /// - `store()` called with an empty or whitespace-only topic
    /// - A collection name containing characters outside `[A-Za-z0-9_]`
    #[error("invalid {field}: {reason}")]
    Validation {
        /// Name of the offending field.
        field: &'static str,
        /// Human readable description of the problem.
        reason: String,
    },

    /// The store is full and the message is not reserved control traffic.
    ///
    /// Priorities 0 and 1 bypass this check, so lifecycle messages (birth and
    /// death certificates) can always be queued.
    #[error("store capacity exceeded: {count} messages stored, capacity is {capacity}")]
    CapacityExceeded {
        /// The configured capacity.
        capacity: u32,
        /// Row count observed by the admission check.
        count: u64,
    },

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================

    /// No connection provider is attached.
    ///
    /// Returned when the store has not been started yet, or has been stopped.
    #[error("message store '{collection}' is not attached to a connection provider")]
    StoreUnavailable {
        /// The collection the call was made against.
        collection: String,
    },

    // =========================================================================
    // Engine Errors
    // =========================================================================

    /// SQLite operation failed.
    ///
    /// Wraps any error from `rusqlite`: I/O failures, locked database files,
    /// constraint violations, corruption.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// The identity generator has no ids left below its limit.
    ///
    /// The store catches this once per insert, resets the generator and
    /// retries. It only reaches callers when the retry fails too.
    #[error("identity generator for '{collection}' exhausted (limit {limit})")]
    SequenceExhausted {
        /// The collection whose generator overflowed.
        collection: String,
        /// The largest id the generator may hand out.
        limit: i64,
    },

    // =========================================================================
    // Maintenance Errors
    // =========================================================================

    /// A step of the repair sequence failed.
    ///
    /// The repair transaction is rolled back, so the table is left exactly as
    /// it was before the repair started.
    #[error("repair failed at step '{step}': {source}")]
    Repair {
        /// The step that failed.
        step: &'static str,
        /// The underlying engine error.
        #[source]
        source: rusqlite::Error,
    },

    // =========================================================================
    // Setup Errors
    // =========================================================================

    /// Invalid configuration value, or a failure to start background work.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Shorthand for building a [`Error::Validation`].
    pub(crate) fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Error::Validation {
            field,
            reason: reason.into(),
        }
    }

    /// Returns true for errors produced by caller input rather than the engine.
    pub fn is_caller_error(&self) -> bool {
        matches!(self, Error::Validation { .. } | Error::CapacityExceeded { .. })
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
