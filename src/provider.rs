//! # Connection Providers
//!
//! The message store never opens database files itself. It is handed a
//! [`ConnectionProvider`], which owns the SQLite connection and decides how
//! transactions are run. The store keeps the provider behind its own lock, so
//! a provider only needs to be `Send`.
//!
//! ## Transaction Boundary
//!
//! ```text
//! with_connection(f)
//!   │
//!   ├── BEGIN
//!   ├── f(&tx) ──── Ok(v) ──► COMMIT ──► Ok(v)
//!   │          └─── Err(e) ─► ROLLBACK ─► Err(e)
//! ```
//!
//! A crash between a statement and its commit leaves the row absent or in its
//! previous state, never partially written.

use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, Transaction};
use tracing::debug;

use crate::config::ProviderOptions;
use crate::error::Result;

// =============================================================================
// Provider Trait
// =============================================================================

/// Supplies connections with transactional semantics to a message store.
///
/// Implementations can be swapped at runtime with
/// [`MessageStore::rebind`](crate::MessageStore::rebind).
pub trait ConnectionProvider: Send + 'static {
    /// Runs `f` inside a transaction. Commits when `f` returns `Ok`, rolls
    /// back otherwise.
    fn with_connection<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>;

    /// Runs `f` on the connection in autocommit mode.
    ///
    /// Meant for pragmas, checkpoints and diagnostics.
    fn with_plain_connection<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>;

    /// Forces the engine to flush its log into the main database file.
    fn checkpoint(&mut self) -> Result<()> {
        self.with_plain_connection(|conn| {
            // Returns (busy, log, checkpointed); outside WAL mode it is a no-op.
            conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
            Ok(())
        })
    }
}

// =============================================================================
// SQLite Provider
// =============================================================================

/// A provider that owns a single SQLite connection.
#[derive(Debug)]
pub struct SqliteProvider {
    conn: Connection,
}

impl SqliteProvider {
    /// Opens a database file, creating it if necessary.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use outboxdb::{ProviderOptions, SqliteProvider};
    ///
    /// let provider = SqliteProvider::open("outbox.db", &ProviderOptions::default())?;
    /// # Ok::<(), outboxdb::Error>(())
    /// ```
    pub fn open(path: impl AsRef<Path>, options: &ProviderOptions) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.busy_timeout(Duration::from_millis(options.busy_timeout_ms))?;

        // journal_mode returns the resulting mode as a row.
        let mode: String = conn.query_row(
            &format!("PRAGMA journal_mode = {}", options.journal_mode.pragma_value()),
            [],
            |row| row.get(0),
        )?;
        conn.execute_batch(&format!(
            "PRAGMA synchronous = {}",
            options.sync_mode.pragma_value()
        ))?;

        debug!(path = %path.as_ref().display(), journal_mode = %mode, "opened sqlite provider");
        Ok(Self { conn })
    }

    /// Creates a provider backed by a private in-memory database.
    ///
    /// The data is lost when the provider is dropped.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self { conn })
    }

    /// Wraps an already opened connection.
    pub fn from_connection(conn: Connection) -> Self {
        Self { conn }
    }

    /// Consumes the provider and returns the connection.
    pub fn into_connection(self) -> Connection {
        self.conn
    }
}

impl ConnectionProvider for SqliteProvider {
    fn with_connection<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let tx = self.conn.transaction()?;
        // Dropping `tx` without commit rolls it back.
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    fn with_plain_connection<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        f(&self.conn)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    fn provider_with_table() -> SqliteProvider {
        let mut provider = SqliteProvider::open_in_memory().unwrap();
        provider
            .with_plain_connection(|c| {
                c.execute_batch("CREATE TABLE t (v INTEGER NOT NULL)")?;
                Ok(())
            })
            .unwrap();
        provider
    }

    fn count(provider: &mut SqliteProvider) -> i64 {
        provider
            .with_plain_connection(|c| Ok(c.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0))?))
            .unwrap()
    }

    #[test]
    fn test_commit_on_ok() {
        let mut provider = provider_with_table();
        provider
            .with_connection(|tx| {
                tx.execute("INSERT INTO t (v) VALUES (1)", [])?;
                Ok(())
            })
            .unwrap();
        assert_eq!(count(&mut provider), 1);
    }

    #[test]
    fn test_rollback_on_err() {
        let mut provider = provider_with_table();
        let result: Result<()> = provider.with_connection(|tx| {
            tx.execute("INSERT INTO t (v) VALUES (1)", [])?;
            Err(Error::Config("boom".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(count(&mut provider), 0);
    }

    #[test]
    fn test_open_file_applies_journal_mode() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("provider.db");

        let mut provider = SqliteProvider::open(&path, &ProviderOptions::default()).unwrap();
        let mode: String = provider
            .with_plain_connection(|c| Ok(c.query_row("PRAGMA journal_mode", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");

        provider.checkpoint().unwrap();
    }

    #[test]
    fn test_checkpoint_in_memory_is_noop() {
        let mut provider = SqliteProvider::open_in_memory().unwrap();
        provider.checkpoint().unwrap();
    }
}
