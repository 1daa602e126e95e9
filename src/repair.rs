//! # Duplicate-Id Repair
//!
//! An abnormal shutdown of the backing engine can leave a collection with more
//! than one row per id. Once that happens the unique index cannot be rebuilt
//! and every later insert risks a constraint violation.
//!
//! ## Repair Sequence
//!
//! ```text
//! BEGIN
//!   count ids with more than one row ── 0 ──► COMMIT (no-op)
//!   │ n > 0
//!   ├── DROP INDEX <collection>_pk
//!   ├── DELETE every row but the first inserted one per id
//!   ├── CREATE UNIQUE INDEX <collection>_pk
//! COMMIT
//! checkpoint
//! ```
//!
//! The first four steps share one transaction: if any fails, the rollback
//! leaves the table exactly as it was. SQLite refuses to checkpoint inside a
//! transaction, so the flush runs right after the commit.

use rusqlite::Connection;
use tracing::info;

use crate::error::{Error, Result};
use crate::schema::MessageTable;

/// What a repair run found and removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairReport {
    /// Number of ids that had more than one row.
    pub duplicate_ids: u64,
    /// Number of rows deleted.
    pub rows_removed: u64,
}

impl RepairReport {
    /// Returns true if the table was already consistent.
    pub fn is_clean(&self) -> bool {
        self.duplicate_ids == 0
    }
}

/// Wraps a failed step into [`Error::Repair`].
fn step<T>(name: &'static str, result: rusqlite::Result<T>) -> Result<T> {
    result.map_err(|source| Error::Repair { step: name, source })
}

/// Removes duplicate-id rows and rebuilds the unique index.
///
/// Must run inside a transaction; the caller checkpoints after the commit when
/// the report is not clean.
pub(crate) fn deduplicate(conn: &Connection, table: &MessageTable) -> Result<RepairReport> {
    let duplicate_ids: i64 = step(
        "count duplicates",
        conn.query_row(&table.duplicate_count, [], |row| row.get(0)),
    )?;

    if duplicate_ids == 0 {
        return Ok(RepairReport::default());
    }

    info!(
        collection = %table.name,
        duplicate_ids,
        "duplicate message ids found, repairing"
    );

    step("drop primary key", conn.execute_batch(&table.drop_pk_index))?;
    let rows_removed = step(
        "delete duplicates",
        conn.execute(&table.delete_duplicates, []),
    )?;
    step(
        "recreate primary key",
        conn.execute_batch(&table.create_pk_index),
    )?;

    info!(collection = %table.name, rows_removed, "duplicate rows removed");

    Ok(RepairReport {
        duplicate_ids: duplicate_ids as u64,
        rows_removed: rows_removed as u64,
    })
}

// =============================================================================
// Tests
// =============================================================================
