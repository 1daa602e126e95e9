//! # Identity Generation
//!
//! Message ids come from a per-collection counter in `outboxdb_sequences`,
//! advanced inside the same transaction as the insert that consumes the id.
//! A rolled back insert therefore also rolls back its id.
//!
//! ```text
//! outboxdb_sequences
//! ┌──────────────┬─────────────┐
//! │ name         │ seq         │
//! ├──────────────┼─────────────┤
//! │ ds_messages  │ 41          │  ← last id handed out
//! └──────────────┴─────────────┘
//! ```
//!
//! The counter is bounded by [`MAX_MESSAGE_ID`]. Asking for an id past the
//! bound fails with [`Error::SequenceExhausted`]; the store then calls
//! [`reset`] and retries once. After a reset, ids still held by stored rows are
//! skipped, so an id is never handed out twice while its row exists.

use rusqlite::{Connection, OptionalExtension};
use tracing::warn;

use crate::error::{Error, Result};
use crate::schema::{MessageTable, SEQUENCES_TABLE};
use crate::types::MessageId;

/// Largest id the generator hands out (32-bit signed identity).
pub const MAX_MESSAGE_ID: i64 = i32::MAX as i64;

/// Reserves the next free id for `table`.
///
/// Must run inside the transaction that inserts the row.
///
/// # Errors
///
/// `Error::SequenceExhausted` if no id at or below `limit` is free.
pub(crate) fn next_id(conn: &Connection, table: &MessageTable, limit: i64) -> Result<MessageId> {
    let name = table.name.as_str();
    let mut candidate = current(conn, table)?;

    loop {
        candidate += 1;
        if candidate > limit {
            return Err(Error::SequenceExhausted {
                collection: name.to_string(),
                limit,
            });
        }

        let taken: bool = conn.query_row(&table.id_exists, [candidate], |row| row.get(0))?;
        if !taken {
            break;
        }
    }

    conn.execute(
        &format!("UPDATE {SEQUENCES_TABLE} SET seq = ?1 WHERE name = ?2"),
        rusqlite::params![candidate, name],
    )?;

    Ok(MessageId::from_raw(candidate))
}

/// Restarts the generator so the next id is 1 (or the first free id above it).
pub(crate) fn reset(conn: &Connection, table: &MessageTable) -> Result<()> {
    warn!(collection = %table.name, "resetting message id sequence");
    conn.execute(
        &format!("UPDATE {SEQUENCES_TABLE} SET seq = 0 WHERE name = ?1"),
        [table.name.as_str()],
    )?;
    Ok(())
}

/// Returns the last id handed out, or 0 if none has been.
pub(crate) fn current(conn: &Connection, table: &MessageTable) -> Result<i64> {
    let seq: Option<i64> = conn
        .query_row(
            &format!("SELECT seq FROM {SEQUENCES_TABLE} WHERE name = ?1"),
            [table.name.as_str()],
            |row| row.get(0),
        )
        .optional()?;

    match seq {
        Some(seq) => Ok(seq),
        None => {
            conn.execute(
                &format!("INSERT INTO {SEQUENCES_TABLE} (name, seq) VALUES (?1, 0)"),
                [table.name.as_str()],
            )?;
            Ok(0)
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ensure_schema, CollectionName};

    fn setup() -> (Connection, MessageTable) {
        let conn = Connection::open_in_memory().unwrap();
        let table = MessageTable::new(CollectionName::new("seq_test").unwrap());
        ensure_schema(&conn, &table).unwrap();
        (conn, table)
    }

    fn insert_row(conn: &Connection, table: &MessageTable, id: i64) {
        conn.execute(
            &table.insert,
            rusqlite::params![id, "t", 0, false, 7, 0, None::<Vec<u8>>],
        )
        .unwrap();
    }

    #[test]
    fn test_ids_are_sequential() {
        let (conn, table) = setup();
        let ids: Vec<i64> = (0..3)
            .map(|_| next_id(&conn, &table, MAX_MESSAGE_ID).unwrap().as_raw())
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(current(&conn, &table).unwrap(), 3);
    }

    #[test]
    fn test_exhaustion_at_limit() {
        let (conn, table) = setup();
        assert_eq!(next_id(&conn, &table, 2).unwrap().as_raw(), 1);
        assert_eq!(next_id(&conn, &table, 2).unwrap().as_raw(), 2);

        let result = next_id(&conn, &table, 2);
        assert!(matches!(
            result,
            Err(Error::SequenceExhausted { limit: 2, .. })
        ));
        // Failed request leaves the counter untouched.
        assert_eq!(current(&conn, &table).unwrap(), 2);
    }

    #[test]
    fn test_reset_skips_stored_ids() {
        let (conn, table) = setup();
        for _ in 0..3 {
            let id = next_id(&conn, &table, MAX_MESSAGE_ID).unwrap();
            insert_row(&conn, &table, id.as_raw());
        }
        // Row 2 has been purged; 1 and 3 remain.
        conn.execute("DELETE FROM \"seq_test\" WHERE id = 2", []).unwrap();

        reset(&conn, &table).unwrap();

        assert_eq!(next_id(&conn, &table, MAX_MESSAGE_ID).unwrap().as_raw(), 2);
        assert_eq!(next_id(&conn, &table, MAX_MESSAGE_ID).unwrap().as_raw(), 4);
    }

    #[test]
    fn test_missing_sequence_row_is_recreated() {
        let (conn, table) = setup();
        conn.execute("DELETE FROM outboxdb_sequences", []).unwrap();
        assert_eq!(next_id(&conn, &table, MAX_MESSAGE_ID).unwrap().as_raw(), 1);
    }
}
