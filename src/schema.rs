//! # SQLite Schema for OutboxDB
//!
//! This module defines the on-disk layout of a message collection and creates
//! it idempotently. Every collection is one table plus five indexes:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │ <collection>                                                         │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │ id  topic  qos  retain  priority  created_on  published_on           │
//! │ published_message_id  session_id  confirmed_on  dropped_on  payload  │
//! └──────────────────────────────────────────────────────────────────────┘
//!   <collection>_pk            UNIQUE (id)
//!   <collection>_next_msg      (published_on, priority, created_on, qos)
//!   <collection>_published_on  (published_on DESC)
//!   <collection>_confirmed_on  (confirmed_on DESC)
//!   <collection>_dropped_on    (dropped_on DESC)
//!
//! outboxdb_sequences   (name PK, seq)       identity generator per collection
//! outboxdb_metadata    (key PK, value)      schema version
//! ```
//!
//! ## Why is `id` not the rowid?
//!
//! An `INTEGER PRIMARY KEY` column aliases SQLite's rowid and can never hold
//! duplicates, but it also cannot be dropped and recreated. Uniqueness lives in
//! the named `<collection>_pk` index instead, which the repair routine can
//! drop, deduplicate under, and rebuild.
//!
//! ## Identifier Safety
//!
//! The collection name comes from configuration and ends up inside DDL, which
//! cannot use bound parameters. [`CollectionName`] accepts only
//! `[A-Za-z_][A-Za-z0-9_]*` and every interpolation is double-quoted on top of
//! that. All values go through bound parameters.

use std::fmt;

use rusqlite::Connection;
use tracing::{debug, warn};

use crate::error::{Error, Result};

// =============================================================================
// Schema Version
// =============================================================================

/// Current schema version. Increment when making breaking schema changes.
const SCHEMA_VERSION: i32 = 1;

/// Maximum length of a collection name.
const MAX_COLLECTION_NAME_LEN: usize = 64;

/// Shared table holding one identity generator per collection.
pub(crate) const SEQUENCES_TABLE: &str = "outboxdb_sequences";

const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS outboxdb_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

const CREATE_SEQUENCES: &str = r#"
CREATE TABLE IF NOT EXISTS outboxdb_sequences (
    name TEXT PRIMARY KEY,
    seq  INTEGER NOT NULL
)
"#;

/// Columns returned by list queries (no payload).
const METADATA_COLUMNS: &str = "id, topic, qos, retain, priority, created_on, published_on, \
     published_message_id, session_id, confirmed_on, dropped_on";

/// Rows matching this predicate are in flight.
const IN_FLIGHT: &str =
    "published_on IS NOT NULL AND qos > 0 AND confirmed_on IS NULL AND dropped_on IS NULL";

// =============================================================================
// Collection Name
// =============================================================================

/// A validated collection (table) name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionName(String);

impl CollectionName {
    /// Validates `name` for use as a table name.
    ///
    /// # Errors
    ///
    /// `Error::Validation` if the name is empty, too long, starts with a digit
    /// or the engine-reserved `sqlite_` prefix, or contains anything other
    /// than ASCII letters, digits and underscores.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();

        if name.is_empty() {
            return Err(Error::validation("collection", "must not be empty"));
        }
        if name.len() > MAX_COLLECTION_NAME_LEN {
            return Err(Error::validation(
                "collection",
                format!("'{name}' is longer than {MAX_COLLECTION_NAME_LEN} characters"),
            ));
        }
        if name.starts_with(|c: char| c.is_ascii_digit()) {
            return Err(Error::validation(
                "collection",
                format!("'{name}' must not start with a digit"),
            ));
        }
        if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(Error::validation(
                "collection",
                format!("'{name}' may only contain ASCII letters, digits and '_'"),
            ));
        }
        if name.to_ascii_lowercase().starts_with("sqlite_") {
            return Err(Error::validation(
                "collection",
                format!("'{name}' uses the reserved 'sqlite_' prefix"),
            ));
        }

        Ok(Self(name))
    }

    /// Returns the raw (unquoted) name.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the name quoted for SQL, optionally with a suffix.
    fn quoted(&self, suffix: &str) -> String {
        quote_identifier(&format!("{}{}", self.0, suffix))
    }
}

impl fmt::Display for CollectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Double-quotes an identifier, doubling embedded quotes.
fn quote_identifier(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

// =============================================================================
// Statements
// =============================================================================

/// Every SQL statement the store runs against one collection.
///
/// Built once per store from a validated [`CollectionName`]. Statements are
/// plain strings so they can be passed to `prepare_cached`.
#[derive(Debug, Clone)]
pub(crate) struct MessageTable {
    pub name: CollectionName,

    pub create_table: String,
    pub create_pk_index: String,
    pub create_next_index: String,
    pub create_purge_indexes: [String; 3],

    pub count: String,
    pub id_exists: String,
    pub insert: String,
    pub get: String,
    pub next: String,
    pub set_published: String,
    pub set_published_with_token: String,
    pub set_confirmed: String,
    pub list_unpublished: String,
    pub list_in_flight: String,
    pub list_dropped: String,
    pub unpublish_in_flight: String,
    pub drop_in_flight: String,
    pub delete_dropped: String,
    pub delete_confirmed: String,
    pub delete_published_qos0: String,

    pub duplicate_count: String,
    pub drop_pk_index: String,
    pub delete_duplicates: String,
}

impl MessageTable {
    pub fn new(name: CollectionName) -> Self {
        let t = name.quoted("");
        let metadata = METADATA_COLUMNS;

        let purge_index = |column: &str| {
            format!(
                "CREATE INDEX IF NOT EXISTS {} ON {t} ({column} DESC)",
                name.quoted(&format!("_{column}"))
            )
        };
        let create_purge_indexes = [
            purge_index("published_on"),
            purge_index("confirmed_on"),
            purge_index("dropped_on"),
        ];

        Self {
            create_table: format!(
                "CREATE TABLE IF NOT EXISTS {t} (
                    id                   INTEGER NOT NULL,
                    topic                TEXT NOT NULL,
                    qos                  INTEGER NOT NULL,
                    retain               INTEGER NOT NULL,
                    priority             INTEGER NOT NULL,
                    created_on           INTEGER NOT NULL,
                    published_on         INTEGER,
                    published_message_id INTEGER,
                    session_id           TEXT,
                    confirmed_on         INTEGER,
                    dropped_on           INTEGER,
                    payload              BLOB
                )"
            ),
            create_pk_index: format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {t} (id)",
                name.quoted("_pk")
            ),
            create_next_index: format!(
                "CREATE INDEX IF NOT EXISTS {} ON {t} (published_on ASC, priority ASC, created_on ASC, qos)",
                name.quoted("_next_msg")
            ),
            create_purge_indexes,

            count: format!("SELECT COUNT(*) FROM {t}"),
            id_exists: format!("SELECT EXISTS(SELECT 1 FROM {t} WHERE id = ?1)"),
            insert: format!(
                "INSERT INTO {t} (id, topic, qos, retain, priority, created_on, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
            ),
            get: format!("SELECT {metadata}, payload FROM {t} WHERE id = ?1 LIMIT 1"),
            next: format!(
                "SELECT {metadata}, payload FROM {t}
                 WHERE published_on IS NULL
                 ORDER BY priority ASC, created_on ASC, id ASC
                 LIMIT 1"
            ),
            set_published: format!("UPDATE {t} SET published_on = ?1 WHERE id = ?2"),
            set_published_with_token: format!(
                "UPDATE {t} SET published_on = ?1, published_message_id = ?2, session_id = ?3 WHERE id = ?4"
            ),
            // Only published, not dropped rows can be confirmed.
            set_confirmed: format!(
                "UPDATE {t} SET confirmed_on = ?1
                 WHERE id = ?2 AND published_on IS NOT NULL AND dropped_on IS NULL"
            ),
            list_unpublished: format!(
                "SELECT {metadata} FROM {t} WHERE published_on IS NULL
                 ORDER BY priority ASC, created_on ASC, id ASC"
            ),
            list_in_flight: format!(
                "SELECT {metadata} FROM {t} WHERE {IN_FLIGHT}
                 ORDER BY priority ASC, created_on ASC, id ASC"
            ),
            list_dropped: format!(
                "SELECT {metadata} FROM {t} WHERE dropped_on IS NOT NULL
                 ORDER BY priority ASC, created_on ASC, id ASC"
            ),
            unpublish_in_flight: format!("UPDATE {t} SET published_on = NULL WHERE {IN_FLIGHT}"),
            drop_in_flight: format!("UPDATE {t} SET dropped_on = ?1 WHERE {IN_FLIGHT}"),
            delete_dropped: format!(
                "DELETE FROM {t} WHERE dropped_on IS NOT NULL AND dropped_on <= ?1"
            ),
            delete_confirmed: format!(
                "DELETE FROM {t} WHERE confirmed_on IS NOT NULL AND confirmed_on <= ?1"
            ),
            delete_published_qos0: format!(
                "DELETE FROM {t} WHERE qos = 0 AND published_on IS NOT NULL AND published_on <= ?1"
            ),

            duplicate_count: format!(
                "SELECT COUNT(*) FROM (SELECT id FROM {t} GROUP BY id HAVING COUNT(*) > 1)"
            ),
            drop_pk_index: format!("DROP INDEX IF EXISTS {}", name.quoted("_pk")),
            // Keeps the first inserted row of every id.
            delete_duplicates: format!(
                "DELETE FROM {t} WHERE rowid NOT IN (SELECT MIN(rowid) FROM {t} GROUP BY id)"
            ),

            name,
        }
    }
}

// =============================================================================
// Schema Creation
// =============================================================================

/// Creates the collection's table and indexes if they don't exist.
///
/// Safe to call on every start and reconfiguration; existing rows are kept.
///
/// # Errors
///
/// - `Error::Storage` if any DDL statement fails
/// - `Error::Config` if the file was written by an incompatible schema version
pub(crate) fn ensure_schema(conn: &Connection, table: &MessageTable) -> Result<()> {
    conn.execute_batch(CREATE_METADATA)?;
    verify_or_set_version(conn)?;

    conn.execute_batch(CREATE_SEQUENCES)?;
    conn.execute(
        &format!("INSERT OR IGNORE INTO {SEQUENCES_TABLE} (name, seq) VALUES (?1, 0)"),
        [table.name.as_str()],
    )?;

    conn.execute_batch(&table.create_table)?;

    // Duplicate ids left behind by a crash make the unique index impossible
    // to build. The repair routine rebuilds it after deduplicating.
    match conn.execute_batch(&table.create_pk_index) {
        Ok(()) => {}
        Err(e) if is_constraint_violation(&e) => {
            warn!(
                collection = %table.name,
                "duplicate message ids present, primary key index deferred to repair"
            );
        }
        Err(e) => return Err(e.into()),
    }

    conn.execute_batch(&table.create_next_index)?;
    for ddl in &table.create_purge_indexes {
        conn.execute_batch(ddl)?;
    }

    debug!(collection = %table.name, "schema ready");
    Ok(())
}

/// Verifies the schema version, or sets it if this is a new database.
fn verify_or_set_version(conn: &Connection) -> Result<()> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT value FROM outboxdb_metadata WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;

    match existing {
        None => {
            conn.execute(
                "INSERT INTO outboxdb_metadata (key, value) VALUES ('schema_version', ?1)",
                [SCHEMA_VERSION.to_string()],
            )?;
        }
        Some(v) if v == SCHEMA_VERSION.to_string() => {}
        Some(v) => {
            return Err(Error::Config(format!(
                "schema version mismatch: database has version {v}, this build requires {SCHEMA_VERSION}"
            )));
        }
    }

    Ok(())
}

/// Returns true if `err` is a SQLite constraint violation.
pub(crate) fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::ConstraintViolation)
    )
}

// =============================================================================
// Tests
// =============================================================================
