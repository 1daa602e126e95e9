#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use outboxdb::{
    MessageId, MessageStore, Priority, ProviderOptions, Qos, SqliteProvider, StoreConfig,
};
use rusqlite::{Connection, OpenFlags};

pub const COLLECTION: &str = "ds_messages";

/// Config whose housekeeper never fires during a test.
pub fn quiet_config(capacity: u32) -> StoreConfig {
    StoreConfig::new(3600, 60, capacity)
}

pub fn in_memory_store() -> MessageStore {
    store_with_capacity(10_000)
}

pub fn store_with_capacity(capacity: u32) -> MessageStore {
    MessageStore::open_in_memory(COLLECTION, quiet_config(capacity)).expect("open in-memory store")
}

pub fn create_temp_db_file(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name);
    (dir, path)
}

pub fn open_provider(path: &Path) -> SqliteProvider {
    SqliteProvider::open(path, &ProviderOptions::default()).expect("open provider")
}

pub fn open_file_store(path: &Path, config: StoreConfig) -> MessageStore {
    let store = MessageStore::new(COLLECTION).expect("valid collection");
    store.start(open_provider(path), config).expect("start store");
    store
}

pub fn open_read_only(path: &Path) -> Connection {
    Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .expect("open read-only connection")
}

pub fn store_message(store: &MessageStore, topic: &str, qos: u8, priority: i32) -> MessageId {
    store
        .store(
            topic,
            Some(b"payload".as_slice()),
            Qos::new(qos),
            false,
            Priority::new(priority),
        )
        .expect("store message")
}

/// Moves a timestamp column of one row `age` into the past.
pub fn backdate(store: &MessageStore, column: &str, id: MessageId, age: Duration) {
    let sql = format!(
        "UPDATE \"{COLLECTION}\" SET {column} = {column} - ?1 WHERE id = ?2"
    );
    store
        .with_plain_connection(|conn| {
            conn.execute(&sql, rusqlite::params![age.as_millis() as i64, id.as_raw()])?;
            Ok(())
        })
        .expect("backdate row");
}

/// Inserts a row directly, bypassing the identity generator.
pub fn insert_raw(store: &MessageStore, id: i64, topic: &str) {
    store
        .with_plain_connection(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO \"{COLLECTION}\" (id, topic, qos, retain, priority, created_on)
                     VALUES (?1, ?2, 1, 0, 7, 0)"
                ),
                rusqlite::params![id, topic],
            )?;
            Ok(())
        })
        .expect("insert raw row");
}

pub fn index_exists(store: &MessageStore, name: &str) -> bool {
    store
        .with_plain_connection(|conn| {
            Ok(conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'index' AND name = ?1)",
                [name],
                |row| row.get(0),
            )?)
        })
        .expect("query sqlite_master")
}

pub fn eventually<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        std::thread::sleep(interval);
    }
}
