mod common;

use outboxdb::{Error, HousekeeperState, MessageStore, SqliteProvider, StoreConfig};
use rusqlite::Connection;

/// A provider whose database was written by an incompatible schema version.
fn incompatible_provider() -> SqliteProvider {
    let conn = Connection::open_in_memory().unwrap();
    conn.execute_batch(
        "CREATE TABLE outboxdb_metadata (key TEXT PRIMARY KEY, value TEXT NOT NULL);
         INSERT INTO outboxdb_metadata (key, value) VALUES ('schema_version', '99');",
    )
    .unwrap();
    SqliteProvider::from_connection(conn)
}

fn set_schema_version(store: &MessageStore, version: &str) {
    store
        .with_plain_connection(|conn| {
            conn.execute(
                "UPDATE outboxdb_metadata SET value = ?1 WHERE key = 'schema_version'",
                [version],
            )?;
            Ok(())
        })
        .unwrap();
}

#[test]
fn failed_start_leaves_detached_store_detached() {
    let store: MessageStore = MessageStore::new(common::COLLECTION).unwrap();

    let result = store.start(incompatible_provider(), common::quiet_config(100));
    assert!(matches!(result, Err(Error::Config(_))));
    assert!(!store.is_attached());
    assert_eq!(store.housekeeper_state(), HousekeeperState::Stopped);
    assert!(matches!(
        store.get_message_count(),
        Err(Error::StoreUnavailable { .. })
    ));
}

#[test]
fn failed_start_keeps_running_store_intact() {
    let store = common::in_memory_store();
    let id = common::store_message(&store, "kept", 1, 5);
    let before = store.config();

    let result = store.start(incompatible_provider(), StoreConfig::new(1, 0, 5));
    assert!(matches!(result, Err(Error::Config(_))));

    assert!(store.is_attached());
    assert_eq!(store.housekeeper_state(), HousekeeperState::Running);
    assert_eq!(store.config(), before);
    assert_eq!(store.get(id).unwrap().unwrap().topic, "kept");
    common::store_message(&store, "after", 1, 5);
    assert_eq!(store.get_message_count().unwrap(), 2);
}

#[test]
fn failed_update_restarts_previous_housekeeper() {
    let store = common::in_memory_store();
    let id = common::store_message(&store, "kept", 1, 5);
    let before = store.config();

    set_schema_version(&store, "99");
    let result = store.update(StoreConfig::new(1, 0, 5));
    assert!(matches!(result, Err(Error::Config(_))));

    assert!(store.is_attached());
    assert_eq!(store.housekeeper_state(), HousekeeperState::Running);
    assert_eq!(store.config(), before);
    assert!(store.get(id).unwrap().is_some());

    // Once the database is compatible again the update goes through.
    set_schema_version(&store, "1");
    store.update(StoreConfig::new(1, 0, 5)).unwrap();
    assert_eq!(store.config().capacity, 5);
    assert_eq!(store.housekeeper_state(), HousekeeperState::Running);
}

#[test]
fn invalid_config_does_not_stop_running_store() {
    let store = common::in_memory_store();

    let result = store.update(StoreConfig::new(0, 60, 100));
    assert!(matches!(result, Err(Error::Config(_))));
    assert_eq!(store.housekeeper_state(), HousekeeperState::Running);
    assert_eq!(store.config(), common::quiet_config(10_000));
}
