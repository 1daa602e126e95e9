mod common;

use outboxdb::{MessageState, MessageStore};

#[test]
fn restart_preserves_rows_and_identity() {
    let (_dir, path) = common::create_temp_db_file("restart.db");

    // First store instance.
    let store1 = common::open_file_store(&path, common::quiet_config(100));
    let a = common::store_message(&store1, "a", 1, 5);
    let b = common::store_message(&store1, "b", 1, 3);
    let c = common::store_message(&store1, "c", 1, 7);
    store1.mark_as_published(b).unwrap();
    assert!(store1.stop().is_some());
    drop(store1);

    // Second store instance (simulates process restart).
    let store2 = common::open_file_store(&path, common::quiet_config(100));
    assert_eq!(store2.get_message_count().unwrap(), 3);

    let in_flight = store2.get_in_flight_messages().unwrap();
    assert_eq!(in_flight.len(), 1);
    assert_eq!(in_flight[0].id, b);

    // Reconnect: requeue what was in flight.
    assert_eq!(store2.unpublish_all_in_flight_messages().unwrap(), 1);
    assert_eq!(store2.get_next_message().unwrap().unwrap().id, b);

    let d = common::store_message(&store2, "d", 1, 5);
    assert!(d > c, "ids keep increasing across restarts");
    assert_eq!(store2.get(a).unwrap().unwrap().state(), MessageState::Unpublished);
}

#[test]
fn committed_rows_are_visible_to_other_connections() {
    let (_dir, path) = common::create_temp_db_file("visible.db");

    let store = common::open_file_store(&path, common::quiet_config(100));
    common::store_message(&store, "a", 1, 5);
    common::store_message(&store, "b", 0, 5);

    let reader = common::open_read_only(&path);
    let count: i64 = reader
        .query_row("SELECT COUNT(*) FROM ds_messages", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 2);
}

#[test]
fn rebind_swaps_provider_without_losing_rows() {
    let (_dir, path) = common::create_temp_db_file("rebind.db");

    let store: MessageStore = MessageStore::new(common::COLLECTION).unwrap();
    // Rebinding a detached store attaches it.
    assert!(store.rebind(common::open_provider(&path)).unwrap().is_none());
    assert!(store.is_attached());
    let id = common::store_message(&store, "a", 1, 5);

    let previous = store.rebind(common::open_provider(&path)).unwrap();
    assert!(previous.is_some());
    drop(previous);

    assert_eq!(store.get(id).unwrap().unwrap().topic, "a");
    let next = common::store_message(&store, "b", 1, 5);
    assert!(next > id);
}

#[test]
fn rebind_to_fresh_database_starts_empty() {
    let (_dir, first) = common::create_temp_db_file("first.db");
    let (_dir2, second) = common::create_temp_db_file("second.db");

    let store = common::open_file_store(&first, common::quiet_config(100));
    common::store_message(&store, "a", 1, 5);

    store.rebind(common::open_provider(&second)).unwrap();
    assert_eq!(store.get_message_count().unwrap(), 0);
    assert_eq!(common::store_message(&store, "b", 1, 5).as_raw(), 1);

    // The first file is untouched.
    let reader = common::open_read_only(&first);
    let count: i64 = reader
        .query_row("SELECT COUNT(*) FROM ds_messages", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 1);
}
