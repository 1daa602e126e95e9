mod common;

use std::time::Duration;

use outboxdb::{RepairReport, StoreConfig};

fn corrupt(store: &outboxdb::MessageStore) {
    store
        .with_plain_connection(|conn| {
            conn.execute_batch(&format!("DROP INDEX \"{}_pk\"", common::COLLECTION))?;
            Ok(())
        })
        .unwrap();
}

fn ids(store: &outboxdb::MessageStore) -> Vec<i64> {
    store
        .with_plain_connection(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT id FROM \"{}\" ORDER BY id", common::COLLECTION))?;
            let ids = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<i64>>>()?;
            Ok(ids)
        })
        .unwrap()
}

#[test]
fn repair_on_clean_table_is_noop() {
    let store = common::in_memory_store();
    common::store_message(&store, "a", 1, 5);

    let report = store.repair().unwrap();
    assert!(report.is_clean());
    assert_eq!(report, RepairReport::default());
    assert_eq!(store.get_message_count().unwrap(), 1);
}

#[test]
fn repair_leaves_one_row_per_id() {
    let store = common::in_memory_store();
    let a = common::store_message(&store, "a", 1, 5);
    let b = common::store_message(&store, "b", 1, 5);

    corrupt(&store);
    common::insert_raw(&store, a.as_raw(), "a-duplicate");
    common::insert_raw(&store, b.as_raw(), "b-duplicate");
    common::insert_raw(&store, b.as_raw(), "b-duplicate-2");
    assert_eq!(ids(&store), vec![1, 1, 2, 2, 2]);

    let report = store.repair().unwrap();
    assert_eq!(report.duplicate_ids, 2);
    assert_eq!(report.rows_removed, 3);

    assert_eq!(ids(&store), vec![1, 2]);
    // The surviving row is the original one.
    assert_eq!(store.get(a).unwrap().unwrap().topic, "a");
    assert_eq!(store.get(b).unwrap().unwrap().topic, "b");
    assert!(common::index_exists(&store, "ds_messages_pk"));

    let c = common::store_message(&store, "c", 1, 5);
    assert_eq!(c.as_raw(), 3);
    assert_eq!(store.get_message_count().unwrap(), 3);
}

#[test]
fn restart_with_duplicates_defers_index_until_repair() {
    let (_dir, path) = common::create_temp_db_file("duplicates.db");

    let store = common::open_file_store(&path, common::quiet_config(100));
    common::store_message(&store, "a", 1, 5);
    corrupt(&store);
    common::insert_raw(&store, 1, "a-duplicate");
    drop(store);

    // Starting on a corrupt file must not fail.
    let store = common::open_file_store(&path, common::quiet_config(100));
    assert!(!common::index_exists(&store, "ds_messages_pk"));

    store.repair().unwrap();
    assert!(common::index_exists(&store, "ds_messages_pk"));
    assert_eq!(ids(&store), vec![1]);
}

#[test]
fn housekeeper_repairs_when_enabled() {
    let store = common::in_memory_store();
    common::store_message(&store, "a", 1, 5);
    corrupt(&store);
    common::insert_raw(&store, 1, "a-duplicate");

    store
        .update(StoreConfig::new(1, 60, 100).with_repair(true))
        .unwrap();

    common::eventually(Duration::from_secs(10), Duration::from_millis(50), || {
        (ids(&store) == vec![1]).then_some(())
    });
    assert!(common::index_exists(&store, "ds_messages_pk"));
}
