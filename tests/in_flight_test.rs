mod common;

use outboxdb::{MessageId, MessageState, MessageStore};

struct Fixture {
    store: MessageStore,
    in_flight_qos1: MessageId,
    in_flight_qos2: MessageId,
    confirmed: MessageId,
    published_qos0: MessageId,
    unpublished: MessageId,
}

/// One row in every state that matters to the in-flight predicate.
fn fixture() -> Fixture {
    let store = common::in_memory_store();

    let in_flight_qos1 = common::store_message(&store, "in-flight-1", 1, 5);
    let in_flight_qos2 = common::store_message(&store, "in-flight-2", 2, 5);
    let confirmed = common::store_message(&store, "confirmed", 1, 5);
    let published_qos0 = common::store_message(&store, "qos0", 0, 5);
    let unpublished = common::store_message(&store, "unpublished", 1, 5);

    for id in [in_flight_qos1, in_flight_qos2, confirmed, published_qos0] {
        store.mark_as_published(id).unwrap();
    }
    store.mark_as_confirmed(confirmed).unwrap();

    Fixture {
        store,
        in_flight_qos1,
        in_flight_qos2,
        confirmed,
        published_qos0,
        unpublished,
    }
}

fn state(store: &MessageStore, id: MessageId) -> MessageState {
    store.get(id).unwrap().expect("row exists").state()
}

#[test]
fn in_flight_list_matches_predicate() {
    let f = fixture();

    let ids: Vec<MessageId> = f
        .store
        .get_in_flight_messages()
        .unwrap()
        .iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(ids, vec![f.in_flight_qos1, f.in_flight_qos2]);
}

#[test]
fn drop_all_touches_only_in_flight_rows() {
    let f = fixture();

    let dropped = f.store.drop_all_in_flight_messages().unwrap();
    assert_eq!(dropped, 2);

    assert_eq!(state(&f.store, f.in_flight_qos1), MessageState::Dropped);
    assert_eq!(state(&f.store, f.in_flight_qos2), MessageState::Dropped);
    assert_eq!(state(&f.store, f.confirmed), MessageState::Confirmed);
    assert_eq!(
        state(&f.store, f.published_qos0),
        MessageState::PublishedUnconfirmed
    );
    assert_eq!(state(&f.store, f.unpublished), MessageState::Unpublished);

    let qos0 = f.store.get(f.published_qos0).unwrap().unwrap();
    assert!(qos0.dropped_on.is_none());

    let dropped_list = f.store.get_dropped_messages().unwrap();
    assert_eq!(dropped_list.len(), 2);
    assert!(dropped_list.iter().all(|m| m.payload.is_none()));
    assert!(f.store.get_in_flight_messages().unwrap().is_empty());
}

#[test]
fn drop_all_is_idempotent() {
    let f = fixture();
    assert_eq!(f.store.drop_all_in_flight_messages().unwrap(), 2);

    let first = f.store.get(f.in_flight_qos1).unwrap().unwrap().dropped_on;
    assert_eq!(f.store.drop_all_in_flight_messages().unwrap(), 0);
    let second = f.store.get(f.in_flight_qos1).unwrap().unwrap().dropped_on;
    assert_eq!(first, second);
}

#[test]
fn unpublish_all_requeues_in_flight_rows() {
    let f = fixture();

    let requeued = f.store.unpublish_all_in_flight_messages().unwrap();
    assert_eq!(requeued, 2);

    assert_eq!(state(&f.store, f.in_flight_qos1), MessageState::Unpublished);
    assert_eq!(state(&f.store, f.in_flight_qos2), MessageState::Unpublished);
    assert_eq!(state(&f.store, f.confirmed), MessageState::Confirmed);
    assert_eq!(
        state(&f.store, f.published_qos0),
        MessageState::PublishedUnconfirmed
    );

    let unpublished: Vec<MessageId> = f
        .store
        .get_unpublished_messages()
        .unwrap()
        .iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(
        unpublished,
        vec![f.in_flight_qos1, f.in_flight_qos2, f.unpublished]
    );

    // Requeued rows are published again in their original order.
    assert_eq!(
        f.store.get_next_message().unwrap().unwrap().id,
        f.in_flight_qos1
    );
}

#[test]
fn confirming_dropped_message_is_noop() {
    let f = fixture();
    f.store.drop_all_in_flight_messages().unwrap();

    f.store.mark_as_confirmed(f.in_flight_qos1).unwrap();

    let msg = f.store.get(f.in_flight_qos1).unwrap().unwrap();
    assert_eq!(msg.confirmed_on, None);
    assert!(msg.dropped_on.is_some());
    assert_eq!(msg.state(), MessageState::Dropped);
}

#[test]
fn dropped_rows_are_not_requeued() {
    let f = fixture();
    f.store.drop_all_in_flight_messages().unwrap();

    assert_eq!(f.store.unpublish_all_in_flight_messages().unwrap(), 0);
    assert_eq!(state(&f.store, f.in_flight_qos1), MessageState::Dropped);
}
