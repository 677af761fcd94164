//! Property-based test generators using proptest.

use proptest::prelude::*;
use replidb_sync_protocol::{DataItem, QueryFingerprint, SyncMode, Value};

/// Strategy for peer ids.
pub fn peer_id_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9-]{2,15}").expect("Invalid regex")
}

/// Strategy for short keys sharing a few prefixes, so queries hit some of them.
pub fn key_strategy() -> impl Strategy<Value = Vec<u8>> {
    (prop::sample::select(vec!["a", "b", "user/", "order/"]), "[a-z0-9]{0,8}")
        .prop_map(|(prefix, rest)| format!("{prefix}{rest}").into_bytes())
}

/// Strategy for data items, live or deleted.
pub fn data_item_strategy() -> impl Strategy<Value = DataItem> {
    (
        key_strategy(),
        prop::collection::vec(any::<u8>(), 0..256),
        1u64..1_000_000,
        any::<bool>(),
    )
        .prop_map(|(key, value, timestamp, deleted)| {
            if deleted {
                DataItem::delete(key, timestamp)
            } else {
                DataItem::put(key, value, timestamp)
            }
        })
}

/// Strategy for scalar query values.
pub fn value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<i64>().prop_map(Value::Integer),
        (-1.0e9f64..1.0e9).prop_map(Value::Real),
        "[a-zA-Z0-9 ]{0,16}".prop_map(Value::Text),
        prop::collection::vec(any::<u8>(), 0..16).prop_map(Value::Bytes),
        any::<bool>().prop_map(Value::Bool),
    ]
}

/// Strategy for valid query fingerprints: a prefix plus a conjunction of
/// simple predicates, optionally scoped to a table.
pub fn query_strategy() -> impl Strategy<Value = QueryFingerprint> {
    (
        key_strategy(),
        prop::option::of("[a-z]{1,8}"),
        prop::collection::vec(("[a-z]{1,6}", value_strategy()), 0..4),
    )
        .prop_map(|(prefix, table, predicates)| {
            let mut query = QueryFingerprint::new().prefix_key(prefix);
            if let Some(table) = table {
                query = query.table(table);
            }
            for (index, (field, value)) in predicates.into_iter().enumerate() {
                if index > 0 {
                    query = query.and();
                }
                query = query.equal_to(field, value);
            }
            query
        })
}

/// Strategy for sync modes.
pub fn sync_mode_strategy() -> impl Strategy<Value = SyncMode> {
    prop::sample::select(vec![
        SyncMode::Push,
        SyncMode::Pull,
        SyncMode::PushAndPull,
        SyncMode::ResponsePull,
        SyncMode::QueryPush,
        SyncMode::QueryPull,
        SyncMode::QueryPushPull,
        SyncMode::SubscribeQuery,
        SyncMode::UnsubscribeQuery,
        SyncMode::AutoSubscribeQuery,
    ])
}
