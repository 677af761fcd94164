//! In-memory storage collaborator.

use parking_lot::Mutex;
use replidb_sync_engine::{MetadataStore, SyncError, SyncResult, SyncStorage};
use replidb_sync_protocol::{DataItem, PreparedStatement, QueryFingerprint, RowDataSet, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Key-value store with timestamps, watermarks and subscription side state.
///
/// Received items win when their timestamp is not older than the local one.
#[derive(Default)]
pub struct MemoryStorage {
    items: Mutex<BTreeMap<Vec<u8>, DataItem>>,
    clock: AtomicU64,
    watermarks: Mutex<HashMap<String, u64>>,
    side_state: Mutex<BTreeSet<String>>,
    remote_queries: Mutex<Vec<PreparedStatement>>,
    fail_side_state: AtomicBool,
}

impl MemoryStorage {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Writes a local item and returns its timestamp.
    pub fn put(&self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> u64 {
        let timestamp = self.tick();
        let item = DataItem::put(key, value, timestamp);
        self.items.lock().insert(item.key.clone(), item);
        timestamp
    }

    /// Deletes a key locally and returns the tombstone timestamp.
    pub fn delete(&self, key: impl Into<Vec<u8>>) -> u64 {
        let timestamp = self.tick();
        let item = DataItem::delete(key, timestamp);
        self.items.lock().insert(item.key.clone(), item);
        timestamp
    }

    /// Live value of `key`.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.items
            .lock()
            .get(key)
            .filter(|item| !item.is_deleted())
            .map(|item| item.value.clone())
    }

    /// Ids with subscription side state.
    pub fn side_state(&self) -> BTreeSet<String> {
        self.side_state.lock().clone()
    }

    /// Statements executed on behalf of peers.
    pub fn remote_queries(&self) -> Vec<PreparedStatement> {
        self.remote_queries.lock().clone()
    }

    /// Makes side state setup fail.
    pub fn set_fail_side_state(&self, fail: bool) {
        self.fail_side_state.store(fail, Ordering::SeqCst);
    }

    /// Stored watermark, 0 if none.
    pub fn watermark(&self, key: &str) -> u64 {
        self.watermarks.lock().get(key).copied().unwrap_or(0)
    }
}

impl MetadataStore for MemoryStorage {
    fn get_watermark(&self, key: &str) -> SyncResult<u64> {
        Ok(self.watermark(key))
    }

    fn set_watermark(&self, key: &str, value: u64) -> SyncResult<()> {
        self.watermarks.lock().insert(key.to_string(), value);
        Ok(())
    }

    fn db_create_time(&self) -> SyncResult<u64> {
        Ok(0)
    }
}

impl SyncStorage for MemoryStorage {
    fn add_subscription_side_state(&self, query_id: &str, _query: &QueryFingerprint) -> SyncResult<()> {
        if self.fail_side_state.load(Ordering::SeqCst) {
            return Err(SyncError::storage("side state unavailable"));
        }
        self.side_state.lock().insert(query_id.to_string());
        Ok(())
    }

    fn remove_subscription_side_state(&self, query_ids: &[String]) -> SyncResult<()> {
        let mut side_state = self.side_state.lock();
        for id in query_ids {
            side_state.remove(id);
        }
        Ok(())
    }

    fn put_sync_data(&self, _peer: &str, items: Vec<DataItem>) -> SyncResult<()> {
        let mut stored = self.items.lock();
        for item in items {
            self.clock.fetch_max(item.timestamp, Ordering::SeqCst);
            let newer = stored
                .get(&item.key)
                .map_or(true, |current| current.timestamp <= item.timestamp);
            if newer {
                stored.insert(item.key.clone(), item);
            }
        }
        Ok(())
    }

    fn get_sync_data(&self, query: Option<&QueryFingerprint>, since: u64) -> SyncResult<Vec<DataItem>> {
        let mut items: Vec<DataItem> = self
            .items
            .lock()
            .values()
            .filter(|item| item.timestamp > since)
            .filter(|item| query.map_or(true, |q| q.matches_key(&item.key)))
            .cloned()
            .collect();
        items.sort_by_key(|item| item.timestamp);
        Ok(items)
    }

    /// Returns every live item as a `(key, value)` row.
    fn execute_remote_query(&self, statement: &PreparedStatement) -> SyncResult<RowDataSet> {
        self.remote_queries.lock().push(statement.clone());
        let rows = self
            .items
            .lock()
            .values()
            .filter(|item| !item.is_deleted())
            .map(|item| {
                vec![
                    Value::Text(String::from_utf8_lossy(&item.key).into_owned()),
                    Value::Bytes(item.value.clone()),
                ]
            })
            .collect();
        Ok(RowDataSet {
            columns: vec!["key".to_string(), "value".to_string()],
            rows,
        })
    }
}
