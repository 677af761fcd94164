//! Storage collaborators.
//!
//! The coordinator reads and writes data only through these traits. It keeps
//! no data of its own beyond subscription bookkeeping.

use crate::error::SyncResult;
use replidb_sync_protocol::{DataItem, PreparedStatement, QueryFingerprint, RowDataSet};

/// Watermark and metadata store.
pub trait MetadataStore: Send + Sync {
    /// Watermark stored under `key`, or 0 if none.
    fn get_watermark(&self, key: &str) -> SyncResult<u64>;

    /// Stores a watermark.
    fn set_watermark(&self, key: &str, value: u64) -> SyncResult<()>;

    /// Creation time of the database.
    fn db_create_time(&self) -> SyncResult<u64>;
}

/// Data access used by sync.
pub trait SyncStorage: Send + Sync {
    /// Sets up whatever the store needs to track changes for a subscribed query.
    fn add_subscription_side_state(&self, query_id: &str, query: &QueryFingerprint)
        -> SyncResult<()>;

    /// Drops change tracking for the given queries.
    fn remove_subscription_side_state(&self, query_ids: &[String]) -> SyncResult<()>;

    /// Applies items received from `peer`.
    fn put_sync_data(&self, peer: &str, items: Vec<DataItem>) -> SyncResult<()>;

    /// Local items with a timestamp above `since`, oldest first.
    ///
    /// With a query, only items inside it are returned.
    fn get_sync_data(&self, query: Option<&QueryFingerprint>, since: u64)
        -> SyncResult<Vec<DataItem>>;

    /// Runs a query on behalf of a peer.
    fn execute_remote_query(&self, statement: &PreparedStatement) -> SyncResult<RowDataSet>;
}

/// Watermark key for data sent to `peer`, optionally scoped to a query.
pub(crate) fn send_watermark_key(peer: &str, query_id: &str) -> String {
    format!("send/{peer}/{query_id}")
}

/// Watermark key for data received from `peer`, optionally scoped to a query.
pub(crate) fn recv_watermark_key(peer: &str, query_id: &str) -> String {
    format!("recv/{peer}/{query_id}")
}
