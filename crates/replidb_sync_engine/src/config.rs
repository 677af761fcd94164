//! Configuration for the sync coordinator.

use crate::error::{SyncError, SyncResult};
use replidb_sync_protocol::{
    version::SUPPORTED_VERSIONS, MAX_NORMAL_PACK_ITEM_SIZE, SOFTWARE_VERSION_CURRENT,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Maximum number of distinct queries one peer may hold.
pub const MAX_SUBSCRIBE_NUM_PER_DEV: usize = 4;

/// Maximum number of distinct queries per database.
pub const MAX_SUBSCRIBE_NUM_PER_DB: usize = 8;

/// Maximum number of peers tracked per subscription map.
pub const MAX_DEVICES_NUM: usize = 32;

/// Default cap on bytes held by queued messages.
pub const DEFAULT_MAX_QUEUE_CACHE_BYTES: usize = 160 * 1024 * 1024;

/// Default ceiling on concurrently executing dispatch tasks.
pub const DEFAULT_MAX_EXEC_TASKS: usize = 7;

/// Label of the main communicator.
pub const DEFAULT_LABEL: &str = "default";

/// Subscription admission limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryLimits {
    /// Distinct queries per peer.
    pub per_peer: usize,
    /// Distinct queries per database.
    pub per_db: usize,
    /// Distinct peers.
    pub max_peers: usize,
}

impl Default for RegistryLimits {
    fn default() -> Self {
        Self {
            per_peer: MAX_SUBSCRIBE_NUM_PER_DEV,
            per_db: MAX_SUBSCRIBE_NUM_PER_DB,
            max_peers: MAX_DEVICES_NUM,
        }
    }
}

/// Configuration for a [`SyncCoordinator`](crate::SyncCoordinator).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Label of the main communicator.
    pub label: String,
    /// Cap on bytes held by queued messages.
    pub max_queue_cache_bytes: usize,
    /// Concurrent dispatch tasks before messages queue up.
    pub max_exec_tasks: usize,
    /// Upper bound on how long `close` waits for in-flight dispatches.
    pub close_timeout: Duration,
    /// How long a remote query waits for its response.
    pub remote_query_timeout: Duration,
    /// Software version written into outgoing packets.
    pub software_version: u32,
    /// Items per data packet.
    pub sync_batch_items: usize,
    /// Compress item batches.
    pub compress_items: bool,
    /// Subscription limits.
    pub limits: RegistryLimits,
}

impl CoordinatorConfig {
    /// Creates a configuration with default values for `label`.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Self::default()
        }
    }

    /// Sets the queue cache cap.
    pub fn with_max_queue_cache_bytes(mut self, bytes: usize) -> Self {
        self.max_queue_cache_bytes = bytes;
        self
    }

    /// Sets the dispatch task ceiling.
    pub fn with_max_exec_tasks(mut self, tasks: usize) -> Self {
        self.max_exec_tasks = tasks;
        self
    }

    /// Sets the close timeout.
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Sets the remote query timeout.
    pub fn with_remote_query_timeout(mut self, timeout: Duration) -> Self {
        self.remote_query_timeout = timeout;
        self
    }

    /// Sets the software version written into packets.
    pub fn with_software_version(mut self, version: u32) -> Self {
        self.software_version = version;
        self
    }

    /// Sets the number of items per data packet.
    pub fn with_sync_batch_items(mut self, items: usize) -> Self {
        self.sync_batch_items = items;
        self
    }

    /// Enables or disables item compression.
    pub fn with_compress_items(mut self, compress: bool) -> Self {
        self.compress_items = compress;
        self
    }

    /// Sets the subscription limits.
    pub fn with_limits(mut self, limits: RegistryLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Checks the configuration for values the coordinator cannot run with.
    pub fn validate(&self) -> SyncResult<()> {
        if self.label.is_empty() {
            return Err(SyncError::invalid_args("communicator label is empty"));
        }
        if self.max_exec_tasks == 0 {
            return Err(SyncError::invalid_args("max_exec_tasks must be positive"));
        }
        if self.sync_batch_items == 0 || self.sync_batch_items > MAX_NORMAL_PACK_ITEM_SIZE {
            return Err(SyncError::invalid_args(format!(
                "sync_batch_items must be in 1..={MAX_NORMAL_PACK_ITEM_SIZE}"
            )));
        }
        if !SUPPORTED_VERSIONS.contains(&self.software_version) {
            return Err(SyncError::invalid_args(format!(
                "unsupported software version {}",
                self.software_version
            )));
        }
        let limits = &self.limits;
        if limits.per_peer == 0 || limits.per_db == 0 || limits.max_peers == 0 {
            return Err(SyncError::invalid_args("subscription limits must be positive"));
        }
        Ok(())
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            label: DEFAULT_LABEL.to_string(),
            max_queue_cache_bytes: DEFAULT_MAX_QUEUE_CACHE_BYTES,
            max_exec_tasks: DEFAULT_MAX_EXEC_TASKS,
            close_timeout: Duration::from_secs(10),
            remote_query_timeout: Duration::from_secs(3),
            software_version: SOFTWARE_VERSION_CURRENT,
            sync_batch_items: 1000,
            compress_items: false,
            limits: RegistryLimits::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_interop_constants() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.max_queue_cache_bytes, 160 * 1024 * 1024);
        assert_eq!(config.max_exec_tasks, 7);
        assert_eq!(config.remote_query_timeout, Duration::from_secs(3));
        assert_eq!(config.limits.per_peer, 4);
        assert_eq!(config.limits.per_db, 8);
        assert_eq!(config.limits.max_peers, 32);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder() {
        let config = CoordinatorConfig::new("tenant")
            .with_max_queue_cache_bytes(1024)
            .with_max_exec_tasks(2)
            .with_sync_batch_items(10)
            .with_compress_items(true)
            .with_close_timeout(Duration::from_millis(50));
        assert_eq!(config.label, "tenant");
        assert_eq!(config.max_queue_cache_bytes, 1024);
        assert_eq!(config.max_exec_tasks, 2);
        assert_eq!(config.sync_batch_items, 10);
        assert!(config.compress_items);
        assert_eq!(config.close_timeout, Duration::from_millis(50));
    }

    #[test]
    fn validate_rejects_bad_values() {
        assert!(CoordinatorConfig::new("").validate().is_err());
        assert!(CoordinatorConfig::default()
            .with_max_exec_tasks(0)
            .validate()
            .is_err());
        assert!(CoordinatorConfig::default()
            .with_sync_batch_items(MAX_NORMAL_PACK_ITEM_SIZE + 1)
            .validate()
            .is_err());
        assert!(CoordinatorConfig::default()
            .with_software_version(SOFTWARE_VERSION_CURRENT + 1)
            .validate()
            .is_err());
        let limits = RegistryLimits {
            per_peer: 0,
            ..RegistryLimits::default()
        };
        assert!(matches!(
            CoordinatorConfig::default().with_limits(limits).validate(),
            Err(SyncError::InvalidArgs(_))
        ));
    }

    #[test]
    fn config_serde_roundtrip() {
        let config = CoordinatorConfig::new("tenant").with_max_exec_tasks(3);
        let json = serde_json::to_string(&config).unwrap();
        let back: CoordinatorConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);

        let partial: CoordinatorConfig = serde_json::from_str(r#"{"max_exec_tasks": 2}"#).unwrap();
        assert_eq!(partial.max_exec_tasks, 2);
        assert_eq!(partial.label, DEFAULT_LABEL);
    }
}
