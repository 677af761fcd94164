//! # ReplIDB Sync Engine
//!
//! Peer-to-peer sync coordination for ReplIDB.
//!
//! This crate provides:
//! - The sync coordinator: bounded inbound queue, dispatch onto a task
//!   scheduler, per-peer contexts
//! - The subscription registry with admission limits and reference counts
//! - Push of local changes, subscribe and unsubscribe handshakes
//! - Remote query execution
//!
//! ## Architecture
//!
//! The coordinator sits between a communicator (bytes in and out), a task
//! scheduler, and the storage layer. It holds no data itself:
//!
//! ```text
//! Communicator ──frames──▶ SyncCoordinator ──tasks──▶ TaskScheduler
//!                               │
//!                 SubscriptionRegistry, PeerContext
//!                               │
//!                    MetadataStore, SyncStorage
//! ```
//!
//! ## Key Invariants
//!
//! - Queue cache bytes equal the sum of queued frame sizes
//! - At most `max_exec_tasks + 1` messages are admitted before queueing
//! - A subscription's reference count equals the number of peers holding it
//! - After `close`, no new message is scheduled

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod context;
mod coordinator;
mod error;
mod inbound;
mod outbound;
mod registry;
mod remote_query;
mod scheduler;
mod storage;
mod transport;

#[cfg(test)]
mod test_support;

pub use config::{
    CoordinatorConfig, RegistryLimits, DEFAULT_LABEL, DEFAULT_MAX_EXEC_TASKS,
    DEFAULT_MAX_QUEUE_CACHE_BYTES, MAX_DEVICES_NUM, MAX_SUBSCRIBE_NUM_PER_DB,
    MAX_SUBSCRIBE_NUM_PER_DEV,
};
pub use context::{ContextState, PeerContext, SyncTaskHandle, SyncTaskStatus};
pub use coordinator::{Collaborators, RemoteDataChangedListener, SyncCoordinator};
pub use error::{SyncError, SyncResult};
pub use registry::{SubscribeStatus, SubscriptionRegistry};
pub use scheduler::{Task, TaskScheduler};
pub use storage::{MetadataStore, SyncStorage};
pub use transport::{mask_peer, Communicator, CommunicatorAggregator};
