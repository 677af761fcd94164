//! # ReplIDB Testkit
//!
//! Test utilities for ReplIDB sync.
//!
//! This crate provides:
//! - An in-memory network with deterministic delivery
//! - Inline, manual and tokio task schedulers
//! - An in-memory storage collaborator
//! - Multi-node fixtures
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use replidb_testkit::prelude::*;
//!
//! #[test]
//! fn test_subscription() {
//!     let cluster = TestCluster::new(&["a", "b"]);
//!     let query = QueryFingerprint::new().prefix_key("user/");
//!     cluster.node("a").coordinator.subscribe("b", query).unwrap();
//!     cluster.settle();
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod network;
pub mod scheduler;
pub mod storage;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::network::*;
    pub use crate::scheduler::*;
    pub use crate::storage::*;
    pub use crate::init_tracing;
}

pub use fixtures::*;
pub use generators::*;
pub use network::*;
pub use scheduler::*;
pub use storage::*;

/// Installs a fmt subscriber filtered by `RUST_LOG`. Safe to call from every
/// test; only the first call installs it.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
