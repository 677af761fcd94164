//! Multi-node fixtures.

use crate::network::{MemoryAggregator, MemoryNetwork};
use crate::scheduler::{InlineScheduler, ManualScheduler};
use crate::storage::MemoryStorage;
use replidb_sync_engine::{Collaborators, CoordinatorConfig, SyncCoordinator, TaskScheduler};
use std::collections::BTreeMap;
use std::sync::Arc;

/// One coordinator wired to in-memory collaborators.
pub struct SyncNode {
    /// Node id on the network.
    pub id: String,
    /// The coordinator under test.
    pub coordinator: SyncCoordinator,
    /// Its storage.
    pub storage: Arc<MemoryStorage>,
    /// Its communicator aggregator.
    pub aggregator: Arc<MemoryAggregator>,
    /// The manual scheduler, when the node was built with one.
    pub manual: Option<Arc<ManualScheduler>>,
}

impl SyncNode {
    /// Builds and starts a node that runs dispatch tasks inline.
    pub fn inline(network: &MemoryNetwork, id: &str, config: CoordinatorConfig) -> Self {
        Self::build(network, id, config, Arc::new(InlineScheduler), None)
    }

    /// Builds and starts a node whose dispatch tasks wait for the test.
    pub fn manual(network: &MemoryNetwork, id: &str, config: CoordinatorConfig) -> Self {
        let scheduler = Arc::new(ManualScheduler::new());
        Self::build(network, id, config, scheduler.clone(), Some(scheduler))
    }

    /// Builds and starts a node with a custom scheduler.
    pub fn with_scheduler(
        network: &MemoryNetwork,
        id: &str,
        config: CoordinatorConfig,
        scheduler: Arc<dyn TaskScheduler>,
    ) -> Self {
        Self::build(network, id, config, scheduler, None)
    }

    fn build(
        network: &MemoryNetwork,
        id: &str,
        config: CoordinatorConfig,
        scheduler: Arc<dyn TaskScheduler>,
        manual: Option<Arc<ManualScheduler>>,
    ) -> Self {
        let storage = Arc::new(MemoryStorage::new());
        let aggregator = network.aggregator(id);
        let coordinator = SyncCoordinator::new(
            config,
            Collaborators {
                aggregator: aggregator.clone(),
                scheduler,
                metadata: storage.clone(),
                storage: storage.clone(),
            },
        )
        .expect("valid coordinator config");
        coordinator.start().expect("coordinator starts");
        network.attach(id, coordinator.clone());
        Self {
            id: id.to_string(),
            coordinator,
            storage,
            aggregator,
            manual,
        }
    }

    /// Runs the node's held tasks. No-op for inline nodes.
    pub fn run_tasks(&self) -> usize {
        self.manual.as_ref().map_or(0, |scheduler| scheduler.run_all())
    }
}

/// A set of inline nodes on one network.
pub struct TestCluster {
    /// The shared network.
    pub network: MemoryNetwork,
    nodes: BTreeMap<String, SyncNode>,
}

impl TestCluster {
    /// Creates inline nodes with the default configuration.
    pub fn new(ids: &[&str]) -> Self {
        Self::with_config(ids, CoordinatorConfig::default())
    }

    /// Creates inline nodes sharing `config`.
    pub fn with_config(ids: &[&str], config: CoordinatorConfig) -> Self {
        let network = MemoryNetwork::new();
        let nodes = ids
            .iter()
            .map(|id| (id.to_string(), SyncNode::inline(&network, id, config.clone())))
            .collect();
        Self { network, nodes }
    }

    /// Node by id.
    ///
    /// # Panics
    ///
    /// Panics if there is no such node.
    pub fn node(&self, id: &str) -> &SyncNode {
        self.nodes
            .get(id)
            .unwrap_or_else(|| panic!("no node {id} in cluster"))
    }

    /// Delivers frames until the network is quiet.
    pub fn settle(&self) -> usize {
        self.network.pump()
    }

    /// Closes every coordinator.
    pub fn shutdown(&self) {
        for node in self.nodes.values() {
            node.coordinator.close();
        }
    }
}
