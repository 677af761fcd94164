//! In-memory network connecting coordinators.
//!
//! Frames sent through a [`MemoryCommunicator`] are queued on the
//! [`MemoryNetwork`] and only delivered when the test calls
//! [`MemoryNetwork::pump`]. This keeps multi-node scenarios deterministic.

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use replidb_sync_engine::{Communicator, CommunicatorAggregator, SyncCoordinator, SyncError, SyncResult};
use replidb_sync_protocol::{Message, WireCodec};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use tracing::debug;

/// A frame travelling between two nodes.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Sending node.
    pub from: String,
    /// Receiving node.
    pub to: String,
    /// Communicator label the frame was sent under.
    pub label: String,
    /// Encoded frame.
    pub bytes: Vec<u8>,
}

impl Delivery {
    /// Decodes the frame.
    pub fn decode(&self) -> Option<Message> {
        let codec = WireCodec::new();
        let frame = codec.parse_frame(Bytes::from(self.bytes.clone())).ok()?;
        codec.decode(&frame).ok()
    }
}

#[derive(Default)]
struct NetworkInner {
    nodes: RwLock<HashMap<String, SyncCoordinator>>,
    down: Mutex<BTreeSet<(String, String)>>,
    in_transit: Mutex<VecDeque<Delivery>>,
    log: Mutex<Vec<Delivery>>,
    rejected: Mutex<Vec<(Delivery, SyncError)>>,
}

/// Shared in-memory network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

fn link(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

impl MemoryNetwork {
    /// Creates an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Aggregator handing out communicators for `node`.
    pub fn aggregator(&self, node: &str) -> Arc<MemoryAggregator> {
        Arc::new(MemoryAggregator {
            network: self.clone(),
            node: node.to_string(),
            allocations: Mutex::new(Vec::new()),
        })
    }

    /// Attaches the coordinator that receives frames addressed to `node`.
    pub fn attach(&self, node: &str, coordinator: SyncCoordinator) {
        self.inner.nodes.write().insert(node.to_string(), coordinator);
    }

    /// Returns true if both nodes are attached and their link is up.
    pub fn is_linked(&self, a: &str, b: &str) -> bool {
        let nodes = self.inner.nodes.read();
        nodes.contains_key(a) && nodes.contains_key(b) && !self.inner.down.lock().contains(&link(a, b))
    }

    /// Takes the link between `a` and `b` down and tells both coordinators.
    pub fn disconnect(&self, a: &str, b: &str) {
        self.inner.down.lock().insert(link(a, b));
        self.notify(a, b, false);
    }

    /// Brings the link between `a` and `b` back up and tells both coordinators.
    pub fn reconnect(&self, a: &str, b: &str) {
        self.inner.down.lock().remove(&link(a, b));
        self.notify(a, b, true);
    }

    fn notify(&self, a: &str, b: &str, online: bool) {
        let (node_a, node_b) = {
            let nodes = self.inner.nodes.read();
            (nodes.get(a).cloned(), nodes.get(b).cloned())
        };
        if let Some(coordinator) = node_a {
            coordinator.on_peer_connect_changed(b, online);
        }
        if let Some(coordinator) = node_b {
            coordinator.on_peer_connect_changed(a, online);
        }
    }

    fn enqueue(&self, delivery: Delivery) -> SyncResult<()> {
        if !self.is_linked(&delivery.from, &delivery.to) {
            return Err(SyncError::transport_retryable(format!(
                "no link from {} to {}",
                delivery.from, delivery.to
            )));
        }
        self.inner.log.lock().push(delivery.clone());
        self.inner.in_transit.lock().push_back(delivery);
        Ok(())
    }

    /// Delivers queued frames, including the ones sent while delivering,
    /// until nothing is left. Returns the number of frames delivered.
    pub fn pump(&self) -> usize {
        let mut delivered = 0;
        loop {
            let Some(delivery) = self.inner.in_transit.lock().pop_front() else {
                return delivered;
            };
            let target = self.inner.nodes.read().get(&delivery.to).cloned();
            let Some(coordinator) = target else {
                debug!(to = %delivery.to, "dropping frame for unknown node");
                continue;
            };
            delivered += 1;
            if let Err(err) = coordinator.on_message_received(&delivery.from, delivery.bytes.clone()) {
                debug!(from = %delivery.from, to = %delivery.to, %err, "frame rejected");
                self.inner.rejected.lock().push((delivery, err));
            }
        }
    }

    /// Frames waiting for delivery.
    pub fn in_transit(&self) -> usize {
        self.inner.in_transit.lock().len()
    }

    /// Every frame accepted for delivery so far.
    pub fn sent(&self) -> Vec<Delivery> {
        self.inner.log.lock().clone()
    }

    /// Decoded frames sent from `from` to `to`.
    pub fn messages_between(&self, from: &str, to: &str) -> Vec<Message> {
        self.inner
            .log
            .lock()
            .iter()
            .filter(|d| d.from == from && d.to == to)
            .filter_map(Delivery::decode)
            .collect()
    }

    /// Frames the receiver refused, with the error it returned.
    pub fn rejected(&self) -> Vec<(Delivery, SyncError)> {
        self.inner.rejected.lock().clone()
    }

    /// Clears the sent log.
    pub fn clear_log(&self) {
        self.inner.log.lock().clear();
    }
}

/// Communicator of one node under one label.
pub struct MemoryCommunicator {
    network: MemoryNetwork,
    node: String,
    label: String,
}

impl Communicator for MemoryCommunicator {
    fn send(&self, peer: &str, bytes: Vec<u8>) -> SyncResult<()> {
        self.network.enqueue(Delivery {
            from: self.node.clone(),
            to: peer.to_string(),
            label: self.label.clone(),
            bytes,
        })
    }

    fn is_peer_online(&self, peer: &str) -> bool {
        self.network.is_linked(&self.node, peer)
    }

    fn local_identity(&self) -> SyncResult<String> {
        Ok(self.node.clone())
    }
}

/// Hands out [`MemoryCommunicator`]s for one node.
pub struct MemoryAggregator {
    network: MemoryNetwork,
    node: String,
    allocations: Mutex<Vec<String>>,
}

impl MemoryAggregator {
    /// Labels requested so far, in order.
    pub fn allocations(&self) -> Vec<String> {
        self.allocations.lock().clone()
    }
}

impl CommunicatorAggregator for MemoryAggregator {
    fn communicator(&self, label: &str) -> SyncResult<Arc<dyn Communicator>> {
        self.allocations.lock().push(label.to_string());
        Ok(Arc::new(MemoryCommunicator {
            network: self.network.clone(),
            node: self.node.clone(),
            label: label.to_string(),
        }))
    }
}
