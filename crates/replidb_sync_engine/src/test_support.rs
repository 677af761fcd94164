//! In-crate fakes for unit tests.

use crate::config::CoordinatorConfig;
use crate::coordinator::{Collaborators, SyncCoordinator};
use crate::error::{SyncError, SyncResult};
use crate::scheduler::{Task, TaskScheduler};
use crate::storage::{MetadataStore, SyncStorage};
use crate::transport::{Communicator, CommunicatorAggregator};
use bytes::Bytes;
use parking_lot::Mutex;
use replidb_sync_protocol::{
    DataItem, DataRequestPacket, Message, MessageId, MessageType, Packet, PreparedStatement,
    QueryFingerprint, RowDataSet, SyncMode, WireCodec,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

pub(crate) const LOCAL: &str = "local-node";

#[derive(Default)]
pub(crate) struct FakeCommunicator {
    pub(crate) sent: Mutex<Vec<(String, Vec<u8>)>>,
    pub(crate) online: Mutex<BTreeSet<String>>,
    pub(crate) fail_sends: Mutex<bool>,
}

impl FakeCommunicator {
    pub(crate) fn sent_messages(&self) -> Vec<(String, Message)> {
        let codec = WireCodec::new();
        self.sent
            .lock()
            .iter()
            .map(|(peer, bytes)| {
                let frame = codec.parse_frame(Bytes::from(bytes.clone())).unwrap();
                (peer.clone(), codec.decode(&frame).unwrap())
            })
            .collect()
    }
}

impl Communicator for FakeCommunicator {
    fn send(&self, peer: &str, bytes: Vec<u8>) -> SyncResult<()> {
        if *self.fail_sends.lock() {
            return Err(SyncError::transport_retryable("link down"));
        }
        self.sent.lock().push((peer.to_string(), bytes));
        Ok(())
    }

    fn is_peer_online(&self, peer: &str) -> bool {
        self.online.lock().contains(peer)
    }

    fn local_identity(&self) -> SyncResult<String> {
        Ok(LOCAL.to_string())
    }
}

#[derive(Default)]
pub(crate) struct FakeAggregator {
    pub(crate) communicators: Mutex<HashMap<String, Arc<FakeCommunicator>>>,
    pub(crate) allocations: Mutex<Vec<String>>,
}

impl FakeAggregator {
    pub(crate) fn get(&self, label: &str) -> Arc<FakeCommunicator> {
        Arc::clone(
            self.communicators
                .lock()
                .entry(label.to_string())
                .or_default(),
        )
    }
}

impl CommunicatorAggregator for FakeAggregator {
    fn communicator(&self, label: &str) -> SyncResult<Arc<dyn Communicator>> {
        self.allocations.lock().push(label.to_string());
        Ok(self.get(label))
    }
}

/// Holds tasks until the test runs them.
#[derive(Default)]
pub(crate) struct HeldScheduler {
    tasks: Mutex<Vec<Task>>,
}

impl HeldScheduler {
    pub(crate) fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Runs tasks, including the ones they submit, until none are left.
    pub(crate) fn run_all(&self) -> usize {
        let mut ran = 0;
        loop {
            let tasks: Vec<Task> = std::mem::take(&mut *self.tasks.lock());
            if tasks.is_empty() {
                return ran;
            }
            for task in tasks {
                task();
                ran += 1;
            }
        }
    }
}

impl TaskScheduler for HeldScheduler {
    fn submit(&self, task: Task) -> SyncResult<()> {
        self.tasks.lock().push(task);
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct FakeStorage {
    pub(crate) watermarks: Mutex<HashMap<String, u64>>,
    pub(crate) items: Mutex<Vec<DataItem>>,
    pub(crate) received: Mutex<Vec<(String, DataItem)>>,
    pub(crate) side_state: Mutex<BTreeSet<String>>,
}

impl MetadataStore for FakeStorage {
    fn get_watermark(&self, key: &str) -> SyncResult<u64> {
        Ok(self.watermarks.lock().get(key).copied().unwrap_or(0))
    }

    fn set_watermark(&self, key: &str, value: u64) -> SyncResult<()> {
        self.watermarks.lock().insert(key.to_string(), value);
        Ok(())
    }

    fn db_create_time(&self) -> SyncResult<u64> {
        Ok(1)
    }
}

impl SyncStorage for FakeStorage {
    fn add_subscription_side_state(&self, query_id: &str, _: &QueryFingerprint) -> SyncResult<()> {
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

    fn put_sync_data(&self, peer: &str, items: Vec<DataItem>) -> SyncResult<()> {
        let mut received = self.received.lock();
        received.extend(items.into_iter().map(|item| (peer.to_string(), item)));
        Ok(())
    }

    fn get_sync_data(
        &self,
        query: Option<&QueryFingerprint>,
        since: u64,
    ) -> SyncResult<Vec<DataItem>> {
        Ok(self
            .items
            .lock()
            .iter()
            .filter(|item| item.timestamp > since)
            .filter(|item| query.map_or(true, |q| q.matches_key(&item.key)))
            .cloned()
            .collect())
    }

    fn execute_remote_query(&self, _: &PreparedStatement) -> SyncResult<RowDataSet> {
        Ok(RowDataSet::default())
    }
}

pub(crate) struct Harness {
    pub(crate) coordinator: SyncCoordinator,
    pub(crate) aggregator: Arc<FakeAggregator>,
    pub(crate) scheduler: Arc<HeldScheduler>,
    pub(crate) storage: Arc<FakeStorage>,
}

impl Harness {
    pub(crate) fn new(config: CoordinatorConfig) -> Self {
        let aggregator = Arc::new(FakeAggregator::default());
        let scheduler = Arc::new(HeldScheduler::default());
        let storage = Arc::new(FakeStorage::default());
        let coordinator = SyncCoordinator::new(
            config,
            Collaborators {
                aggregator: aggregator.clone(),
                scheduler: scheduler.clone(),
                metadata: storage.clone(),
                storage: storage.clone(),
            },
        )
        .unwrap();
        Self {
            coordinator,
            aggregator,
            scheduler,
            storage,
        }
    }

    pub(crate) fn started(config: CoordinatorConfig) -> Self {
        let harness = Self::new(config);
        harness.coordinator.start().unwrap();
        harness
    }

    pub(crate) fn main(&self) -> Arc<FakeCommunicator> {
        self.aggregator.get(&self.coordinator.config().label)
    }
}

/// Encoded push request carrying `items`.
pub(crate) fn push_frame(session: u32, items: Vec<DataItem>) -> Vec<u8> {
    let mut packet = DataRequestPacket::new(SyncMode::Push).with_packet_id(u64::from(session));
    packet.end_watermark = items.iter().map(|i| i.timestamp).max().unwrap_or(0);
    packet.set_items(items);
    let message = Message::new(MessageId::DataSync, MessageType::Request, Packet::DataRequest(packet))
        .with_session(session, 0);
    WireCodec::new().encode(&message).unwrap()
}

/// Encoded change notification.
pub(crate) fn change_frame() -> Vec<u8> {
    let message = Message::new(MessageId::LocalDataChanged, MessageType::Notify, Packet::Empty);
    WireCodec::new().encode(&message).unwrap()
}
