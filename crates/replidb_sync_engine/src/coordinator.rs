//! Sync coordinator.
//!
//! The coordinator owns the inbound message pipeline for one database:
//!
//! 1. [`SyncCoordinator::on_message_received`] parses the frame header and
//!    charges the frame against the queue cache.
//! 2. Unless the in-flight count already exceeds `max_exec_tasks`, the
//!    message is handed to the [`TaskScheduler`] right away. Otherwise it
//!    waits in a FIFO queue.
//! 3. Every finished dispatch task drains at most one queued message before
//!    giving up its in-flight slot.
//!
//! Remote execute requests bypass the queue entirely, and local data change
//! notifications are handled inline.

use crate::config::CoordinatorConfig;
use crate::context::{PeerContext, SyncTaskHandle};
use crate::error::{SyncError, SyncResult};
use crate::registry::SubscriptionRegistry;
use crate::remote_query::RemoteQueryState;
use crate::scheduler::TaskScheduler;
use crate::storage::{MetadataStore, SyncStorage};
use crate::transport::{mask_peer, Communicator, CommunicatorAggregator};
use bytes::Bytes;
use parking_lot::{Condvar, Mutex, RwLock};
use replidb_sync_protocol::{
    Frame, Message, MessageId, PreparedStatement, QueryFingerprint, RowDataSet, WireCodec,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Callback invoked with the peer id when a peer reports local changes.
pub type RemoteDataChangedListener = Arc<dyn Fn(&str) + Send + Sync>;

/// External collaborators the coordinator works through.
#[derive(Clone)]
pub struct Collaborators {
    /// Allocates communicators per label.
    pub aggregator: Arc<dyn CommunicatorAggregator>,
    /// Runs dispatch tasks.
    pub scheduler: Arc<dyn TaskScheduler>,
    /// Watermark store.
    pub metadata: Arc<dyn MetadataStore>,
    /// Data access.
    pub storage: Arc<dyn SyncStorage>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

pub(crate) struct QueuedMessage {
    pub(crate) peer: String,
    pub(crate) frame: Frame,
    pub(crate) size: usize,
}

#[derive(Default)]
struct MessageQueue {
    messages: VecDeque<QueuedMessage>,
    cache_bytes: usize,
    discarded: u64,
}

#[derive(Default)]
struct EqualIdentifiers {
    /// Peer id to identifier.
    aliases: HashMap<String, String>,
    /// Identifier to its communicator.
    communicators: HashMap<String, Arc<dyn Communicator>>,
}

pub(crate) struct CoordinatorInner {
    pub(crate) config: CoordinatorConfig,
    max_queue_cache_bytes: AtomicUsize,
    pub(crate) codec: WireCodec,
    pub(crate) registry: SubscriptionRegistry,
    pub(crate) collab: Collaborators,
    active: AtomicBool,
    killed: AtomicBool,
    communicator: RwLock<Option<Arc<dyn Communicator>>>,
    queue: Mutex<MessageQueue>,
    in_flight: Mutex<usize>,
    in_flight_done: Condvar,
    contexts: RwLock<HashMap<String, PeerContext>>,
    equal: Mutex<EqualIdentifiers>,
    pub(crate) remote: RemoteQueryState,
    listener: RwLock<Option<RemoteDataChangedListener>>,
    pub(crate) listener_peers: Mutex<BTreeSet<String>>,
    next_session: AtomicU32,
    next_task: AtomicU64,
}

/// Peer-to-peer sync coordinator for one database.
///
/// Cloning is cheap; all clones share the same state.
///
/// # Example
///
/// ```ignore
/// let coordinator = SyncCoordinator::new(CoordinatorConfig::default(), collaborators)?;
/// coordinator.start()?;
/// let task = coordinator.subscribe("peer-b", QueryFingerprint::new().prefix_key("user/"))?;
/// task.wait(Duration::from_secs(5));
/// ```
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl std::fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("label", &self.inner.config.label)
            .field("active", &self.inner.is_active())
            .field("in_flight", &self.inner.in_flight())
            .field("queue_len", &self.inner.queue.lock().messages.len())
            .finish()
    }
}

impl SyncCoordinator {
    /// Creates an inactive coordinator. Call [`start`](Self::start) before use.
    ///
    /// # Errors
    ///
    /// `InvalidArgs` if the configuration is invalid.
    pub fn new(config: CoordinatorConfig, collaborators: Collaborators) -> SyncResult<Self> {
        config.validate()?;
        let registry = SubscriptionRegistry::new(config.limits);
        Ok(Self {
            inner: Arc::new(CoordinatorInner {
                max_queue_cache_bytes: AtomicUsize::new(config.max_queue_cache_bytes),
                config,
                codec: WireCodec::new(),
                registry,
                collab: collaborators,
                active: AtomicBool::new(false),
                killed: AtomicBool::new(false),
                communicator: RwLock::new(None),
                queue: Mutex::new(MessageQueue::default()),
                in_flight: Mutex::new(0),
                in_flight_done: Condvar::new(),
                contexts: RwLock::new(HashMap::new()),
                equal: Mutex::new(EqualIdentifiers::default()),
                remote: RemoteQueryState::default(),
                listener: RwLock::new(None),
                listener_peers: Mutex::new(BTreeSet::new()),
                next_session: AtomicU32::new(1),
                next_task: AtomicU64::new(1),
            }),
        })
    }

    /// Allocates the main communicator and starts accepting messages.
    ///
    /// # Errors
    ///
    /// `ObjectKilled` after [`close`](Self::close), or the aggregator's error.
    pub fn start(&self) -> SyncResult<()> {
        self.inner.start()
    }

    /// Stops the coordinator.
    ///
    /// Kills every peer context, waits up to the configured close timeout for
    /// in-flight messages, drops the queue and all remote subscriptions, and
    /// fails pending remote queries.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Returns true between `start` and `close`.
    pub fn is_active(&self) -> bool {
        self.inner.is_active()
    }

    /// Entry point for bytes received from `peer`.
    ///
    /// # Errors
    ///
    /// - `InvalidArgs` for an empty peer or frame.
    /// - `Busy` when inactive or when the frame does not fit the queue cache.
    /// - `NotSupported` for frames this codec cannot decode.
    /// - Header parse errors and scheduler rejections.
    pub fn on_message_received(&self, peer: &str, bytes: impl Into<Bytes>) -> SyncResult<()> {
        self.inner.on_message_received(peer, bytes.into())
    }

    /// Maps `targets` to `identifier` so that traffic to them goes through
    /// the identifier's communicator. Replaces the previous targets of the
    /// identifier.
    ///
    /// While the coordinator is inactive the mapping is only recorded.
    pub fn set_equal_identifier(&self, identifier: &str, targets: &[String]) -> SyncResult<()> {
        self.inner.set_equal_identifier(identifier, targets)
    }

    /// Re-applies all equal identifiers after the transport came back.
    pub fn on_transport_activated(&self) -> SyncResult<()> {
        self.inner.on_transport_activated()
    }

    /// Connectivity change for `peer`.
    ///
    /// Going offline drops the peer's remote subscriptions and, if the peer
    /// is really unreachable, its local subscriptions and pending tasks.
    /// Coming online resubscribes the peer's unfinished queries.
    pub fn on_peer_connect_changed(&self, peer: &str, online: bool) {
        if online {
            self.inner.online_handle(peer);
        } else {
            self.inner.offline_handle(peer);
        }
    }

    /// Subscribes to `query` on `peer`.
    pub fn subscribe(&self, peer: &str, query: QueryFingerprint) -> SyncResult<SyncTaskHandle> {
        self.inner.subscribe_inner(peer, query, false)
    }

    /// Cancels a subscription on `peer`.
    pub fn unsubscribe(&self, peer: &str, query: QueryFingerprint) -> SyncResult<SyncTaskHandle> {
        self.inner.unsubscribe_inner(peer, query)
    }

    /// Pushes local changes to `peer`, optionally restricted to `query`.
    pub fn push(&self, peer: &str, query: Option<QueryFingerprint>) -> SyncResult<SyncTaskHandle> {
        self.inner
            .push_inner(peer, query, false)?
            .ok_or_else(|| SyncError::internal("push produced no task"))
    }

    /// Pushes new local changes to every peer holding an active
    /// subscription, and notifies listening peers.
    pub fn notify_local_data_changed(&self) -> SyncResult<Vec<SyncTaskHandle>> {
        self.inner.notify_local_data_changed()
    }

    /// Sends `LocalDataChanged` notifications to `peer` on
    /// [`notify_local_data_changed`](Self::notify_local_data_changed).
    pub fn add_change_listener_peer(&self, peer: &str) {
        self.inner.listener_peers.lock().insert(peer.to_string());
    }

    /// Stops change notifications to `peer`.
    pub fn remove_change_listener_peer(&self, peer: &str) {
        self.inner.listener_peers.lock().remove(peer);
    }

    /// Sets the callback for peers reporting local changes.
    pub fn set_remote_data_changed_listener(&self, listener: RemoteDataChangedListener) {
        *self.inner.listener.write() = Some(listener);
    }

    /// Runs `statement` on `peer` and waits for the rows.
    ///
    /// # Errors
    ///
    /// `Timeout` if no answer arrives within the configured timeout, the
    /// error code reported by the peer, or a transport error.
    pub fn remote_query(&self, peer: &str, statement: PreparedStatement) -> SyncResult<RowDataSet> {
        self.inner.remote_query(peer, statement)
    }

    /// Records queries to resubscribe when `peer` comes back.
    pub fn put_unfinished_subscriptions(&self, peer: &str, queries: &[QueryFingerprint]) {
        self.inner.registry.put_unfinished(peer, queries);
    }

    /// Queries still waiting for resubscription, per peer.
    pub fn unfinished_subscriptions(&self) -> BTreeMap<String, Vec<QueryFingerprint>> {
        self.inner.registry.unfinished_queries()
    }

    /// Identity of the local node.
    ///
    /// # Errors
    ///
    /// `Busy` while inactive.
    pub fn local_identity(&self) -> SyncResult<String> {
        self.inner.main_communicator()?.local_identity()
    }

    /// Checks that `peer` is non-empty and not the local node.
    pub fn check_peer_id_valid(&self, peer: &str) -> SyncResult<()> {
        self.inner.check_peer_id_valid(peer)
    }

    /// Subscription registry.
    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.inner.registry
    }

    /// Context of `peer`, if one exists.
    pub fn context(&self, peer: &str) -> Option<PeerContext> {
        self.inner.contexts.read().get(peer).cloned()
    }

    /// Bytes of frames currently waiting in the queue.
    pub fn queue_cache_bytes(&self) -> usize {
        self.inner.queue.lock().cache_bytes
    }

    /// Number of frames waiting in the queue.
    pub fn queue_len(&self) -> usize {
        self.inner.queue.lock().messages.len()
    }

    /// Frames rejected because the queue cache was full.
    pub fn discard_count(&self) -> u64 {
        self.inner.queue.lock().discarded
    }

    /// Messages currently being processed.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight()
    }

    /// Dispatch tasks allowed before messages are queued.
    pub fn max_exec_tasks(&self) -> usize {
        self.inner.config.max_exec_tasks
    }

    /// Current queue cache limit.
    pub fn max_queue_cache_bytes(&self) -> usize {
        self.inner.max_queue_cache_bytes.load(Ordering::SeqCst)
    }

    /// Changes the queue cache limit. Frames already queued stay queued.
    pub fn set_max_queue_cache_bytes(&self, bytes: usize) {
        self.inner.max_queue_cache_bytes.store(bytes, Ordering::SeqCst);
    }

    /// Configuration in use.
    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }
}

impl CoordinatorInner {
    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_active(&self) -> SyncResult<()> {
        if self.killed.load(Ordering::SeqCst) {
            return Err(SyncError::ObjectKilled);
        }
        if !self.is_active() {
            return Err(SyncError::busy("coordinator not active"));
        }
        Ok(())
    }

    fn start(&self) -> SyncResult<()> {
        if self.killed.load(Ordering::SeqCst) {
            return Err(SyncError::ObjectKilled);
        }
        let communicator = self.collab.aggregator.communicator(&self.config.label)?;
        *self.communicator.write() = Some(communicator);
        self.active.store(true, Ordering::SeqCst);
        self.apply_equal_identifiers(false);
        info!(label = %self.config.label, "sync coordinator started");
        Ok(())
    }

    fn close(&self) {
        self.active.store(false, Ordering::SeqCst);
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }

        let contexts: Vec<PeerContext> = self.contexts.write().drain().map(|(_, c)| c).collect();
        for context in &contexts {
            context.kill();
        }
        drop(contexts);

        if !self.wait_in_flight(self.config.close_timeout) {
            warn!(
                in_flight = self.in_flight(),
                "close timed out waiting for in-flight messages"
            );
        }

        let dropped = {
            let mut queue = self.queue.lock();
            let mut dropped = 0usize;
            while let Some(message) = queue.messages.pop_front() {
                queue.cache_bytes = queue.cache_bytes.saturating_sub(message.size);
                dropped += 1;
            }
            dropped
        };

        self.registry.clear_all_remote();
        self.remote.close();
        *self.communicator.write() = None;
        self.equal.lock().communicators.clear();
        info!(label = %self.config.label, dropped, "sync coordinator closed");
    }

    fn wait_in_flight(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.in_flight.lock();
        while *count > 0 {
            if self.in_flight_done.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }

    fn in_flight(&self) -> usize {
        *self.in_flight.lock()
    }

    fn inc_in_flight(&self) {
        *self.in_flight.lock() += 1;
    }

    fn dec_in_flight(&self) {
        {
            let mut count = self.in_flight.lock();
            *count = count.saturating_sub(1);
        }
        self.in_flight_done.notify_all();
    }

    pub(crate) fn next_session(&self) -> u32 {
        loop {
            let id = self.next_session.fetch_add(1, Ordering::SeqCst);
            if id != 0 {
                return id;
            }
        }
    }

    pub(crate) fn next_task_id(&self) -> u64 {
        self.next_task.fetch_add(1, Ordering::SeqCst)
    }

    fn on_message_received(self: &Arc<Self>, peer: &str, bytes: Bytes) -> SyncResult<()> {
        self.inc_in_flight();
        match self.receive(peer, bytes) {
            Ok(true) => Ok(()),
            Ok(false) => {
                self.dec_in_flight();
                Ok(())
            }
            Err(err) => {
                self.dec_in_flight();
                Err(err)
            }
        }
    }

    /// Returns `Ok(true)` when a dispatch task took over the in-flight slot.
    fn receive(self: &Arc<Self>, peer: &str, bytes: Bytes) -> SyncResult<bool> {
        if peer.is_empty() || bytes.is_empty() {
            return Err(SyncError::invalid_args("empty peer or frame"));
        }
        if !self.is_active() {
            return Err(SyncError::busy("coordinator not active"));
        }
        let frame = self.codec.parse_frame(bytes)?;

        if frame.header.id == MessageId::RemoteExecute {
            self.receive_remote(peer, frame)?;
            return Ok(false);
        }

        let size = if frame.is_feedback() {
            0
        } else {
            match self.codec.frame_len(&frame) {
                0 => {
                    return Err(SyncError::NotSupported(format!(
                        "frame {:?} has no decodable payload",
                        frame.header.id
                    )))
                }
                n => n,
            }
        };

        let message = QueuedMessage {
            peer: peer.to_string(),
            frame,
            size,
        };
        {
            let mut queue = self.queue.lock();
            let limit = self.max_queue_cache_bytes.load(Ordering::SeqCst);
            if queue.cache_bytes + size > limit {
                queue.discarded += 1;
                warn!(
                    peer = %mask_peer(peer),
                    size,
                    cache = queue.cache_bytes,
                    limit,
                    discarded = queue.discarded,
                    "queue cache full, discarding frame"
                );
                return Err(SyncError::busy("queue cache full"));
            }
            if self.in_flight() > self.config.max_exec_tasks {
                Self::enqueue(&mut queue, message);
                return Ok(false);
            }
        }

        let context = self.context_for(peer)?;
        self.schedule(context, message)?;
        Ok(true)
    }

    fn enqueue(queue: &mut MessageQueue, message: QueuedMessage) {
        if message.frame.header.id == MessageId::LocalDataChanged
            && queue.messages.iter().any(|queued| {
                queued.peer == message.peer && queued.frame.header.id == MessageId::LocalDataChanged
            })
        {
            debug!(
                peer = %mask_peer(&message.peer),
                "change notification already queued"
            );
            return;
        }
        queue.cache_bytes += message.size;
        queue.messages.push_back(message);
    }

    /// Returns the context for `peer`, creating it if needed.
    pub(crate) fn context_for(&self, peer: &str) -> SyncResult<PeerContext> {
        if self.killed.load(Ordering::SeqCst) {
            return Err(SyncError::ObjectKilled);
        }
        if let Some(context) = self.contexts.read().get(peer) {
            return Ok(context.clone());
        }
        let mut contexts = self.contexts.write();
        let context = contexts
            .entry(peer.to_string())
            .or_insert_with(|| PeerContext::new(peer));
        if context.is_killed() {
            return Err(SyncError::ObjectKilled);
        }
        Ok(context.clone())
    }

    fn schedule(self: &Arc<Self>, context: PeerContext, message: QueuedMessage) -> SyncResult<()> {
        if message.frame.header.id == MessageId::LocalDataChanged {
            self.handle_remote_data_changed(&message.peer);
            self.task_out();
            return Ok(());
        }
        let inner = Arc::clone(self);
        self.collab.scheduler.submit(Box::new(move || {
            inner.process(&context, message);
            inner.task_out();
        }))
    }

    fn task_out(self: &Arc<Self>) {
        self.drain_one();
        self.dec_in_flight();
    }

    fn drain_one(self: &Arc<Self>) {
        if !self.is_active() {
            return;
        }
        let Some(message) = ({
            let mut queue = self.queue.lock();
            let message = queue.messages.pop_front();
            if let Some(message) = &message {
                queue.cache_bytes = queue.cache_bytes.saturating_sub(message.size);
            }
            message
        }) else {
            return;
        };

        self.inc_in_flight();
        let peer = message.peer.clone();
        let result = self
            .context_for(&peer)
            .and_then(|context| self.schedule(context, message));
        if let Err(err) = result {
            error!(peer = %mask_peer(&peer), %err, "failed to schedule queued message");
            self.dec_in_flight();
        }
    }

    fn handle_remote_data_changed(&self, peer: &str) {
        let listener = self.listener.read().clone();
        let Some(listener) = listener else {
            debug!(peer = %mask_peer(peer), "no listener for remote data change");
            return;
        };
        let online = self
            .communicator_for(peer)
            .map(|c| c.is_peer_online(peer))
            .unwrap_or(false);
        if online {
            listener(peer);
        } else {
            debug!(peer = %mask_peer(peer), "ignoring change notification from offline peer");
        }
    }

    pub(crate) fn main_communicator(&self) -> SyncResult<Arc<dyn Communicator>> {
        self.communicator
            .read()
            .clone()
            .ok_or_else(|| SyncError::busy("coordinator not started"))
    }

    /// Communicator that reaches `peer`: the equal identifier's if the peer
    /// is mapped to one, the main one otherwise.
    pub(crate) fn communicator_for(&self, peer: &str) -> SyncResult<Arc<dyn Communicator>> {
        {
            let equal = self.equal.lock();
            if let Some(communicator) = equal
                .aliases
                .get(peer)
                .and_then(|identifier| equal.communicators.get(identifier))
            {
                return Ok(Arc::clone(communicator));
            }
        }
        self.main_communicator()
    }

    pub(crate) fn send(&self, peer: &str, message: &Message) -> SyncResult<()> {
        let bytes = self.codec.encode(message)?;
        self.communicator_for(peer)?.send(peer, bytes)
    }

    pub(crate) fn is_peer_online(&self, peer: &str) -> bool {
        self.communicator_for(peer)
            .map(|c| c.is_peer_online(peer))
            .unwrap_or(false)
    }

    pub(crate) fn check_peer_id_valid(&self, peer: &str) -> SyncResult<()> {
        if peer.is_empty() {
            return Err(SyncError::invalid_args("empty peer id"));
        }
        let local = self.main_communicator()?.local_identity()?;
        if local == peer {
            return Err(SyncError::invalid_args("peer id is the local node"));
        }
        Ok(())
    }

    fn set_equal_identifier(&self, identifier: &str, targets: &[String]) -> SyncResult<()> {
        if identifier.is_empty() {
            return Err(SyncError::invalid_args("empty identifier"));
        }
        {
            let mut equal = self.equal.lock();
            equal.aliases.retain(|_, mapped| mapped != identifier);
            for target in targets {
                equal.aliases.insert(target.clone(), identifier.to_string());
            }
        }
        if !self.is_active() {
            debug!(identifier, targets = targets.len(), "coordinator inactive, identifier recorded");
            return Ok(());
        }
        self.ensure_identifier_communicator(identifier, false)?;
        info!(identifier, targets = targets.len(), "equal identifier set");
        Ok(())
    }

    fn ensure_identifier_communicator(&self, identifier: &str, refresh: bool) -> SyncResult<()> {
        if !refresh && self.equal.lock().communicators.contains_key(identifier) {
            return Ok(());
        }
        let communicator = self.collab.aggregator.communicator(identifier)?;
        self.equal
            .lock()
            .communicators
            .insert(identifier.to_string(), communicator);
        Ok(())
    }

    fn apply_equal_identifiers(&self, refresh: bool) -> usize {
        let identifiers: BTreeSet<String> = self.equal.lock().aliases.values().cloned().collect();
        let mut failed = 0;
        for identifier in &identifiers {
            if let Err(err) = self.ensure_identifier_communicator(identifier, refresh) {
                warn!(identifier = %identifier, %err, "failed to allocate communicator");
                failed += 1;
            }
        }
        failed
    }

    fn on_transport_activated(&self) -> SyncResult<()> {
        if !self.is_active() {
            return Ok(());
        }
        match self.apply_equal_identifiers(true) {
            0 => Ok(()),
            failed => Err(SyncError::transport_retryable(format!(
                "{failed} equal identifiers could not be reapplied"
            ))),
        }
    }

    pub(crate) fn offline_handle(&self, peer: &str) {
        info!(peer = %mask_peer(peer), "peer offline");
        self.remote.notify_peer_offline(peer);

        let query_ids = self.registry.remote_subscribe_query_ids(peer);
        self.registry.clear_remote(peer);
        let orphaned: Vec<String> = query_ids
            .into_iter()
            .filter(|id| !self.registry.is_query_exist_subscribe(id))
            .collect();
        self.drop_side_state(&orphaned);

        if self.is_peer_online(peer) {
            debug!(peer = %mask_peer(peer), "peer still reachable, keeping local state");
            return;
        }
        self.registry.clear_local(peer);
        if let Some(context) = self.contexts.read().get(peer) {
            let aborted = context.abort_all();
            if aborted > 0 {
                debug!(peer = %mask_peer(peer), aborted, "aborted pending sync tasks");
            }
        }
    }

    fn online_handle(&self, peer: &str) {
        if !self.is_active() {
            return;
        }
        let Some(queries) = self.registry.unfinished_queries().remove(peer) else {
            return;
        };
        info!(peer = %mask_peer(peer), queries = queries.len(), "resubscribing unfinished queries");
        for query in queries {
            if let Err(err) = self.subscribe_inner(peer, query, true) {
                warn!(peer = %mask_peer(peer), %err, "automatic resubscription failed");
            }
        }
    }

    pub(crate) fn drop_side_state(&self, query_ids: &[String]) {
        if query_ids.is_empty() {
            return;
        }
        if let Err(err) = self.collab.storage.remove_subscription_side_state(query_ids) {
            warn!(%err, count = query_ids.len(), "failed to remove subscription side state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SyncTaskStatus;
    use crate::registry::SubscribeStatus;
    use crate::test_support::{change_frame, push_frame, Harness};
    use replidb_sync_protocol::{
        status, ControlAckPacket, ControlCommand, DataItem, MessageType, Packet, SubscribeRequest,
        FRAME_HEADER_LEN,
    };
    use std::sync::atomic::AtomicUsize;

    fn item_frame(session: u32) -> Vec<u8> {
        push_frame(
            session,
            vec![DataItem::put(format!("k{session}"), "v", u64::from(session))],
        )
    }

    fn encode(message: Message) -> Vec<u8> {
        WireCodec::new().encode(&message).unwrap()
    }

    #[test]
    fn queues_beyond_exec_ceiling_and_drains() {
        let h = Harness::started(CoordinatorConfig::default().with_max_exec_tasks(1));
        let frames: Vec<Vec<u8>> = (1..=3).map(item_frame).collect();
        for frame in &frames {
            h.coordinator.on_message_received("peer-b", frame.clone()).unwrap();
        }

        assert_eq!(h.scheduler.len(), 1);
        assert_eq!(h.coordinator.in_flight(), 1);
        assert_eq!(h.coordinator.queue_len(), 2);
        assert_eq!(h.coordinator.queue_cache_bytes(), frames[1].len() + frames[2].len());

        assert_eq!(h.scheduler.run_all(), 3);
        assert_eq!(h.coordinator.queue_len(), 0);
        assert_eq!(h.coordinator.queue_cache_bytes(), 0);
        assert_eq!(h.coordinator.in_flight(), 0);
        assert_eq!(h.storage.received.lock().len(), 3);

        let acks = h.main().sent_messages();
        assert_eq!(acks.len(), 3);
        for (peer, message) in acks {
            assert_eq!(peer, "peer-b");
            assert_eq!(message.msg_type, MessageType::Response);
            assert!(matches!(message.packet, Packet::DataAck(ref ack) if ack.recv_code == status::OK));
        }
    }

    #[test]
    fn full_cache_discards() {
        let h = Harness::started(CoordinatorConfig::default());
        let frame = item_frame(1);
        h.coordinator.set_max_queue_cache_bytes(frame.len() - 1);

        let err = h.coordinator.on_message_received("peer-b", frame).unwrap_err();
        assert!(matches!(err, SyncError::Busy(_)));
        assert_eq!(h.coordinator.discard_count(), 1);
        assert_eq!(h.coordinator.in_flight(), 0);
        assert_eq!(h.scheduler.len(), 0);
    }

    #[test]
    fn rejects_bad_input() {
        let h = Harness::new(CoordinatorConfig::default());
        assert!(matches!(
            h.coordinator.on_message_received("", item_frame(1)),
            Err(SyncError::InvalidArgs(_))
        ));
        assert!(matches!(
            h.coordinator.on_message_received("peer-b", Vec::<u8>::new()),
            Err(SyncError::InvalidArgs(_))
        ));
        assert!(matches!(
            h.coordinator.on_message_received("peer-b", item_frame(1)),
            Err(SyncError::Busy(_))
        ));

        h.coordinator.start().unwrap();
        let mut header_only = item_frame(1);
        header_only.truncate(FRAME_HEADER_LEN);
        assert!(matches!(
            h.coordinator.on_message_received("peer-b", header_only),
            Err(SyncError::NotSupported(_))
        ));
        assert_eq!(h.coordinator.in_flight(), 0);
    }

    #[test]
    fn change_notifications_are_deduplicated_per_peer() {
        let h = Harness::started(CoordinatorConfig::default().with_max_exec_tasks(1));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        h.coordinator
            .set_remote_data_changed_listener(Arc::new(move |_peer: &str| {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        h.main().online.lock().insert("peer-b".to_string());

        h.coordinator.on_message_received("peer-b", item_frame(1)).unwrap();
        h.coordinator.on_message_received("peer-b", change_frame()).unwrap();
        h.coordinator.on_message_received("peer-b", change_frame()).unwrap();
        h.coordinator.on_message_received("peer-c", change_frame()).unwrap();
        assert_eq!(h.coordinator.queue_len(), 2);
        assert_eq!(h.coordinator.queue_cache_bytes(), 2 * change_frame().len());

        h.scheduler.run_all();
        // peer-c is offline, so only peer-b reaches the listener
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.coordinator.queue_len(), 0);
        assert_eq!(h.coordinator.in_flight(), 0);
    }

    #[test]
    fn close_drops_queue_and_rejects_new_frames() {
        let h = Harness::started(
            CoordinatorConfig::default()
                .with_max_exec_tasks(1)
                .with_close_timeout(Duration::from_millis(20)),
        );
        for session in 1..=3 {
            h.coordinator.on_message_received("peer-b", item_frame(session)).unwrap();
        }
        let context = h.coordinator.context("peer-b").unwrap();

        h.coordinator.close();
        assert!(!h.coordinator.is_active());
        assert!(context.is_killed());
        assert_eq!(h.coordinator.queue_len(), 0);
        assert_eq!(h.coordinator.queue_cache_bytes(), 0);
        assert!(h.coordinator.context("peer-b").is_none());
        assert!(matches!(
            h.coordinator.on_message_received("peer-b", item_frame(4)),
            Err(SyncError::Busy(_))
        ));

        // the held task still runs but does nothing
        h.scheduler.run_all();
        assert_eq!(h.coordinator.in_flight(), 0);
        assert!(h.storage.received.lock().is_empty());
        assert_eq!(h.coordinator.start(), Err(SyncError::ObjectKilled));
    }

    #[test]
    fn equal_identifier_routes_outbound_traffic() {
        let h = Harness::new(CoordinatorConfig::default());
        h.coordinator
            .set_equal_identifier("alias", &["peer-x".to_string()])
            .unwrap();
        assert!(h.aggregator.allocations.lock().is_empty());

        h.coordinator.start().unwrap();
        assert!(h.aggregator.allocations.lock().contains(&"alias".to_string()));

        h.coordinator.push("peer-x", None).unwrap();
        assert_eq!(h.aggregator.get("alias").sent.lock().len(), 1);
        assert!(h.main().sent.lock().is_empty());

        h.coordinator
            .set_equal_identifier("alias", &["peer-y".to_string()])
            .unwrap();
        h.coordinator.push("peer-x", None).unwrap();
        assert_eq!(h.main().sent.lock().len(), 1);

        h.coordinator.on_transport_activated().unwrap();
        let reallocated = h
            .aggregator
            .allocations
            .lock()
            .iter()
            .filter(|label| *label == "alias")
            .count();
        assert_eq!(reallocated, 2);
    }

    #[test]
    fn offline_keeps_side_state_shared_with_other_peers() {
        let h = Harness::started(CoordinatorConfig::default());
        let query = QueryFingerprint::new().prefix_key("a");
        let id = query.identify();
        let registry = h.coordinator.registry();
        for peer in ["peer-b", "peer-c"] {
            registry.reserve_remote(peer, &query).unwrap();
            registry.activate_remote(peer, &id).unwrap();
        }
        h.storage.side_state.lock().insert(id.clone());

        h.coordinator.on_peer_connect_changed("peer-b", false);
        assert!(registry.remote_subscribe_query_ids("peer-b").is_empty());
        assert!(h.storage.side_state.lock().contains(&id));

        h.coordinator.on_peer_connect_changed("peer-c", false);
        assert!(h.storage.side_state.lock().is_empty());
    }

    #[test]
    fn offline_clears_local_state_only_when_unreachable() {
        let h = Harness::started(CoordinatorConfig::default());
        let query = QueryFingerprint::new().prefix_key("a");
        let registry = h.coordinator.registry();
        registry.reserve_local("peer-b", &query).unwrap();
        let task = h.coordinator.push("peer-b", None).unwrap();

        h.main().online.lock().insert("peer-b".to_string());
        h.coordinator.on_peer_connect_changed("peer-b", false);
        assert!(registry.local_status("peer-b", &query.identify()).is_some());
        assert_eq!(task.status(), SyncTaskStatus::Pending);

        h.main().online.lock().clear();
        h.coordinator.on_peer_connect_changed("peer-b", false);
        assert!(registry.local_status("peer-b", &query.identify()).is_none());
        assert_eq!(task.status(), SyncTaskStatus::Aborted);
    }

    #[test]
    fn inbound_subscribe_activates_and_pushes_matching_items() {
        let h = Harness::started(CoordinatorConfig::default());
        h.storage.items.lock().extend([
            DataItem::put("a1", "x", 1),
            DataItem::put("b1", "y", 2),
        ]);
        let query = QueryFingerprint::new().prefix_key("a");
        let request = Message::new(
            MessageId::ControlSync,
            MessageType::Request,
            Packet::Subscribe(SubscribeRequest::subscribe(query.clone())),
        )
        .with_session(40, 0);
        h.coordinator.on_message_received("peer-b", encode(request)).unwrap();
        h.scheduler.run_all();

        let id = query.identify();
        assert_eq!(
            h.coordinator.registry().remote_status("peer-b", &id),
            Some(SubscribeStatus::Active)
        );
        assert!(h.storage.side_state.lock().contains(&id));

        let sent = h.main().sent_messages();
        assert_eq!(sent.len(), 2);
        match &sent[0].1.packet {
            Packet::ControlAck(ack) => {
                assert_eq!(ack.recv_code, status::OK);
                assert_eq!(sent[0].1.session_id, 40);
            }
            other => panic!("expected control ack, got {other:?}"),
        }
        match &sent[1].1.packet {
            Packet::DataRequest(packet) => {
                assert_eq!(packet.query_id, id);
                let keys: Vec<&[u8]> = packet.items().iter().map(|i| i.key.as_slice()).collect();
                assert_eq!(keys, vec![b"a1".as_slice()]);
            }
            other => panic!("expected data request, got {other:?}"),
        }
    }

    #[test]
    fn subscribe_ack_drives_local_state() {
        let h = Harness::started(CoordinatorConfig::default());
        let query = QueryFingerprint::new().prefix_key("a");
        let id = query.identify();

        let task = h.coordinator.subscribe("peer-b", query.clone()).unwrap();
        let registry = h.coordinator.registry();
        assert_eq!(registry.local_status("peer-b", &id), Some(SubscribeStatus::NotActive));
        let session = h.main().sent_messages()[0].1.session_id;

        let ack = Message::new(
            MessageId::ControlSync,
            MessageType::Response,
            Packet::ControlAck(ControlAckPacket::new(ControlCommand::Subscribe, status::OK)),
        )
        .with_session(session, 0);
        h.coordinator.on_message_received("peer-b", encode(ack)).unwrap();
        h.scheduler.run_all();
        assert_eq!(task.status(), SyncTaskStatus::Finished);
        assert_eq!(registry.local_status("peer-b", &id), Some(SubscribeStatus::Active));

        let other = QueryFingerprint::new().prefix_key("z");
        let task = h.coordinator.subscribe("peer-b", other.clone()).unwrap();
        let session = h.main().sent_messages()[1].1.session_id;
        let reject = Message::new(
            MessageId::ControlSync,
            MessageType::Response,
            Packet::ControlAck(ControlAckPacket::new(
                ControlCommand::Subscribe,
                status::MAX_LIMITS_EXCEEDED,
            )),
        )
        .with_session(session, 0);
        h.coordinator.on_message_received("peer-b", encode(reject)).unwrap();
        h.scheduler.run_all();
        assert!(matches!(
            task.status(),
            SyncTaskStatus::Failed(SyncError::MaxLimitsExceeded(_))
        ));
        assert_eq!(registry.local_status("peer-b", &other.identify()), None);
    }

    #[test]
    fn failed_send_rolls_back_reservation() {
        let h = Harness::started(CoordinatorConfig::default());
        *h.main().fail_sends.lock() = true;
        let query = QueryFingerprint::new().prefix_key("a");
        let err = h.coordinator.subscribe("peer-b", query.clone()).unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(h.coordinator.registry().local_status("peer-b", &query.identify()), None);
        assert_eq!(h.coordinator.context("peer-b").unwrap().pending_count(), 0);
    }

    #[test]
    fn peer_id_checks() {
        let h = Harness::started(CoordinatorConfig::default());
        let query = QueryFingerprint::new().prefix_key("a");
        assert!(matches!(
            h.coordinator.subscribe(crate::test_support::LOCAL, query.clone()),
            Err(SyncError::InvalidArgs(_))
        ));
        assert!(matches!(
            h.coordinator.subscribe("", query),
            Err(SyncError::InvalidArgs(_))
        ));
        assert_eq!(
            h.coordinator.local_identity().unwrap(),
            crate::test_support::LOCAL
        );
    }

    #[test]
    fn unfinished_queries_resubscribe_when_peer_returns() {
        let h = Harness::started(CoordinatorConfig::default());
        let query = QueryFingerprint::new().prefix_key("a");
        h.coordinator.registry().reserve_local("peer-b", &query).unwrap();
        h.coordinator
            .put_unfinished_subscriptions("peer-b", std::slice::from_ref(&query));

        h.coordinator.on_peer_connect_changed("peer-b", true);
        let sent = h.main().sent_messages();
        assert_eq!(sent.len(), 1);
        match &sent[0].1.packet {
            Packet::Subscribe(request) => {
                assert_eq!(request.command(), ControlCommand::Subscribe);
                assert!(request.control.is_auto_subscribe());
            }
            other => panic!("expected subscribe request, got {other:?}"),
        }
    }
}
