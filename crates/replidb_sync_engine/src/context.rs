//! Per-peer sync context and task handles.
//!
//! A [`PeerContext`] is a cloneable handle. The coordinator's context map
//! holds one clone, every dispatch task holds another while it runs, and the
//! context is freed when the last clone drops. Killing is cooperative: the
//! killed flag is checked before work starts, and all outstanding tasks are
//! aborted.

use crate::error::SyncError;
use parking_lot::{Condvar, Mutex, MutexGuard};
use replidb_sync_protocol::{ControlCommand, QueryFingerprint};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Lifecycle state of a peer context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextState {
    /// Created, nothing processed yet.
    Idle,
    /// A dispatch task is processing a message for the peer.
    Running,
    /// The last dispatch task finished.
    Finished,
    /// Torn down.
    Killed,
}

/// Outcome of a sync task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncTaskStatus {
    /// Waiting for acknowledgement.
    Pending,
    /// Acknowledged by the peer.
    Finished,
    /// Rejected by the peer or failed locally.
    Failed(SyncError),
    /// Aborted because the peer went offline or the coordinator closed.
    Aborted,
}

impl SyncTaskStatus {
    /// Returns true once the task will not change anymore.
    pub fn is_done(&self) -> bool {
        !matches!(self, SyncTaskStatus::Pending)
    }
}

#[derive(Debug)]
struct TaskState {
    status: SyncTaskStatus,
    outstanding: usize,
}

#[derive(Debug)]
struct TaskInner {
    id: u64,
    peer: String,
    query_id: String,
    state: Mutex<TaskState>,
    done: Condvar,
}

/// Handle to an outbound sync task (push, subscribe or unsubscribe).
#[derive(Debug, Clone)]
pub struct SyncTaskHandle {
    inner: Arc<TaskInner>,
}

impl SyncTaskHandle {
    pub(crate) fn new(id: u64, peer: &str, query_id: &str, outstanding: usize) -> Self {
        Self {
            inner: Arc::new(TaskInner {
                id,
                peer: peer.to_string(),
                query_id: query_id.to_string(),
                state: Mutex::new(TaskState {
                    status: SyncTaskStatus::Pending,
                    outstanding: outstanding.max(1),
                }),
                done: Condvar::new(),
            }),
        }
    }

    /// Task id.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Target peer.
    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    /// Query id, empty for a full push.
    pub fn query_id(&self) -> &str {
        &self.inner.query_id
    }

    /// Current status.
    pub fn status(&self) -> SyncTaskStatus {
        self.inner.state.lock().status.clone()
    }

    /// Returns true once the task completed in any way.
    pub fn is_done(&self) -> bool {
        self.inner.state.lock().status.is_done()
    }

    /// Blocks until the task completes or `timeout` elapses, and returns the
    /// status at that point.
    pub fn wait(&self, timeout: Duration) -> SyncTaskStatus {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while !state.status.is_done() {
            if self.inner.done.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.status.clone()
    }

    /// One acknowledged packet. The task finishes after the last one.
    pub(crate) fn ack_one(&self) {
        let mut state = self.inner.state.lock();
        if state.status.is_done() {
            return;
        }
        state.outstanding = state.outstanding.saturating_sub(1);
        if state.outstanding == 0 {
            state.status = SyncTaskStatus::Finished;
            self.inner.done.notify_all();
        }
    }

    pub(crate) fn fail(&self, err: SyncError) {
        self.complete(SyncTaskStatus::Failed(err));
    }

    pub(crate) fn abort(&self) {
        self.complete(SyncTaskStatus::Aborted);
    }

    fn complete(&self, status: SyncTaskStatus) {
        let mut state = self.inner.state.lock();
        if state.status.is_done() {
            return;
        }
        state.status = status;
        self.inner.done.notify_all();
    }
}

/// A request waiting for its ack, keyed by session id.
#[derive(Debug, Clone)]
pub(crate) enum PendingRequest {
    Data {
        task: SyncTaskHandle,
        watermark_key: String,
    },
    Control {
        task: SyncTaskHandle,
        command: ControlCommand,
        query: QueryFingerprint,
    },
}

impl PendingRequest {
    pub(crate) fn task(&self) -> &SyncTaskHandle {
        match self {
            PendingRequest::Data { task, .. } | PendingRequest::Control { task, .. } => task,
        }
    }
}

#[derive(Debug)]
struct ContextInner {
    peer: String,
    killed: AtomicBool,
    state: Mutex<ContextState>,
    serial: Mutex<()>,
    pending: Mutex<HashMap<u32, PendingRequest>>,
}

/// Sync state for one remote peer.
#[derive(Debug, Clone)]
pub struct PeerContext {
    inner: Arc<ContextInner>,
}

impl PeerContext {
    pub(crate) fn new(peer: &str) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                peer: peer.to_string(),
                killed: AtomicBool::new(false),
                state: Mutex::new(ContextState::Idle),
                serial: Mutex::new(()),
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Peer this context belongs to.
    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    /// Current state.
    pub fn state(&self) -> ContextState {
        *self.inner.state.lock()
    }

    /// Returns true once the context has been killed.
    pub fn is_killed(&self) -> bool {
        self.inner.killed.load(Ordering::SeqCst)
    }

    /// Number of live handles to this context.
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Number of requests waiting for an ack.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Marks the context killed and aborts its outstanding tasks.
    pub(crate) fn kill(&self) {
        self.inner.killed.store(true, Ordering::SeqCst);
        *self.inner.state.lock() = ContextState::Killed;
        self.abort_all();
    }

    /// Serializes processing for this peer until the guard drops.
    pub(crate) fn begin(&self) -> ContextGuard<'_> {
        let serial = self.inner.serial.lock();
        {
            let mut state = self.inner.state.lock();
            if *state != ContextState::Killed {
                *state = ContextState::Running;
            }
        }
        ContextGuard {
            inner: &self.inner,
            _serial: serial,
        }
    }

    pub(crate) fn track(&self, session_id: u32, request: PendingRequest) {
        self.inner.pending.lock().insert(session_id, request);
    }

    pub(crate) fn take(&self, session_id: u32) -> Option<PendingRequest> {
        self.inner.pending.lock().remove(&session_id)
    }

    /// Aborts every outstanding task and returns how many requests were dropped.
    pub(crate) fn abort_all(&self) -> usize {
        let drained: Vec<PendingRequest> = self.inner.pending.lock().drain().map(|(_, r)| r).collect();
        for request in &drained {
            request.task().abort();
        }
        drained.len()
    }
}

/// Held while a dispatch task processes a message for the peer.
pub(crate) struct ContextGuard<'a> {
    inner: &'a ContextInner,
    _serial: MutexGuard<'a, ()>,
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        if *state != ContextState::Killed {
            *state = ContextState::Finished;
        }
    }
}
