//! Remote query execution.
//!
//! Remote execute frames skip the message queue. A request runs on the
//! scheduler against [`SyncStorage::execute_remote_query`](crate::SyncStorage)
//! and is answered with an ack on the same session. The caller of
//! [`SyncCoordinator::remote_query`](crate::SyncCoordinator::remote_query)
//! blocks until that ack arrives, the peer goes offline, or the timeout
//! elapses.

use crate::coordinator::CoordinatorInner;
use crate::error::{SyncError, SyncResult};
use crate::transport::mask_peer;
use parking_lot::{Condvar, Mutex};
use replidb_sync_protocol::{
    status, Frame, FrameHeader, Message, MessageId, MessageType, Packet, PreparedStatement,
    RemoteExecutorAckPacket, RemoteExecutorRequestPacket, RowDataSet,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug)]
struct PendingQuery {
    peer: String,
    result: Option<SyncResult<RowDataSet>>,
}

/// Remote queries waiting for their ack, keyed by session id.
#[derive(Debug, Default)]
pub(crate) struct RemoteQueryState {
    pending: Mutex<HashMap<u32, PendingQuery>>,
    ready: Condvar,
    closed: AtomicBool,
}

impl RemoteQueryState {
    fn register(&self, session: u32, peer: &str) -> SyncResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SyncError::ObjectKilled);
        }
        self.pending.lock().insert(
            session,
            PendingQuery {
                peer: peer.to_string(),
                result: None,
            },
        );
        Ok(())
    }

    fn cancel(&self, session: u32) {
        self.pending.lock().remove(&session);
    }

    /// Stores the result for `session` if it is still waiting on `peer`.
    fn complete(&self, session: u32, peer: &str, result: SyncResult<RowDataSet>) -> bool {
        let mut pending = self.pending.lock();
        match pending.get_mut(&session) {
            Some(entry) if entry.peer == peer && entry.result.is_none() => {
                entry.result = Some(result);
                self.ready.notify_all();
                true
            }
            _ => false,
        }
    }

    fn wait(&self, session: u32, timeout: Duration) -> SyncResult<RowDataSet> {
        let deadline = Instant::now() + timeout;
        let mut pending = self.pending.lock();
        loop {
            match pending.get(&session) {
                None => return Err(SyncError::ObjectKilled),
                Some(entry) if entry.result.is_some() => {
                    return pending
                        .remove(&session)
                        .and_then(|entry| entry.result)
                        .unwrap_or(Err(SyncError::ObjectKilled));
                }
                Some(_) => {}
            }
            if self.ready.wait_until(&mut pending, deadline).timed_out() {
                return match pending.remove(&session).and_then(|entry| entry.result) {
                    Some(result) => result,
                    None => Err(SyncError::Timeout),
                };
            }
        }
    }

    /// Fails every query waiting on `peer`.
    pub(crate) fn notify_peer_offline(&self, peer: &str) {
        let mut pending = self.pending.lock();
        let mut failed = 0usize;
        for entry in pending.values_mut() {
            if entry.peer == peer && entry.result.is_none() {
                entry.result = Some(Err(SyncError::transport_retryable("peer went offline")));
                failed += 1;
            }
        }
        if failed > 0 {
            self.ready.notify_all();
            debug!(peer = %mask_peer(peer), failed, "failed remote queries of offline peer");
        }
    }

    /// Fails every waiting query and rejects new ones.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut pending = self.pending.lock();
        for entry in pending.values_mut() {
            if entry.result.is_none() {
                entry.result = Some(Err(SyncError::ObjectKilled));
            }
        }
        self.ready.notify_all();
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}

impl CoordinatorInner {
    pub(crate) fn remote_query(
        &self,
        peer: &str,
        statement: PreparedStatement,
    ) -> SyncResult<RowDataSet> {
        self.ensure_active()?;
        self.check_peer_id_valid(peer)?;
        let session = self.next_session();
        self.remote.register(session, peer)?;

        let message = Message::new(
            MessageId::RemoteExecute,
            MessageType::Request,
            Packet::RemoteRequest(RemoteExecutorRequestPacket::new(statement)),
        )
        .with_session(session, 0);
        if let Err(err) = self.send(peer, &message) {
            self.remote.cancel(session);
            return Err(err);
        }
        debug!(peer = %mask_peer(peer), session, "remote query sent");

        let result = self.remote.wait(session, self.config.remote_query_timeout);
        if let Err(err) = &result {
            warn!(peer = %mask_peer(peer), session, %err, "remote query failed");
        }
        result
    }

    /// Handles a remote execute frame outside the message queue.
    pub(crate) fn receive_remote(self: &Arc<Self>, peer: &str, frame: Frame) -> SyncResult<()> {
        let header = frame.header;
        if frame.is_feedback() {
            self.remote.complete(
                header.session_id,
                peer,
                Err(SyncError::transport_retryable(format!(
                    "peer reported error {}",
                    header.error_no
                ))),
            );
            return Ok(());
        }

        match self.codec.decode(&frame)?.packet {
            Packet::RemoteRequest(request) => {
                let inner = Arc::clone(self);
                let peer = peer.to_string();
                self.collab.scheduler.submit(Box::new(move || {
                    inner.execute_remote(&peer, &header, &request);
                }))
            }
            Packet::RemoteAck(ack) => {
                let result = match SyncError::check_code(ack.ack_code) {
                    Ok(()) => Ok(ack.rows),
                    Err(err) => Err(err),
                };
                if !self.remote.complete(header.session_id, peer, result) {
                    debug!(
                        peer = %mask_peer(peer),
                        session = header.session_id,
                        "remote query ack without waiter"
                    );
                }
                Ok(())
            }
            other => Err(SyncError::NotSupported(format!(
                "{} on remote execute",
                other.kind()
            ))),
        }
    }

    fn execute_remote(
        &self,
        peer: &str,
        header: &FrameHeader,
        request: &RemoteExecutorRequestPacket,
    ) {
        if !self.is_active() {
            return;
        }
        let ack = match self.collab.storage.execute_remote_query(&request.statement) {
            Ok(rows) => {
                info!(peer = %mask_peer(peer), rows = rows.rows.len(), "remote query executed");
                RemoteExecutorAckPacket::new(status::OK, rows)
            }
            Err(err) => {
                warn!(peer = %mask_peer(peer), %err, "remote query execution failed");
                RemoteExecutorAckPacket::error(err.code())
            }
        };
        if !request.needs_response() {
            return;
        }
        let message = Message::new(MessageId::RemoteExecute, MessageType::Response, Packet::RemoteAck(ack))
            .with_session(header.session_id, header.sequence_id);
        if let Err(err) = self.send(peer, &message) {
            warn!(peer = %mask_peer(peer), %err, "failed to answer remote query");
        }
    }
}
