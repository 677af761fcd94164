//! Requests the coordinator initiates: subscribe, unsubscribe and push.

use crate::context::{PendingRequest, SyncTaskHandle};
use crate::coordinator::CoordinatorInner;
use crate::error::{SyncError, SyncResult};
use crate::storage::send_watermark_key;
use crate::transport::mask_peer;
use replidb_sync_protocol::packet::DATA_FLAG_LAST_SEQUENCE;
use replidb_sync_protocol::version::SOFTWARE_VERSION_RELEASE_2_0;
use replidb_sync_protocol::{
    CompressAlgorithm, ControlCommand, DataItem, DataRequestPacket, Message, MessageId,
    MessageType, Packet, QueryFingerprint, SubscribeRequest, SyncMode,
};
use tracing::{debug, info, warn};

impl CoordinatorInner {
    pub(crate) fn subscribe_inner(
        &self,
        peer: &str,
        query: QueryFingerprint,
        auto: bool,
    ) -> SyncResult<SyncTaskHandle> {
        self.ensure_active()?;
        self.check_peer_id_valid(peer)?;
        let query_id = query.identify();
        if query_id.is_empty() {
            return Err(SyncError::invalid_args("query has no identity"));
        }
        self.registry.local_subscribe_limit_check(&[peer], &query)?;
        self.registry.reserve_local(peer, &query)?;

        let mut request = SubscribeRequest::subscribe(query.clone());
        if auto {
            request = request.auto_subscribe();
        }
        request.control.version = self.config.software_version;

        let result = self.send_control(peer, request, &query_id, ControlCommand::Subscribe, query);
        if result.is_err() {
            self.registry.delete_local(peer, &query_id);
        }
        result
    }

    pub(crate) fn unsubscribe_inner(
        &self,
        peer: &str,
        query: QueryFingerprint,
    ) -> SyncResult<SyncTaskHandle> {
        self.ensure_active()?;
        self.check_peer_id_valid(peer)?;
        let query_id = query.identify();
        if query_id.is_empty() {
            return Err(SyncError::invalid_args("query has no identity"));
        }
        let mut request = SubscribeRequest::unsubscribe(query.clone());
        request.control.version = self.config.software_version;
        self.send_control(peer, request, &query_id, ControlCommand::Unsubscribe, query)
    }

    fn send_control(
        &self,
        peer: &str,
        request: SubscribeRequest,
        query_id: &str,
        command: ControlCommand,
        query: QueryFingerprint,
    ) -> SyncResult<SyncTaskHandle> {
        let context = self.context_for(peer)?;
        let session = self.next_session();
        let task = SyncTaskHandle::new(self.next_task_id(), peer, query_id, 1);
        context.track(
            session,
            PendingRequest::Control {
                task: task.clone(),
                command,
                query,
            },
        );

        let message = Message::new(
            MessageId::ControlSync,
            MessageType::Request,
            Packet::Subscribe(request),
        )
        .with_session(session, 0);
        if let Err(err) = self.send(peer, &message) {
            context.take(session);
            task.fail(err.clone());
            warn!(peer = %mask_peer(peer), ?command, %err, "failed to send control request");
            return Err(err);
        }
        info!(peer = %mask_peer(peer), ?command, query = query_id, session, "control request sent");
        Ok(task)
    }

    /// Sends local items newer than the peer's send watermark.
    ///
    /// With `skip_empty` nothing is sent when there are no new items and
    /// `Ok(None)` is returned.
    pub(crate) fn push_inner(
        &self,
        peer: &str,
        query: Option<QueryFingerprint>,
        skip_empty: bool,
    ) -> SyncResult<Option<SyncTaskHandle>> {
        self.ensure_active()?;
        self.check_peer_id_valid(peer)?;
        let query_id = query.as_ref().map(|q| q.identify()).unwrap_or_default();
        if query.is_some() && query_id.is_empty() {
            return Err(SyncError::invalid_args("query has no identity"));
        }

        let watermark_key = send_watermark_key(peer, &query_id);
        let since = self.collab.metadata.get_watermark(&watermark_key)?;
        let items = self.collab.storage.get_sync_data(query.as_ref(), since)?;
        if items.is_empty() && skip_empty {
            return Ok(None);
        }

        let batches = batch_items(items, self.config.sync_batch_items);
        let context = self.context_for(peer)?;
        let task = SyncTaskHandle::new(self.next_task_id(), peer, &query_id, batches.len());
        let (id, mode) = match query {
            Some(_) => (MessageId::QuerySync, SyncMode::QueryPush),
            None => (MessageId::DataSync, SyncMode::Push),
        };

        let last = batches.len() - 1;
        for (index, batch) in batches.into_iter().enumerate() {
            let session = self.next_session();
            let end_watermark = batch.iter().map(|item| item.timestamp).max().unwrap_or(since);
            let count = batch.len();
            let mut packet = DataRequestPacket::new(mode).with_version(self.config.software_version);
            if let Some(query) = &query {
                packet = packet.with_query(query.clone());
            }
            packet = packet.with_packet_id(u64::from(session));
            packet.session_id = session;
            packet.local_watermark = since;
            packet.end_watermark = end_watermark;
            packet.set_items(batch);
            if self.config.software_version > SOFTWARE_VERSION_RELEASE_2_0 {
                if index == last {
                    packet.flag |= DATA_FLAG_LAST_SEQUENCE;
                }
                if self.config.compress_items && count > 0 {
                    packet.compress(CompressAlgorithm::Zlib)?;
                }
            }

            context.track(
                session,
                PendingRequest::Data {
                    task: task.clone(),
                    watermark_key: watermark_key.clone(),
                },
            );
            let message = Message::new(id, MessageType::Request, Packet::DataRequest(packet))
                .with_session(session, index as u32);
            if let Err(err) = self.send(peer, &message) {
                context.take(session);
                task.fail(err.clone());
                warn!(peer = %mask_peer(peer), %err, "failed to send data batch");
                return Err(err);
            }
            debug!(
                peer = %mask_peer(peer),
                query = %query_id,
                session,
                items = count,
                end_watermark,
                "data batch sent"
            );
        }
        Ok(Some(task))
    }

    pub(crate) fn notify_local_data_changed(&self) -> SyncResult<Vec<SyncTaskHandle>> {
        self.ensure_active()?;
        let mut tasks = Vec::new();
        for (peer, query) in self.registry.active_remote_subscriptions() {
            match self.push_inner(&peer, Some(query), true) {
                Ok(Some(task)) => tasks.push(task),
                Ok(None) => {}
                Err(err) => warn!(peer = %mask_peer(&peer), %err, "failed to push subscribed data"),
            }
        }

        let listeners: Vec<String> = self.listener_peers.lock().iter().cloned().collect();
        for peer in listeners {
            if !self.is_peer_online(&peer) {
                continue;
            }
            let message = Message::new(MessageId::LocalDataChanged, MessageType::Notify, Packet::Empty)
                .with_session(self.next_session(), 0);
            if let Err(err) = self.send(&peer, &message) {
                warn!(peer = %mask_peer(&peer), %err, "failed to send change notification");
            }
        }
        Ok(tasks)
    }
}

/// Splits `items` into batches of at most `per_batch`. Always yields at least
/// one, possibly empty, batch.
fn batch_items(items: Vec<DataItem>, per_batch: usize) -> Vec<Vec<DataItem>> {
    if items.is_empty() {
        return vec![Vec::new()];
    }
    let per_batch = per_batch.max(1);
    let mut batches = Vec::with_capacity(items.len().div_ceil(per_batch));
    let mut current = Vec::with_capacity(per_batch.min(items.len()));
    for item in items {
        current.push(item);
        if current.len() == per_batch {
            batches.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(n: u64) -> Vec<DataItem> {
        (1..=n).map(|i| DataItem::put(format!("k{i}"), "v", i)).collect()
    }

    #[test]
    fn batches_split_evenly() {
        let batches = batch_items(items(5), 2);
        let sizes: Vec<usize> = batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(batches[2][0].timestamp, 5);
    }

    #[test]
    fn empty_input_gives_one_empty_batch() {
        let batches = batch_items(Vec::new(), 10);
        assert_eq!(batches.len(), 1);
        assert!(batches[0].is_empty());
    }
}
