//! Processing of queued messages on dispatch tasks.

use crate::context::{PeerContext, PendingRequest};
use crate::coordinator::{CoordinatorInner, QueuedMessage};
use crate::error::{SyncError, SyncResult};
use crate::storage::recv_watermark_key;
use crate::transport::mask_peer;
use replidb_sync_protocol::{
    status, ControlAckPacket, ControlCommand, DataAckPacket, DataRequestPacket, FrameHeader,
    Message, MessageType, Packet, QueryFingerprint, SubscribeRequest, SyncMode,
};
use tracing::{debug, error, info, warn};

/// Modes whose request carries items for the receiver to apply.
fn carries_data(mode: SyncMode) -> bool {
    !matches!(
        mode,
        SyncMode::Pull | SyncMode::QueryPull | SyncMode::UnsubscribeQuery
    )
}

fn response(header: &FrameHeader, packet: Packet) -> Message {
    Message::new(header.id, MessageType::Response, packet)
        .with_session(header.session_id, header.sequence_id)
}

impl CoordinatorInner {
    pub(crate) fn process(&self, context: &PeerContext, queued: QueuedMessage) {
        if context.is_killed() || !self.is_active() {
            debug!(peer = %mask_peer(&queued.peer), "dropping message, context killed");
            return;
        }
        let _running = context.begin();
        let peer = queued.peer.as_str();
        let header = queued.frame.header;

        let message = match self.codec.decode(&queued.frame) {
            Ok(message) => message,
            Err(err) => {
                error!(peer = %mask_peer(peer), id = ?header.id, %err, "failed to decode message");
                self.reply_decode_error(peer, &header, err.into());
                return;
            }
        };

        if message.is_feedback() {
            self.handle_feedback(context, peer, &header);
            return;
        }

        let result = match message.packet {
            Packet::DataRequest(packet) => self.handle_data_request(peer, &header, packet),
            Packet::DataAck(ack) => self.handle_data_ack(context, peer, &header, &ack),
            Packet::Subscribe(request) => self.handle_subscribe_request(peer, &header, request),
            Packet::ControlAck(ack) => self.handle_control_ack(context, peer, &header, &ack),
            other => Err(SyncError::NotSupported(format!(
                "{} on {:?}",
                other.kind(),
                header.id
            ))),
        };
        if let Err(err) = result {
            warn!(
                peer = %mask_peer(peer),
                id = ?header.id,
                session = header.session_id,
                %err,
                "message handling failed"
            );
        }
    }

    fn reply_decode_error(&self, peer: &str, header: &FrameHeader, err: SyncError) {
        if header.msg_type != MessageType::Request || !header.id.is_data() {
            return;
        }
        let mut ack = DataAckPacket::new(err.code(), 0);
        ack.version = self.config.software_version;
        if let Err(send_err) = self.send(peer, &response(header, Packet::DataAck(ack))) {
            warn!(peer = %mask_peer(peer), err = %send_err, "failed to report decode error");
        }
    }

    fn handle_feedback(&self, context: &PeerContext, peer: &str, header: &FrameHeader) {
        warn!(
            peer = %mask_peer(peer),
            session = header.session_id,
            error_no = header.error_no,
            "peer reported transport error"
        );
        if let Some(pending) = context.take(header.session_id) {
            pending.task().fail(SyncError::transport_retryable(format!(
                "peer reported error {}",
                header.error_no
            )));
        }
    }

    fn handle_data_request(
        &self,
        peer: &str,
        header: &FrameHeader,
        packet: DataRequestPacket,
    ) -> SyncResult<()> {
        let packet_id = packet.packet_id();
        let end_watermark = packet.end_watermark;
        let result = self.apply_data(peer, packet);

        let code = match &result {
            Ok(()) => status::OK,
            Err(err) => err.code(),
        };
        let mut ack = DataAckPacket::new(code, end_watermark);
        ack.version = self.config.software_version;
        if let Some(id) = packet_id {
            ack = ack.with_packet_id(id);
        }
        self.send(peer, &response(header, Packet::DataAck(ack)))?;
        result
    }

    fn apply_data(&self, peer: &str, packet: DataRequestPacket) -> SyncResult<()> {
        if !carries_data(packet.mode) {
            return Err(SyncError::NotSupported(format!("sync mode {:?}", packet.mode)));
        }
        let end_watermark = packet.end_watermark;
        let key = recv_watermark_key(peer, &packet.query_id);
        let items = packet.into_items();
        let count = items.len();
        if count > 0 {
            self.collab.storage.put_sync_data(peer, items)?;
        }
        self.advance_watermark(&key, end_watermark)?;
        debug!(peer = %mask_peer(peer), items = count, end_watermark, "applied data batch");
        Ok(())
    }

    fn advance_watermark(&self, key: &str, watermark: u64) -> SyncResult<()> {
        let current = self.collab.metadata.get_watermark(key)?;
        if watermark > current {
            self.collab.metadata.set_watermark(key, watermark)?;
        }
        Ok(())
    }

    fn handle_data_ack(
        &self,
        context: &PeerContext,
        peer: &str,
        header: &FrameHeader,
        ack: &DataAckPacket,
    ) -> SyncResult<()> {
        let Some(pending) = context.take(header.session_id) else {
            debug!(peer = %mask_peer(peer), session = header.session_id, "ack without pending request");
            return Ok(());
        };
        let (task, watermark_key) = match pending {
            PendingRequest::Data {
                task,
                watermark_key,
            } => (task, watermark_key),
            other => {
                let err = SyncError::internal("data ack for a control request");
                other.task().fail(err.clone());
                return Err(err);
            }
        };

        if let Err(err) = SyncError::check_code(ack.recv_code) {
            task.fail(err.clone());
            return Err(err);
        }
        if let Err(err) = self.advance_watermark(&watermark_key, ack.watermark) {
            task.fail(err.clone());
            return Err(err);
        }
        task.ack_one();
        Ok(())
    }

    fn handle_subscribe_request(
        &self,
        peer: &str,
        header: &FrameHeader,
        request: SubscribeRequest,
    ) -> SyncResult<()> {
        match request.command() {
            ControlCommand::Subscribe => self.accept_subscribe(peer, header, &request.query),
            ControlCommand::Unsubscribe => self.accept_unsubscribe(peer, header, &request.query),
        }
    }

    fn send_control_ack(
        &self,
        peer: &str,
        header: &FrameHeader,
        command: ControlCommand,
        code: i32,
    ) -> SyncResult<()> {
        let mut ack = ControlAckPacket::new(command, code);
        ack.version = self.config.software_version;
        self.send(peer, &response(header, Packet::ControlAck(ack)))
    }

    fn reject_subscribe(&self, peer: &str, header: &FrameHeader, err: SyncError) -> SyncResult<()> {
        if let Err(send_err) =
            self.send_control_ack(peer, header, ControlCommand::Subscribe, err.code())
        {
            warn!(peer = %mask_peer(peer), err = %send_err, "failed to send subscribe rejection");
        }
        Err(err)
    }

    fn accept_subscribe(
        &self,
        peer: &str,
        header: &FrameHeader,
        query: &QueryFingerprint,
    ) -> SyncResult<()> {
        let query_id = query.identify();
        if query_id.is_empty() {
            return self.reject_subscribe(peer, header, SyncError::invalid_args("query has no identity"));
        }
        if let Err(err) = self.collab.storage.add_subscription_side_state(&query_id, query) {
            return self.reject_subscribe(peer, header, err);
        }
        if let Err(err) = self.registry.reserve_remote(peer, query) {
            if !self.registry.is_query_exist_subscribe(&query_id) {
                self.drop_side_state(std::slice::from_ref(&query_id));
            }
            return self.reject_subscribe(peer, header, err);
        }

        if let Err(err) = self.send_control_ack(peer, header, ControlCommand::Subscribe, status::OK) {
            self.registry.delete_remote(peer, &query_id);
            if !self.registry.is_query_exist_subscribe(&query_id) {
                self.drop_side_state(std::slice::from_ref(&query_id));
            }
            return Err(err);
        }
        self.registry.activate_remote(peer, &query_id)?;
        info!(peer = %mask_peer(peer), query = %query_id, "remote subscription active");

        if let Err(err) = self.push_inner(peer, Some(query.clone()), true) {
            warn!(peer = %mask_peer(peer), %err, "initial push for subscription failed");
        }
        Ok(())
    }

    fn accept_unsubscribe(
        &self,
        peer: &str,
        header: &FrameHeader,
        query: &QueryFingerprint,
    ) -> SyncResult<()> {
        let query_id = query.identify();
        if self.registry.is_last_remote_contain_subscribe(peer, &query_id) {
            self.drop_side_state(std::slice::from_ref(&query_id));
        }
        let sent = self.send_control_ack(peer, header, ControlCommand::Unsubscribe, status::OK);
        self.registry.remove_remote(peer, &query_id);
        info!(peer = %mask_peer(peer), query = %query_id, "remote subscription removed");
        sent
    }

    fn handle_control_ack(
        &self,
        context: &PeerContext,
        peer: &str,
        header: &FrameHeader,
        ack: &ControlAckPacket,
    ) -> SyncResult<()> {
        let Some(pending) = context.take(header.session_id) else {
            debug!(peer = %mask_peer(peer), session = header.session_id, "ack without pending request");
            return Ok(());
        };
        let (task, command, query) = match pending {
            PendingRequest::Control {
                task,
                command,
                query,
            } => (task, command, query),
            other => {
                let err = SyncError::internal("control ack for a data request");
                other.task().fail(err.clone());
                return Err(err);
            }
        };
        if ack.command != command {
            let err = SyncError::internal(format!(
                "ack for {:?} answers a {command:?} request",
                ack.command
            ));
            task.fail(err.clone());
            return Err(err);
        }

        let query_id = query.identify();
        match (command, SyncError::check_code(ack.recv_code)) {
            (ControlCommand::Subscribe, Ok(())) => {
                self.registry.activate_local(peer, &query_id).map_err(|err| {
                    task.fail(err.clone());
                    err
                })?;
                task.ack_one();
                info!(peer = %mask_peer(peer), query = %query_id, "subscription active");
            }
            (ControlCommand::Subscribe, Err(err)) => {
                self.registry.delete_local(peer, &query_id);
                task.fail(err.clone());
                warn!(peer = %mask_peer(peer), query = %query_id, %err, "subscription rejected");
            }
            (ControlCommand::Unsubscribe, Ok(())) => {
                self.registry.remove_local(peer, &query_id);
                task.ack_one();
                info!(peer = %mask_peer(peer), query = %query_id, "unsubscribed");
            }
            (ControlCommand::Unsubscribe, Err(err)) => {
                task.fail(err.clone());
                warn!(peer = %mask_peer(peer), query = %query_id, %err, "unsubscribe rejected");
            }
        }
        Ok(())
    }
}
