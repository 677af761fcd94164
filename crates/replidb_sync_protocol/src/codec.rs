//! Message-level wire codec.
//!
//! Dispatch is two-level. Message ids with a registered
//! [`MessageTransform`] (remote query by default) are handled by it.
//! Everything else goes through the built-in path, which picks the packet
//! type from the message type (request vs. response/notify) and whether the
//! id is a control or a data message.

use crate::error::{ProtocolError, ProtocolResult};
use crate::frame::{Frame, FrameHeader, FRAME_HEADER_LEN};
use crate::message::{Message, MessageId, MessageType, Packet};
use crate::packet::{
    ControlAckPacket, DataAckPacket, DataRequestPacket, RemoteExecutorAckPacket,
    RemoteExecutorRequestPacket, SubscribeRequest, SyncPacket,
};
use bytes::Bytes;
use parking_lot::RwLock;
use replidb_codec::ParcelWriter;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Codec for the messages of one feature, registered by message id.
pub trait MessageTransform: Send + Sync {
    /// Payload length of `message`.
    fn length(&self, message: &Message) -> ProtocolResult<usize>;

    /// Write the payload of `message`.
    fn serialize(&self, message: &Message, writer: &mut ParcelWriter) -> ProtocolResult<()>;

    /// Decode a payload of the given message type.
    fn deserialize(&self, msg_type: MessageType, payload: &[u8]) -> ProtocolResult<Packet>;
}

/// Codec for [`MessageId::RemoteExecute`].
#[derive(Debug, Default, Clone, Copy)]
pub struct RemoteExecutorTransform;

impl RemoteExecutorTransform {
    fn check_shape(message: &Message) -> ProtocolResult<()> {
        match (message.msg_type, &message.packet) {
            (MessageType::Request, Packet::RemoteRequest(_))
            | (MessageType::Response, Packet::RemoteAck(_)) => Ok(()),
            (msg_type, packet) => Err(ProtocolError::invalid_args(format!(
                "remote execute {msg_type:?} cannot carry {}",
                packet.kind()
            ))),
        }
    }
}

impl MessageTransform for RemoteExecutorTransform {
    fn length(&self, message: &Message) -> ProtocolResult<usize> {
        Self::check_shape(message)?;
        Ok(message.packet.length())
    }

    fn serialize(&self, message: &Message, writer: &mut ParcelWriter) -> ProtocolResult<()> {
        Self::check_shape(message)?;
        message.packet.serialize(writer)
    }

    fn deserialize(&self, msg_type: MessageType, payload: &[u8]) -> ProtocolResult<Packet> {
        match msg_type {
            MessageType::Request => Ok(Packet::RemoteRequest(
                RemoteExecutorRequestPacket::from_bytes(payload)?,
            )),
            MessageType::Response => Ok(Packet::RemoteAck(RemoteExecutorAckPacket::from_bytes(
                payload,
            )?)),
            MessageType::Notify => Err(ProtocolError::not_supported("remote execute notify")),
        }
    }
}

/// Encodes messages into frames and decodes frames back into messages.
pub struct WireCodec {
    transforms: RwLock<HashMap<MessageId, Arc<dyn MessageTransform>>>,
}

impl WireCodec {
    /// Creates a codec with the remote query transform registered.
    pub fn new() -> Self {
        let codec = Self {
            transforms: RwLock::new(HashMap::new()),
        };
        codec.register(MessageId::RemoteExecute, Arc::new(RemoteExecutorTransform));
        codec
    }

    /// Registers a transform for `id`, replacing any previous one.
    pub fn register(&self, id: MessageId, transform: Arc<dyn MessageTransform>) {
        debug!(?id, "registering message transform");
        self.transforms.write().insert(id, transform);
    }

    /// Removes the transform for `id`.
    pub fn unregister(&self, id: MessageId) -> Option<Arc<dyn MessageTransform>> {
        self.transforms.write().remove(&id)
    }

    fn transform(&self, id: MessageId) -> Option<Arc<dyn MessageTransform>> {
        self.transforms.read().get(&id).cloned()
    }

    /// Payload length of `message`.
    ///
    /// # Errors
    ///
    /// `NotSupported` for ids without a codec, `InvalidArgs` when the packet
    /// does not fit the id and type.
    pub fn payload_len(&self, message: &Message) -> ProtocolResult<usize> {
        if let Some(transform) = self.transform(message.id) {
            return transform.length(message);
        }
        check_shape(message)?;
        Ok(message.packet.length())
    }

    /// Encode `message` into a complete frame.
    pub fn encode(&self, message: &Message) -> ProtocolResult<Vec<u8>> {
        let payload_len = self.payload_len(message)?;
        let mut writer = ParcelWriter::with_length(FRAME_HEADER_LEN + payload_len);
        FrameHeader {
            id: message.id,
            msg_type: message.msg_type,
            session_id: message.session_id,
            sequence_id: message.sequence_id,
            error_no: message.error_no,
        }
        .write_to(&mut writer);
        match self.transform(message.id) {
            Some(transform) => transform.serialize(message, &mut writer)?,
            None => message.packet.serialize(&mut writer)?,
        }
        Ok(writer.finish()?)
    }

    /// Parse a raw frame header.
    pub fn parse_frame(&self, bytes: Bytes) -> ProtocolResult<Frame> {
        Frame::parse(bytes)
    }

    /// Bytes a frame accounts for while queued, or 0 when this codec cannot
    /// decode it.
    pub fn frame_len(&self, frame: &Frame) -> usize {
        let id = frame.header.id;
        let decodable = self.transform(id).is_some()
            || id.is_data()
            || id.is_control()
            || id == MessageId::LocalDataChanged;
        if !decodable || (frame.payload.is_empty() && id != MessageId::LocalDataChanged) {
            return 0;
        }
        FRAME_HEADER_LEN + frame.payload.len()
    }

    /// Decode the payload of a frame.
    ///
    /// # Errors
    ///
    /// Any packet decode error. Feedback frames carry no payload and decode
    /// to [`Packet::Empty`].
    pub fn decode(&self, frame: &Frame) -> ProtocolResult<Message> {
        let header = frame.header;
        let packet = if frame.is_feedback() {
            Packet::Empty
        } else if let Some(transform) = self.transform(header.id) {
            transform.deserialize(header.msg_type, &frame.payload)?
        } else {
            decode_default(header.id, header.msg_type, &frame.payload)?
        };
        Ok(Message {
            id: header.id,
            msg_type: header.msg_type,
            session_id: header.session_id,
            sequence_id: header.sequence_id,
            error_no: header.error_no,
            packet,
        })
    }
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WireCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<MessageId> = self.transforms.read().keys().copied().collect();
        f.debug_struct("WireCodec").field("transforms", &ids).finish()
    }
}

fn check_shape(message: &Message) -> ProtocolResult<()> {
    let id = message.id;
    let ok = match (message.msg_type, &message.packet) {
        _ if message.is_feedback() => matches!(message.packet, Packet::Empty),
        (_, Packet::Empty) => id == MessageId::LocalDataChanged,
        (MessageType::Request, Packet::Subscribe(_)) => id.is_control(),
        (MessageType::Response, Packet::ControlAck(_)) => id.is_control(),
        (MessageType::Request, Packet::DataRequest(_)) => id.is_data(),
        (MessageType::Response | MessageType::Notify, Packet::DataAck(_)) => id.is_data(),
        _ => false,
    };
    if ok {
        return Ok(());
    }
    if !(id.is_data() || id.is_control() || id == MessageId::LocalDataChanged) {
        return Err(ProtocolError::not_supported(format!("message id {id:?}")));
    }
    Err(ProtocolError::invalid_args(format!(
        "{id:?} {:?} cannot carry {}",
        message.msg_type,
        message.packet.kind()
    )))
}

fn decode_default(id: MessageId, msg_type: MessageType, payload: &[u8]) -> ProtocolResult<Packet> {
    if id == MessageId::LocalDataChanged {
        return Ok(Packet::Empty);
    }
    if id.is_control() {
        return match msg_type {
            MessageType::Request => Ok(Packet::Subscribe(SubscribeRequest::from_bytes(payload)?)),
            MessageType::Response => Ok(Packet::ControlAck(ControlAckPacket::from_bytes(payload)?)),
            MessageType::Notify => Err(ProtocolError::not_supported("control notify")),
        };
    }
    if id.is_data() {
        return match msg_type {
            MessageType::Request => Ok(Packet::DataRequest(DataRequestPacket::from_bytes(payload)?)),
            MessageType::Response | MessageType::Notify => {
                Ok(Packet::DataAck(DataAckPacket::from_bytes(payload)?))
            }
        };
    }
    Err(ProtocolError::not_supported(format!("message id {id:?}")))
}
