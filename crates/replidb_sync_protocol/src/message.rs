//! Protocol message envelope.

use crate::error::ProtocolResult;
use crate::packet::{
    ControlAckPacket, DataAckPacket, DataRequestPacket, RemoteExecutorAckPacket,
    RemoteExecutorRequestPacket, SubscribeRequest, SyncPacket,
};
use replidb_codec::ParcelWriter;
use serde::{Deserialize, Serialize};

/// Message id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum MessageId {
    /// Clock offset negotiation.
    TimeSync = 1,
    /// Watermark-based item sync.
    DataSync = 2,
    /// Multi-version commit history.
    CommitHistorySync = 3,
    /// Multi-version data.
    MultiVerDataSync = 4,
    /// Large value slices.
    ValueSliceSync = 5,
    /// Change notification without data.
    LocalDataChanged = 6,
    /// Capability negotiation.
    AbilitySync = 7,
    /// Query-scoped item sync.
    QuerySync = 8,
    /// Subscription control.
    ControlSync = 9,
    /// Remote query execution.
    RemoteExecute = 10,
}

impl MessageId {
    /// Decode a message id from its wire value.
    pub fn from_u32(value: u32) -> Option<Self> {
        use MessageId::*;
        Some(match value {
            1 => TimeSync,
            2 => DataSync,
            3 => CommitHistorySync,
            4 => MultiVerDataSync,
            5 => ValueSliceSync,
            6 => LocalDataChanged,
            7 => AbilitySync,
            8 => QuerySync,
            9 => ControlSync,
            10 => RemoteExecute,
            _ => return None,
        })
    }

    /// Returns true for messages that carry data items.
    pub fn is_data(self) -> bool {
        matches!(self, MessageId::DataSync | MessageId::QuerySync)
    }

    /// Returns true for messages that manage subscription state.
    pub fn is_control(self) -> bool {
        matches!(self, MessageId::ControlSync)
    }
}

/// Message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum MessageType {
    /// Request expecting a response.
    Request = 1,
    /// Response to a request.
    Response = 2,
    /// One-way notification.
    Notify = 3,
}

impl MessageType {
    /// Decode a message type from its wire value.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(MessageType::Request),
            2 => Some(MessageType::Response),
            3 => Some(MessageType::Notify),
            _ => None,
        }
    }
}

/// Typed payload of a message.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// Data request.
    DataRequest(DataRequestPacket),
    /// Data ack.
    DataAck(DataAckPacket),
    /// Subscribe or unsubscribe request.
    Subscribe(SubscribeRequest),
    /// Control ack.
    ControlAck(ControlAckPacket),
    /// Remote query request.
    RemoteRequest(RemoteExecutorRequestPacket),
    /// Remote query ack.
    RemoteAck(RemoteExecutorAckPacket),
    /// No payload.
    Empty,
}

impl Packet {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::DataRequest(_) => "data_request",
            Packet::DataAck(_) => "data_ack",
            Packet::Subscribe(_) => "subscribe",
            Packet::ControlAck(_) => "control_ack",
            Packet::RemoteRequest(_) => "remote_request",
            Packet::RemoteAck(_) => "remote_ack",
            Packet::Empty => "empty",
        }
    }

    pub(crate) fn length(&self) -> usize {
        match self {
            Packet::DataRequest(p) => p.length(),
            Packet::DataAck(p) => p.length(),
            Packet::Subscribe(p) => p.length(),
            Packet::ControlAck(p) => p.length(),
            Packet::RemoteRequest(p) => p.length(),
            Packet::RemoteAck(p) => p.length(),
            Packet::Empty => 0,
        }
    }

    pub(crate) fn serialize(&self, writer: &mut ParcelWriter) -> ProtocolResult<()> {
        match self {
            Packet::DataRequest(p) => p.serialize(writer),
            Packet::DataAck(p) => p.serialize(writer),
            Packet::Subscribe(p) => p.serialize(writer),
            Packet::ControlAck(p) => p.serialize(writer),
            Packet::RemoteRequest(p) => p.serialize(writer),
            Packet::RemoteAck(p) => p.serialize(writer),
            Packet::Empty => Ok(()),
        }
    }
}

/// A protocol message: routing header plus typed packet.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Message id.
    pub id: MessageId,
    /// Message type.
    pub msg_type: MessageType,
    /// Session the message belongs to.
    pub session_id: u32,
    /// Sequence number within the session.
    pub sequence_id: u32,
    /// Non-zero for transport-level error feedback.
    pub error_no: u32,
    /// Payload.
    pub packet: Packet,
}

impl Message {
    /// Creates a message.
    pub fn new(id: MessageId, msg_type: MessageType, packet: Packet) -> Self {
        Self {
            id,
            msg_type,
            session_id: 0,
            sequence_id: 0,
            error_no: 0,
            packet,
        }
    }

    /// Sets the session and sequence ids.
    pub fn with_session(mut self, session_id: u32, sequence_id: u32) -> Self {
        self.session_id = session_id;
        self.sequence_id = sequence_id;
        self
    }

    /// Returns true for transport-level error feedback.
    pub fn is_feedback(&self) -> bool {
        self.error_no != 0
    }
}
