//! Frame envelope handed to the communicator.
//!
//! A frame is a fixed 24-byte header followed by the packet payload:
//!
//! | field       | type |
//! |-------------|------|
//! | magic       | u32  |
//! | message id  | u32  |
//! | type        | u32  |
//! | session id  | u32  |
//! | sequence id | u32  |
//! | error no    | u32  |

use crate::error::{ProtocolError, ProtocolResult};
use crate::message::{MessageId, MessageType};
use bytes::Bytes;
use replidb_codec::{ParcelReader, ParcelWriter};

/// Magic number leading every frame.
pub const FRAME_MAGIC: u32 = 0x5244_4246;

/// Length of the frame header.
pub const FRAME_HEADER_LEN: usize = 24;

/// Routing header of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Message id.
    pub id: MessageId,
    /// Message type.
    pub msg_type: MessageType,
    /// Session id.
    pub session_id: u32,
    /// Sequence id.
    pub sequence_id: u32,
    /// Non-zero for transport-level error feedback.
    pub error_no: u32,
}

impl FrameHeader {
    pub(crate) fn write_to(&self, writer: &mut ParcelWriter) {
        writer.write_u32(FRAME_MAGIC);
        writer.write_u32(self.id as u32);
        writer.write_u32(self.msg_type as u32);
        writer.write_u32(self.session_id);
        writer.write_u32(self.sequence_id);
        writer.write_u32(self.error_no);
    }
}

/// A received frame: header decoded, payload still raw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Routing header.
    pub header: FrameHeader,
    /// Packet payload.
    pub payload: Bytes,
}

impl Frame {
    /// Parse the header of a raw frame.
    ///
    /// # Errors
    ///
    /// `LengthError` for input shorter than a header, `ParseFail` for a bad
    /// magic or message type, `NotSupported` for an unknown message id.
    pub fn parse(bytes: Bytes) -> ProtocolResult<Self> {
        let mut reader = ParcelReader::new(&bytes);
        let magic = reader.read_u32();
        let id = reader.read_u32();
        let msg_type = reader.read_u32();
        let session_id = reader.read_u32();
        let sequence_id = reader.read_u32();
        let error_no = reader.read_u32();
        reader.status()?;
        if magic != FRAME_MAGIC {
            return Err(ProtocolError::parse_fail(format!("bad frame magic {magic:#x}")));
        }
        let id = MessageId::from_u32(id)
            .ok_or_else(|| ProtocolError::not_supported(format!("message id {id}")))?;
        let msg_type = MessageType::from_u32(msg_type)
            .ok_or_else(|| ProtocolError::parse_fail(format!("message type {msg_type}")))?;
        Ok(Self {
            header: FrameHeader {
                id,
                msg_type,
                session_id,
                sequence_id,
                error_no,
            },
            payload: bytes.slice(FRAME_HEADER_LEN..),
        })
    }

    /// Returns true for transport-level error feedback.
    pub fn is_feedback(&self) -> bool {
        self.header.error_no != 0
    }
}
