//! Control packets for subscription management.

use super::{check_version, SyncPacket};
use crate::error::{status, ProtocolError, ProtocolResult};
use crate::query::QueryFingerprint;
use crate::version::SOFTWARE_VERSION_CURRENT;
use replidb_codec::{len, ParcelReader, ParcelWriter};
use serde::{Deserialize, Serialize};

/// The subscription was created automatically after a reconnect.
pub const CONTROL_FLAG_AUTO_SUBSCRIBE: u32 = 0x1;

const CONTROL_HEAD_LEN: usize = len::align8(len::U32 * 4);

/// Control command carried by control packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum ControlCommand {
    /// Start notifying the sender about changes matching a query.
    Subscribe = 0,
    /// Stop notifying the sender.
    Unsubscribe = 1,
}

impl ControlCommand {
    /// Wire value of the first invalid command.
    pub const INVALID: u32 = 2;

    /// Decode a command from its wire value.
    ///
    /// # Errors
    ///
    /// Values at or above [`ControlCommand::INVALID`] fail with `InvalidArgs`.
    pub fn from_u32(value: u32) -> ProtocolResult<Self> {
        match value {
            0 => Ok(ControlCommand::Subscribe),
            1 => Ok(ControlCommand::Unsubscribe),
            other => Err(ProtocolError::invalid_args(format!(
                "invalid control command {other}"
            ))),
        }
    }
}

/// Common head of every control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRequestPacket {
    /// Sender software version.
    pub version: u32,
    /// Sender status code.
    pub send_code: i32,
    /// Command.
    pub command: ControlCommand,
    /// `CONTROL_FLAG_*` bits.
    pub flag: u32,
}

impl ControlRequestPacket {
    /// Creates a current-version request.
    pub fn new(command: ControlCommand) -> Self {
        Self {
            version: SOFTWARE_VERSION_CURRENT,
            send_code: status::OK,
            command,
            flag: 0,
        }
    }

    /// Returns true if the request was created by automatic resubscription.
    pub fn is_auto_subscribe(&self) -> bool {
        self.flag & CONTROL_FLAG_AUTO_SUBSCRIBE != 0
    }
}

impl SyncPacket for ControlRequestPacket {
    fn length(&self) -> usize {
        CONTROL_HEAD_LEN
    }

    fn serialize(&self, writer: &mut ParcelWriter) -> ProtocolResult<()> {
        writer.write_u32(self.version);
        writer.write_i32(self.send_code);
        writer.write_u32(self.command as u32);
        writer.write_u32(self.flag);
        writer.align8();
        writer.status()?;
        Ok(())
    }

    fn deserialize(reader: &mut ParcelReader<'_>) -> ProtocolResult<Self> {
        let version = reader.read_u32();
        let send_code = reader.read_i32();
        let command = reader.read_u32();
        let flag = reader.read_u32();
        reader.align8();
        reader.status()?;
        check_version(version, SOFTWARE_VERSION_CURRENT)?;
        Ok(Self {
            version,
            send_code,
            command: ControlCommand::from_u32(command)?,
            flag,
        })
    }
}

/// Subscribe or unsubscribe request: a control head plus the query.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeRequest {
    /// Control head.
    pub control: ControlRequestPacket,
    /// Query being subscribed to.
    pub query: QueryFingerprint,
}

impl SubscribeRequest {
    /// Creates a subscribe request.
    pub fn subscribe(query: QueryFingerprint) -> Self {
        Self {
            control: ControlRequestPacket::new(ControlCommand::Subscribe),
            query,
        }
    }

    /// Creates an unsubscribe request.
    pub fn unsubscribe(query: QueryFingerprint) -> Self {
        Self {
            control: ControlRequestPacket::new(ControlCommand::Unsubscribe),
            query,
        }
    }

    /// Marks the request as an automatic resubscription.
    pub fn auto_subscribe(mut self) -> Self {
        self.control.flag |= CONTROL_FLAG_AUTO_SUBSCRIBE;
        self
    }

    /// Command of the request.
    pub fn command(&self) -> ControlCommand {
        self.control.command
    }
}

impl SyncPacket for SubscribeRequest {
    fn length(&self) -> usize {
        self.control.length() + self.query.parcel_len()
    }

    fn serialize(&self, writer: &mut ParcelWriter) -> ProtocolResult<()> {
        self.control.serialize(writer)?;
        self.query.write_to(writer)
    }

    fn deserialize(reader: &mut ParcelReader<'_>) -> ProtocolResult<Self> {
        let control = ControlRequestPacket::deserialize(reader)?;
        let query = QueryFingerprint::read_from(reader)?;
        Ok(Self { control, query })
    }
}

/// Acknowledgement of a control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlAckPacket {
    /// Receiver software version.
    pub version: u32,
    /// Receiver status code.
    pub recv_code: i32,
    /// Command being acknowledged.
    pub command: ControlCommand,
    /// Echo of the request flags.
    pub flag: u32,
}

impl ControlAckPacket {
    /// Creates a current-version ack.
    pub fn new(command: ControlCommand, recv_code: i32) -> Self {
        Self {
            version: SOFTWARE_VERSION_CURRENT,
            recv_code,
            command,
            flag: 0,
        }
    }
}

impl SyncPacket for ControlAckPacket {
    fn length(&self) -> usize {
        CONTROL_HEAD_LEN
    }

    fn serialize(&self, writer: &mut ParcelWriter) -> ProtocolResult<()> {
        writer.write_u32(self.version);
        writer.write_i32(self.recv_code);
        writer.write_u32(self.command as u32);
        writer.write_u32(self.flag);
        writer.align8();
        writer.status()?;
        Ok(())
    }

    fn deserialize(reader: &mut ParcelReader<'_>) -> ProtocolResult<Self> {
        let version = reader.read_u32();
        let recv_code = reader.read_i32();
        let command = reader.read_u32();
        let flag = reader.read_u32();
        reader.align8();
        reader.status()?;
        check_version(version, SOFTWARE_VERSION_CURRENT)?;
        Ok(Self {
            version,
            recv_code,
            command: ControlCommand::from_u32(command)?,
            flag,
        })
    }
}
