//! Sync packets.
//!
//! Every packet implements [`SyncPacket`]: its wire length is computable
//! without serializing, serialization writes exactly that many bytes, and
//! deserialization either yields a fully valid packet or an error.

mod control;
mod data;
mod remote;

pub use control::{
    ControlAckPacket, ControlCommand, ControlRequestPacket, SubscribeRequest, CONTROL_FLAG_AUTO_SUBSCRIBE,
};
pub use data::{
    DataAckPacket, DataRequestPacket, SyncMode, DATA_FLAG_COMPRESS, DATA_FLAG_CONDITION,
    DATA_FLAG_LAST_SEQUENCE, DATA_FLAG_UPDATE_WATERMARK, MAX_RESERVED_SLOTS,
};
pub use remote::{
    PreparedStatement, RemoteExecutorAckPacket, RemoteExecutorRequestPacket, RowDataSet,
    SecurityOption, StatementOpcode, REMOTE_ACK_FLAG_LAST, REMOTE_ACK_FLAG_SECURITY_OPTION,
    REMOTE_EXECUTOR_PACKET_VERSION_CURRENT, REMOTE_EXECUTOR_PACKET_VERSION_V1,
    REMOTE_EXECUTOR_PACKET_VERSION_V2, REMOTE_REQUEST_FLAG_NEED_RESPONSE,
};

use crate::error::{ProtocolError, ProtocolResult};
use replidb_codec::{len, ParcelReader, ParcelWriter};
use std::collections::BTreeMap;

/// Maximum number of extra key/value conditions.
pub const MAX_CONDITION_COUNT: usize = 32;

/// Maximum length of a condition key.
pub const MAX_CONDITION_KEY_LEN: usize = 128;

/// Maximum length of a condition value.
pub const MAX_CONDITION_VALUE_LEN: usize = 128;

/// Extra key/value conditions attached to data and remote query requests.
pub type ConditionMap = BTreeMap<String, String>;

/// Capability set shared by all packets.
pub trait SyncPacket: Sized {
    /// Exact encoded length in bytes.
    fn length(&self) -> usize;

    /// Write the packet. Must write exactly [`length`](SyncPacket::length) bytes.
    ///
    /// # Errors
    ///
    /// Returns an error as soon as a bound check or a write fails.
    fn serialize(&self, writer: &mut ParcelWriter) -> ProtocolResult<()>;

    /// Read a packet.
    ///
    /// # Errors
    ///
    /// Returns an error for any bound, length or version violation. A packet
    /// is never partially accepted.
    fn deserialize(reader: &mut ParcelReader<'_>) -> ProtocolResult<Self>;

    /// Serialize into a new buffer of exactly `length()` bytes.
    fn to_bytes(&self) -> ProtocolResult<Vec<u8>> {
        let mut writer = ParcelWriter::with_length(self.length());
        self.serialize(&mut writer)?;
        Ok(writer.finish()?)
    }

    /// Deserialize from a buffer that must be consumed entirely.
    fn from_bytes(bytes: &[u8]) -> ProtocolResult<Self> {
        let mut reader = ParcelReader::new(bytes);
        let packet = Self::deserialize(&mut reader)?;
        if !reader.is_empty() {
            return Err(ProtocolError::LengthError(format!(
                "{} trailing bytes after packet",
                reader.remaining()
            )));
        }
        Ok(packet)
    }
}

pub(crate) fn validate_conditions(conditions: &ConditionMap) -> ProtocolResult<()> {
    if conditions.len() > MAX_CONDITION_COUNT {
        return Err(ProtocolError::invalid_args(format!(
            "{} conditions exceed limit {MAX_CONDITION_COUNT}",
            conditions.len()
        )));
    }
    for (key, value) in conditions {
        if key.len() > MAX_CONDITION_KEY_LEN || value.len() > MAX_CONDITION_VALUE_LEN {
            return Err(ProtocolError::invalid_args("condition entry too long"));
        }
    }
    Ok(())
}

/// Length of a condition section, without trailing alignment.
pub(crate) fn conditions_len(conditions: &ConditionMap) -> usize {
    len::U32
        + conditions
            .iter()
            .map(|(k, v)| len::string(k) + len::string(v))
            .sum::<usize>()
}

pub(crate) fn write_conditions(writer: &mut ParcelWriter, conditions: &ConditionMap) {
    writer.write_u32(conditions.len() as u32);
    for (key, value) in conditions {
        writer.write_string(key);
        writer.write_string(value);
    }
}

pub(crate) fn read_conditions(reader: &mut ParcelReader<'_>) -> ProtocolResult<ConditionMap> {
    let count = reader.read_u32() as usize;
    reader.status()?;
    if count > MAX_CONDITION_COUNT {
        return Err(ProtocolError::invalid_args(format!(
            "{count} conditions exceed limit {MAX_CONDITION_COUNT}"
        )));
    }
    let mut conditions = ConditionMap::new();
    for _ in 0..count {
        let key = reader.read_string("condition key", MAX_CONDITION_KEY_LEN);
        let value = reader.read_string("condition value", MAX_CONDITION_VALUE_LEN);
        reader.status()?;
        if conditions.insert(key, value).is_some() {
            return Err(ProtocolError::parse_fail("duplicate condition key"));
        }
    }
    Ok(conditions)
}

pub(crate) fn check_version(version: u32, current: u32) -> ProtocolResult<()> {
    if version > current {
        return Err(ProtocolError::VersionNotSupported { version, current });
    }
    Ok(())
}
