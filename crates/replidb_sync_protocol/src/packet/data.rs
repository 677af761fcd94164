//! Data request and data ack packets.

use super::{
    check_version, conditions_len, read_conditions, validate_conditions, write_conditions,
    ConditionMap, SyncPacket,
};
use crate::compress::{CompressAlgorithm, MAX_DECOMPRESSED_LEN};
use crate::error::{status, ProtocolError, ProtocolResult};
use crate::item::{items_from_bytes, items_len_at, items_to_bytes, read_items, write_items, DataItem};
use crate::query::QueryFingerprint;
use crate::version::{
    SOFTWARE_VERSION_CURRENT, SOFTWARE_VERSION_RELEASE_2_0, SOFTWARE_VERSION_RELEASE_3_0,
    SOFTWARE_VERSION_RELEASE_4_0,
};
use replidb_codec::{len, ParcelReader, ParcelWriter};
use serde::{Deserialize, Serialize};

/// Last packet of a sync sequence.
pub const DATA_FLAG_LAST_SEQUENCE: u32 = 0x1;
/// Receiver should advance its watermark even without items.
pub const DATA_FLAG_UPDATE_WATERMARK: u32 = 0x2;
/// Items travel as a compressed blob.
pub const DATA_FLAG_COMPRESS: u32 = 0x4;
/// An extra condition section follows.
pub const DATA_FLAG_CONDITION: u32 = 0x8;

/// Maximum number of reserved extension slots.
pub const MAX_RESERVED_SLOTS: usize = 32;

const MAX_QUERY_ID_LEN: usize = 256;

/// Sync direction and scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum SyncMode {
    /// Send local changes.
    Push = 0,
    /// Request remote changes.
    Pull = 1,
    /// Both directions.
    PushAndPull = 2,
    /// Reply to a pull.
    ResponsePull = 3,
    /// Send local changes matching a query.
    QueryPush = 4,
    /// Request remote changes matching a query.
    QueryPull = 5,
    /// Both directions, query scoped.
    QueryPushPull = 6,
    /// Subscription-driven push.
    SubscribeQuery = 7,
    /// Subscription teardown.
    UnsubscribeQuery = 8,
    /// Automatic resubscription after reconnect.
    AutoSubscribeQuery = 9,
}

impl SyncMode {
    /// Decode a mode from its wire value.
    pub fn from_i32(value: i32) -> ProtocolResult<Self> {
        use SyncMode::*;
        Ok(match value {
            0 => Push,
            1 => Pull,
            2 => PushAndPull,
            3 => ResponsePull,
            4 => QueryPush,
            5 => QueryPull,
            6 => QueryPushPull,
            7 => SubscribeQuery,
            8 => UnsubscribeQuery,
            9 => AutoSubscribeQuery,
            other => return Err(ProtocolError::parse_fail(format!("unknown sync mode {other}"))),
        })
    }

    /// Returns true for query-scoped modes, which carry the query section.
    pub fn is_query(self) -> bool {
        matches!(
            self,
            SyncMode::QueryPush
                | SyncMode::QueryPull
                | SyncMode::QueryPushPull
                | SyncMode::SubscribeQuery
                | SyncMode::UnsubscribeQuery
                | SyncMode::AutoSubscribeQuery
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CompressedItems {
    algorithm: CompressAlgorithm,
    source_len: u32,
    blob: Vec<u8>,
}

/// A batch of data items plus the watermarks describing the sync stream.
#[derive(Debug, Clone, PartialEq)]
pub struct DataRequestPacket {
    /// Sender software version.
    pub version: u32,
    /// Sync mode.
    pub mode: SyncMode,
    /// `DATA_FLAG_*` bits. Written from release 3.0.
    pub flag: u32,
    /// Watermark the batch ends at.
    pub end_watermark: u64,
    /// Sender's local watermark.
    pub local_watermark: u64,
    /// Sender's view of the receiver's watermark.
    pub peer_watermark: u64,
    /// Deleted-data watermark for query sync.
    pub deleted_watermark: u64,
    /// Sender status code.
    pub send_code: i32,
    /// Session the batch belongs to.
    pub session_id: u32,
    /// Extension slots; slot 0 carries the packet id.
    pub reserved: Vec<u64>,
    /// Identity of the query for query sync.
    pub query_id: String,
    /// Query for query sync.
    pub query: QueryFingerprint,
    items: Vec<DataItem>,
    compressed: Option<CompressedItems>,
    conditions: ConditionMap,
}

impl DataRequestPacket {
    /// Creates an empty current-version packet.
    pub fn new(mode: SyncMode) -> Self {
        Self {
            version: SOFTWARE_VERSION_CURRENT,
            mode,
            flag: 0,
            end_watermark: 0,
            local_watermark: 0,
            peer_watermark: 0,
            deleted_watermark: 0,
            send_code: status::OK,
            session_id: 0,
            reserved: Vec::new(),
            query_id: String::new(),
            query: QueryFingerprint::new(),
            items: Vec::new(),
            compressed: None,
            conditions: ConditionMap::new(),
        }
    }

    /// Sets the packet version.
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Sets the query, and its identity as query id.
    pub fn with_query(mut self, query: QueryFingerprint) -> Self {
        self.query_id = query.identify();
        self.query = query;
        self
    }

    /// Sets the packet id carried in reserved slot 0.
    pub fn with_packet_id(mut self, id: u64) -> Self {
        if self.reserved.is_empty() {
            self.reserved.push(id);
        } else {
            self.reserved[0] = id;
        }
        self
    }

    /// Packet id from reserved slot 0.
    pub fn packet_id(&self) -> Option<u64> {
        self.reserved.first().copied()
    }

    /// Items carried by the packet.
    pub fn items(&self) -> &[DataItem] {
        &self.items
    }

    /// Takes the items out of the packet.
    pub fn into_items(self) -> Vec<DataItem> {
        self.items
    }

    /// Replaces the items. Drops any previous compression.
    pub fn set_items(&mut self, items: Vec<DataItem>) {
        self.items = items;
        self.compressed = None;
        self.flag &= !DATA_FLAG_COMPRESS;
    }

    /// Compresses the current items with `algorithm`.
    ///
    /// # Errors
    ///
    /// Fails with `NotSupported` below release 3.0, which has no flag word to
    /// announce compression.
    pub fn compress(&mut self, algorithm: CompressAlgorithm) -> ProtocolResult<()> {
        if self.version <= SOFTWARE_VERSION_RELEASE_2_0 {
            return Err(ProtocolError::not_supported(
                "compression needs release 3.0 or later",
            ));
        }
        let raw = items_to_bytes(&self.items)?;
        if raw.len() > MAX_DECOMPRESSED_LEN {
            return Err(ProtocolError::invalid_args("items too large to compress"));
        }
        let blob = algorithm.compress(&raw)?;
        self.compressed = Some(CompressedItems {
            algorithm,
            source_len: raw.len() as u32,
            blob,
        });
        self.flag |= DATA_FLAG_COMPRESS;
        Ok(())
    }

    /// Compression algorithm in use, if any.
    pub fn compress_algorithm(&self) -> Option<CompressAlgorithm> {
        self.compressed.as_ref().map(|c| c.algorithm)
    }

    /// Returns true if the items travel compressed.
    pub fn is_compressed(&self) -> bool {
        self.flag & DATA_FLAG_COMPRESS != 0
    }

    /// Extra conditions.
    pub fn conditions(&self) -> &ConditionMap {
        &self.conditions
    }

    /// Attaches extra conditions.
    ///
    /// # Errors
    ///
    /// Fails with `NotSupported` below release 3.0 and with `InvalidArgs` when
    /// the map violates the count or length bounds.
    pub fn set_conditions(&mut self, conditions: ConditionMap) -> ProtocolResult<()> {
        if self.version < SOFTWARE_VERSION_RELEASE_3_0 {
            return Err(ProtocolError::not_supported(
                "extra conditions need release 3.0 or later",
            ));
        }
        validate_conditions(&conditions)?;
        self.conditions = conditions;
        self.flag |= DATA_FLAG_CONDITION;
        Ok(())
    }

    /// Returns true if this is the last packet of its sequence.
    pub fn is_last_sequence(&self) -> bool {
        self.flag & DATA_FLAG_LAST_SEQUENCE != 0
    }

    fn has_flag_word(&self) -> bool {
        self.version > SOFTWARE_VERSION_RELEASE_2_0
    }

    fn has_conditions(&self) -> bool {
        self.version >= SOFTWARE_VERSION_RELEASE_3_0 && self.flag & DATA_FLAG_CONDITION != 0
    }

    fn carries_query(&self) -> bool {
        self.version > SOFTWARE_VERSION_RELEASE_4_0 || self.mode != SyncMode::QueryPush
    }
}

impl SyncPacket for DataRequestPacket {
    fn length(&self) -> usize {
        let mut total = len::U32;
        total += if self.is_compressed() {
            items_len_at(total, &[])
        } else {
            items_len_at(total, &self.items)
        };
        total += len::U64 * 3 + len::U32 * 3 + len::u64_vec(self.reserved.len());
        if self.has_flag_word() {
            total += len::U32;
        }
        total = len::align8(total);

        if self.mode.is_query() {
            total += len::U64 + len::string(&self.query_id);
            if self.carries_query() {
                total += self.query.parcel_len();
            }
        }
        if let (true, Some(compressed)) = (self.is_compressed(), &self.compressed) {
            total += len::U32 * 2 + len::bytes(compressed.blob.len());
        }
        if self.has_conditions() {
            total = len::align8(total + conditions_len(&self.conditions));
        }
        total
    }

    fn serialize(&self, writer: &mut ParcelWriter) -> ProtocolResult<()> {
        if !self.has_flag_word() && self.flag != 0 {
            return Err(ProtocolError::invalid_args(
                "flags cannot be sent before release 3.0",
            ));
        }
        if self.reserved.len() > MAX_RESERVED_SLOTS {
            return Err(ProtocolError::invalid_args("too many reserved slots"));
        }
        if self.is_compressed() && self.compressed.is_none() {
            return Err(ProtocolError::invalid_args("compress flag without compressed data"));
        }
        if self.has_conditions() {
            validate_conditions(&self.conditions)?;
        }

        writer.write_u32(self.version);
        if self.is_compressed() {
            write_items(writer, &[]);
        } else {
            write_items(writer, &self.items);
        }
        writer.write_u64(self.end_watermark);
        writer.write_u64(self.local_watermark);
        writer.write_u64(self.peer_watermark);
        writer.write_i32(self.send_code);
        writer.write_i32(self.mode as i32);
        writer.write_u32(self.session_id);
        writer.write_u64_vec(&self.reserved);
        if self.has_flag_word() {
            writer.write_u32(self.flag);
        }
        writer.align8();
        writer.status()?;

        if self.mode.is_query() {
            writer.write_u64(self.deleted_watermark);
            writer.write_string(&self.query_id);
            if self.carries_query() {
                self.query.write_to(writer)?;
            }
        }
        if let (true, Some(compressed)) = (self.is_compressed(), &self.compressed) {
            writer.write_u32(compressed.algorithm as u32);
            writer.write_u32(compressed.source_len);
            writer.write_bytes(&compressed.blob);
        }
        if self.has_conditions() {
            write_conditions(writer, &self.conditions);
            writer.align8();
        }
        writer.status()?;
        Ok(())
    }

    fn deserialize(reader: &mut ParcelReader<'_>) -> ProtocolResult<Self> {
        let version = reader.read_u32();
        reader.status()?;
        check_version(version, SOFTWARE_VERSION_CURRENT)?;

        let mut items = read_items(reader)?;
        let end_watermark = reader.read_u64();
        let local_watermark = reader.read_u64();
        let peer_watermark = reader.read_u64();
        let send_code = reader.read_i32();
        let mode = reader.read_i32();
        let session_id = reader.read_u32();
        let reserved = reader.read_u64_vec("reserved", MAX_RESERVED_SLOTS);
        let flag = if version > SOFTWARE_VERSION_RELEASE_2_0 {
            reader.read_u32()
        } else {
            0
        };
        reader.align8();
        reader
            .status()
            .map_err(|e| ProtocolError::LengthError(e.to_string()))?;

        let mut packet = DataRequestPacket {
            version,
            mode: SyncMode::from_i32(mode)?,
            flag,
            end_watermark,
            local_watermark,
            peer_watermark,
            deleted_watermark: 0,
            send_code,
            session_id,
            reserved,
            query_id: String::new(),
            query: QueryFingerprint::new(),
            items: Vec::new(),
            compressed: None,
            conditions: ConditionMap::new(),
        };

        if packet.mode.is_query() {
            packet.deleted_watermark = reader.read_u64();
            packet.query_id = reader.read_string("query id", MAX_QUERY_ID_LEN);
            reader.status()?;
            if packet.carries_query() {
                packet.query = QueryFingerprint::read_from(reader)?;
            }
        }

        if packet.is_compressed() {
            if !items.is_empty() {
                return Err(ProtocolError::parse_fail(
                    "compressed packet also carries plain items",
                ));
            }
            let algorithm = reader.read_u32();
            let source_len = reader.read_u32();
            let blob = reader.read_bytes("compressed items", MAX_DECOMPRESSED_LEN);
            reader.status()?;
            let algorithm = CompressAlgorithm::from_u32(algorithm)?;
            let raw = algorithm.decompress(&blob, source_len as usize)?;
            items = items_from_bytes(&raw)?;
            packet.compressed = Some(CompressedItems {
                algorithm,
                source_len,
                blob,
            });
        }
        packet.items = items;

        if packet.has_conditions() {
            packet.conditions = read_conditions(reader)?;
            reader.align8();
            reader.status()?;
        }
        Ok(packet)
    }
}

/// Acknowledgement of a data request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataAckPacket {
    /// Receiver software version.
    pub version: u32,
    /// Watermark the receiver has reached.
    pub watermark: u64,
    /// Receiver status code, see [`status`].
    pub recv_code: i32,
    /// Extension slots; slot 0 echoes the request packet id.
    pub reserved: Vec<u64>,
}

impl DataAckPacket {
    /// Creates a current-version ack.
    pub fn new(recv_code: i32, watermark: u64) -> Self {
        Self {
            version: SOFTWARE_VERSION_CURRENT,
            watermark,
            recv_code,
            reserved: Vec::new(),
        }
    }

    /// Sets the echoed packet id.
    pub fn with_packet_id(mut self, id: u64) -> Self {
        if self.reserved.is_empty() {
            self.reserved.push(id);
        } else {
            self.reserved[0] = id;
        }
        self
    }

    /// Echoed packet id.
    pub fn packet_id(&self) -> Option<u64> {
        self.reserved.first().copied()
    }
}

impl SyncPacket for DataAckPacket {
    fn length(&self) -> usize {
        len::align8(len::U32 + len::U64 + len::U32 + len::u64_vec(self.reserved.len()))
    }

    fn serialize(&self, writer: &mut ParcelWriter) -> ProtocolResult<()> {
        if self.reserved.len() > MAX_RESERVED_SLOTS {
            return Err(ProtocolError::invalid_args("too many reserved slots"));
        }
        writer.write_u32(self.version);
        writer.write_u64(self.watermark);
        writer.write_i32(self.recv_code);
        writer.write_u64_vec(&self.reserved);
        writer.align8();
        writer.status()?;
        Ok(())
    }

    /// An ack from a newer peer is not an error: it decodes to an ack whose
    /// receive code is `VERSION_NOT_SUPPORTED` so the sender can stop.
    fn deserialize(reader: &mut ParcelReader<'_>) -> ProtocolResult<Self> {
        let version = reader.read_u32();
        reader.status()?;
        if version > SOFTWARE_VERSION_CURRENT {
            reader.skip_to_end();
            return Ok(Self {
                version,
                watermark: 0,
                recv_code: status::VERSION_NOT_SUPPORTED,
                reserved: Vec::new(),
            });
        }
        let watermark = reader.read_u64();
        let recv_code = reader.read_i32();
        let reserved = reader.read_u64_vec("reserved", MAX_RESERVED_SLOTS);
        reader.align8();
        reader.status()?;
        Ok(Self {
            version,
            watermark,
            recv_code,
            reserved,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::{SOFTWARE_VERSION_RELEASE_1_0, SUPPORTED_VERSIONS};

    fn items_for(version: u32) -> Vec<DataItem> {
        (0..3)
            .map(|i| {
                let mut item = DataItem::put(format!("a/{i}").into_bytes(), vec![i as u8; 20], i);
                item.version = version;
                if version < SOFTWARE_VERSION_RELEASE_2_0 {
                    item.write_timestamp = 0;
                }
                if version >= crate::version::SOFTWARE_VERSION_RELEASE_6_0 {
                    item.hash_key = vec![7; 8];
                }
                item
            })
            .collect()
    }

    fn assert_roundtrip(packet: &DataRequestPacket) {
        let bytes = packet.to_bytes().unwrap();
        assert_eq!(bytes.len(), packet.length());
        assert_eq!(bytes.len() % 8, 0);
        assert_eq!(&DataRequestPacket::from_bytes(&bytes).unwrap(), packet);
    }

    #[test]
    fn plain_request_roundtrip_every_version() {
        for version in SUPPORTED_VERSIONS {
            let mut packet = DataRequestPacket::new(SyncMode::Push)
                .with_version(version)
                .with_packet_id(42);
            packet.set_items(items_for(version));
            packet.end_watermark = 9;
            packet.local_watermark = 8;
            packet.peer_watermark = 7;
            packet.session_id = 5;
            if version > SOFTWARE_VERSION_RELEASE_2_0 {
                packet.flag |= DATA_FLAG_LAST_SEQUENCE;
            }
            assert_roundtrip(&packet);
        }
    }

    #[test]
    fn query_request_roundtrip_every_version() {
        let query = QueryFingerprint::new().prefix_key(b"a");
        for version in SUPPORTED_VERSIONS {
            for mode in [SyncMode::QueryPush, SyncMode::QueryPull, SyncMode::SubscribeQuery] {
                let mut packet = DataRequestPacket::new(mode)
                    .with_version(version)
                    .with_query(query.clone());
                if !packet.carries_query() {
                    packet.query = QueryFingerprint::new();
                }
                packet.deleted_watermark = 3;
                packet.set_items(items_for(version));
                assert_roundtrip(&packet);
            }
        }
    }

    #[test]
    fn query_push_omits_query_before_release_5() {
        let query = QueryFingerprint::new().prefix_key(b"abc");
        let old = DataRequestPacket::new(SyncMode::QueryPush)
            .with_version(SOFTWARE_VERSION_RELEASE_4_0)
            .with_query(query.clone());
        let new = old.clone().with_version(SOFTWARE_VERSION_CURRENT);
        assert!(old.length() < new.length());
        let decoded = DataRequestPacket::from_bytes(&old.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.query_id, query.identify());
        assert_eq!(decoded.query, QueryFingerprint::new());
    }

    #[test]
    fn compressed_request_roundtrip() {
        let mut packet = DataRequestPacket::new(SyncMode::QueryPush)
            .with_query(QueryFingerprint::new().prefix_key(b"a"));
        packet.set_items(items_for(SOFTWARE_VERSION_CURRENT));
        packet.compress(CompressAlgorithm::Zlib).unwrap();
        assert!(packet.is_compressed());
        assert_roundtrip(&packet);
    }

    #[test]
    fn compression_needs_flag_word() {
        let mut packet =
            DataRequestPacket::new(SyncMode::Push).with_version(SOFTWARE_VERSION_RELEASE_2_0);
        assert!(matches!(
            packet.compress(CompressAlgorithm::Zlib),
            Err(ProtocolError::NotSupported(_))
        ));
    }

    #[test]
    fn conditions_roundtrip_and_bounds() {
        let mut packet = DataRequestPacket::new(SyncMode::Pull);
        let conditions: ConditionMap = [("tenant".to_string(), "a".to_string())].into();
        packet.set_conditions(conditions).unwrap();
        packet.set_items(items_for(SOFTWARE_VERSION_CURRENT));
        packet.compress(CompressAlgorithm::Zlib).unwrap();
        assert_roundtrip(&packet);

        let too_many: ConditionMap = (0..=super::super::MAX_CONDITION_COUNT)
            .map(|i| (i.to_string(), String::new()))
            .collect();
        assert!(matches!(
            packet.set_conditions(too_many),
            Err(ProtocolError::InvalidArgs(_))
        ));

        let too_long: ConditionMap = [("k".to_string(), "v".repeat(129))].into();
        assert!(packet.set_conditions(too_long).is_err());

        let mut old = DataRequestPacket::new(SyncMode::Pull).with_version(SOFTWARE_VERSION_RELEASE_1_0);
        assert!(old.set_conditions(ConditionMap::new()).is_err());
    }

    #[test]
    fn oversized_condition_count_fails_decode() {
        let mut packet = DataRequestPacket::new(SyncMode::Pull);
        packet
            .set_conditions([("k".to_string(), "v".to_string())].into())
            .unwrap();
        let mut bytes = packet.to_bytes().unwrap();
        // The condition count is the first word of the final section.
        let section = bytes.len() - len::align8(conditions_len(packet.conditions()));
        bytes[section..section + 4].copy_from_slice(&1000u32.to_le_bytes());
        assert!(matches!(
            DataRequestPacket::from_bytes(&bytes),
            Err(ProtocolError::InvalidArgs(_))
        ));
    }

    #[test]
    fn newer_version_is_rejected() {
        let packet = DataRequestPacket::new(SyncMode::Push);
        let mut bytes = packet.to_bytes().unwrap();
        bytes[..4].copy_from_slice(&(SOFTWARE_VERSION_CURRENT + 1).to_le_bytes());
        assert!(matches!(
            DataRequestPacket::from_bytes(&bytes),
            Err(ProtocolError::VersionNotSupported { .. })
        ));
    }

    #[test]
    fn truncated_request_is_rejected_whole() {
        let mut packet = DataRequestPacket::new(SyncMode::Push);
        packet.set_items(items_for(SOFTWARE_VERSION_CURRENT));
        let bytes = packet.to_bytes().unwrap();
        for cut in [4, 16, bytes.len() / 2, bytes.len() - 8] {
            assert!(DataRequestPacket::from_bytes(&bytes[..cut]).is_err());
        }
    }

    #[test]
    fn ack_roundtrip() {
        let ack = DataAckPacket::new(status::OK, 99).with_packet_id(4);
        let bytes = ack.to_bytes().unwrap();
        assert_eq!(bytes.len(), ack.length());
        let decoded = DataAckPacket::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, ack);
        assert_eq!(decoded.packet_id(), Some(4));
    }

    #[test]
    fn ack_from_newer_peer_reports_version_not_supported() {
        let mut ack = DataAckPacket::new(status::OK, 1);
        ack.version = SOFTWARE_VERSION_CURRENT + 5;
        let decoded = DataAckPacket::from_bytes(&ack.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.recv_code, status::VERSION_NOT_SUPPORTED);
    }
}
