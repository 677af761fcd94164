//! Data items carried by data request packets.

use crate::error::{ProtocolError, ProtocolResult};
use crate::query::MAX_KEY_SIZE;
use crate::version::{
    SOFTWARE_VERSION_CURRENT, SOFTWARE_VERSION_RELEASE_2_0, SOFTWARE_VERSION_RELEASE_6_0,
};
use replidb_codec::{len, ParcelReader, ParcelWriter};

/// Maximum length of an item value.
pub const MAX_VALUE_SIZE: usize = 4 * 1024 * 1024;

/// Maximum number of items in one data request.
pub const MAX_NORMAL_PACK_ITEM_SIZE: usize = 4000;

const MAX_PEER_ID_LEN: usize = 256;

/// One replicated key/value record.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DataItem {
    /// Layout version of this item.
    pub version: u32,
    /// Record key.
    pub key: Vec<u8>,
    /// Record value; empty for deletions.
    pub value: Vec<u8>,
    /// Logical timestamp used for watermarks.
    pub timestamp: u64,
    /// Item flags, see [`DataItem::DELETE_FLAG`].
    pub flag: u64,
    /// Peer the record originated on; empty for local records.
    pub origin_peer: String,
    /// Wall-clock write time. Present from release 2.0.
    pub write_timestamp: u64,
    /// Hash of the key. Present from release 6.0.
    pub hash_key: Vec<u8>,
}

impl DataItem {
    /// Marks a deletion tombstone.
    pub const DELETE_FLAG: u64 = 0x01;

    /// Creates a current-version put record.
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>, timestamp: u64) -> Self {
        Self {
            version: SOFTWARE_VERSION_CURRENT,
            key: key.into(),
            value: value.into(),
            timestamp,
            write_timestamp: timestamp,
            ..Self::default()
        }
    }

    /// Creates a current-version deletion tombstone.
    pub fn delete(key: impl Into<Vec<u8>>, timestamp: u64) -> Self {
        Self {
            flag: Self::DELETE_FLAG,
            ..Self::put(key, Vec::new(), timestamp)
        }
    }

    /// Returns true if this item is a deletion.
    pub fn is_deleted(&self) -> bool {
        self.flag & Self::DELETE_FLAG != 0
    }

    /// Encoded length in bytes.
    pub fn parcel_len(&self) -> usize {
        let mut total = len::U32
            + len::bytes(self.key.len())
            + len::bytes(self.value.len())
            + len::U64
            + len::U64
            + len::string(&self.origin_peer);
        if self.version >= SOFTWARE_VERSION_RELEASE_2_0 {
            total += len::U64;
        }
        if self.version >= SOFTWARE_VERSION_RELEASE_6_0 {
            total += len::bytes(self.hash_key.len());
        }
        total
    }

    /// Write this item to a parcel.
    pub fn write_to(&self, writer: &mut ParcelWriter) {
        writer.write_u32(self.version);
        writer.write_bytes(&self.key);
        writer.write_bytes(&self.value);
        writer.write_u64(self.timestamp);
        writer.write_u64(self.flag);
        writer.write_string(&self.origin_peer);
        if self.version >= SOFTWARE_VERSION_RELEASE_2_0 {
            writer.write_u64(self.write_timestamp);
        }
        if self.version >= SOFTWARE_VERSION_RELEASE_6_0 {
            writer.write_bytes(&self.hash_key);
        }
    }

    /// Read an item from a parcel.
    ///
    /// # Errors
    ///
    /// Returns `VersionNotSupported` for an item newer than this build, or the
    /// parcel error if a read failed.
    pub fn read_from(reader: &mut ParcelReader<'_>) -> ProtocolResult<Self> {
        let version = reader.read_u32();
        reader.status()?;
        if version > SOFTWARE_VERSION_CURRENT {
            return Err(ProtocolError::VersionNotSupported {
                version,
                current: SOFTWARE_VERSION_CURRENT,
            });
        }
        let mut item = DataItem {
            version,
            key: reader.read_bytes("item key", MAX_KEY_SIZE),
            value: reader.read_bytes("item value", MAX_VALUE_SIZE),
            timestamp: reader.read_u64(),
            flag: reader.read_u64(),
            origin_peer: reader.read_string("origin peer", MAX_PEER_ID_LEN),
            ..DataItem::default()
        };
        if version >= SOFTWARE_VERSION_RELEASE_2_0 {
            item.write_timestamp = reader.read_u64();
        }
        if version >= SOFTWARE_VERSION_RELEASE_6_0 {
            item.hash_key = reader.read_bytes("hash key", MAX_KEY_SIZE);
        }
        reader.status()?;
        Ok(item)
    }
}

/// Encoded length of an item list: count, alignment, then the items.
pub(crate) fn items_len(items: &[DataItem]) -> usize {
    len::align8(len::U32) + items.iter().map(DataItem::parcel_len).sum::<usize>()
}

/// Length of the item section when it starts at byte offset `offset`.
pub(crate) fn items_len_at(offset: usize, items: &[DataItem]) -> usize {
    let head = len::align8(offset + len::U32) - offset;
    head + items.iter().map(DataItem::parcel_len).sum::<usize>()
}

pub(crate) fn write_items(writer: &mut ParcelWriter, items: &[DataItem]) {
    writer.write_u32(items.len() as u32);
    writer.align8();
    for item in items {
        item.write_to(writer);
    }
}

pub(crate) fn read_items(reader: &mut ParcelReader<'_>) -> ProtocolResult<Vec<DataItem>> {
    let count = reader.read_u32() as usize;
    reader.align8();
    reader.status()?;
    if count > MAX_NORMAL_PACK_ITEM_SIZE {
        return Err(ProtocolError::LengthError(format!(
            "{count} items exceed limit {MAX_NORMAL_PACK_ITEM_SIZE}"
        )));
    }
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        items.push(DataItem::read_from(reader)?);
    }
    Ok(items)
}

/// Serialize an item list into a standalone buffer, used as the input of
/// compression.
pub(crate) fn items_to_bytes(items: &[DataItem]) -> ProtocolResult<Vec<u8>> {
    let mut writer = ParcelWriter::with_length(items_len(items));
    write_items(&mut writer, items);
    Ok(writer.finish()?)
}

pub(crate) fn items_from_bytes(bytes: &[u8]) -> ProtocolResult<Vec<DataItem>> {
    let mut reader = ParcelReader::new(bytes);
    let items = read_items(&mut reader)?;
    if !reader.is_empty() {
        return Err(ProtocolError::LengthError(format!(
            "{} trailing bytes after items",
            reader.remaining()
        )));
    }
    Ok(items)
}
