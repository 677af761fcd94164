//! # ReplIDB Sync Protocol
//!
//! Wire types for peer-to-peer sync between ReplIDB instances.
//!
//! This crate provides:
//! - Software version constants negotiated between peers
//! - `QueryFingerprint` and its stable identity hash
//! - `DataItem` records and zlib item compression
//! - Data, control and remote query packets
//! - `WireCodec`, which frames messages and dispatches payload decoding
//!
//! This is a pure protocol crate with no I/O operations.
//!
//! ## Compatibility
//!
//! Every packet carries the sender's software version. Decoders accept
//! anything up to [`SOFTWARE_VERSION_CURRENT`] and gate optional sections on
//! the version found on the wire, so older peers keep working. Packets from
//! newer peers are rejected with `VersionNotSupported`, except data acks,
//! which decode to an ack reporting the mismatch.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod compress;
mod error;
mod frame;
mod item;
mod message;
pub mod packet;
mod query;
pub mod version;

pub use codec::{MessageTransform, RemoteExecutorTransform, WireCodec};
pub use compress::{CompressAlgorithm, MAX_DECOMPRESSED_LEN};
pub use error::{status, ProtocolError, ProtocolResult};
pub use frame::{Frame, FrameHeader, FRAME_HEADER_LEN, FRAME_MAGIC};
pub use item::{DataItem, MAX_NORMAL_PACK_ITEM_SIZE, MAX_VALUE_SIZE};
pub use message::{Message, MessageId, MessageType, Packet};
pub use packet::{
    ConditionMap, ControlAckPacket, ControlCommand, DataAckPacket, DataRequestPacket,
    PreparedStatement, RemoteExecutorAckPacket, RemoteExecutorRequestPacket, RowDataSet,
    SecurityOption, SubscribeRequest, SyncMode, SyncPacket,
};
pub use query::{
    QueryFingerprint, QueryNode, QueryOperator, MAX_KEY_SIZE, QUERY_SYNC_OBJECT_MAGIC,
    QUERY_SYNC_OBJECT_VERSION_CURRENT,
};
pub use replidb_codec::Value;
pub use version::{SOFTWARE_VERSION_CURRENT, SOFTWARE_VERSION_EARLIEST};

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use proptest::prelude::*;

    fn arb_item() -> impl Strategy<Value = DataItem> {
        (
            prop::collection::vec(any::<u8>(), 1..32),
            prop::collection::vec(any::<u8>(), 0..64),
            any::<u64>(),
            any::<bool>(),
        )
            .prop_map(|(key, value, ts, deleted)| {
                if deleted {
                    DataItem::delete(key, ts)
                } else {
                    DataItem::put(key, value, ts)
                }
            })
    }

    fn arb_query() -> impl Strategy<Value = QueryFingerprint> {
        (
            prop::collection::vec(any::<u8>(), 0..16),
            "[a-z]{1,8}",
            any::<i64>(),
            prop::option::of("[a-z]{1,8}"),
        )
            .prop_map(|(prefix, field, value, table)| {
                let query = QueryFingerprint::new()
                    .prefix_key(prefix)
                    .equal_to(field, value);
                match table {
                    Some(table) => query.table(table),
                    None => query,
                }
            })
    }

    proptest! {
        #[test]
        fn data_request_frame_length_matches(
            items in prop::collection::vec(arb_item(), 0..16),
            query in arb_query(),
            session in any::<u32>(),
        ) {
            let codec = WireCodec::new();
            let mut packet = DataRequestPacket::new(SyncMode::QueryPush).with_query(query);
            packet.set_items(items);
            let message = Message::new(MessageId::QuerySync, MessageType::Request, Packet::DataRequest(packet))
                .with_session(session, 1);
            let bytes = codec.encode(&message).unwrap();
            prop_assert_eq!(bytes.len(), FRAME_HEADER_LEN + codec.payload_len(&message).unwrap());
            let frame = Frame::parse(Bytes::from(bytes)).unwrap();
            prop_assert_eq!(codec.decode(&frame).unwrap(), message);
        }

        #[test]
        fn identity_ignores_ordering_nodes(query in arb_query(), limit in 1i64..100) {
            let id = query.identify();
            prop_assert_eq!(id.len(), 64);
            prop_assert_eq!(query.clone().order_by("f", true).limit(limit).identify(), id);
        }

        #[test]
        fn truncated_frames_never_panic(cut in 0usize..200, items in prop::collection::vec(arb_item(), 1..4)) {
            let codec = WireCodec::new();
            let mut packet = DataRequestPacket::new(SyncMode::Push);
            packet.set_items(items);
            let message = Message::new(MessageId::DataSync, MessageType::Request, Packet::DataRequest(packet));
            let bytes = codec.encode(&message).unwrap();
            let cut = cut.min(bytes.len());
            if let Ok(frame) = Frame::parse(Bytes::copy_from_slice(&bytes[..cut])) {
                let _ = codec.decode(&frame);
            }
        }
    }
}
