//! Wire packet format shared by every transport
//!
//! Every message crossing a process boundary is one packet: a fixed 86-byte
//! header followed by the group, topic and payload bytes. All multi-byte
//! fields are little-endian. Packets failing magic, version or checksum
//! validation are dropped silently by receivers.

use crate::error::{LrpcError, Result};
use crate::ring::MAX_MSG_SIZE;

/// Packet magic ("LRPC")
pub const PACKET_MAGIC: u32 = 0x4C52_5043;

/// Packet format version
pub const PACKET_VERSION: u16 = 1;

/// Fixed header size in bytes
pub const PACKET_HEADER_SIZE: usize = 86;

/// Width of the NUL-padded node id field
pub const NODE_ID_FIELD: usize = 64;

/// Longest node id (one byte is reserved for the NUL terminator)
pub const MAX_NODE_ID_LEN: usize = NODE_ID_FIELD - 1;

/// Message type tag carried in every packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Data = 0,
    Subscribe = 1,
    Unsubscribe = 2,
    QuerySubscriptions = 3,
    SubscriptionReply = 4,
    ServiceRegister = 5,
    ServiceUnregister = 6,
    NodeJoin = 7,
    NodeLeave = 8,
    Heartbeat = 9,
}

impl MessageType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Data),
            1 => Some(Self::Subscribe),
            2 => Some(Self::Unsubscribe),
            3 => Some(Self::QuerySubscriptions),
            4 => Some(Self::SubscriptionReply),
            5 => Some(Self::ServiceRegister),
            6 => Some(Self::ServiceUnregister),
            7 => Some(Self::NodeJoin),
            8 => Some(Self::NodeLeave),
            9 => Some(Self::Heartbeat),
            _ => None,
        }
    }
}

/// A decoded packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub msg_type: MessageType,
    pub source_node_id: String,
    pub group: String,
    pub topic: String,
    pub payload: Vec<u8>,
    /// Discovery aid for datagram transports; 0 when absent
    pub endpoint_port: u16,
}

impl Packet {
    /// Total encoded size for the given subject and payload
    pub fn encoded_size(group: &str, topic: &str, payload_len: usize) -> usize {
        PACKET_HEADER_SIZE + group.len() + topic.len() + payload_len
    }

    /// Whether an encoded packet fits in a single ring frame
    pub fn fits_in_frame(group: &str, topic: &str, payload_len: usize) -> bool {
        Self::encoded_size(group, topic, payload_len) <= MAX_MSG_SIZE
    }

    /// Encode a packet
    pub fn encode(
        msg_type: MessageType,
        source_node_id: &str,
        group: &str,
        topic: &str,
        payload: &[u8],
        endpoint_port: u16,
    ) -> Result<Vec<u8>> {
        if source_node_id.len() > MAX_NODE_ID_LEN {
            return Err(LrpcError::invalid_argument("node_id", "too long"));
        }
        if group.len() > u16::MAX as usize || topic.len() > u16::MAX as usize {
            return Err(LrpcError::invalid_argument("subject", "too long"));
        }

        let total = Self::encoded_size(group, topic, payload.len());
        let mut buf = vec![0u8; total];

        buf[0..4].copy_from_slice(&PACKET_MAGIC.to_le_bytes());
        buf[4..6].copy_from_slice(&PACKET_VERSION.to_le_bytes());
        buf[6] = msg_type as u8;
        // buf[7] reserved
        buf[8..10].copy_from_slice(&(group.len() as u16).to_le_bytes());
        buf[10..12].copy_from_slice(&(topic.len() as u16).to_le_bytes());
        buf[12..16].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        // checksum at 16..20 filled below
        buf[20..20 + source_node_id.len()].copy_from_slice(source_node_id.as_bytes());
        buf[84..86].copy_from_slice(&endpoint_port.to_le_bytes());

        let mut cursor = PACKET_HEADER_SIZE;
        buf[cursor..cursor + group.len()].copy_from_slice(group.as_bytes());
        cursor += group.len();
        buf[cursor..cursor + topic.len()].copy_from_slice(topic.as_bytes());
        cursor += topic.len();
        buf[cursor..cursor + payload.len()].copy_from_slice(payload);

        let checksum = crc32fast::hash(&buf[20..]);
        buf[16..20].copy_from_slice(&checksum.to_le_bytes());

        Ok(buf)
    }

    /// Decode and validate a packet
    ///
    /// Any malformed input is an error; receivers treat these as silent drops.
    pub fn decode(bytes: &[u8]) -> Result<Packet> {
        if bytes.len() < PACKET_HEADER_SIZE {
            return Err(LrpcError::corruption("packet shorter than header"));
        }

        let magic = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        if magic != PACKET_MAGIC {
            return Err(LrpcError::corruption("bad packet magic"));
        }
        let version = u16::from_le_bytes(bytes[4..6].try_into().unwrap());
        if version != PACKET_VERSION {
            return Err(LrpcError::corruption("unsupported packet version"));
        }
        let msg_type = MessageType::from_u8(bytes[6])
            .ok_or_else(|| LrpcError::corruption("unknown message type"))?;

        let group_len = u16::from_le_bytes(bytes[8..10].try_into().unwrap()) as usize;
        let topic_len = u16::from_le_bytes(bytes[10..12].try_into().unwrap()) as usize;
        let payload_len = u32::from_le_bytes(bytes[12..16].try_into().unwrap()) as usize;

        let expected = PACKET_HEADER_SIZE + group_len + topic_len + payload_len;
        if bytes.len() != expected {
            return Err(LrpcError::corruption(format!(
                "packet length {} != declared {}",
                bytes.len(),
                expected
            )));
        }

        let checksum = u32::from_le_bytes(bytes[16..20].try_into().unwrap());
        if crc32fast::hash(&bytes[20..]) != checksum {
            return Err(LrpcError::corruption("packet checksum mismatch"));
        }

        let id_field = &bytes[20..20 + NODE_ID_FIELD];
        let id_len = id_field
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(NODE_ID_FIELD);
        let source_node_id = String::from_utf8_lossy(&id_field[..id_len]).into_owned();
        let endpoint_port = u16::from_le_bytes(bytes[84..86].try_into().unwrap());

        let mut cursor = PACKET_HEADER_SIZE;
        let group = String::from_utf8_lossy(&bytes[cursor..cursor + group_len]).into_owned();
        cursor += group_len;
        let topic = String::from_utf8_lossy(&bytes[cursor..cursor + topic_len]).into_owned();
        cursor += topic_len;
        let payload = bytes[cursor..cursor + payload_len].to_vec();

        Ok(Packet {
            msg_type,
            source_node_id,
            group,
            topic,
            payload,
            endpoint_port,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let bytes = Packet::encode(
            MessageType::Data,
            "nav_node",
            "sensor",
            "temp",
            b"25.5C",
            0,
        )
        .unwrap();
        let packet = Packet::decode(&bytes).unwrap();

        assert_eq!(packet.msg_type, MessageType::Data);
        assert_eq!(packet.source_node_id, "nav_node");
        assert_eq!(packet.group, "sensor");
        assert_eq!(packet.topic, "temp");
        assert_eq!(packet.payload, b"25.5C");
        assert_eq!(packet.endpoint_port, 0);
    }

    #[test]
    fn test_header_layout() {
        let bytes =
            Packet::encode(MessageType::Heartbeat, "n", "g", "t", &[], 47211).unwrap();
        assert_eq!(bytes.len(), PACKET_HEADER_SIZE + 2);
        assert_eq!(&bytes[0..4], &PACKET_MAGIC.to_le_bytes());
        assert_eq!(bytes[6], MessageType::Heartbeat as u8);
        assert_eq!(u16::from_le_bytes(bytes[84..86].try_into().unwrap()), 47211);
    }

    #[test]
    fn test_corrupt_packets_rejected() {
        let good = Packet::encode(MessageType::Data, "n", "g", "t", b"x", 0).unwrap();

        let mut bad_magic = good.clone();
        bad_magic[0] ^= 0xFF;
        assert!(Packet::decode(&bad_magic).is_err());

        let mut bad_version = good.clone();
        bad_version[4] = 99;
        assert!(Packet::decode(&bad_version).is_err());

        let mut bad_payload = good.clone();
        let last = bad_payload.len() - 1;
        bad_payload[last] ^= 0xFF;
        assert!(Packet::decode(&bad_payload).is_err());

        let mut truncated = good.clone();
        truncated.pop();
        assert!(Packet::decode(&truncated).is_err());

        assert!(Packet::decode(&good[..10]).is_err());
    }

    #[test]
    fn test_node_id_limits() {
        let long_id = "a".repeat(MAX_NODE_ID_LEN);
        let bytes = Packet::encode(MessageType::Data, &long_id, "g", "t", &[], 0).unwrap();
        assert_eq!(Packet::decode(&bytes).unwrap().source_node_id, long_id);

        let too_long = "a".repeat(MAX_NODE_ID_LEN + 1);
        assert!(Packet::encode(MessageType::Data, &too_long, "g", "t", &[], 0).is_err());
    }

    #[test]
    fn test_frame_capacity() {
        assert!(Packet::fits_in_frame("g", "t", 1000));
        assert!(!Packet::fits_in_frame("g", "t", MAX_MSG_SIZE));
    }
}
