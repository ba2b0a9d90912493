//! Binary frames for per-document CRDT sync channels.
//!
//! Wire format (bincode, standard config, one frame per WebSocket binary
//! message):
//! ```text
//! ┌──────────┬──────────┬──────────────┬──────────┬──────────┐
//! │ msg_type │ peer_id  │ room         │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes │ len + UTF-8  │ varint   │ variable │
//! └──────────┴──────────┴──────────────┴──────────┴──────────┘
//! ```
//!
//! Handshake: on connect a peer sends `PeerJoined` followed by `SyncStep1`
//! carrying its state vector. The other side answers with `SyncStep2`, the
//! update the requester is missing. Afterwards every local edit travels as a
//! `Delta`. Payloads are opaque `yrs` v1 encodings.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// State vector, asks the other side for what we lack
    SyncStep1 = 1,
    /// Update answering a `SyncStep1`
    SyncStep2 = 2,
    /// Incremental update from a local edit
    Delta = 3,
    PeerJoined = 4,
    PeerLeft = 5,
    Ping = 6,
    Pong = 7,
}

/// Identity announced by a peer when it joins a room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    pub name: String,
}

impl PeerInfo {
    /// Create a peer identity with a fresh random id.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    /// Create a peer identity with a known id.
    pub fn with_id(peer_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            peer_id,
            name: name.into(),
        }
    }
}

/// One sync frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    pub room: String,
    /// Per-sender sequence number for deltas, zero otherwise
    pub clock: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn new(msg_type: MessageType, peer_id: Uuid, room: &str, clock: u64, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            peer_id,
            room: room.to_string(),
            clock,
            payload,
        }
    }

    /// Create a delta update message.
    pub fn delta(peer_id: Uuid, room: &str, clock: u64, update: Vec<u8>) -> Self {
        Self::new(MessageType::Delta, peer_id, room, clock, update)
    }

    /// Create a state-vector request (handshake step 1).
    pub fn sync_step1(peer_id: Uuid, room: &str, state_vector: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep1, peer_id, room, 0, state_vector)
    }

    /// Create the reply to a state-vector request (handshake step 2).
    pub fn sync_step2(peer_id: Uuid, room: &str, update: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep2, peer_id, room, 0, update)
    }

    /// Create a join announcement carrying the encoded [`PeerInfo`].
    pub fn peer_joined(room: &str, info: &PeerInfo) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(info, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self::new(MessageType::PeerJoined, info.peer_id, room, 0, payload))
    }

    /// Create a departure announcement.
    pub fn peer_left(peer_id: Uuid, room: &str) -> Self {
        Self::new(MessageType::PeerLeft, peer_id, room, 0, Vec::new())
    }

    /// Create a keep-alive ping.
    pub fn ping(peer_id: Uuid, room: &str) -> Self {
        Self::new(MessageType::Ping, peer_id, room, 0, Vec::new())
    }

    /// Create the answer to a ping.
    pub fn pong(peer_id: Uuid, room: &str) -> Self {
        Self::new(MessageType::Pong, peer_id, room, 0, Vec::new())
    }

    /// Serialize to bytes for the socket.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize a frame read from the socket.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    /// Parse the payload of a `PeerJoined` frame.
    pub fn peer_info(&self) -> Result<PeerInfo, ProtocolError> {
        if self.msg_type != MessageType::PeerJoined {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (info, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(info)
    }
}

#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
    ConnectionClosed,
    QueueFull,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::QueueFull => write!(f, "Offline queue full"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delta_roundtrip() {
        let peer = Uuid::new_v4();
        let msg = SyncMessage::delta(peer, "doc-a", 42, vec![1, 2, 3]);
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded, msg);
        assert_eq!(decoded.room, "doc-a");
    }

    #[test]
    fn test_handshake_frames_carry_no_clock() {
        let peer = Uuid::new_v4();
        let step1 = SyncMessage::sync_step1(peer, "doc-a", vec![9]);
        let step2 = SyncMessage::sync_step2(peer, "doc-a", vec![8]);

        assert_eq!(step1.msg_type, MessageType::SyncStep1);
        assert_eq!(step2.msg_type, MessageType::SyncStep2);
        assert_eq!(step1.clock, 0);
        assert_eq!(step2.clock, 0);
    }

    #[test]
    fn test_peer_joined_payload() {
        let info = PeerInfo::new("Alice");
        let msg = SyncMessage::peer_joined("doc-a", &info).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.peer_id, info.peer_id);
        assert_eq!(decoded.peer_info().unwrap(), info);
    }

    #[test]
    fn test_peer_info_rejects_other_types() {
        let msg = SyncMessage::ping(Uuid::new_v4(), "doc-a");
        assert!(matches!(msg.peer_info(), Err(ProtocolError::InvalidMessageType)));
    }

    #[test]
    fn test_decode_garbage_fails() {
        let err = SyncMessage::decode(&[0xFF, 0x00, 0x13]).unwrap_err();
        assert!(matches!(err, ProtocolError::DeserializationError(_)));
    }

    #[test]
    fn test_delta_frame_is_compact() {
        let msg = SyncMessage::delta(Uuid::new_v4(), "doc-1", 1, vec![0u8; 50]);
        let encoded = msg.encode().unwrap();

        // type + uuid + short room + varint clock + length-prefixed payload
        assert!(encoded.len() < 100, "Frame too large: {} bytes", encoded.len());
    }
}
