//! Binary protocol spoken between replicas through the relay.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬─────────────────┬──────────┐
//! │ msg_type │ peer_id   │ target          │ payload  │
//! │ 1 byte   │ 16 bytes  │ 0 or 1+16 bytes │ variable │
//! └──────────┴───────────┴─────────────────┴──────────┘
//! ```
//!
//! The relay never decodes these frames; only replicas do.
//!
//! Handshake on every (re)connect:
//! ```text
//! joiner                       relay                     peer
//!   │── SyncStep1(vs_j) ─────────►│──────────────────────►│
//!   │◄────────────────────────────│◄─ SyncStep2(→joiner) ─│  diff(vs_j) + vs_p
//!   │── Delta(diff(vs_p)) ───────►│──────────────────────►│  only if non-empty
//! ```

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Sender's version state, asking peers for what it lacks
    SyncStep1 = 1,
    /// Targeted reply: missing update plus the responder's version state
    SyncStep2 = 2,
    /// Incremental update produced by a local transaction
    Delta = 3,
}

/// Payload of a [`MessageType::SyncStep2`] message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncReply {
    /// Update holding everything the requester had not seen
    pub missing: Vec<u8>,
    /// Responder's encoded version state
    pub state: Vec<u8>,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    /// Addressed peer; `None` means every peer in the room
    pub target: Option<Uuid>,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    /// Create a delta update message.
    pub fn delta(peer_id: Uuid, update: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::Delta,
            peer_id,
            target: None,
            payload: update,
        }
    }

    /// Create a sync step 1 (version state announcement).
    pub fn sync_step1(peer_id: Uuid, state_vector: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::SyncStep1,
            peer_id,
            target: None,
            payload: state_vector,
        }
    }

    /// Create a sync step 2 addressed to `target`.
    pub fn sync_step2(peer_id: Uuid, target: Uuid, reply: &SyncReply) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(reply, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self {
            msg_type: MessageType::SyncStep2,
            peer_id,
            target: Some(target),
            payload,
        })
    }

    /// Whether `peer` should act on this message.
    pub fn is_for(&self, peer: Uuid) -> bool {
        self.peer_id != peer && self.target.map_or(true, |t| t == peer)
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    /// Parse a sync step 2 payload.
    pub fn sync_reply(&self) -> Result<SyncReply, ProtocolError> {
        if self.msg_type != MessageType::SyncStep2 {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (reply, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(reply)
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
    InvalidUrl(String),
    WebSocket(String),
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::InvalidUrl(url) => write!(f, "Invalid relay URL: {url}"),
            Self::WebSocket(e) => write!(f, "WebSocket error: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<tokio_tungstenite::tungstenite::Error> for ProtocolError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error;
        match e {
            Error::ConnectionClosed | Error::AlreadyClosed => ProtocolError::ConnectionClosed,
            other => ProtocolError::WebSocket(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delta_roundtrip() {
        let peer = Uuid::new_v4();
        let payload = vec![1, 2, 3, 4, 5];

        let msg = SyncMessage::delta(peer, payload.clone());
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::Delta);
        assert_eq!(decoded.peer_id, peer);
        assert_eq!(decoded.target, None);
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn test_sync_step2_carries_reply() {
        let responder = Uuid::new_v4();
        let requester = Uuid::new_v4();
        let reply = SyncReply {
            missing: vec![1, 9, 9],
            state: vec![1, 0, 0],
        };

        let msg = SyncMessage::sync_step2(responder, requester, &reply).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::SyncStep2);
        assert_eq!(decoded.target, Some(requester));
        assert_eq!(decoded.sync_reply().unwrap(), reply);
    }

    #[test]
    fn test_addressing() {
        let me = Uuid::new_v4();
        let other = Uuid::new_v4();
        let third = Uuid::new_v4();

        assert!(SyncMessage::sync_step1(other, vec![]).is_for(me));
        assert!(!SyncMessage::sync_step1(me, vec![]).is_for(me), "own frames are ignored");

        let reply = SyncReply { missing: vec![], state: vec![] };
        assert!(SyncMessage::sync_step2(other, me, &reply).unwrap().is_for(me));
        assert!(!SyncMessage::sync_step2(other, third, &reply).unwrap().is_for(me));
    }

    #[test]
    fn test_invalid_message_type_error() {
        let msg = SyncMessage::delta(Uuid::new_v4(), vec![]);
        assert!(matches!(msg.sync_reply(), Err(ProtocolError::InvalidMessageType)));
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(SyncMessage::decode(&garbage).is_err());
        assert!(SyncMessage::decode(&[]).is_err());
    }

    #[test]
    fn test_delta_size_efficient() {
        let msg = SyncMessage::delta(Uuid::new_v4(), vec![0u8; 50]);
        let encoded = msg.encode().unwrap();
        // 1 type + 16 peer + 1 target tag + length prefix + payload
        assert!(encoded.len() < 80, "Encoded size {} too large for 50-byte delta", encoded.len());
    }

    #[test]
    fn test_document_delta_survives_framing() {
        use crm_core::{Collection, Document, NewContact};

        let mut origin = Document::new();
        let update = origin
            .mutate(|tx| tx.add_contact(NewContact::new("Ann", "Lee")))
            .unwrap()
            .update
            .unwrap();

        let frame = SyncMessage::delta(origin.replica_id().as_uuid(), update).encode().unwrap();
        let decoded = SyncMessage::decode(&frame).unwrap();

        let mut remote = Document::new();
        assert!(remote.apply(&decoded.payload).unwrap());
        assert_eq!(remote.len(Collection::Contacts), 1);
        assert_eq!(decoded.peer_id, origin.replica_id().as_uuid());
    }
}
