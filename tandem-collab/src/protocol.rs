//! Binary wire protocol between sync agents and the server.
//!
//! Frame layout (bincode-encoded):
//! ```text
//! ┌──────────┬────────────┬────────────────┬──────────┐
//! │ kind     │ session_id │ participant_id │ payload  │
//! │ 1 byte   │ 16 bytes   │ 16 bytes       │ variable │
//! └──────────┴────────────┴────────────────┴──────────┘
//! ```
//!
//! The payload interpretation depends on `kind`. Document updates travel
//! as `tandem-core` codec frames inside `Update`/`Diff`/`Snapshot`
//! messages; the server relays them without interpreting their content.

use serde::{Deserialize, Serialize};
use tandem_core::VersionVector;
use uuid::Uuid;

use crate::presence::PresenceUpdate;

/// Message kinds on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    /// Client → server: join a session (payload: [`JoinRequest`]).
    Join = 1,
    /// Server → client: full document state.
    Snapshot = 2,
    /// Server → client: incremental updates since the client's marker.
    Diff = 3,
    /// A single document update (either direction).
    Update = 4,
    /// Cursor/selection state (payload: [`PresenceUpdate`]).
    Presence = 5,
    /// A participant disconnected.
    PresenceRemoved = 6,
    /// Heartbeat ping.
    Ping = 7,
    /// Heartbeat pong.
    Pong = 8,
}

/// Participant identity with display metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParticipantInfo {
    pub id: Uuid,
    pub name: String,
    /// RGBA color for cursor/selection rendering.
    pub color: [f32; 4],
}

impl ParticipantInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    /// Create with an explicit id (stable color derived from it).
    pub fn with_id(id: Uuid, name: impl Into<String>) -> Self {
        let hash = id.as_u128();
        let r = (hash & 0xFF) as f32 / 255.0;
        let g = ((hash >> 8) & 0xFF) as f32 / 255.0;
        let b = ((hash >> 16) & 0xFF) as f32 / 255.0;
        Self {
            id,
            name: name.into(),
            color: [r, g, b, 1.0],
        }
    }
}

/// Join handshake payload. The marker lets a reconnecting client receive a
/// diff instead of a full snapshot; a fresh client sends `None`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JoinRequest {
    pub info: ParticipantInfo,
    pub marker: Option<VersionVector>,
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub kind: MessageKind,
    pub session_id: Uuid,
    pub participant_id: Uuid,
    pub payload: Vec<u8>,
}

impl WireMessage {
    /// Client join handshake.
    pub fn join(session_id: Uuid, request: &JoinRequest) -> Result<Self, ProtocolError> {
        Ok(Self {
            kind: MessageKind::Join,
            session_id,
            participant_id: request.info.id,
            payload: encode(request)?,
        })
    }

    /// Full-state snapshot (server-originated).
    pub fn snapshot(session_id: Uuid, snapshot_bytes: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::Snapshot,
            session_id,
            participant_id: Uuid::nil(),
            payload: snapshot_bytes,
        }
    }

    /// Resync diff: a batch of codec-encoded updates (server-originated).
    pub fn diff(session_id: Uuid, batch_bytes: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::Diff,
            session_id,
            participant_id: Uuid::nil(),
            payload: batch_bytes,
        }
    }

    /// A single codec-encoded document update.
    pub fn update(session_id: Uuid, participant_id: Uuid, frame: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::Update,
            session_id,
            participant_id,
            payload: frame,
        }
    }

    /// Presence (cursor/selection) state.
    pub fn presence(
        session_id: Uuid,
        update: &PresenceUpdate,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            kind: MessageKind::Presence,
            session_id,
            participant_id: update.info.id,
            payload: encode(update)?,
        })
    }

    /// Notify that a participant disconnected.
    pub fn presence_removed(session_id: Uuid, participant_id: Uuid) -> Self {
        Self {
            kind: MessageKind::PresenceRemoved,
            session_id,
            participant_id,
            payload: Vec::new(),
        }
    }

    pub fn ping(participant_id: Uuid) -> Self {
        Self {
            kind: MessageKind::Ping,
            session_id: Uuid::nil(),
            participant_id,
            payload: Vec::new(),
        }
    }

    pub fn pong(participant_id: Uuid) -> Self {
        Self {
            kind: MessageKind::Pong,
            session_id: Uuid::nil(),
            participant_id,
            payload: Vec::new(),
        }
    }

    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }

    /// Parse a join payload.
    pub fn join_request(&self) -> Result<JoinRequest, ProtocolError> {
        if self.kind != MessageKind::Join {
            return Err(ProtocolError::InvalidKind);
        }
        decode(&self.payload)
    }

    /// Parse a presence payload.
    pub fn presence_update(&self) -> Result<PresenceUpdate, ProtocolError> {
        if self.kind != MessageKind::Presence {
            return Err(ProtocolError::InvalidKind);
        }
        decode(&self.payload)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

/// Protocol-level errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Serialization(String),
    Deserialization(String),
    InvalidKind,
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "deserialization error: {e}"),
            Self::InvalidKind => write!(f, "invalid message kind"),
            Self::ConnectionClosed => write!(f, "connection closed"),
            Self::Timeout => write!(f, "connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::PresenceState;

    #[test]
    fn test_join_roundtrip() {
        let request = JoinRequest {
            info: ParticipantInfo::new("Alice"),
            marker: None,
        };
        let session = Uuid::new_v4();

        let msg = WireMessage::join(session, &request).unwrap();
        let bytes = msg.encode().unwrap();
        let decoded = WireMessage::decode(&bytes).unwrap();

        assert_eq!(decoded.kind, MessageKind::Join);
        assert_eq!(decoded.session_id, session);
        let parsed = decoded.join_request().unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn test_join_with_marker() {
        let mut marker = VersionVector::new();
        marker.observe(tandem_core::RecordId::new(Uuid::new_v4(), 3));
        let request = JoinRequest {
            info: ParticipantInfo::new("Bob"),
            marker: Some(marker.clone()),
        };

        let msg = WireMessage::join(Uuid::new_v4(), &request).unwrap();
        let parsed = WireMessage::decode(&msg.encode().unwrap())
            .unwrap()
            .join_request()
            .unwrap();
        assert_eq!(parsed.marker, Some(marker));
    }

    #[test]
    fn test_update_roundtrip() {
        let session = Uuid::new_v4();
        let sender = Uuid::new_v4();
        let frame = vec![1, 2, 3, 4];

        let msg = WireMessage::update(session, sender, frame.clone());
        let decoded = WireMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.kind, MessageKind::Update);
        assert_eq!(decoded.participant_id, sender);
        assert_eq!(decoded.payload, frame);
    }

    #[test]
    fn test_presence_roundtrip() {
        let info = ParticipantInfo::new("Carol");
        let update = PresenceUpdate {
            info: info.clone(),
            state: PresenceState { cursor: 12, selection: Some((3, 9)) },
            seq: 7,
        };
        let msg = WireMessage::presence(Uuid::new_v4(), &update).unwrap();
        let decoded = WireMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.kind, MessageKind::Presence);
        assert_eq!(decoded.participant_id, info.id);
        let parsed = decoded.presence_update().unwrap();
        assert_eq!(parsed, update);
    }

    #[test]
    fn test_presence_removed() {
        let participant = Uuid::new_v4();
        let msg = WireMessage::presence_removed(Uuid::new_v4(), participant);
        let decoded = WireMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.kind, MessageKind::PresenceRemoved);
        assert_eq!(decoded.participant_id, participant);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_wrong_kind_accessors_error() {
        let msg = WireMessage::ping(Uuid::new_v4());
        assert!(msg.join_request().is_err());
        assert!(msg.presence_update().is_err());
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(WireMessage::decode(&[0xFF, 0xFE, 0xFD]).is_err());
    }

    #[test]
    fn test_stable_color_from_id() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let a = ParticipantInfo::with_id(id, "X");
        let b = ParticipantInfo::with_id(id, "X");
        assert_eq!(a.color, b.color);
    }
}
