//! Binary codec for updates and snapshots.
//!
//! Update wire format:
//! ```text
//! ┌──────────┬────────────────────┐
//! │ kind     │ bincode payload    │
//! │ 1 byte   │ variable           │
//! └──────────┴────────────────────┘
//! ```
//!
//! The kind byte is outside the bincode payload on purpose: a decoder that
//! does not recognize the kind still yields [`Update::Unknown`] carrying
//! the raw payload, instead of failing the whole stream. Snapshot encoding
//! is deterministic — identical replicas produce byte-identical snapshots,
//! which makes integrity checks possible.

use serde::{Deserialize, Serialize};

use crate::id::{RecordId, VersionVector};
use crate::record::CharRecord;
use crate::replica::TextReplica;
use crate::update::Update;

pub const KIND_INSERT: u8 = 1;
pub const KIND_DELETE: u8 = 2;

#[derive(Debug, Clone)]
pub enum CodecError {
    Serialization(String),
    Deserialization(String),
    Empty,
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "deserialization error: {e}"),
            Self::Empty => write!(f, "empty update frame"),
        }
    }
}

impl std::error::Error for CodecError {}

fn to_vec<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| CodecError::Serialization(e.to_string()))
}

fn from_slice<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, CodecError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| CodecError::Deserialization(e.to_string()))?;
    Ok(value)
}

/// Serialize a single update to its wire frame.
pub fn encode_update(update: &Update) -> Result<Vec<u8>, CodecError> {
    let (kind, payload) = match update {
        Update::Insert(rec) => (KIND_INSERT, to_vec(rec)?),
        Update::Delete { target } => (KIND_DELETE, to_vec(target)?),
        Update::Unknown { kind, payload } => (*kind, payload.clone()),
    };
    let mut frame = Vec::with_capacity(1 + payload.len());
    frame.push(kind);
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Deserialize a single update frame. Unrecognized kinds decode to
/// [`Update::Unknown`] rather than an error.
pub fn decode_update(bytes: &[u8]) -> Result<Update, CodecError> {
    let (&kind, payload) = bytes.split_first().ok_or(CodecError::Empty)?;
    match kind {
        KIND_INSERT => {
            let rec: CharRecord = from_slice(payload)?;
            Ok(Update::Insert(rec))
        }
        KIND_DELETE => {
            let target: RecordId = from_slice(payload)?;
            Ok(Update::Delete { target })
        }
        other => Ok(Update::Unknown {
            kind: other,
            payload: payload.to_vec(),
        }),
    }
}

/// Encode a batch of updates (a resync diff). Each update keeps its own
/// frame so one unknown kind cannot poison the rest of the batch.
pub fn encode_update_batch(updates: &[Update]) -> Result<Vec<u8>, CodecError> {
    let frames: Vec<Vec<u8>> = updates
        .iter()
        .map(encode_update)
        .collect::<Result<_, _>>()?;
    to_vec(&frames)
}

pub fn decode_update_batch(bytes: &[u8]) -> Result<Vec<Update>, CodecError> {
    let frames: Vec<Vec<u8>> = from_slice(bytes)?;
    frames.iter().map(|f| decode_update(f)).collect()
}

/// A full-state snapshot: all records in document order plus the version
/// vector. Both parts are deterministic for a given record set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub records: Vec<CharRecord>,
    pub vv: VersionVector,
}

pub fn encode_snapshot(replica: &TextReplica) -> Result<Vec<u8>, CodecError> {
    let snapshot = Snapshot {
        records: replica.records_in_order(),
        vv: replica.version_vector().clone(),
    };
    to_vec(&snapshot)
}

pub fn decode_snapshot(bytes: &[u8]) -> Result<Snapshot, CodecError> {
    from_slice(bytes)
}
