//! Updates: the immutable units of change exchanged between replicas.

use serde::{Deserialize, Serialize};

use crate::id::RecordId;
use crate::record::CharRecord;

/// A single incremental change to a document.
///
/// Updates are immutable and idempotent: applying the same update twice has
/// the same effect as applying it once. `Unknown` preserves update kinds
/// introduced by newer clients — they decode, apply as a no-op, and relay
/// unchanged, so one client's unsupported feature cannot corrupt another's
/// session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Update {
    /// A new character record plus its insertion context.
    Insert(CharRecord),
    /// Flip the tombstone of an existing record.
    Delete { target: RecordId },
    /// An update kind this version does not understand. Carried through
    /// untouched for forward compatibility.
    Unknown { kind: u8, payload: Vec<u8> },
}

impl Update {
    /// The record id this update concerns, if it has one.
    pub fn record_id(&self) -> Option<RecordId> {
        match self {
            Update::Insert(rec) => Some(rec.id),
            Update::Delete { target } => Some(*target),
            Update::Unknown { .. } => None,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Update::Unknown { .. })
    }
}
