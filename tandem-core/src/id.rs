//! Identity types for the replicated text model.
//!
//! Every inserted character gets a [`RecordId`] — the pair of the inserting
//! participant's id and that participant's monotonic counter. Ids are
//! globally unique, never reused, and never change once assigned. All
//! position resolution in the model is done in terms of these ids, never
//! numeric indices, which is what makes out-of-order application safe.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Identifies one participant (one editing replica). Ephemeral: a new id is
/// minted per connection.
pub type ParticipantId = Uuid;

/// Stable identity of a single inserted character.
///
/// Ordering is lexicographic on `(participant, counter)`; the participant
/// component doubles as the tie-break between concurrent inserts sharing
/// the same origin.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct RecordId {
    pub participant: ParticipantId,
    /// Per-participant monotonic counter, starting at 1.
    pub counter: u64,
}

impl RecordId {
    pub fn new(participant: ParticipantId, counter: u64) -> Self {
        Self { participant, counter }
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.participant, self.counter)
    }
}

/// Version marker: for each participant, the highest counter this replica
/// has incorporated.
///
/// A reconnecting client sends its version vector so the registry can reply
/// with only the updates it is missing (or a full snapshot if the marker is
/// from a session incarnation the registry no longer knows about).
///
/// Backed by a `BTreeMap` so that encoding is deterministic — snapshots
/// containing a version vector must be byte-for-byte identical for
/// identical replicas.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionVector {
    seen: BTreeMap<ParticipantId, u64>,
}

impl VersionVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `id` has been incorporated.
    pub fn observe(&mut self, id: RecordId) {
        let entry = self.seen.entry(id.participant).or_insert(0);
        if id.counter > *entry {
            *entry = id.counter;
        }
    }

    /// Whether `id` is covered by this marker.
    pub fn contains(&self, id: RecordId) -> bool {
        self.seen
            .get(&id.participant)
            .is_some_and(|&max| max >= id.counter)
    }

    /// Whether `other` is entirely covered by this marker.
    pub fn dominates(&self, other: &VersionVector) -> bool {
        other
            .seen
            .iter()
            .all(|(p, &c)| self.seen.get(p).is_some_and(|&max| max >= c))
    }

    /// Fold another marker into this one.
    pub fn merge(&mut self, other: &VersionVector) {
        for (&p, &c) in &other.seen {
            let entry = self.seen.entry(p).or_insert(0);
            if c > *entry {
                *entry = c;
            }
        }
    }

    /// Highest counter seen for `participant` (0 if none).
    pub fn max_counter(&self, participant: ParticipantId) -> u64 {
        self.seen.get(&participant).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn participant_count(&self) -> usize {
        self.seen.len()
    }
}
