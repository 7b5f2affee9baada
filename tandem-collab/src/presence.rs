//! Presence: ephemeral cursor/selection state, separate from document
//! content.
//!
//! Presence is decorative, not authoritative. Updates are fire-and-forget
//! and last-write-wins per participant (ordered by a per-sender sequence
//! number, so a delayed older update never clobbers a newer one). Nothing
//! here is persisted or replayed — a late joiner only receives the current
//! state of currently-connected participants.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::ParticipantInfo;

/// Cursor and selection expressed as visible character offsets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceState {
    pub cursor: u64,
    /// Selection range `(start, end)`, absent when nothing is selected.
    pub selection: Option<(u64, u64)>,
}

/// One participant's presence as sent over the wire. Carries the full
/// [`ParticipantInfo`] so peers that joined later still learn the sender's
/// name and color.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub info: ParticipantInfo,
    pub state: PresenceState,
    /// Per-sender monotonic sequence, used for last-write-wins.
    pub seq: u64,
}

/// Last-known presence per participant.
#[derive(Debug, Clone, Default)]
pub struct PresenceMap {
    entries: HashMap<Uuid, PresenceUpdate>,
}

impl PresenceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an update, last-write-wins per participant. Returns whether
    /// the map changed.
    pub fn apply(&mut self, update: PresenceUpdate) -> bool {
        match self.entries.get(&update.info.id) {
            Some(existing) if existing.seq >= update.seq => false,
            _ => {
                self.entries.insert(update.info.id, update);
                true
            }
        }
    }

    /// Drop a participant (disconnect). Returns the removed entry.
    pub fn remove(&mut self, participant: &Uuid) -> Option<PresenceUpdate> {
        self.entries.remove(participant)
    }

    pub fn get(&self, participant: &Uuid) -> Option<&PresenceUpdate> {
        self.entries.get(participant)
    }

    /// Current entries in no particular order.
    pub fn entries(&self) -> impl Iterator<Item = &PresenceUpdate> {
        self.entries.values()
    }

    pub fn participants(&self) -> Vec<ParticipantInfo> {
        self.entries.values().map(|e| e.info.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(info: &ParticipantInfo, cursor: u64, seq: u64) -> PresenceUpdate {
        PresenceUpdate {
            info: info.clone(),
            state: PresenceState { cursor, selection: None },
            seq,
        }
    }

    #[test]
    fn test_apply_and_get() {
        let alice = ParticipantInfo::new("Alice");
        let mut map = PresenceMap::new();

        assert!(map.apply(update(&alice, 4, 1)));
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(&alice.id).unwrap().state.cursor, 4);
    }

    #[test]
    fn test_last_write_wins_by_seq() {
        let alice = ParticipantInfo::new("Alice");
        let mut map = PresenceMap::new();

        map.apply(update(&alice, 10, 5));
        // A delayed older update must not clobber the newer one.
        assert!(!map.apply(update(&alice, 2, 3)));
        assert_eq!(map.get(&alice.id).unwrap().state.cursor, 10);

        assert!(map.apply(update(&alice, 20, 6)));
        assert_eq!(map.get(&alice.id).unwrap().state.cursor, 20);
    }

    #[test]
    fn test_equal_seq_is_not_applied() {
        let alice = ParticipantInfo::new("Alice");
        let mut map = PresenceMap::new();
        map.apply(update(&alice, 1, 1));
        assert!(!map.apply(update(&alice, 9, 1)));
    }

    #[test]
    fn test_remove_on_disconnect() {
        let alice = ParticipantInfo::new("Alice");
        let bob = ParticipantInfo::new("Bob");
        let mut map = PresenceMap::new();
        map.apply(update(&alice, 1, 1));
        map.apply(update(&bob, 2, 1));

        let removed = map.remove(&alice.id).unwrap();
        assert_eq!(removed.info.name, "Alice");
        assert_eq!(map.len(), 1);
        assert!(map.get(&alice.id).is_none());
    }

    #[test]
    fn test_participants_listing() {
        let mut map = PresenceMap::new();
        map.apply(update(&ParticipantInfo::new("A"), 0, 1));
        map.apply(update(&ParticipantInfo::new("B"), 0, 1));
        assert_eq!(map.participants().len(), 2);
    }

    #[test]
    fn test_selection_state() {
        let alice = ParticipantInfo::new("Alice");
        let mut map = PresenceMap::new();
        map.apply(PresenceUpdate {
            info: alice.clone(),
            state: PresenceState { cursor: 8, selection: Some((2, 8)) },
            seq: 1,
        });
        assert_eq!(map.get(&alice.id).unwrap().state.selection, Some((2, 8)));
    }
}
