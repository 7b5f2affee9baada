//! The replicated text model: a conflict-free sequence of character
//! records.
//!
//! The document is an arena of [`CharRecord`]s indexed by stable id, plus a
//! total order over those ids. The order is a pure function of the record
//! set: every record carries the ids of its left/right neighbors at
//! insertion time, and concurrent inserts at the same spot are resolved by
//! a fixed deterministic scan. Two replicas holding the same records therefore
//! compute the same sequence regardless of the order updates arrived in —
//! that is the whole convergence argument, and the property tests in
//! `tests/convergence.rs` hammer on it.
//!
//! Deletes only flip a tombstone; tombstoned records stay in the sequence
//! so that origin links of later inserts keep resolving.

use std::collections::{HashMap, HashSet};

use crate::id::{ParticipantId, RecordId, VersionVector};
use crate::record::CharRecord;
use crate::update::Update;

/// Raised when an incoming record reuses an existing id with different
/// content or origins. By construction this never happens; any occurrence
/// is an invariant violation worth logging loudly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    Conflict { id: RecordId },
}

impl std::fmt::Display for ApplyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Conflict { id } => {
                write!(f, "record id {id} reused with conflicting content")
            }
        }
    }
}

impl std::error::Error for ApplyError {}

/// A single participant's copy of the document.
pub struct TextReplica {
    participant: ParticipantId,
    /// Arena of all records ever seen, tombstones included.
    records: HashMap<RecordId, CharRecord>,
    /// Total order over the arena.
    sequence: Vec<RecordId>,
    /// Local insertion counter (per-participant, monotonic).
    counter: u64,
    /// Deletes whose target insertion has not arrived yet.
    pending_deletes: HashSet<RecordId>,
    /// Inserts whose origins have not arrived yet.
    pending_inserts: HashMap<RecordId, CharRecord>,
    vv: VersionVector,
}

impl TextReplica {
    pub fn new(participant: ParticipantId) -> Self {
        Self {
            participant,
            records: HashMap::new(),
            sequence: Vec::new(),
            counter: 0,
            pending_deletes: HashSet::new(),
            pending_inserts: HashMap::new(),
            vv: VersionVector::new(),
        }
    }

    /// Rebuild a replica from a snapshot's records (already in document
    /// order) and version vector.
    pub fn from_snapshot(
        participant: ParticipantId,
        records: Vec<CharRecord>,
        vv: VersionVector,
    ) -> Self {
        let sequence: Vec<RecordId> = records.iter().map(|r| r.id).collect();
        let arena: HashMap<RecordId, CharRecord> =
            records.into_iter().map(|r| (r.id, r)).collect();
        let counter = vv.max_counter(participant);
        Self {
            participant,
            records: arena,
            sequence,
            counter,
            pending_deletes: HashSet::new(),
            pending_inserts: HashMap::new(),
            vv,
        }
    }

    pub fn participant(&self) -> ParticipantId {
        self.participant
    }

    /// Insert `ch` after the record `after` (None = document start).
    ///
    /// Applied locally immediately; the returned update is what gets sent
    /// to peers.
    pub fn insert(&mut self, after: Option<RecordId>, ch: char) -> Update {
        self.counter += 1;
        let id = RecordId::new(self.participant, self.counter);

        let origin_right = match after {
            Some(a) => self.index_of(a).and_then(|i| self.sequence.get(i + 1).copied()),
            None => self.sequence.first().copied(),
        };
        let rec = CharRecord::new(id, ch, after, origin_right);
        self.integrate(rec.clone());
        Update::Insert(rec)
    }

    /// Insert at a visible character offset (0 = before the first visible
    /// character). Convenience wrapper over [`TextReplica::insert`].
    pub fn insert_at(&mut self, offset: usize, ch: char) -> Update {
        let after = if offset == 0 {
            None
        } else {
            self.visible_id_at(offset - 1)
        };
        self.insert(after, ch)
    }

    /// Insert a string at a visible offset, returning one update per char.
    pub fn insert_str_at(&mut self, offset: usize, text: &str) -> Vec<Update> {
        let mut after = if offset == 0 {
            None
        } else {
            self.visible_id_at(offset - 1)
        };
        let mut updates = Vec::with_capacity(text.chars().count());
        for ch in text.chars() {
            let update = self.insert(after, ch);
            after = update.record_id();
            updates.push(update);
        }
        updates
    }

    /// Tombstone the record with the given id. Returns the update to send,
    /// or None if the record is unknown or already deleted.
    pub fn delete(&mut self, id: RecordId) -> Option<Update> {
        let rec = self.records.get_mut(&id)?;
        if rec.tombstone {
            return None;
        }
        rec.tombstone = true;
        Some(Update::Delete { target: id })
    }

    /// Delete the visible character at `offset`.
    pub fn delete_at(&mut self, offset: usize) -> Option<Update> {
        let id = self.visible_id_at(offset)?;
        self.delete(id)
    }

    /// Apply an update produced by another replica.
    ///
    /// Position is re-derived purely from the record's origin links —
    /// never from a numeric index — so application is safe in any order
    /// and after arbitrary delay. Returns `Ok(true)` if the
    /// update was applied or buffered for later, `Ok(false)` if it had no
    /// effect (duplicate, already-deleted target, unknown kind).
    pub fn apply_remote(&mut self, update: &Update) -> Result<bool, ApplyError> {
        match update {
            Update::Insert(rec) => self.apply_insert(rec),
            Update::Delete { target } => Ok(self.apply_delete(*target)),
            Update::Unknown { kind, .. } => {
                log::debug!("skipping unknown update kind {kind}");
                Ok(false)
            }
        }
    }

    fn apply_insert(&mut self, rec: &CharRecord) -> Result<bool, ApplyError> {
        if let Some(existing) = self.records.get(&rec.id) {
            if !existing.same_identity(rec) {
                log::error!(
                    "apply conflict: id {} reused with different content — \
                     convergence invariant violated",
                    rec.id
                );
                return Err(ApplyError::Conflict { id: rec.id });
            }
            return Ok(false);
        }
        if self.pending_inserts.contains_key(&rec.id) {
            return Ok(false);
        }

        if self.origins_known(rec) {
            self.integrate(rec.clone());
            self.flush_pending();
        } else {
            // Network reordering delivered a child before its context.
            // Park it until the origins arrive.
            self.pending_inserts.insert(rec.id, rec.clone());
        }
        Ok(true)
    }

    fn apply_delete(&mut self, target: RecordId) -> bool {
        match self.records.get_mut(&target) {
            Some(rec) => {
                if rec.tombstone {
                    false
                } else {
                    rec.tombstone = true;
                    true
                }
            }
            None => {
                // Deferred until the referenced insertion arrives.
                self.pending_deletes.insert(target)
            }
        }
    }

    fn origins_known(&self, rec: &CharRecord) -> bool {
        let known = |o: Option<RecordId>| o.is_none_or(|id| self.records.contains_key(&id));
        known(rec.origin_left) && known(rec.origin_right)
    }

    /// Place a record into the sequence from its origin links alone.
    ///
    /// Scans the window between the two origins, keeping track of which
    /// window records are still in conflict with this one:
    /// - a record with the same origin-left is a direct concurrent
    ///   sibling: a smaller participant id puts it before us; one that
    ///   also shares our origin-right and has a larger id goes after us
    ///   and ends the scan;
    /// - a record whose origin-left lies earlier inside the window hangs
    ///   off an already-scanned record and follows it: it lands before us
    ///   when its parent already resolved before us, and stays in the
    ///   conflict set otherwise (this keeps a child glued to its parent
    ///   even when the parent's own position was decided concurrently);
    /// - a record whose origin-left is outside the window ends the scan.
    ///
    /// Every replica runs this same scan over the same record set, so all
    /// of them pick the same slot regardless of delivery order.
    fn integrate(&mut self, rec: CharRecord) {
        let start = match rec.origin_left {
            Some(left) => self.index_of(left).map(|i| i + 1).unwrap_or(0),
            None => 0,
        };
        let end = match rec.origin_right {
            Some(right) => self.index_of(right).unwrap_or(self.sequence.len()),
            None => self.sequence.len(),
        };

        let mut dst = start;
        let mut scanned: HashSet<RecordId> = HashSet::new();
        let mut conflicting: HashSet<RecordId> = HashSet::new();
        for i in start..end {
            let other = &self.records[&self.sequence[i]];
            scanned.insert(other.id);
            conflicting.insert(other.id);
            if other.origin_left == rec.origin_left {
                if other.id.participant < rec.id.participant {
                    dst = i + 1;
                    conflicting.clear();
                } else if other.origin_right == rec.origin_right {
                    break;
                }
            } else {
                match other.origin_left {
                    Some(origin) if scanned.contains(&origin) => {
                        if !conflicting.contains(&origin) {
                            dst = i + 1;
                            conflicting.clear();
                        }
                    }
                    _ => break,
                }
            }
        }

        if rec.id.participant == self.participant && rec.id.counter > self.counter {
            self.counter = rec.id.counter;
        }
        self.vv.observe(rec.id);
        self.sequence.insert(dst, rec.id);
        self.records.insert(rec.id, rec);
    }

    /// Re-try parked inserts and deletes until nothing more applies.
    fn flush_pending(&mut self) {
        loop {
            let ready: Vec<RecordId> = self
                .pending_inserts
                .values()
                .filter(|r| self.origins_known(r))
                .map(|r| r.id)
                .collect();
            if ready.is_empty() {
                break;
            }
            for id in ready {
                if let Some(rec) = self.pending_inserts.remove(&id) {
                    self.integrate(rec);
                }
            }
        }

        let due: Vec<RecordId> = self
            .pending_deletes
            .iter()
            .filter(|id| self.records.contains_key(id))
            .copied()
            .collect();
        for id in due {
            self.pending_deletes.remove(&id);
            if let Some(rec) = self.records.get_mut(&id) {
                rec.tombstone = true;
            }
        }
    }

    /// Merge a full snapshot into this replica. Local records the snapshot
    /// does not know about are kept — no local edit is ever lost.
    pub fn apply_snapshot(
        &mut self,
        records: &[CharRecord],
        vv: &VersionVector,
    ) -> Result<(), ApplyError> {
        for rec in records {
            self.apply_insert(rec)?;
            if rec.tombstone {
                self.apply_delete(rec.id);
            }
        }
        self.vv.merge(vv);
        Ok(())
    }

    /// Visible (non-tombstoned) text.
    pub fn render(&self) -> String {
        self.sequence
            .iter()
            .filter_map(|id| {
                let rec = &self.records[id];
                (!rec.tombstone).then_some(rec.ch)
            })
            .collect()
    }

    /// All updates the holder of `marker` has not seen.
    ///
    /// Inserts are sent for records outside the marker (tombstone state
    /// included); deletes are re-sent for every tombstoned record the
    /// requester already has. Over-sending deletes is harmless because
    /// updates are idempotent.
    pub fn diff_since(&self, marker: &VersionVector) -> Vec<Update> {
        let mut updates = Vec::new();
        for id in &self.sequence {
            let rec = &self.records[id];
            if !marker.contains(rec.id) {
                updates.push(Update::Insert(rec.clone()));
            } else if rec.tombstone {
                updates.push(Update::Delete { target: rec.id });
            }
        }
        updates
    }

    /// Records in document order (tombstones included) — the snapshot body.
    pub fn records_in_order(&self) -> Vec<CharRecord> {
        self.sequence
            .iter()
            .map(|id| self.records[id].clone())
            .collect()
    }

    pub fn version_vector(&self) -> &VersionVector {
        &self.vv
    }

    /// Id of the visible character at `offset`.
    pub fn visible_id_at(&self, offset: usize) -> Option<RecordId> {
        self.sequence
            .iter()
            .filter(|id| !self.records[*id].tombstone)
            .nth(offset)
            .copied()
    }

    /// Visible offset of the record with the given id (None if tombstoned
    /// or unknown). Used to map remote cursors onto local text.
    pub fn offset_of(&self, id: RecordId) -> Option<usize> {
        let mut offset = 0;
        for seq_id in &self.sequence {
            let rec = &self.records[seq_id];
            if rec.tombstone {
                continue;
            }
            if *seq_id == id {
                return Some(offset);
            }
            offset += 1;
        }
        None
    }

    /// Number of visible characters.
    pub fn len(&self) -> usize {
        self.sequence
            .iter()
            .filter(|id| !self.records[*id].tombstone)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Arena size, tombstones included.
    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Updates accepted but not yet integrated (awaiting their origins).
    pub fn pending_count(&self) -> usize {
        self.pending_inserts.len() + self.pending_deletes.len()
    }

    // TODO: replace the Vec sequence + linear index_of with an
    // order-statistic tree once documents grow past editor-buffer sizes.
    fn index_of(&self, id: RecordId) -> Option<usize> {
        self.sequence.iter().position(|&x| x == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn replica() -> TextReplica {
        TextReplica::new(Uuid::new_v4())
    }

    #[test]
    fn test_local_insert_and_render() {
        let mut doc = replica();
        doc.insert_str_at(0, "hello");
        assert_eq!(doc.render(), "hello");
        assert_eq!(doc.len(), 5);
    }

    #[test]
    fn test_insert_in_middle() {
        let mut doc = replica();
        doc.insert_str_at(0, "held");
        doc.insert_at(3, 'l');
        assert_eq!(doc.render(), "helld");
        doc.delete_at(4);
        assert_eq!(doc.render(), "hell");
    }

    #[test]
    fn test_delete_tombstones_but_retains_record() {
        let mut doc = replica();
        doc.insert_str_at(0, "abc");
        let update = doc.delete_at(1).unwrap();
        assert_eq!(doc.render(), "ac");
        assert_eq!(doc.record_count(), 3);
        assert!(matches!(update, Update::Delete { .. }));
    }

    #[test]
    fn test_delete_twice_is_noop() {
        let mut doc = replica();
        doc.insert_str_at(0, "a");
        let id = doc.visible_id_at(0).unwrap();
        assert!(doc.delete(id).is_some());
        assert!(doc.delete(id).is_none());
    }

    #[test]
    fn test_remote_apply_idempotent() {
        let mut a = replica();
        let mut b = replica();
        let update = a.insert_at(0, 'x');

        assert!(b.apply_remote(&update).unwrap());
        assert!(!b.apply_remote(&update).unwrap());
        assert_eq!(b.render(), "x");
    }

    #[test]
    fn test_apply_conflict_detected() {
        let mut a = replica();
        let mut b = replica();
        let update = a.insert_at(0, 'x');
        b.apply_remote(&update).unwrap();

        // Same id, different character — must be rejected loudly.
        let mut forged = match update {
            Update::Insert(rec) => rec,
            _ => unreachable!(),
        };
        forged.ch = 'y';
        let err = b.apply_remote(&Update::Insert(forged)).unwrap_err();
        assert!(matches!(err, ApplyError::Conflict { .. }));
    }

    #[test]
    fn test_concurrent_inserts_converge() {
        let mut a = replica();
        let mut b = replica();

        // Both insert at offset 0 of an empty document, unaware of each
        // other.
        let ua: Vec<Update> = a.insert_str_at(0, "hello");
        let ub: Vec<Update> = b.insert_str_at(0, "world");

        for u in &ub {
            a.apply_remote(u).unwrap();
        }
        for u in &ua {
            b.apply_remote(u).unwrap();
        }

        let text = a.render();
        assert_eq!(text, b.render());
        assert!(text.contains("hello"));
        assert!(text.contains("world"));
        assert_eq!(text.len(), 10);
    }

    #[test]
    fn test_cross_origin_insert_converges_in_any_order() {
        // A and B each insert into an empty document, unaware of each
        // other; C sees only A's insert and types after it. The child's
        // origin is A's record, not B's, so placing it correctly requires
        // following its parent through the concurrent tie-break.
        let mut a = replica();
        let mut b = replica();
        let mut c = replica();

        let ux = a.insert_at(0, 'x');
        let uy = b.insert_at(0, 'y');
        c.apply_remote(&ux).unwrap();
        let uz = c.insert_at(1, 'z');

        let mut first = replica();
        let mut second = replica();
        for u in [&uy, &ux, &uz] {
            first.apply_remote(u).unwrap();
        }
        for u in [&ux, &uz, &uy] {
            second.apply_remote(u).unwrap();
        }

        assert_eq!(first.render(), second.render());
        // 'z' keeps following the record it was typed after.
        assert!(first.render().contains("xz"), "got {}", first.render());
    }

    #[test]
    fn test_concurrent_delete_and_insert_at_same_spot() {
        let mut a = replica();
        let mut b = replica();

        let seed = a.insert_str_at(0, "abcd");
        for u in &seed {
            b.apply_remote(u).unwrap();
        }

        // A deletes 'c' while B concurrently inserts 'X' before 'c'.
        let del = a.delete_at(2).unwrap();
        let ins = b.insert_at(2, 'X');

        a.apply_remote(&ins).unwrap();
        b.apply_remote(&del).unwrap();

        assert_eq!(a.render(), b.render());
        assert_eq!(a.render(), "abXd");
    }

    #[test]
    fn test_delete_buffered_until_insert_arrives() {
        let mut a = replica();
        let mut b = replica();

        let ins = a.insert_at(0, 'q');
        let del = a.delete_at(0).unwrap();

        // Delivered out of order: delete first.
        b.apply_remote(&del).unwrap();
        assert_eq!(b.pending_count(), 1);
        assert_eq!(b.render(), "");

        b.apply_remote(&ins).unwrap();
        assert_eq!(b.pending_count(), 0);
        assert_eq!(b.render(), "");
        assert_eq!(b.record_count(), 1);
    }

    #[test]
    fn test_insert_buffered_until_origin_arrives() {
        let mut a = replica();
        let mut b = replica();

        let first = a.insert_at(0, 'x');
        let second = a.insert_at(1, 'y');

        b.apply_remote(&second).unwrap();
        assert_eq!(b.render(), "");
        assert_eq!(b.pending_count(), 1);

        b.apply_remote(&first).unwrap();
        assert_eq!(b.render(), "xy");
        assert_eq!(b.pending_count(), 0);
    }

    #[test]
    fn test_diff_since_empty_marker_is_everything() {
        let mut doc = replica();
        doc.insert_str_at(0, "hi");
        doc.delete_at(0);

        let diff = doc.diff_since(&VersionVector::new());
        // Two inserts (one tombstoned in place); no separate delete needed
        // because the insert carries the tombstone flag.
        assert_eq!(diff.len(), 2);

        let mut fresh = replica();
        for u in &diff {
            fresh.apply_remote(u).unwrap();
        }
        assert_eq!(fresh.render(), doc.render());
    }

    #[test]
    fn test_diff_since_partial_marker() {
        let mut source = replica();
        let mut stale = replica();

        for u in source.insert_str_at(0, "one") {
            stale.apply_remote(&u).unwrap();
        }
        let marker = stale.version_vector().clone();

        source.insert_str_at(3, "two");
        source.delete_at(0);

        for u in source.diff_since(&marker) {
            stale.apply_remote(&u).unwrap();
        }
        assert_eq!(stale.render(), source.render());
        assert_eq!(stale.render(), "netwo");
    }

    #[test]
    fn test_offset_mapping() {
        let mut doc = replica();
        doc.insert_str_at(0, "abc");
        let b_id = doc.visible_id_at(1).unwrap();
        assert_eq!(doc.offset_of(b_id), Some(1));

        doc.delete_at(0);
        assert_eq!(doc.offset_of(b_id), Some(0));
    }

    #[test]
    fn test_snapshot_roundtrip_preserves_order() {
        let mut doc = replica();
        doc.insert_str_at(0, "snapshot");
        doc.delete_at(3);

        let restored = TextReplica::from_snapshot(
            Uuid::new_v4(),
            doc.records_in_order(),
            doc.version_vector().clone(),
        );
        assert_eq!(restored.render(), doc.render());
        assert_eq!(restored.record_count(), doc.record_count());
    }

    #[test]
    fn test_counter_continues_after_snapshot_restore() {
        let participant = Uuid::new_v4();
        let mut doc = TextReplica::new(participant);
        doc.insert_str_at(0, "abc");

        let mut restored = TextReplica::from_snapshot(
            participant,
            doc.records_in_order(),
            doc.version_vector().clone(),
        );
        let update = restored.insert_at(3, 'd');
        // The new id must not collide with any pre-snapshot id.
        assert_eq!(update.record_id().unwrap().counter, 4);
    }
}
