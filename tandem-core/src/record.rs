//! Character records: one entry per inserted character, tombstoned on
//! delete, never physically removed.

use serde::{Deserialize, Serialize};

use crate::id::RecordId;

/// One inserted character together with the context it was inserted into.
///
/// `origin_left` and `origin_right` are the ids of the records immediately
/// to the left and right of the insertion point *at insertion time*. They
/// are fixed forever — any replica can re-derive this record's position
/// from them no matter when or in what order it learns about neighboring
/// inserts.
///
/// `None` for `origin_left` means "inserted at the start of the document";
/// `None` for `origin_right` means "nothing to the right at the time".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharRecord {
    pub id: RecordId,
    pub ch: char,
    /// Deleted but retained for ordering stability.
    pub tombstone: bool,
    pub origin_left: Option<RecordId>,
    pub origin_right: Option<RecordId>,
}

impl CharRecord {
    pub fn new(
        id: RecordId,
        ch: char,
        origin_left: Option<RecordId>,
        origin_right: Option<RecordId>,
    ) -> Self {
        Self {
            id,
            ch,
            tombstone: false,
            origin_left,
            origin_right,
        }
    }

    /// Two records with the same id must agree on everything but the
    /// tombstone flag. Disagreement means an id was reused — the one
    /// invariant violation the whole design rules out by construction.
    pub fn same_identity(&self, other: &CharRecord) -> bool {
        self.id == other.id
            && self.ch == other.ch
            && self.origin_left == other.origin_left
            && self.origin_right == other.origin_right
    }
}
