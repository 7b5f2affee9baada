//! # tandem-core — conflict-free replicated text model
//!
//! The document model behind Tandem's real-time collaborative editing.
//! Each participant holds a [`TextReplica`]; local edits apply immediately
//! and produce [`Update`]s that can be delivered to peers in any order,
//! duplicated, or delayed — every replica holding the same update set
//! renders the same text.
//!
//! ## How convergence works
//!
//! ```text
//! insert('X' between a and b)
//!        │
//!        ▼
//! CharRecord { id: (participant, counter),
//!              origin_left: id(a), origin_right: id(b) }
//!        │
//!        ▼  (any delivery order)
//! integrate(): position re-derived from origins;
//! concurrent siblings ordered by a deterministic scan
//! ```
//!
//! Deletes tombstone records instead of removing them, keeping origin
//! links of later inserts resolvable forever.
//!
//! ## Modules
//!
//! - [`id`] — record ids and version vectors
//! - [`record`] — character records with origin links
//! - [`update`] — the insert/delete/unknown update variants
//! - [`replica`] — the replica itself: integration, diff, render
//! - [`codec`] — forward-compatible wire encoding, deterministic snapshots
//!
//! This crate is pure and synchronous; all networking lives in
//! `tandem-collab`.

pub mod codec;
pub mod id;
pub mod record;
pub mod replica;
pub mod update;

pub use codec::{CodecError, Snapshot};
pub use id::{ParticipantId, RecordId, VersionVector};
pub use record::CharRecord;
pub use replica::{ApplyError, TextReplica};
pub use update::Update;
