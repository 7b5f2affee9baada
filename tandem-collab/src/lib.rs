//! # tandem-collab — Real-time sync layer for Tandem
//!
//! WebSocket-based multiplayer text editing on top of the `tandem-core`
//! replicated text model.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncAgent   │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │     Binary Proto    │ (central)   │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌───────────────┐
//! │ TextReplica │                     │SessionRegistry│
//! │ (local)     │                     │(actor/session)│
//! └─────────────┘                     └──────┬────────┘
//!                                            │
//!                                    ┌───────┴────────┐
//!                                    │ TextReplica    │
//!                                    │ (authority)    │
//!                                    │ + PresenceMap  │
//!                                    └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded WireMessage)
//! - [`registry`] — Actor-per-session registry with grace-period reaping
//! - [`server`] — WebSocket sync server
//! - [`client`] — Client sync agent with offline queue and resync markers
//! - [`presence`] — Ephemeral cursor/selection state, last-write-wins
//! - [`directory`] — Named-session catalogue
//! - [`sandbox`] — Code-runner trait seam

pub mod client;
pub mod directory;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod sandbox;
pub mod server;

// Re-exports for convenience
pub use client::{ConnectionState, OfflineQueue, SyncAgent, SyncEvent};
pub use directory::{SessionDirectory, SessionInfo};
pub use presence::{PresenceMap, PresenceState, PresenceUpdate};
pub use protocol::{
    JoinRequest, MessageKind, ParticipantInfo, ProtocolError, WireMessage,
};
pub use registry::{
    JoinReply, RegistryConfig, RegistryError, SessionRegistry, SyncPayload,
};
pub use sandbox::{CodeRunner, Language, RunError, RunOutput};
pub use server::{ServerConfig, ServerStats, SyncServer};
