//! Session registry: one actor task per session owning the authoritative
//! replica.
//!
//! ```text
//! connection task ──┐                       ┌── outbound mpsc ── conn A
//!                   ├── mpsc ── Session ────┤
//! connection task ──┘    inbox  (actor)     └── outbound mpsc ── conn B
//!                               │
//!                               ├── authoritative TextReplica
//!                               └── PresenceMap
//! ```
//!
//! All mutation of a session's replica happens inside its actor, strictly
//! one command at a time — an update is committed to the authoritative
//! replica before any peer sees the broadcast. Different sessions are
//! fully independent tasks.
//!
//! A session with zero participants lingers for a grace period before the
//! actor exits and unregisters itself. A join racing that reap simply
//! fails to send on the closed inbox and re-creates the session.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, RwLock};
use uuid::Uuid;

use tandem_core::{codec, TextReplica};

use crate::presence::{PresenceMap, PresenceState, PresenceUpdate};
use crate::protocol::{JoinRequest, ParticipantInfo, WireMessage};

/// Registry tuning knobs.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How long an empty session lingers before being reaped.
    pub grace_period: Duration,
    /// Resync diffs larger than this fall back to a full snapshot.
    pub max_diff_updates: usize,
    /// Capacity of session inboxes and per-participant outbound channels.
    pub channel_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(30),
            max_diff_updates: 4096,
            channel_capacity: 256,
        }
    }
}

/// Either a full snapshot or an incremental diff — whichever the joiner's
/// marker warrants. Callers treat both the same way.
#[derive(Debug, Clone)]
pub enum SyncPayload {
    Snapshot(Vec<u8>),
    Diff(Vec<u8>),
}

/// What a joining participant gets back.
#[derive(Debug)]
pub struct JoinReply {
    pub sync: SyncPayload,
    /// The other participants currently in the session.
    pub participants: Vec<ParticipantInfo>,
    /// Their last-known presence (default state if they have not moved
    /// their cursor yet).
    pub presence: Vec<PresenceUpdate>,
}

#[derive(Debug, Clone)]
pub enum RegistryError {
    /// The session actor went away mid-operation and could not be reached.
    SessionClosed,
    /// The join handshake could not be serviced (encode failure).
    JoinFailed(String),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SessionClosed => write!(f, "session closed"),
            Self::JoinFailed(e) => write!(f, "join failed: {e}"),
        }
    }
}

impl std::error::Error for RegistryError {}

enum SessionCommand {
    Join {
        request: JoinRequest,
        outbound: mpsc::Sender<WireMessage>,
        reply: oneshot::Sender<Result<JoinReply, RegistryError>>,
    },
    Update {
        from: Uuid,
        frame: Vec<u8>,
    },
    Presence {
        from: Uuid,
        update: PresenceUpdate,
    },
    Leave {
        participant: Uuid,
        /// Outbound channel of the connection that is leaving. Membership
        /// is only dropped if this is still the registered channel, so a
        /// stale connection's deferred leave cannot evict a re-join that
        /// arrived on a fresh connection in the meantime.
        outbound: mpsc::Sender<WireMessage>,
    },
}

type SessionMap = Arc<RwLock<HashMap<Uuid, mpsc::Sender<SessionCommand>>>>;

/// Maps session ids to their actor inboxes and owns session lifecycle.
pub struct SessionRegistry {
    sessions: SessionMap,
    config: RegistryConfig,
}

impl SessionRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RegistryConfig::default())
    }

    /// Join a session, creating it (empty) if it does not exist — including
    /// the case where a reap completed moments ago.
    pub async fn join(
        &self,
        session_id: Uuid,
        request: JoinRequest,
        outbound: mpsc::Sender<WireMessage>,
    ) -> Result<JoinReply, RegistryError> {
        // Bounded retries: each iteration only fails if the actor exited
        // between lookup and send, which cannot repeat indefinitely.
        for _ in 0..4 {
            let inbox = self.get_or_spawn(session_id).await;
            let (tx, rx) = oneshot::channel();
            let cmd = SessionCommand::Join {
                request: request.clone(),
                outbound: outbound.clone(),
                reply: tx,
            };
            if inbox.send(cmd).await.is_err() {
                // Lost the race against the reaper; drop the dead handle
                // and re-create.
                self.remove_if_closed(session_id).await;
                continue;
            }
            match rx.await {
                Ok(reply) => return reply,
                Err(_) => {
                    self.remove_if_closed(session_id).await;
                    continue;
                }
            }
        }
        Err(RegistryError::SessionClosed)
    }

    /// Forward a document update into the session actor.
    pub async fn update(
        &self,
        session_id: Uuid,
        from: Uuid,
        frame: Vec<u8>,
    ) -> Result<(), RegistryError> {
        self.send(session_id, SessionCommand::Update { from, frame })
            .await
    }

    /// Forward a presence update into the session actor.
    pub async fn presence(
        &self,
        session_id: Uuid,
        from: Uuid,
        update: PresenceUpdate,
    ) -> Result<(), RegistryError> {
        self.send(session_id, SessionCommand::Presence { from, update })
            .await
    }

    /// Remove a participant, but only if `outbound` is still their
    /// registered channel — a leave from a superseded connection is a
    /// no-op. Fire-and-forget: a closed session already has nobody to
    /// notify.
    pub async fn leave(
        &self,
        session_id: Uuid,
        participant: Uuid,
        outbound: mpsc::Sender<WireMessage>,
    ) {
        let _ = self
            .send(session_id, SessionCommand::Leave { participant, outbound })
            .await;
    }

    /// Number of live sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn send(&self, session_id: Uuid, cmd: SessionCommand) -> Result<(), RegistryError> {
        let inbox = {
            let sessions = self.sessions.read().await;
            sessions.get(&session_id).cloned()
        };
        match inbox {
            Some(inbox) => inbox
                .send(cmd)
                .await
                .map_err(|_| RegistryError::SessionClosed),
            None => Err(RegistryError::SessionClosed),
        }
    }

    async fn get_or_spawn(&self, session_id: Uuid) -> mpsc::Sender<SessionCommand> {
        {
            let sessions = self.sessions.read().await;
            if let Some(inbox) = sessions.get(&session_id) {
                return inbox.clone();
            }
        }

        let mut sessions = self.sessions.write().await;
        // Double-check after taking the write lock.
        if let Some(inbox) = sessions.get(&session_id) {
            return inbox.clone();
        }

        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        let session = Session::new(session_id, self.config.clone());
        let map = self.sessions.clone();
        let own_tx = tx.clone();
        tokio::spawn(async move {
            session.run(rx).await;
            // Unregister, unless a newer incarnation replaced us already.
            let mut sessions = map.write().await;
            if let Some(current) = sessions.get(&session_id) {
                if current.same_channel(&own_tx) {
                    sessions.remove(&session_id);
                    log::info!("session {session_id} reaped (empty past grace period)");
                }
            }
        });
        sessions.insert(session_id, tx.clone());
        log::info!("session {session_id} created");
        tx
    }

    async fn remove_if_closed(&self, session_id: Uuid) {
        let mut sessions = self.sessions.write().await;
        if let Some(inbox) = sessions.get(&session_id) {
            if inbox.is_closed() {
                sessions.remove(&session_id);
            }
        }
    }
}

struct Member {
    info: ParticipantInfo,
    outbound: mpsc::Sender<WireMessage>,
}

/// The per-session actor state. Sole owner of the authoritative replica.
struct Session {
    id: Uuid,
    replica: TextReplica,
    members: HashMap<Uuid, Member>,
    presence: PresenceMap,
    config: RegistryConfig,
}

impl Session {
    fn new(id: Uuid, config: RegistryConfig) -> Self {
        Self {
            id,
            // The authoritative replica never originates edits.
            replica: TextReplica::new(Uuid::nil()),
            members: HashMap::new(),
            presence: PresenceMap::new(),
            config,
        }
    }

    async fn run(mut self, mut inbox: mpsc::Receiver<SessionCommand>) {
        loop {
            let cmd = if self.members.is_empty() {
                // Empty session: linger for the grace period, then reap.
                match tokio::time::timeout(self.config.grace_period, inbox.recv()).await {
                    Ok(Some(cmd)) => cmd,
                    Ok(None) => break,
                    Err(_) => break,
                }
            } else {
                match inbox.recv().await {
                    Some(cmd) => cmd,
                    None => break,
                }
            };

            match cmd {
                SessionCommand::Join { request, outbound, reply } => {
                    let _ = reply.send(self.handle_join(request, outbound));
                }
                SessionCommand::Update { from, frame } => {
                    self.handle_update(from, frame);
                }
                SessionCommand::Presence { from, update } => {
                    self.presence.apply(update.clone());
                    match WireMessage::presence(self.id, &update) {
                        Ok(msg) => self.fan_out(msg, Some(from)),
                        Err(e) => log::warn!("presence encode failed: {e}"),
                    }
                }
                SessionCommand::Leave { participant, outbound } => {
                    self.handle_leave(participant, &outbound);
                }
            }
        }
    }

    fn handle_join(
        &mut self,
        request: JoinRequest,
        outbound: mpsc::Sender<WireMessage>,
    ) -> Result<JoinReply, RegistryError> {
        let joiner = request.info.clone();

        // Snapshot-or-diff, transparent to the caller. A marker that this
        // session incarnation does not dominate means the requester's
        // history belongs to a reaped predecessor (or to their own
        // unsent edits) — fall back to a snapshot.
        let sync = match &request.marker {
            Some(marker)
                if !marker.is_empty() && self.replica.version_vector().dominates(marker) =>
            {
                let updates = self.replica.diff_since(marker);
                if updates.len() > self.config.max_diff_updates {
                    self.encode_snapshot()?
                } else {
                    let batch = codec::encode_update_batch(&updates)
                        .map_err(|e| RegistryError::JoinFailed(e.to_string()))?;
                    SyncPayload::Diff(batch)
                }
            }
            _ => self.encode_snapshot()?,
        };

        let participants: Vec<ParticipantInfo> =
            self.members.values().map(|m| m.info.clone()).collect();
        let presence: Vec<PresenceUpdate> = self
            .members
            .values()
            .map(|m| {
                self.presence
                    .get(&m.info.id)
                    .cloned()
                    .unwrap_or(PresenceUpdate {
                        info: m.info.clone(),
                        state: PresenceState::default(),
                        seq: 0,
                    })
            })
            .collect();

        self.members.insert(
            joiner.id,
            Member { info: joiner.clone(), outbound },
        );
        log::info!(
            "participant {} ({}) joined session {} ({} present)",
            joiner.name,
            joiner.id,
            self.id,
            self.members.len()
        );

        // Announce the joiner to everyone else.
        let announce = PresenceUpdate {
            info: joiner.clone(),
            state: PresenceState::default(),
            seq: 0,
        };
        if let Ok(msg) = WireMessage::presence(self.id, &announce) {
            self.fan_out(msg, Some(joiner.id));
        }

        Ok(JoinReply { sync, participants, presence })
    }

    fn encode_snapshot(&self) -> Result<SyncPayload, RegistryError> {
        codec::encode_snapshot(&self.replica)
            .map(SyncPayload::Snapshot)
            .map_err(|e| RegistryError::JoinFailed(e.to_string()))
    }

    fn handle_update(&mut self, from: Uuid, frame: Vec<u8>) {
        let update = match codec::decode_update(&frame) {
            Ok(update) => update,
            Err(e) => {
                log::warn!("undecodable update from {from} in session {}: {e}", self.id);
                return;
            }
        };

        // Commit to the authoritative replica before any peer sees it.
        match self.replica.apply_remote(&update) {
            Ok(_) => {
                // Unknown kinds apply as a no-op but are still relayed;
                // peers with newer clients may understand them.
                let msg = WireMessage::update(self.id, from, frame);
                self.fan_out(msg, Some(from));
            }
            Err(e) => {
                log::error!(
                    "apply conflict in session {} from {from}: {e} — update dropped",
                    self.id
                );
            }
        }
    }

    fn handle_leave(&mut self, participant: Uuid, outbound: &mpsc::Sender<WireMessage>) {
        match self.members.get(&participant) {
            Some(member) if member.outbound.same_channel(outbound) => {}
            // Unknown participant, or the membership now belongs to a
            // newer connection.
            _ => return,
        }
        self.members.remove(&participant);
        self.presence.remove(&participant);
        log::info!(
            "participant {participant} left session {} ({} remain)",
            self.id,
            self.members.len()
        );
        let msg = WireMessage::presence_removed(self.id, participant);
        self.fan_out(msg, None);
    }

    /// Send to every member except `exclude`. A full outbound queue drops
    /// the message for that peer (it will level up via resync); a closed
    /// one means the connection died, so the member is removed and its
    /// departure broadcast, repeating until no dead members remain.
    fn fan_out(&mut self, msg: WireMessage, exclude: Option<Uuid>) {
        let mut dead = self.try_send_all(&msg, exclude);
        while let Some(id) = dead.pop() {
            if self.members.remove(&id).is_none() {
                continue;
            }
            self.presence.remove(&id);
            log::info!(
                "participant {id} dropped from session {} ({} remain)",
                self.id,
                self.members.len()
            );
            let removal = WireMessage::presence_removed(self.id, id);
            dead.extend(self.try_send_all(&removal, None));
        }
    }

    fn try_send_all(&self, msg: &WireMessage, exclude: Option<Uuid>) -> Vec<Uuid> {
        let mut dead = Vec::new();
        for (id, member) in &self.members {
            if Some(*id) == exclude {
                continue;
            }
            match member.outbound.try_send(msg.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    log::warn!(
                        "participant {id} lagging in session {}, message dropped",
                        self.id
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dead.push(*id);
                }
            }
        }
        dead
    }
}
