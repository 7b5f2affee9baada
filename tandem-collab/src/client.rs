//! Client-side sync agent.
//!
//! Owns a local [`TextReplica`], applies the user's edits to it
//! immediately, and ships the resulting updates to the server over
//! WebSocket. Remote updates, snapshots, and diffs arriving from the
//! server are applied to the same replica, so the rendered text always
//! reflects everything the agent has seen.
//!
//! Edits made while disconnected land in an offline queue and are
//! replayed after the join handshake on reconnect, after the server's
//! snapshot/diff has been applied.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;

use tandem_core::{codec, TextReplica};

use crate::presence::{PresenceMap, PresenceState, PresenceUpdate};
use crate::protocol::{
    JoinRequest, MessageKind, ParticipantInfo, ProtocolError, WireMessage,
};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events emitted by the sync agent.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Connection established and initial sync applied
    Synced,
    /// Connection lost
    Disconnected,
    /// The document text changed (local or remote edit)
    TextChanged(String),
    /// A participant's cursor/selection moved
    PresenceChanged(PresenceUpdate),
    /// A participant disconnected
    ParticipantLeft(Uuid),
}

/// Offline queue for edits made while disconnected.
///
/// Queued update frames are replayed on reconnection, after the server's
/// resync payload has been applied.
pub struct OfflineQueue {
    queue: VecDeque<QueuedFrame>,
    max_size: usize,
}

#[derive(Debug, Clone)]
struct QueuedFrame {
    payload: Vec<u8>,
    #[allow(dead_code)]
    timestamp: std::time::Instant,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an encoded update frame for later replay.
    pub fn enqueue(&mut self, payload: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            return false; // Queue full
        }
        self.queue.push_back(QueuedFrame {
            payload,
            timestamp: std::time::Instant::now(),
        });
        true
    }

    /// Drain all queued frames for replay.
    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        self.queue.drain(..).map(|f| f.payload).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Total bytes queued.
    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|f| f.payload.len()).sum()
    }
}

type ChangeCallback = Box<dyn Fn(&str) + Send + Sync>;
type PresenceCallback = Box<dyn Fn(&PresenceUpdate) + Send + Sync>;

/// The sync agent.
///
/// Local edits apply to the replica first and are never blocked on the
/// network; presence is fire-and-forget and dropped when offline.
/// Consumers observe the document either through the [`SyncEvent`]
/// channel or by registering callbacks with [`SyncAgent::on_change`] /
/// [`SyncAgent::on_presence_change`].
pub struct SyncAgent {
    info: ParticipantInfo,
    session_id: Uuid,
    server_url: String,

    replica: Arc<Mutex<TextReplica>>,
    presence: Arc<Mutex<PresenceMap>>,
    state: Arc<RwLock<ConnectionState>>,
    offline_queue: Arc<Mutex<OfflineQueue>>,
    presence_seq: Arc<AtomicU64>,

    /// Channel to the WebSocket writer task.
    outgoing_tx: Option<mpsc::Sender<tokio_tungstenite::tungstenite::Message>>,

    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    event_tx: mpsc::Sender<SyncEvent>,

    on_change: Arc<std::sync::Mutex<Vec<ChangeCallback>>>,
    on_presence_change: Arc<std::sync::Mutex<Vec<PresenceCallback>>>,
}

impl SyncAgent {
    pub fn new(info: ParticipantInfo, session_id: Uuid, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        let replica = TextReplica::new(info.id);
        Self {
            info,
            session_id,
            server_url: server_url.into(),
            replica: Arc::new(Mutex::new(replica)),
            presence: Arc::new(Mutex::new(PresenceMap::new())),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            offline_queue: Arc::new(Mutex::new(OfflineQueue::new(10_000))),
            presence_seq: Arc::new(AtomicU64::new(0)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            on_change: Arc::new(std::sync::Mutex::new(Vec::new())),
            on_presence_change: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    /// Register a callback invoked whenever the document text changes,
    /// whether from a local or a remote edit.
    pub fn on_change(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        if let Ok(mut callbacks) = self.on_change.lock() {
            callbacks.push(Box::new(callback));
        }
    }

    /// Register a callback invoked when a peer's presence changes.
    pub fn on_presence_change(&self, callback: impl Fn(&PresenceUpdate) + Send + Sync + 'static) {
        if let Ok(mut callbacks) = self.on_presence_change.lock() {
            callbacks.push(Box::new(callback));
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect and perform the join handshake.
    ///
    /// If the local replica already holds state (reconnect), the join
    /// carries a resync marker so the server can answer with a diff
    /// instead of a full snapshot. Spawns reader and writer tasks; edits
    /// queued while offline are replayed after the handshake.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let (ws_stream, _) = match tokio_tungstenite::connect_async(&self.server_url).await {
            Ok(conn) => conn,
            Err(e) => {
                log::debug!("connect to {} failed: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };

        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) =
            mpsc::channel::<tokio_tungstenite::tungstenite::Message>(256);
        self.outgoing_tx = Some(out_tx.clone());

        // Writer task: forward outgoing channel to the WebSocket.
        tokio::spawn(async move {
            use futures_util::SinkExt;
            while let Some(msg) = out_rx.recv().await {
                if ws_writer.send(msg).await.is_err() {
                    break;
                }
            }
        });

        // Join handshake, with a marker when we hold prior state.
        let marker = {
            let replica = self.replica.lock().await;
            let vv = replica.version_vector();
            if vv.is_empty() { None } else { Some(vv.clone()) }
        };
        let request = JoinRequest { info: self.info.clone(), marker };
        let join = WireMessage::join(self.session_id, &request)?;
        out_tx
            .send(binary(join.encode()?))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;

        *self.state.write().await = ConnectionState::Connected;

        // Replay offline edits. The server applies them after our join, so
        // they land on top of whatever resync payload it sends us.
        {
            let mut queue = self.offline_queue.lock().await;
            let queued = queue.drain();
            if !queued.is_empty() {
                log::info!("replaying {} queued updates", queued.len());
                for frame in queued {
                    let msg = WireMessage::update(self.session_id, self.info.id, frame);
                    let _ = out_tx.send(binary(msg.encode()?)).await;
                }
            }
        }

        // Reader task: apply server messages to the shared replica.
        let replica = self.replica.clone();
        let presence = self.presence.clone();
        let state = self.state.clone();
        let event_tx = self.event_tx.clone();
        let on_change = self.on_change.clone();
        let on_presence_change = self.on_presence_change.clone();
        let own_id = self.info.id;
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let bytes: Vec<u8> = match msg {
                    Ok(tokio_tungstenite::tungstenite::Message::Binary(data)) => data.into(),
                    Ok(tokio_tungstenite::tungstenite::Message::Close(_)) | Err(_) => break,
                    _ => continue,
                };
                let wire = match WireMessage::decode(&bytes) {
                    Ok(wire) => wire,
                    Err(e) => {
                        log::warn!("undecodable server frame: {e}");
                        continue;
                    }
                };
                handle_server_message(
                    wire,
                    own_id,
                    &replica,
                    &presence,
                    &event_tx,
                    &on_change,
                    &on_presence_change,
                )
                .await;
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Reconnect with exponential backoff, resyncing via the replica's
    /// version marker. Gives up after `max_attempts`.
    pub async fn reconnect(&mut self, max_attempts: u32) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Reconnecting;
        let mut delay = Duration::from_millis(100);
        for attempt in 1..=max_attempts {
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    log::warn!("reconnect attempt {attempt}/{max_attempts} failed: {e}");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(10));
                }
            }
        }
        *self.state.write().await = ConnectionState::Disconnected;
        Err(ProtocolError::ConnectionClosed)
    }

    /// Insert a character at a visible offset. Applies locally first, then
    /// sends (or queues) the update.
    pub async fn insert_at(&self, offset: usize, ch: char) -> Result<(), ProtocolError> {
        let update = {
            let mut replica = self.replica.lock().await;
            replica.insert_at(offset, ch)
        };
        let frame = codec::encode_update(&update)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        self.emit_text_changed().await;
        self.send_frame(frame).await
    }

    /// Insert a string at a visible offset.
    pub async fn insert_str_at(&self, offset: usize, text: &str) -> Result<(), ProtocolError> {
        let updates = {
            let mut replica = self.replica.lock().await;
            replica.insert_str_at(offset, text)
        };
        self.emit_text_changed().await;
        for update in updates {
            let frame = codec::encode_update(&update)
                .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
            self.send_frame(frame).await?;
        }
        Ok(())
    }

    /// Delete the character at a visible offset.
    pub async fn delete_at(&self, offset: usize) -> Result<(), ProtocolError> {
        let update = {
            let mut replica = self.replica.lock().await;
            replica.delete_at(offset)
        };
        let Some(update) = update else {
            return Ok(()); // Offset past the end, nothing to delete
        };
        let frame = codec::encode_update(&update)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        self.emit_text_changed().await;
        self.send_frame(frame).await
    }

    /// Send our cursor/selection state. Silently dropped when offline —
    /// presence is decorative and never queued.
    pub async fn set_presence(&self, state: PresenceState) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Ok(());
        }
        let seq = self.presence_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let update = PresenceUpdate { info: self.info.clone(), state, seq };
        let msg = WireMessage::presence(self.session_id, &update)?;
        if let Some(ref tx) = self.outgoing_tx {
            tx.send(binary(msg.encode()?))
                .await
                .map_err(|_| ProtocolError::ConnectionClosed)?;
        }
        Ok(())
    }

    /// Cleanly close the connection. Subsequent edits queue offline.
    pub async fn disconnect(&mut self) {
        if let Some(tx) = self.outgoing_tx.take() {
            let _ = tx
                .send(tokio_tungstenite::tungstenite::Message::Close(None))
                .await;
        }
        *self.state.write().await = ConnectionState::Disconnected;
    }

    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        let msg = WireMessage::ping(self.info.id);
        if let Some(ref tx) = self.outgoing_tx {
            tx.send(binary(msg.encode()?))
                .await
                .map_err(|_| ProtocolError::ConnectionClosed)?;
        }
        Ok(())
    }

    /// Current rendered document text.
    pub async fn text(&self) -> String {
        self.replica.lock().await.render()
    }

    /// Last-known presence of the other participants.
    pub async fn peers(&self) -> Vec<PresenceUpdate> {
        self.presence.lock().await.entries().cloned().collect()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn info(&self) -> &ParticipantInfo {
        &self.info
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.offline_queue.lock().await.len()
    }

    async fn send_frame(&self, frame: Vec<u8>) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            let mut queue = self.offline_queue.lock().await;
            if !queue.enqueue(frame) {
                return Err(ProtocolError::ConnectionClosed);
            }
            return Ok(());
        }
        let msg = WireMessage::update(self.session_id, self.info.id, frame);
        if let Some(ref tx) = self.outgoing_tx {
            tx.send(binary(msg.encode()?))
                .await
                .map_err(|_| ProtocolError::ConnectionClosed)?;
        }
        Ok(())
    }

    async fn emit_text_changed(&self) {
        let text = self.replica.lock().await.render();
        notify_change(&self.on_change, &text);
        let _ = self.event_tx.send(SyncEvent::TextChanged(text)).await;
    }
}

fn notify_change(callbacks: &std::sync::Mutex<Vec<ChangeCallback>>, text: &str) {
    if let Ok(callbacks) = callbacks.lock() {
        for callback in callbacks.iter() {
            callback(text);
        }
    }
}

fn notify_presence(callbacks: &std::sync::Mutex<Vec<PresenceCallback>>, update: &PresenceUpdate) {
    if let Ok(callbacks) = callbacks.lock() {
        for callback in callbacks.iter() {
            callback(update);
        }
    }
}

fn binary(bytes: Vec<u8>) -> tokio_tungstenite::tungstenite::Message {
    tokio_tungstenite::tungstenite::Message::Binary(bytes.into())
}

async fn handle_server_message(
    wire: WireMessage,
    own_id: Uuid,
    replica: &Arc<Mutex<TextReplica>>,
    presence: &Arc<Mutex<PresenceMap>>,
    event_tx: &mpsc::Sender<SyncEvent>,
    on_change: &std::sync::Mutex<Vec<ChangeCallback>>,
    on_presence_change: &std::sync::Mutex<Vec<PresenceCallback>>,
) {
    match wire.kind {
        MessageKind::Snapshot => {
            let snapshot = match codec::decode_snapshot(&wire.payload) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    log::error!("bad snapshot from server: {e}");
                    return;
                }
            };
            let text = {
                let mut doc = replica.lock().await;
                // Merge, keeping any local edits the server has not seen.
                if let Err(e) = doc.apply_snapshot(&snapshot.records, &snapshot.vv) {
                    log::error!("snapshot apply failed: {e}");
                    return;
                }
                doc.render()
            };
            notify_change(on_change, &text);
            let _ = event_tx.send(SyncEvent::Synced).await;
            let _ = event_tx.send(SyncEvent::TextChanged(text)).await;
        }
        MessageKind::Diff => {
            let updates = match codec::decode_update_batch(&wire.payload) {
                Ok(updates) => updates,
                Err(e) => {
                    log::error!("bad diff from server: {e}");
                    return;
                }
            };
            let text = {
                let mut doc = replica.lock().await;
                for update in &updates {
                    if let Err(e) = doc.apply_remote(update) {
                        log::error!("diff apply failed: {e}");
                    }
                }
                doc.render()
            };
            notify_change(on_change, &text);
            let _ = event_tx.send(SyncEvent::Synced).await;
            let _ = event_tx.send(SyncEvent::TextChanged(text)).await;
        }
        MessageKind::Update => {
            if wire.participant_id == own_id {
                return; // Our own update echoed back
            }
            let update = match codec::decode_update(&wire.payload) {
                Ok(update) => update,
                Err(e) => {
                    log::warn!("undecodable update relayed by server: {e}");
                    return;
                }
            };
            let (changed, text) = {
                let mut doc = replica.lock().await;
                match doc.apply_remote(&update) {
                    Ok(changed) => (changed, doc.render()),
                    Err(e) => {
                        log::error!("remote apply failed: {e}");
                        return;
                    }
                }
            };
            if changed {
                notify_change(on_change, &text);
                let _ = event_tx.send(SyncEvent::TextChanged(text)).await;
            }
        }
        MessageKind::Presence => {
            let update = match wire.presence_update() {
                Ok(update) => update,
                Err(e) => {
                    log::warn!("bad presence payload: {e}");
                    return;
                }
            };
            if update.info.id == own_id {
                return;
            }
            let changed = presence.lock().await.apply(update.clone());
            if changed {
                notify_presence(on_presence_change, &update);
                let _ = event_tx.send(SyncEvent::PresenceChanged(update)).await;
            }
        }
        MessageKind::PresenceRemoved => {
            presence.lock().await.remove(&wire.participant_id);
            let _ = event_tx
                .send(SyncEvent::ParticipantLeft(wire.participant_id))
                .await;
        }
        MessageKind::Pong => {}
        other => {
            log::debug!("unexpected {other:?} from server, ignored");
        }
    }
}
