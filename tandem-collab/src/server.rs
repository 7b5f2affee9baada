//! WebSocket sync server.
//!
//! ```text
//!             ┌─────────────────────────────┐
//!   ws ───────┤ connection task             │
//!             │   decode WireMessage        ├──► SessionRegistry
//!   ws ───────┤   forward to registry       │      (actor per session)
//!             │   drain outbound queue      │◄── fan-out
//!             └─────────────────────────────┘
//! ```
//!
//! The server interprets the envelope only. Document updates inside
//! `Update` payloads are opaque frames handed to the session actor, which
//! applies them to the authoritative replica before relaying. Malformed
//! frames are logged and dropped; a connection producing too many of them
//! is closed.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{MessageKind, WireMessage};
use crate::registry::{RegistryConfig, SessionRegistry, SyncPayload};

/// Close the connection after this many undecodable frames.
const MAX_MALFORMED_FRAMES: u32 = 8;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// How long an empty session lingers before being reaped.
    pub grace_period_secs: u64,
    /// Resync diffs larger than this fall back to a full snapshot.
    pub max_diff_updates: usize,
    /// Per-connection outbound queue capacity.
    pub channel_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9600".to_string(),
            grace_period_secs: 30,
            max_diff_updates: 4096,
            channel_capacity: 256,
        }
    }
}

/// Aggregate counters, readable from any task.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub total_connections: AtomicU64,
    pub active_connections: AtomicU64,
    pub total_messages: AtomicU64,
    pub total_bytes: AtomicU64,
}

pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    stats: Arc<ServerStats>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        let registry = SessionRegistry::new(RegistryConfig {
            grace_period: Duration::from_secs(config.grace_period_secs),
            max_diff_updates: config.max_diff_updates,
            channel_capacity: config.channel_capacity,
        });
        Self {
            config,
            registry: Arc::new(registry),
            stats: Arc::new(ServerStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        self.stats.clone()
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    /// Bind and serve until the process exits.
    pub async fn run(&self) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        let local = listener.local_addr()?;
        log::info!("sync server listening on {local}");
        self.serve(listener).await
    }

    /// Serve on an already-bound listener. Useful when the caller needs the
    /// actual port before accepting (ephemeral-port binds).
    pub async fn serve(&self, listener: TcpListener) -> Result<(), std::io::Error> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let registry = self.registry.clone();
            let stats = self.stats.clone();
            let capacity = self.config.channel_capacity;

            stats.total_connections.fetch_add(1, Ordering::Relaxed);
            stats.active_connections.fetch_add(1, Ordering::Relaxed);

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer, registry, stats.clone(), capacity).await {
                    log::debug!("connection {peer} ended: {e}");
                }
                stats.active_connections.fetch_sub(1, Ordering::Relaxed);
            });
        }
    }
}

/// Session membership of one connection, cleared on drop.
struct ConnectionSession {
    session_id: Uuid,
    participant_id: Uuid,
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<SessionRegistry>,
    stats: Arc<ServerStats>,
    capacity: usize,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    log::debug!("websocket established with {peer}");
    let (mut ws_sink, mut ws_stream) = ws.split();

    let (out_tx, mut out_rx) = mpsc::channel::<WireMessage>(capacity);
    let mut membership: Option<ConnectionSession> = None;
    let mut malformed: u32 = 0;

    loop {
        tokio::select! {
            incoming = ws_stream.next() => {
                let msg = match incoming {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        log::debug!("websocket error from {peer}: {e}");
                        break;
                    }
                    None => break,
                };

                let bytes = match msg {
                    Message::Binary(bytes) => bytes,
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => continue,
                    other => {
                        log::debug!("ignoring non-binary frame from {peer}: {other:?}");
                        continue;
                    }
                };

                stats.total_messages.fetch_add(1, Ordering::Relaxed);
                stats.total_bytes.fetch_add(bytes.len() as u64, Ordering::Relaxed);

                let wire = match WireMessage::decode(&bytes) {
                    Ok(wire) => wire,
                    Err(e) => {
                        malformed += 1;
                        log::warn!("malformed frame from {peer} ({malformed}): {e}");
                        if malformed >= MAX_MALFORMED_FRAMES {
                            log::warn!("closing {peer}: too many malformed frames");
                            break;
                        }
                        continue;
                    }
                };

                match wire.kind {
                    MessageKind::Join => {
                        let request = match wire.join_request() {
                            Ok(request) => request,
                            Err(e) => {
                                log::warn!("bad join from {peer}: {e}");
                                continue;
                            }
                        };
                        let session_id = wire.session_id;
                        let participant_id = request.info.id;

                        // Re-join on the same connection moves the
                        // participant out of the previous session first.
                        if let Some(prev) = membership.take() {
                            registry
                                .leave(prev.session_id, prev.participant_id, out_tx.clone())
                                .await;
                        }

                        match registry.join(session_id, request, out_tx.clone()).await {
                            Ok(reply) => {
                                let sync_msg = match reply.sync {
                                    SyncPayload::Snapshot(bytes) => {
                                        WireMessage::snapshot(session_id, bytes)
                                    }
                                    SyncPayload::Diff(bytes) => {
                                        WireMessage::diff(session_id, bytes)
                                    }
                                };
                                send_wire(&mut ws_sink, &sync_msg).await?;
                                for entry in &reply.presence {
                                    if let Ok(msg) = WireMessage::presence(session_id, entry) {
                                        send_wire(&mut ws_sink, &msg).await?;
                                    }
                                }
                                membership = Some(ConnectionSession { session_id, participant_id });
                            }
                            Err(e) => {
                                log::error!("join failed for {peer}: {e}");
                                break;
                            }
                        }
                    }
                    MessageKind::Update => {
                        if let Some(session) = &membership {
                            let _ = registry
                                .update(session.session_id, session.participant_id, wire.payload)
                                .await;
                        } else {
                            log::warn!("update from {peer} before join, dropped");
                        }
                    }
                    MessageKind::Presence => {
                        if let Some(session) = &membership {
                            match wire.presence_update() {
                                Ok(update) => {
                                    let _ = registry
                                        .presence(session.session_id, session.participant_id, update)
                                        .await;
                                }
                                Err(e) => log::warn!("bad presence from {peer}: {e}"),
                            }
                        }
                    }
                    MessageKind::Ping => {
                        send_wire(&mut ws_sink, &WireMessage::pong(wire.participant_id)).await?;
                    }
                    other => {
                        log::debug!("unexpected {other:?} from client {peer}, ignored");
                    }
                }
            }
            outbound = out_rx.recv() => {
                match outbound {
                    Some(msg) => send_wire(&mut ws_sink, &msg).await?,
                    // Session actor dropped our sender (reaped or removed).
                    None => break,
                }
            }
        }
    }

    // Scoped to this connection's channel: if the participant already
    // re-joined over a new connection, their membership stays.
    if let Some(session) = membership {
        registry
            .leave(session.session_id, session.participant_id, out_tx.clone())
            .await;
    }
    log::debug!("connection {peer} closed");
    Ok(())
}

async fn send_wire<S>(
    sink: &mut S,
    msg: &WireMessage,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let bytes = msg.encode()?;
    sink.send(Message::Binary(bytes.into())).await?;
    Ok(())
}
