//! WebSocket server with room-addressed sessions.
//!
//! Architecture:
//! ```text
//! ws://host/ws/{roomId}
//!        │
//!        ▼  handshake (non-/ws/ paths → HTTP 404)
//!   ┌──────────┐   miss ──► close 4004 "room not found"
//!   │ Session  │── get ──► RoomStore (memory / RocksDB)
//!   │  join    │
//!   └────┬─────┘
//!        │ admit
//!        ▼
//!   SessionRegistry ◄── BroadcastRouter ◄── Session::handle
//!        │                    │
//!        │ Channel (bounded)  │ broadcast_except / broadcast_all
//!        ▼                    ▼
//!   Client A rx           Client B rx
//! ```
//!
//! Each connection runs one `select!` loop over the socket and its own
//! outbound queue. The router never writes to a socket: it only enqueues,
//! so a slow peer stalls nobody but itself. When the router evicts a
//! channel the queue's last sender is dropped and the loop ends once the
//! queue drains, or at the channel's next inbound frame if that comes first.

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{FutureExt, SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::config::ServerConfig;
use crate::protocol::{
    Frame, RoomId, CLOSE_INTERNAL_ERROR, CLOSE_INTERNAL_ERROR_REASON, CLOSE_ROOM_NOT_FOUND,
    CLOSE_ROOM_NOT_FOUND_REASON,
};
use crate::registry::{Channel, SessionRegistry};
use crate::session::{Dispatch, Session, SessionContext, SessionError};
use crate::storage::RoomStore;

/// Route prefix for room connections.
pub const WS_PATH_PREFIX: &str = "/ws/";

/// First pause after a failed `accept`; doubles up to [`MAX_ACCEPT_BACKOFF`].
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    /// Handshakes that ended in a close frame instead of a session
    pub rejected_joins: u64,
    pub inbound_messages: u64,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_joins: AtomicU64,
    inbound_messages: AtomicU64,
}

impl AtomicServerStats {
    fn snapshot(&self) -> ServerStats {
        ServerStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            rejected_joins: self.rejected_joins.load(Ordering::Relaxed),
            inbound_messages: self.inbound_messages.load(Ordering::Relaxed),
        }
    }
}

/// Pause before retrying after the `previous` accept failure.
fn accept_backoff(previous: Option<Duration>) -> Duration {
    previous.map_or(ACCEPT_BACKOFF, |d| (d * 2).min(MAX_ACCEPT_BACKOFF))
}

/// Why a streaming loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
enum StreamExit {
    ClientClosed,
    ReadError(String),
    WriteError(String),
    Evicted,
    IdleTimeout(Duration),
}

impl std::fmt::Display for StreamExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamExit::ClientClosed => write!(f, "client closed"),
            StreamExit::ReadError(e) => write!(f, "read error: {e}"),
            StreamExit::WriteError(e) => write!(f, "write error: {e}"),
            StreamExit::Evicted => write!(f, "evicted after failed delivery"),
            StreamExit::IdleTimeout(d) => write!(f, "idle for {d:?}"),
        }
    }
}

/// The collaboration server.
pub struct CollabServer {
    config: ServerConfig,
    ctx: SessionContext,
    stats: Arc<AtomicServerStats>,
}

impl CollabServer {
    pub fn new(config: ServerConfig, store: Arc<dyn RoomStore>) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        Self {
            config,
            ctx: SessionContext::new(registry, store),
            stats: Arc::new(AtomicServerStats::default()),
        }
    }

    /// Bind `config.bind_addr` and serve. Only a failed bind returns.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Collab server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Accept connections on an already-bound listener until the task is dropped.
    ///
    /// Accept errors (e.g. `EMFILE`) are logged and retried after a growing pause.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let mut backoff = None;
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => {
                    backoff = None;
                    accepted
                }
                Err(e) => {
                    let pause = accept_backoff(backoff);
                    log::error!("Accept failed: {e}; retrying in {pause:?}");
                    tokio::time::sleep(pause).await;
                    backoff = Some(pause);
                    continue;
                }
            };
            log::debug!("New TCP connection from {addr}");

            let ctx = self.ctx.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, ctx, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection from handshake to cleanup.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        ctx: SessionContext,
        stats: Arc<AtomicServerStats>,
        config: ServerConfig,
    ) -> Result<(), ServerError> {
        let mut requested: Option<RoomId> = None;
        let handshake = tokio_tungstenite::accept_hdr_async(
            stream,
            |request: &Request, response: Response| match room_id_from_path(request.uri().path()) {
                Some(room_id) => {
                    requested = Some(room_id);
                    Ok(response)
                }
                None => Err(not_found(request.uri().path())),
            },
        )
        .await;
        let (ws_stream, room_id) = match (handshake, requested) {
            (Ok(ws_stream), Some(room_id)) => (ws_stream, room_id),
            (Err(e), None) => {
                log::debug!("Handshake from {addr} rejected: {e}");
                return Ok(());
            }
            (Err(e), Some(_)) => return Err(e.into()),
            (Ok(_), None) => return Ok(()),
        };
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        stats.total_connections.fetch_add(1, Ordering::Relaxed);
        stats.active_connections.fetch_add(1, Ordering::Relaxed);
        log::info!("WebSocket connection from {addr} for room '{room_id}'");

        let (channel, mut outbound) = Channel::new(config.channel_capacity);
        let mut session = match Session::join(&ctx, room_id, channel).await {
            Ok(session) => session,
            Err(e) => {
                let frame = match &e {
                    SessionError::RoomNotFound(_) => CloseFrame {
                        code: CloseCode::from(CLOSE_ROOM_NOT_FOUND),
                        reason: CLOSE_ROOM_NOT_FOUND_REASON.into(),
                    },
                    SessionError::Store(_) => CloseFrame {
                        code: CloseCode::from(CLOSE_INTERNAL_ERROR),
                        reason: CLOSE_INTERNAL_ERROR_REASON.into(),
                    },
                };
                log::info!("Rejected {addr}: {e}");
                stats.rejected_joins.fetch_add(1, Ordering::Relaxed);
                stats.active_connections.fetch_sub(1, Ordering::Relaxed);
                if let Err(e) = ws_sender.send(Message::Close(Some(frame))).await {
                    log::debug!("Could not send close frame to {addr}: {e}");
                }
                return Ok(());
            }
        };

        let exit = AssertUnwindSafe(Self::stream(
            &mut session,
            &mut ws_sender,
            &mut ws_receiver,
            &mut outbound,
            config.idle_timeout,
            &stats,
        ))
        .catch_unwind()
        .await;

        let room_id = session.room_id().clone();
        let channel_id = session.channel_id();
        session.close().await;

        match exit {
            Ok(reason) => {
                log::info!("Channel {channel_id} left room '{room_id}': {reason}");
                if matches!(reason, StreamExit::Evicted | StreamExit::IdleTimeout(_)) {
                    let _ = ws_sender.send(Message::Close(None)).await;
                }
            }
            Err(_) => log::error!("Connection handler for channel {channel_id} panicked"),
        }

        stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }

    /// Pump frames both ways until either side is done.
    async fn stream(
        session: &mut Session,
        ws_sender: &mut WsSink,
        ws_receiver: &mut WsSource,
        outbound: &mut mpsc::Receiver<Frame>,
        idle_timeout: Option<Duration>,
        stats: &AtomicServerStats,
    ) -> StreamExit {
        let mut deadline = idle_timeout.map(|d| Instant::now() + d);

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            deadline = idle_timeout.map(|d| Instant::now() + d);
                            stats.inbound_messages.fetch_add(1, Ordering::Relaxed);
                            if session.handle_text(text.as_str()).await == Dispatch::Evicted {
                                return StreamExit::Evicted;
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            deadline = idle_timeout.map(|d| Instant::now() + d);
                            if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                                return StreamExit::WriteError(e.to_string());
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => return StreamExit::ClientClosed,
                        Some(Err(e)) => return StreamExit::ReadError(e.to_string()),
                        Some(Ok(_)) => {}
                    }
                }

                // Outgoing frame queued by the router
                frame = outbound.recv() => {
                    match frame {
                        Some(frame) => {
                            if let Err(e) = ws_sender.send(Message::text(frame.to_string())).await {
                                return StreamExit::WriteError(e.to_string());
                            }
                        }
                        None => return StreamExit::Evicted,
                    }
                }

                _ = async move {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                } => {
                    if let Some(d) = idle_timeout {
                        return StreamExit::IdleTimeout(d);
                    }
                }
            }
        }
    }

    /// Get server statistics.
    pub fn stats(&self) -> ServerStats {
        self.stats.snapshot()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        self.ctx.registry()
    }
}

/// Extract the room id from `/ws/{roomId}`.
pub fn room_id_from_path(path: &str) -> Option<RoomId> {
    path.strip_prefix(WS_PATH_PREFIX)
        .filter(|id| !id.is_empty() && !id.contains('/'))
        .map(RoomId::from)
}

fn not_found(path: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(format!("no route for '{path}'")));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
}
