//! WebSocket sync server with room-based document routing.
//!
//! Architecture:
//! ```text
//! ws://host/notes ──┐
//!                   ├── DocRegistry ── "notes" ── SharedDoc ── broadcast
//! ws://host/?room=notes ┘                               │
//!                                            ┌──────────┼───────────┐
//!                                            ▼          ▼           ▼
//!                                         Session A  Session B  Session C
//! ```
//!
//! The room is named by the `room` query parameter, or failing that by the
//! request path without its leading `/`. Each accepted socket runs one
//! [`Session`] on its own task; a background task expires stale presence.

use futures_util::{future, SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::config::ServerConfig;
use crate::registry::DocRegistry;
use crate::session::{CloseReason, Session, SessionSummary};

/// Errors that stop the server.
#[derive(Debug)]
pub enum ServerError {
    Bind { addr: String, source: std::io::Error },
    Accept(std::io::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bind { addr, source } => write!(f, "Failed to bind {addr}: {source}"),
            Self::Accept(e) => write!(f, "Accept failed: {e}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Bind { source, .. } => Some(source),
            Self::Accept(e) => Some(e),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    /// Frames received from peers of finished sessions
    pub total_frames: u64,
    /// Received frames that were malformed or rejected
    pub dropped_frames: u64,
    pub active_rooms: usize,
}

#[derive(Default)]
struct Counters {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_frames: AtomicU64,
    dropped_frames: AtomicU64,
}

impl Counters {
    fn record(&self, summary: &SessionSummary) {
        self.total_frames.fetch_add(summary.frames_received, Ordering::Relaxed);
        self.dropped_frames.fetch_add(summary.frames_dropped, Ordering::Relaxed);
    }
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    registry: DocRegistry,
    counters: Arc<Counters>,
}

impl SyncServer {
    /// Create a new sync server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        let registry = DocRegistry::new(config.registry_config());
        Self {
            config,
            registry,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The registry backing this server; clones share the same rooms.
    pub fn registry(&self) -> &DocRegistry {
        &self.registry
    }

    /// Get current server statistics.
    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.counters.total_connections.load(Ordering::Relaxed),
            active_connections: self.counters.active_connections.load(Ordering::Relaxed),
            total_frames: self.counters.total_frames.load(Ordering::Relaxed),
            dropped_frames: self.counters.dropped_frames.load(Ordering::Relaxed),
            active_rooms: self.registry.room_count().await,
        }
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: self.config.bind_addr.clone(),
                source,
            })
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the server event loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until accepting fails.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        match listener.local_addr() {
            Ok(addr) => log::info!("Sync server listening on {addr}"),
            Err(_) => log::info!("Sync server listening on {}", self.config.bind_addr),
        }

        let sweeper = self
            .config
            .awareness_timeout()
            .map(|timeout| spawn_awareness_sweeper(self.registry.clone(), timeout));

        let result = self.accept_loop(&listener).await;
        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }
        result
    }

    async fn accept_loop(&self, listener: &TcpListener) -> Result<(), ServerError> {
        loop {
            let (stream, addr) = listener.accept().await.map_err(ServerError::Accept)?;
            log::debug!("New TCP connection from {addr}");

            let registry = self.registry.clone();
            let counters = self.counters.clone();
            let max_message_size = self.config.max_message_size;

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, registry, counters, max_message_size).await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: DocRegistry,
        counters: Arc<Counters>,
        max_message_size: usize,
    ) -> Result<(), WsError> {
        let mut room: Option<String> = None;
        let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            match room_from_target(req.uri().path(), req.uri().query()) {
                Some(name) => {
                    room = Some(name);
                    Ok(resp)
                }
                None => {
                    let mut err = ErrorResponse::new(Some("missing room name".to_string()));
                    *err.status_mut() = StatusCode::BAD_REQUEST;
                    Err(err)
                }
            }
        };
        // Oversized messages fail in the reader instead of being buffered whole.
        let ws_config = WebSocketConfig::default()
            .max_message_size(Some(max_message_size))
            .max_frame_size(Some(max_message_size));
        let ws_stream =
            tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(ws_config)).await?;
        let Some(room) = room else {
            return Ok(());
        };

        log::info!("WebSocket connection established from {addr} for room {room}");
        counters.total_connections.fetch_add(1, Ordering::Relaxed);
        counters.active_connections.fetch_add(1, Ordering::Relaxed);

        let (ws_sender, ws_receiver) = ws_stream.split();

        // Binary frames carry protocol messages; a close frame ends the stream.
        let inbound = Box::pin(
            ws_receiver
                .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))))
                .filter_map(|msg| {
                    future::ready(match msg {
                        Ok(Message::Binary(data)) => Some(Ok(data.to_vec())),
                        Ok(_) => None,
                        Err(e) => Some(Err(e)),
                    })
                }),
        );
        let outbound = Box::pin(ws_sender.with(|frame: Vec<u8>| {
            future::ready(Ok::<_, WsError>(Message::Binary(frame.into())))
        }));

        let summary = Session::new(room, max_message_size)
            .run(registry, inbound, outbound)
            .await;

        counters.record(&summary);
        counters.active_connections.fetch_sub(1, Ordering::Relaxed);

        match &summary.reason {
            CloseReason::PeerClosed => log::info!(
                "Peer {addr} left room {} ({} frames, {} dropped)",
                summary.room,
                summary.frames_received,
                summary.frames_dropped
            ),
            CloseReason::Transport(e) => {
                log::warn!("Peer {addr} disconnected from room {}: {e}", summary.room)
            }
            CloseReason::Rejected(e) => log::warn!("Peer {addr} rejected: {e}"),
        }
        Ok(())
    }
}

/// Room name for a request target: `?room=` if present, else the path.
///
/// Names are used verbatim; no percent-decoding is applied.
pub fn room_from_target(path: &str, query: Option<&str>) -> Option<String> {
    let from_query = query.and_then(|q| {
        q.split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| *key == "room")
            .map(|(_, value)| value)
    });

    let name = match from_query {
        Some(value) if !value.is_empty() => value,
        _ => path.strip_prefix('/').unwrap_or(path),
    };

    (!name.is_empty()).then(|| name.to_string())
}

/// Periodically drop presence that has not been renewed within `timeout`.
fn spawn_awareness_sweeper(registry: DocRegistry, timeout: Duration) -> JoinHandle<()> {
    let period = (timeout / 2).max(Duration::from_millis(100));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            for room in registry.rooms().await {
                let removed = room.sweep_awareness(timeout).await;
                if !removed.is_empty() {
                    log::debug!(
                        "Expired {} presence entries in room {}",
                        removed.len(),
                        room.name()
                    );
                }
            }
        }
    })
}
