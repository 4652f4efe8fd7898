//! Relay server core: shared state, WebSocket handler, and server startup.
//!
//! Every accepted WebSocket becomes a [`Connection`] with a bounded outbound
//! queue. A reader task feeds inbound frames to the [`Router`] in arrival
//! order; a writer task drains the queue into the socket. When either side
//! finishes, the connection leaves its room.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, Utf8Bytes, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Notify, RwLock};

use crate::config::DEFAULT_OUTBOUND_BUFFER;
use crate::rooms::{Connection, ConnectionId, Outbound, Registry};
use crate::router::{DEFAULT_MAX_MESSAGE_SIZE, Router};

/// An open connection plus the signal that tells its writer to close the
/// socket even when the outbound queue is full.
struct Tracked {
    conn: Connection,
    shutdown: Arc<Notify>,
}

/// Shared relay server state: the router (and its registry) plus the set of
/// open connections.
pub struct RelayState {
    /// Every open connection, joined or not.
    connections: RwLock<HashMap<ConnectionId, Tracked>>,
    /// Message router over the room registry.
    pub router: Router,
    /// Outbound queue capacity for new connections.
    outbound_buffer: usize,
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayState {
    /// Creates a new relay state with an empty registry and default limits.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_OUTBOUND_BUFFER)
    }

    /// Creates a new relay state with custom message size and queue limits.
    #[must_use]
    pub fn with_config(max_message_size: usize, outbound_buffer: usize) -> Self {
        let registry = Arc::new(Registry::new());
        Self {
            connections: RwLock::new(HashMap::new()),
            router: Router::with_max_message_size(registry, max_message_size),
            outbound_buffer,
        }
    }

    /// The room registry behind the router.
    #[must_use]
    pub const fn registry(&self) -> &Arc<Registry> {
        self.router.registry()
    }

    /// Tracks a newly opened connection, returning its shutdown signal.
    pub async fn register(&self, conn: &Connection) -> Arc<Notify> {
        let shutdown = Arc::new(Notify::new());
        let mut conns = self.connections.write().await;
        conns.insert(
            conn.id(),
            Tracked {
                conn: conn.clone(),
                shutdown: Arc::clone(&shutdown),
            },
        );
        shutdown
    }

    /// Stops tracking a connection, returning it if it was known.
    pub async fn unregister(&self, id: ConnectionId) -> Option<Connection> {
        let mut conns = self.connections.write().await;
        conns.remove(&id).map(|tracked| tracked.conn)
    }

    /// Number of open connections, joined or not.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Queue a WebSocket Close frame on every open connection.
    ///
    /// Each writer task sends the close frame and stops, which ends the
    /// connection and runs its leave path. A connection whose queue is full
    /// leaves its room immediately and its writer is signalled to close
    /// without waiting for the backlog. Useful for graceful shutdown and
    /// testing.
    pub async fn close_all_connections(&self) {
        let conns = self.connections.read().await;
        for (conn_id, tracked) in conns.iter() {
            tracing::info!(conn_id = %conn_id, "sending close frame to connection");
            match tracked.conn.try_send(Outbound::Close) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(conn_id = %conn_id, "outbound queue full, forcing close");
                    self.router.disconnect(*conn_id);
                    tracked.shutdown.notify_one();
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(conn_id = %conn_id, "connection already closing");
                }
            }
        }
    }
}

/// Handles an upgraded WebSocket connection for a single client.
///
/// The connection lifecycle:
/// 1. Create the connection and its outbound queue; track it.
/// 2. Spawn the writer (queue → socket) and reader (socket → router) tasks.
/// 3. Wait for either task to finish, abort the other and wait for it to stop,
///    so no inbound frame is routed after the leave.
/// 4. Leave the current room, if any, and stop tracking the connection.
pub async fn handle_socket(socket: WebSocket, state: Arc<RelayState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (conn, mut rx) = Connection::channel(state.outbound_buffer);
    let conn_id = conn.id();
    let shutdown = state.register(&conn).await;

    tracing::info!(conn_id = %conn_id, "connection opened");

    let mut write_task = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                frame = rx.recv() => frame,
                () = shutdown.notified() => Some(Outbound::Close),
            };
            let Some(frame) = frame else {
                break;
            };
            let (msg, closing) = match frame {
                // Copies the shared text into this socket's frame.
                Outbound::Signal(text) => (Message::Text(Utf8Bytes::from(&*text)), false),
                Outbound::Close => (Message::Close(None), true),
            };
            if ws_sender.send(msg).await.is_err() {
                tracing::warn!(conn_id = %conn_id, "WebSocket write failed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    let reader_state = Arc::clone(&state);
    let reader_conn = conn.clone();
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => {
                    reader_state.router.dispatch(&reader_conn, text.as_str());
                }
                Message::Binary(data) => {
                    reader_state.router.dispatch_binary(&reader_conn, &data);
                }
                Message::Close(_) => {
                    tracing::debug!(conn_id = %reader_conn.id(), "received close frame");
                    break;
                }
                _ => {
                    // Ignore ping and pong frames.
                }
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => {
            write_task.abort();
            let _ = (&mut write_task).await;
        }
        _ = &mut write_task => {
            read_task.abort();
            let _ = (&mut read_task).await;
        }
    }

    state.router.disconnect(conn_id);
    state.unregister(conn_id).await;
    tracing::info!(conn_id = %conn_id, "connection closed");
}

/// Starts the relay server on the given address and returns the bound address
/// and a join handle.
///
/// This is the primary entry point used by both `main.rs` and test code.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(RelayState::new())).await
}

/// Starts the relay server with a pre-configured [`RelayState`].
///
/// The WebSocket endpoint is served at both `/` and `/ws`.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<RelayState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = axum::Router::new()
        .route("/", axum::routing::get(ws_handler))
        .route("/ws", axum::routing::get(ws_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "relay server error");
        }
    });

    Ok((bound_addr, handle))
}

/// axum handler that upgrades an HTTP request to a WebSocket connection.
async fn ws_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<Arc<RelayState>>,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}
