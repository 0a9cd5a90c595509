//! WebSocket front of the relay.
//!
//! Each connection gets a bounded outbox drained by its own writer task, so a
//! slow peer can only ever fill its own queue. Frames are dispatched by an
//! exhaustive match over [`ClientFrame`]; anything that fails to parse is
//! answered with `error` and the connection stays open.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tessera_common::{decode_frame, encode_frame, ClientFrame, RelayFrame};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::directory::{ConnectionId, Credential, Directory, Outbox};

pub const WS_OUTBOX_CAPACITY: usize = 128;
pub const WS_MAX_TEXT_BYTES: usize = 64 * 1024;
pub const WS_MAX_MESSAGES_PER_MINUTE: u32 = 600;

/// Relay limits.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub max_message_bytes: usize,
    pub outbox_capacity: usize,
    pub max_messages_per_minute: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: WS_MAX_TEXT_BYTES,
            outbox_capacity: WS_OUTBOX_CAPACITY,
            max_messages_per_minute: WS_MAX_MESSAGES_PER_MINUTE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayState {
    directory: Directory,
    config: RelayConfig,
    next_connection: Arc<AtomicU64>,
}

impl RelayState {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            directory: Directory::new(),
            config,
            next_connection: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }
}

pub fn router(state: RelayState) -> Router {
    Router::new().route("/", get(ws_handler)).with_state(state)
}

/// Serve the relay on `listener` until the process exits.
pub async fn serve(listener: TcpListener, config: RelayConfig) -> std::io::Result<()> {
    serve_with_shutdown(listener, config, std::future::pending()).await
}

/// Serve the relay on `listener` until `shutdown` resolves.
pub async fn serve_with_shutdown<F>(
    listener: TcpListener,
    config: RelayConfig,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(RelayState::new(config));
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<RelayState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    let limit = state.config.max_message_bytes;
    ws.max_message_size(limit)
        .max_frame_size(limit)
        .on_upgrade(move |socket| handle_socket(socket, state, addr))
}

fn error_frame(message: impl Into<String>) -> RelayFrame {
    RelayFrame::error(message)
}

async fn reply(tx: &Outbox, frame: RelayFrame) -> bool {
    tx.send(frame).await.is_ok()
}

async fn handle_socket(stream: WebSocket, state: RelayState, addr: SocketAddr) {
    let connection = state.next_connection.fetch_add(1, Ordering::Relaxed);
    info!("peer connecting from {} as connection {}", addr, connection);

    let (mut sender, mut receiver) = stream.split();
    let (tx, mut rx) = mpsc::channel::<RelayFrame>(state.config.outbox_capacity);
    let (disconnect_tx, mut disconnect_rx) = mpsc::channel::<()>(1);

    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let json = match encode_frame(&frame) {
                Ok(json) => json,
                Err(err) => {
                    warn!("failed to encode relay frame: {}", err);
                    continue;
                }
            };
            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
        let _ = disconnect_tx.try_send(());
    });

    let mut registered: Option<String> = None;
    let mut window_start = Instant::now();
    let mut message_count: u32 = 0;

    loop {
        tokio::select! {
            _ = disconnect_rx.recv() => {
                break;
            }
            msg = receiver.next() => {
                let Some(msg) = msg else { break; };
                let Ok(msg) = msg else { break; };

                let now = Instant::now();
                if now.duration_since(window_start) >= Duration::from_secs(60) {
                    window_start = now;
                    message_count = 0;
                }
                message_count = message_count.saturating_add(1);
                if message_count > state.config.max_messages_per_minute {
                    let _ = reply(&tx, error_frame("Rate limit exceeded")).await;
                    break;
                }

                let text = match msg {
                    Message::Text(text) => text,
                    Message::Binary(_) => {
                        let _ = reply(&tx, error_frame("Binary messages are not supported")).await;
                        break;
                    }
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => continue,
                };

                if text.len() > state.config.max_message_bytes {
                    let _ = reply(&tx, error_frame("Message too large")).await;
                    break;
                }

                let frame: ClientFrame = match decode_frame(&text) {
                    Ok(frame) => frame,
                    Err(err) => {
                        debug!("rejected frame from {}: {}", addr, err);
                        let _ = reply(&tx, error_frame(err.to_string())).await;
                        continue;
                    }
                };

                handle_frame(&state, connection, &tx, &mut registered, frame).await;
            }
        }
    }

    if let Some(id) = registered {
        if state.directory.unregister(&id, connection).await {
            info!("{} went offline", id);
            state.directory.broadcast_user_list().await;
        }
    }
    info!("connection {} from {} closed", connection, addr);
}

async fn handle_frame(
    state: &RelayState,
    connection: ConnectionId,
    tx: &Outbox,
    registered: &mut Option<String>,
    frame: ClientFrame,
) {
    match frame {
        ClientFrame::Register { id, public_key } => {
            register(
                state,
                connection,
                tx,
                registered,
                id,
                Credential::PublicKey(public_key),
            )
            .await;
        }
        ClientFrame::RegisterWithCert { certificate } => {
            let id = certificate.user_id.clone();
            register(
                state,
                connection,
                tx,
                registered,
                id,
                Credential::Certificate(certificate),
            )
            .await;
        }
        ClientFrame::List => {
            let users = state.directory.snapshot().await;
            let _ = reply(tx, RelayFrame::UserList { users }).await;
        }
        ClientFrame::GetCert { target_id } => {
            let frame = match state.directory.certificate_of(&target_id).await {
                Some(certificate) => RelayFrame::CertResponse {
                    target_id,
                    certificate,
                },
                None => {
                    let message = format!("No certificate for {target_id}");
                    RelayFrame::unknown_target(target_id, message)
                }
            };
            let _ = reply(tx, frame).await;
        }
        ClientFrame::Direct { target_id, payload } => {
            let sender_id = match registered.as_deref() {
                Some(id) if state.directory.owns(id, connection).await => id.to_string(),
                _ => {
                    let _ = reply(tx, error_frame("Register before sending")).await;
                    return;
                }
            };

            let Some(target) = state.directory.sender_for(&target_id).await else {
                debug!("target user not connected: {}", target_id);
                let message = format!("User {target_id} not found");
                let _ = reply(tx, RelayFrame::unknown_target(target_id, message)).await;
                return;
            };

            if target
                .try_send(RelayFrame::Direct { sender_id, payload })
                .is_err()
            {
                warn!("failed to queue direct frame for {}", target_id);
                let _ = reply(tx, error_frame(format!("Could not deliver to {target_id}"))).await;
            }
        }
    }
}

async fn register(
    state: &RelayState,
    connection: ConnectionId,
    tx: &Outbox,
    registered: &mut Option<String>,
    id: String,
    credential: Credential,
) {
    let kind = match credential {
        Credential::PublicKey(_) => "public key",
        Credential::Certificate(_) => "certificate",
    };

    let mut dropped_previous = false;
    if let Some(previous) = registered.as_deref() {
        if previous != id {
            dropped_previous = state.directory.unregister(previous, connection).await;
        }
    }

    match state
        .directory
        .register(&id, connection, credential, tx.clone())
        .await
    {
        Ok(replaced) => {
            if let Some(previous) = replaced {
                let _ = previous.try_send(error_frame("Session replaced by a newer connection"));
            }
            info!("{} registered with {}", id, kind);
            *registered = Some(id);
            state.directory.broadcast_user_list().await;
        }
        Err(err) => {
            *registered = None;
            let _ = reply(tx, error_frame(err.to_string())).await;
            if dropped_previous {
                state.directory.broadcast_user_list().await;
            }
        }
    }
}
