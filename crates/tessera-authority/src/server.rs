//! WebSocket host for a [`TrustAuthority`].

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tessera_common::{encode_frame, AuthorityResponse};
use tessera_crypto::TrustAuthority;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::service::handle_text;

const WS_MAX_TEXT_BYTES: usize = 16 * 1024;

pub fn router(authority: Arc<TrustAuthority>) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .with_state(authority)
}

pub async fn serve(listener: TcpListener, authority: Arc<TrustAuthority>) -> std::io::Result<()> {
    serve_with_shutdown(listener, authority, std::future::pending()).await
}

pub async fn serve_with_shutdown<F>(
    listener: TcpListener,
    authority: Arc<TrustAuthority>,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(
        listener,
        router(authority).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(authority): State<Arc<TrustAuthority>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    ws.max_message_size(WS_MAX_TEXT_BYTES)
        .max_frame_size(WS_MAX_TEXT_BYTES)
        .on_upgrade(move |socket| handle_socket(socket, authority, addr))
}

async fn handle_socket(stream: WebSocket, authority: Arc<TrustAuthority>, addr: SocketAddr) {
    info!("authority client connected from {}", addr);
    let (mut sender, mut receiver) = stream.split();

    while let Some(Ok(msg)) = receiver.next().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            Message::Binary(_) | Message::Ping(_) | Message::Pong(_) => continue,
        };

        // Signing is CPU-bound; keep it off the reactor.
        let authority = authority.clone();
        let response = tokio::task::spawn_blocking(move || handle_text(&authority, &text))
            .await
            .unwrap_or_else(|err| AuthorityResponse::Error {
                message: format!("internal error: {err}"),
            });

        let json = match encode_frame(&response) {
            Ok(json) => json,
            Err(err) => {
                warn!("failed to encode authority response: {}", err);
                continue;
            }
        };
        if sender.send(Message::Text(json)).await.is_err() {
            break;
        }
    }

    info!("authority client {} disconnected", addr);
}
