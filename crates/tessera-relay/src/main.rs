#![forbid(unsafe_code)]

//! Tessera Relay - routes opaque frames between registered peers.

use std::net::SocketAddr;

use anyhow::Result;
use clap::Parser;
use tessera_common::{check_public_bind_allowed, init_tracing_with_default};
use tessera_relay::server::{WS_MAX_MESSAGES_PER_MINUTE, WS_MAX_TEXT_BYTES, WS_OUTBOX_CAPACITY};
use tessera_relay::{serve_with_shutdown, RelayConfig};
use tokio::net::TcpListener;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "tessera-relay")]
#[command(about = "Tessera relay - forwards opaque frames between peers over WebSocket")]
struct Args {
    /// WebSocket listen address
    #[arg(long, env = "TESSERA_RELAY_LISTEN", default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Largest accepted frame in bytes
    #[arg(long, env = "TESSERA_RELAY_MAX_MESSAGE_BYTES", default_value_t = WS_MAX_TEXT_BYTES)]
    max_message_bytes: usize,

    /// Frames queued per connection before deliveries to it fail
    #[arg(long, env = "TESSERA_RELAY_OUTBOX_CAPACITY", default_value_t = WS_OUTBOX_CAPACITY)]
    outbox_capacity: usize,

    /// Frames a connection may send per minute before it is dropped
    #[arg(long, env = "TESSERA_RELAY_RATE_LIMIT", default_value_t = WS_MAX_MESSAGES_PER_MINUTE)]
    max_messages_per_minute: u32,

    /// Log level
    #[arg(long, env = "TESSERA_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing_with_default(&args.log_level);

    check_public_bind_allowed(args.listen)?;

    let listener = TcpListener::bind(args.listen).await?;
    info!("relay listening on ws://{}", listener.local_addr()?);

    let config = RelayConfig {
        max_message_bytes: args.max_message_bytes,
        outbox_capacity: args.outbox_capacity.max(1),
        max_messages_per_minute: args.max_messages_per_minute,
    };

    serve_with_shutdown(listener, config, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown requested");
    })
    .await?;

    info!("relay stopped");
    Ok(())
}
