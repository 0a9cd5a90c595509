#![forbid(unsafe_code)]

//! Tessera Authority - a single-root certificate authority for peer ids.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tessera_common::{check_public_bind_allowed, init_tracing_with_default};
use tessera_authority::serve_with_shutdown;
use tessera_crypto::authority::DEFAULT_ISSUER;
use tessera_crypto::identity::DEFAULT_KEY_BITS;
use tessera_crypto::{AuthorityConfig, TrustAuthority};
use tokio::net::TcpListener;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "tessera-authority")]
#[command(about = "Tessera trust authority - issues certificates binding peer ids to public keys")]
struct Args {
    /// WebSocket listen address
    #[arg(long, env = "TESSERA_AUTHORITY_LISTEN", default_value = "127.0.0.1:8081")]
    listen: SocketAddr,

    /// Issuer name stamped on certificates
    #[arg(long, env = "TESSERA_AUTHORITY_ISSUER", default_value = DEFAULT_ISSUER)]
    issuer: String,

    /// Root key size in bits
    #[arg(long, env = "TESSERA_AUTHORITY_KEY_BITS", default_value_t = DEFAULT_KEY_BITS)]
    key_bits: usize,

    /// Log level
    #[arg(long, env = "TESSERA_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing_with_default(&args.log_level);

    check_public_bind_allowed(args.listen)?;

    let config = AuthorityConfig {
        issuer: args.issuer,
        key_bits: args.key_bits,
    };
    info!("generating {}-bit root key", config.key_bits);
    let authority = tokio::task::spawn_blocking(move || TrustAuthority::start(config))
        .await
        .context("root key generation task failed")??;
    let authority = Arc::new(authority);

    let listener = TcpListener::bind(args.listen).await?;
    info!("authority listening on ws://{}", listener.local_addr()?);

    serve_with_shutdown(listener, authority.clone(), async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown requested");
    })
    .await?;

    match Arc::try_unwrap(authority) {
        Ok(authority) => authority.shutdown(),
        Err(_) => info!("authority stopped with connections still draining"),
    }
    Ok(())
}
