#![forbid(unsafe_code)]

//! Tessera - interactive end-to-end encrypted chat over a relay.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tessera_client::command::HELP;
use tessera_client::{
    AuthorityClient, Command, Outcome, Peer, PeerConfig, PeerEvent, RelayConnection, RelaySender,
    ReplayScope, SecurityMode,
};
use tessera_common::{init_tracing_with_default, is_valid_peer_id, ClientFrame};
use tessera_crypto::{Identity, ReplayConfig};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    /// Encrypted messages only
    Encrypted,
    /// Encrypted messages with replay protection
    Replay,
    /// Replay protection plus authority-issued certificates
    Certified,
}

impl From<ModeArg> for SecurityMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Encrypted => SecurityMode::Encrypted,
            ModeArg::Replay => SecurityMode::ReplayProtected,
            ModeArg::Certified => SecurityMode::Certified,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ScopeArg {
    Session,
    Global,
}

impl From<ScopeArg> for ReplayScope {
    fn from(scope: ScopeArg) -> Self {
        match scope {
            ScopeArg::Session => ReplayScope::PerSession,
            ScopeArg::Global => ReplayScope::Global,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "tessera")]
#[command(about = "Tessera - end-to-end encrypted chat through an untrusted relay")]
struct Args {
    /// Peer id to register as
    #[arg(long, env = "TESSERA_ID")]
    id: String,

    /// Relay WebSocket URL
    #[arg(long, env = "TESSERA_RELAY_URL", default_value = "ws://127.0.0.1:8080/")]
    relay: String,

    /// Trust authority WebSocket URL (certified mode)
    #[arg(long, env = "TESSERA_AUTHORITY_URL", default_value = "ws://127.0.0.1:8081/")]
    authority: String,

    /// Security mode
    #[arg(long, env = "TESSERA_MODE", value_enum, default_value = "certified")]
    mode: ModeArg,

    /// Replay guard scope
    #[arg(long, env = "TESSERA_REPLAY_SCOPE", value_enum, default_value = "session")]
    replay_scope: ScopeArg,

    /// Replay window in milliseconds
    #[arg(long, env = "TESSERA_REPLAY_WINDOW_MS", default_value_t = tessera_crypto::replay::DEFAULT_WINDOW_MS)]
    replay_window_ms: u64,

    /// Tolerated sender clock lead in milliseconds
    #[arg(long, env = "TESSERA_CLOCK_SKEW_MS", default_value_t = tessera_crypto::replay::DEFAULT_CLOCK_SKEW_MS)]
    clock_skew_ms: u64,

    /// Log level
    #[arg(long, env = "TESSERA_LOG_LEVEL", default_value = "warn")]
    log_level: String,
}

fn render(event: &PeerEvent) {
    match event {
        PeerEvent::UserList(users) => {
            let ids: Vec<&str> = users.iter().map(|u| u.id.as_str()).collect();
            println!("* online: {}", ids.join(", "));
        }
        PeerEvent::SessionEstablished { peer, initiated } => {
            let how = if *initiated { "to" } else { "from" };
            println!("* secure session established {how} {peer}");
        }
        PeerEvent::SessionClosed { peer } => println!("* session with {peer} closed"),
        PeerEvent::Message { from, text } => println!("<{from}> {text}"),
        PeerEvent::Dropped { from, reason } => {
            println!("! dropped message from {from}: {reason}")
        }
        PeerEvent::CertificateVerified { peer } => println!("* certificate for {peer} verified"),
        PeerEvent::CertificateRejected { peer, reason } => {
            println!("! certificate for {peer} rejected: {reason}")
        }
        PeerEvent::RelayError { message } => println!("! relay: {message}"),
    }
}

async fn apply(sender: &mut RelaySender, outcome: Outcome) -> Result<()> {
    for event in &outcome.events {
        render(event);
    }
    for frame in &outcome.frames {
        sender.send(frame).await?;
    }
    Ok(())
}

/// Returns `false` when the user asked to quit.
async fn run_command(peer: &mut Peer, sender: &mut RelaySender, line: &str) -> Result<bool> {
    let command = match Command::parse(line) {
        Ok(command) => command,
        Err(message) => {
            println!("! {message}");
            return Ok(true);
        }
    };

    let outcome = match command {
        Command::Quit => return Ok(false),
        Command::Help => {
            println!("{HELP}");
            return Ok(true);
        }
        Command::List => Ok(Outcome {
            frames: vec![ClientFrame::List],
            events: Vec::new(),
        }),
        Command::Cert(target) => Ok(peer.request_certificate(&target)),
        Command::Connect(target) => peer.connect(&target),
        Command::Msg { to, text } => peer.send_chat(&to, &text),
    };

    match outcome {
        Ok(outcome) => apply(sender, outcome).await?,
        Err(e) => println!("! {e}"),
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing_with_default(&args.log_level);

    if !is_valid_peer_id(&args.id) {
        anyhow::bail!("invalid peer id {:?}", args.id);
    }

    let config = PeerConfig {
        mode: args.mode.into(),
        replay: ReplayConfig {
            window_ms: args.replay_window_ms,
            clock_skew_ms: args.clock_skew_ms,
        },
        replay_scope: args.replay_scope.into(),
    };

    let id = args.id.clone();
    let identity = tokio::task::spawn_blocking(move || Identity::generate(id))
        .await?
        .context("generating identity")?;
    let mut peer = Peer::new(identity, config)?;
    info!(id = %peer.id(), mode = ?peer.mode(), "identity ready");

    if peer.mode().certified() {
        let mut authority = AuthorityClient::connect(&args.authority)
            .await
            .with_context(|| format!("connecting to authority at {}", args.authority))?;
        let root_key = authority.fetch_root_key().await?;
        peer.set_root_key(&root_key)?;
        let certificate = authority.request_certificate(&peer.sign_request()).await?;
        peer.set_certificate(certificate)?;
    }

    let relay = RelayConnection::connect(&args.relay)
        .await
        .with_context(|| format!("connecting to relay at {}", args.relay))?;
    let (mut sender, mut receiver) = relay.into_split();
    sender.send(&peer.register_frame()?).await?;

    println!("* registered as {} ({:?}); /help for commands", peer.id(), peer.mode());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                if !run_command(&mut peer, &mut sender, &line).await? {
                    break;
                }
            }
            frame = receiver.recv() => {
                match frame {
                    Ok(frame) => {
                        let outcome = peer.handle_relay_frame(frame);
                        apply(&mut sender, outcome).await?;
                    }
                    Err(e) if e.is_fatal() => {
                        warn!("relay connection lost: {e}");
                        println!("! relay connection lost");
                        break;
                    }
                    Err(e) => {
                        warn!("ignoring frame from relay: {e}");
                        println!("! relay sent a frame we could not read");
                    }
                }
            }
        }
    }

    let _ = sender.close().await;
    Ok(())
}
