//! Shared types for Tessera: wire protocol, logging, error types.
//!
//! This crate provides common infrastructure used across all Tessera components.

#![forbid(unsafe_code)]

pub mod error;
pub mod helpers;
pub mod protocol;

pub use error::{Error, Result};
pub use helpers::{check_public_bind_allowed, env_bool, is_valid_peer_id};
pub use protocol::*;

/// Initialize tracing. `RUST_LOG` overrides `default_level`.
pub fn init_tracing_with_default(default_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

/// Milliseconds since the Unix epoch, clamped at zero.
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
