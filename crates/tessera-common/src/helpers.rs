//! Small helpers shared by the Tessera binaries and services.

use std::net::SocketAddr;

use crate::error::{Error, Result};

/// Longest accepted peer id, in bytes.
pub const MAX_PEER_ID_LEN: usize = 64;

/// Peer ids are 1-64 characters of ASCII alphanumerics, `_`, `-` or `.`.
pub fn is_valid_peer_id(id: &str) -> bool {
    let len = id.len();
    if !(1..=MAX_PEER_ID_LEN).contains(&len) {
        return false;
    }
    id.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}

/// Read a boolean flag from the environment (`1`, `true`, `yes`, `on`).
pub fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

/// Refuse non-loopback listeners unless `TESSERA_ALLOW_PUBLIC_BIND=1`.
pub fn check_public_bind_allowed(addr: SocketAddr) -> Result<()> {
    if addr.ip().is_loopback() {
        return Ok(());
    }
    if env_bool("TESSERA_ALLOW_PUBLIC_BIND", false) {
        return Ok(());
    }
    Err(Error::config(format!(
        "refusing non-loopback bind to {addr} without TESSERA_ALLOW_PUBLIC_BIND=1"
    )))
}
