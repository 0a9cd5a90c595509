//! Tessera relay.
//!
//! The relay is untrusted: it routes `direct`
//! frames by recipient id and publishes who is online, but never sees a
//! session key and never inspects payloads.

#![forbid(unsafe_code)]

pub mod directory;
pub mod server;

pub use directory::{Credential, Directory, DirectoryError};
pub use server::{router, serve, serve_with_shutdown, RelayConfig, RelayState};
