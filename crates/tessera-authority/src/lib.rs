//! Tessera trust authority service.
//!
//! Hosts one [`TrustAuthority`](tessera_crypto::TrustAuthority) and answers
//! `get_root_key` and `sign_request` over WebSocket. The authority performs
//! no identity proofing.

#![forbid(unsafe_code)]

pub mod server;
pub mod service;

pub use server::{router, serve, serve_with_shutdown};
pub use service::{handle_request, handle_text};
