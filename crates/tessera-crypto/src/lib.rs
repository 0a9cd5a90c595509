//! Cryptographic core for Tessera.
//!
//! This crate provides:
//! - RSA-2048 identities with SPKI PEM public keys
//! - A single-root trust authority and certificate verification
//! - One-shot session establishment by RSA-OAEP key wrap
//! - AES-256-GCM message envelopes
//! - Time-windowed replay protection
//!
//! # Design
//!
//! Hybrid encryption: one asymmetric operation per session wraps a random
//! 256-bit key, then every message is a single AEAD operation under it.
//! Everything here is synchronous and transport-free; the relay, authority
//! server, and client drive it from their own I/O loops.

#![forbid(unsafe_code)]

pub mod authority;
pub mod envelope;
pub mod handshake;
pub mod identity;
pub mod replay;
pub mod session;

pub use authority::{
    trusted_key, verify_certificate, AuthorityConfig, CertificateError, TrustAuthority,
};
pub use envelope::{decrypt, encrypt, EnvelopeError, SecureEnvelope};
pub use handshake::{accept, offer, HandshakeError, SessionKey};
pub use identity::{parse_public_key_pem, Identity, IdentityError};
pub use replay::{ReplayConfig, ReplayError, ReplayGuard};
pub use session::{HandshakeState, SessionError, SessionNegotiator, SessionTable};

// Re-exported so callers can name key types without depending on `rsa`.
pub use rsa::{RsaPrivateKey, RsaPublicKey};
