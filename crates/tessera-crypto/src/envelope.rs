//! Secure envelope codec: AES-256-GCM under a session key.
//!
//! # Wire Format
//!
//! ```text
//! base64( {"iv": <24 hex>, "encrypted": <hex>, "authTag": <32 hex>} )
//! ```
//!
//! Every call to [`encrypt`] draws a fresh 96-bit IV from the OS CSPRNG.
//! There is no counter: a counter that resets (restart, re-handshake reusing
//! a key) would repeat an IV under the same key.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::handshake::SessionKey;

/// IV length in bytes (96 bits).
pub const IV_LEN: usize = 12;

/// Authentication tag length in bytes (128 bits).
pub const TAG_LEN: usize = 16;

/// Envelope errors.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("encryption failed")]
    Encryption,

    /// Tag mismatch: tampering, wrong key, or corruption. Deliberately carries no detail.
    #[error("authentication failed")]
    Authentication,

    /// The wire form could not be parsed into an envelope.
    #[error("malformed envelope: {0}")]
    Malformed(String),
}

/// An encrypted message: IV, ciphertext, and authentication tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecureEnvelope {
    pub iv: [u8; IV_LEN],
    pub ciphertext: Vec<u8>,
    pub auth_tag: [u8; TAG_LEN],
}

/// The JSON shape of an envelope on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEnvelope {
    pub iv: String,
    pub encrypted: String,
    pub auth_tag: String,
}

impl SecureEnvelope {
    /// Encode as base64 JSON for a `chat.content` field.
    pub fn to_content(&self) -> String {
        let wire = WireEnvelope {
            iv: hex::encode(self.iv),
            encrypted: hex::encode(&self.ciphertext),
            auth_tag: hex::encode(self.auth_tag),
        };
        // Serializing three strings cannot fail.
        let json = serde_json::to_vec(&wire).unwrap_or_default();
        STANDARD.encode(json)
    }

    /// Parse a `chat.content` field.
    pub fn from_content(content: &str) -> Result<Self, EnvelopeError> {
        let json = STANDARD
            .decode(content.trim())
            .map_err(|e| EnvelopeError::Malformed(format!("base64: {e}")))?;
        let wire: WireEnvelope = serde_json::from_slice(&json)
            .map_err(|e| EnvelopeError::Malformed(format!("json: {e}")))?;

        Ok(Self {
            iv: decode_fixed(&wire.iv, "iv")?,
            ciphertext: hex::decode(&wire.encrypted)
                .map_err(|e| EnvelopeError::Malformed(format!("encrypted: {e}")))?,
            auth_tag: decode_fixed(&wire.auth_tag, "authTag")?,
        })
    }
}

fn decode_fixed<const N: usize>(field: &str, name: &str) -> Result<[u8; N], EnvelopeError> {
    let bytes =
        hex::decode(field).map_err(|e| EnvelopeError::Malformed(format!("{name}: {e}")))?;
    bytes.try_into().map_err(|bytes: Vec<u8>| {
        EnvelopeError::Malformed(format!("{name}: expected {N} bytes, got {}", bytes.len()))
    })
}

fn cipher(key: &SessionKey) -> Aes256Gcm {
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()))
}

/// Encrypt `plaintext` under `key` with a fresh random IV.
pub fn encrypt(plaintext: &[u8], key: &SessionKey) -> Result<SecureEnvelope, EnvelopeError> {
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let mut sealed = cipher(key)
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|_| EnvelopeError::Encryption)?;

    // aes-gcm appends the tag to the ciphertext.
    let split = sealed
        .len()
        .checked_sub(TAG_LEN)
        .ok_or(EnvelopeError::Encryption)?;
    let auth_tag: [u8; TAG_LEN] = sealed[split..]
        .try_into()
        .map_err(|_| EnvelopeError::Encryption)?;
    sealed.truncate(split);

    Ok(SecureEnvelope {
        iv,
        ciphertext: sealed,
        auth_tag,
    })
}

/// Decrypt and authenticate `envelope` under `key`.
///
/// Any failure is [`EnvelopeError::Authentication`]; the caller drops the
/// message and must not retry with a different key.
pub fn decrypt(envelope: &SecureEnvelope, key: &SessionKey) -> Result<Vec<u8>, EnvelopeError> {
    let mut sealed = Vec::with_capacity(envelope.ciphertext.len() + TAG_LEN);
    sealed.extend_from_slice(&envelope.ciphertext);
    sealed.extend_from_slice(&envelope.auth_tag);

    cipher(key)
        .decrypt(Nonce::from_slice(&envelope.iv), sealed.as_slice())
        .map_err(|_| EnvelopeError::Authentication)
}
