//! Session key wrap and unwrap.
//!
//! Asymmetric operations are too slow to pay per message, so a session pays
//! for exactly one: the initiator draws a random 256-bit [`SessionKey`] and
//! wraps it with the responder's trusted public key (RSA-OAEP, SHA-256 digest
//! and MGF1). Every message after that costs one AES-GCM operation.
//!
//! ```text
//! Initiator                                   Responder
//!     |  offer(pub(B)) -> (K, wrap(K))            |
//!     |  key_exchange{encryptedKey: wrap(K)}      |
//!     |------------------------------------------>|
//!     |                                           |  accept(wrap(K), priv(B)) -> K
//!     [       both sides hold K, no reply         ]
//! ```

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Session key length in bytes (AES-256).
pub const SESSION_KEY_LEN: usize = 32;

/// Handshake errors.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("key wrap failed: {0}")]
    KeyWrap(String),

    /// The wrapped key could not be recovered: wrong private key, corrupted
    /// or truncated ciphertext, or a payload of the wrong size.
    #[error("key unwrap failed")]
    KeyUnwrap,
}

/// A 256-bit symmetric session key. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; SESSION_KEY_LEN]);

impl SessionKey {
    /// Draw a fresh key from the OS CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; SESSION_KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; SESSION_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Generate a fresh session key and wrap it for `remote`.
///
/// `remote` must already be trusted (directory or verified certificate).
pub fn offer(remote: &RsaPublicKey) -> Result<(SessionKey, Vec<u8>), HandshakeError> {
    let key = SessionKey::generate();
    let wrapped = wrap(&key, remote)?;
    Ok((key, wrapped))
}

/// Wrap an existing session key for `remote`.
pub fn wrap(key: &SessionKey, remote: &RsaPublicKey) -> Result<Vec<u8>, HandshakeError> {
    remote
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), key.as_bytes())
        .map_err(|e| HandshakeError::KeyWrap(e.to_string()))
}

/// Recover the session key from `wrapped` with our own private key.
pub fn accept(wrapped: &[u8], own: &RsaPrivateKey) -> Result<SessionKey, HandshakeError> {
    let mut plain = own
        .decrypt(Oaep::new::<Sha256>(), wrapped)
        .map_err(|_| HandshakeError::KeyUnwrap)?;

    let result = <[u8; SESSION_KEY_LEN]>::try_from(plain.as_slice())
        .map(SessionKey::from_bytes)
        .map_err(|_| HandshakeError::KeyUnwrap);
    plain.zeroize();
    result
}

/// Encode wrapped key bytes for the `encryptedKey` field.
pub fn encode_wrapped_key(wrapped: &[u8]) -> String {
    STANDARD.encode(wrapped)
}

/// Decode the `encryptedKey` field. Bad encoding is an unwrap failure.
pub fn decode_wrapped_key(encoded: &str) -> Result<Vec<u8>, HandshakeError> {
    STANDARD
        .decode(encoded.trim())
        .map_err(|_| HandshakeError::KeyUnwrap)
}
