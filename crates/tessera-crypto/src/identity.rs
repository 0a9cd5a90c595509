//! RSA identity keypairs.
//!
//! An [`Identity`] is created once at process startup and never changes. The
//! public half travels as an SPKI PEM string; the private half never leaves
//! the owning process and is never serialized.
//!
//! The same keypair serves both purposes the protocol needs: peers use it to
//! unwrap session keys (RSA-OAEP), the trust authority uses it to sign
//! certificates (PKCS#1 v1.5, SHA-256).
//!
//! # Example
//!
//! ```
//! use tessera_crypto::identity::{parse_public_key_pem, Identity};
//!
//! let identity = Identity::generate("alice").unwrap();
//! let pem = identity.public_key_pem().unwrap();
//! assert_eq!(&parse_public_key_pem(&pem).unwrap(), identity.public_key());
//! ```

use std::fmt;

use rand::rngs::OsRng;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use thiserror::Error;

/// Default modulus size for generated keypairs.
pub const DEFAULT_KEY_BITS: usize = 2048;

/// Smallest modulus size accepted for generated keypairs.
pub const MIN_KEY_BITS: usize = 2048;

/// Identity errors.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// Key generation failed. Fatal: a process cannot run without an identity.
    #[error("identity generation failed: {0}")]
    Generation(String),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("public key encoding failed: {0}")]
    Encoding(String),
}

/// A peer's identity: an id string plus an RSA keypair.
pub struct Identity {
    id: String,
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
}

impl Identity {
    /// Generate a new identity with a [`DEFAULT_KEY_BITS`] keypair from the OS CSPRNG.
    pub fn generate(id: impl Into<String>) -> Result<Self, IdentityError> {
        Self::generate_with_bits(id, DEFAULT_KEY_BITS)
    }

    /// Generate a new identity with a keypair of `bits` bits.
    pub fn generate_with_bits(id: impl Into<String>, bits: usize) -> Result<Self, IdentityError> {
        if bits < MIN_KEY_BITS {
            return Err(IdentityError::Generation(format!(
                "key size {bits} is below the {MIN_KEY_BITS}-bit minimum"
            )));
        }

        let private_key = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| IdentityError::Generation(e.to_string()))?;
        let public_key = private_key.to_public_key();

        Ok(Self {
            id: id.into(),
            private_key,
            public_key,
        })
    }

    /// Wrap an existing private key, e.g. one loaded from storage.
    pub fn from_private_key(id: impl Into<String>, private_key: RsaPrivateKey) -> Self {
        let public_key = private_key.to_public_key();
        Self {
            id: id.into(),
            private_key,
            public_key,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }

    /// The private key, for unwrapping session keys in this process.
    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private_key
    }

    /// Modulus size in bits.
    pub fn key_bits(&self) -> usize {
        self.public_key.size() * 8
    }

    /// The public key as an SPKI PEM string, ready for transmission.
    pub fn public_key_pem(&self) -> Result<String, IdentityError> {
        encode_public_key_pem(&self.public_key)
    }

    /// Sign `message` with RSASSA-PKCS1-v1_5 over SHA-256.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        let signing_key = SigningKey::<Sha256>::new(self.private_key.clone());
        signing_key.sign(message).to_vec()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("id", &self.id)
            .field("bits", &self.key_bits())
            .finish_non_exhaustive()
    }
}

/// Encode a public key as SPKI PEM with LF line endings.
pub fn encode_public_key_pem(key: &RsaPublicKey) -> Result<String, IdentityError> {
    key.to_public_key_pem(LineEnding::LF)
        .map_err(|e| IdentityError::Encoding(e.to_string()))
}

/// Parse an SPKI PEM public key.
pub fn parse_public_key_pem(pem: &str) -> Result<RsaPublicKey, IdentityError> {
    RsaPublicKey::from_public_key_pem(pem.trim())
        .map_err(|e| IdentityError::InvalidPublicKey(e.to_string()))
}

/// Verify a PKCS#1 v1.5 / SHA-256 signature. Malformed signatures verify as false.
pub fn verify_signature(key: &RsaPublicKey, message: &[u8], signature: &[u8]) -> bool {
    let Ok(signature) = Signature::try_from(signature) else {
        return false;
    };
    VerifyingKey::<Sha256>::new(key.clone())
        .verify(message, &signature)
        .is_ok()
}
