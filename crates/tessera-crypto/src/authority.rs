//! Minimal certificate authority and certificate verification.
//!
//! One [`TrustAuthority`] holds one root keypair for its whole lifetime and
//! issues [`Certificate`]s binding `(userId, publicKey)` under that root.
//! There is no chain, no expiry, and no revocation.
//!
//! The authority performs no identity proofing: whoever asks receives a
//! certificate for the id string they supply. Certificates prove only that
//! the authority saw that binding, not that the requester owns the name.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rsa::RsaPublicKey;
use tessera_common::Certificate;
use thiserror::Error;
use tracing::{debug, info};

use crate::identity::{
    parse_public_key_pem, verify_signature, Identity, IdentityError, DEFAULT_KEY_BITS,
};

/// Issuer name stamped on certificates unless configured otherwise.
pub const DEFAULT_ISSUER: &str = "Tessera Trust Authority";

/// Certificate errors.
#[derive(Debug, Error)]
pub enum CertificateError {
    /// Signature does not verify under the root key, or the certificate is malformed.
    #[error("certificate invalid")]
    Invalid,

    /// Certificate is valid but names someone else.
    #[error("certificate subject mismatch: expected {expected}, got {actual}")]
    SubjectMismatch { expected: String, actual: String },

    #[error("cannot certify key: {0}")]
    UnusableKey(#[from] IdentityError),
}

/// Trust authority configuration.
#[derive(Debug, Clone)]
pub struct AuthorityConfig {
    pub issuer: String,
    pub key_bits: usize,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            issuer: DEFAULT_ISSUER.to_string(),
            key_bits: DEFAULT_KEY_BITS,
        }
    }
}

/// A running certificate authority with a single root keypair.
#[derive(Debug)]
pub struct TrustAuthority {
    root: Identity,
    root_pem: String,
}

impl TrustAuthority {
    /// Generate the root keypair and bring the authority up.
    pub fn start(config: AuthorityConfig) -> Result<Self, IdentityError> {
        let root = Identity::generate_with_bits(config.issuer, config.key_bits)?;
        Self::from_root(root)
    }

    /// Bring the authority up around an existing root identity; its id is the issuer name.
    pub fn from_root(root: Identity) -> Result<Self, IdentityError> {
        let root_pem = root.public_key_pem()?;
        info!(issuer = root.id(), bits = root.key_bits(), "trust authority started");
        Ok(Self { root, root_pem })
    }

    pub fn issuer(&self) -> &str {
        self.root.id()
    }

    /// The standing root key. Stable for the authority's lifetime.
    pub fn root_public_key(&self) -> &RsaPublicKey {
        self.root.public_key()
    }

    pub fn root_public_key_pem(&self) -> &str {
        &self.root_pem
    }

    /// Sign `user_id || user_public_key_pem` and return the certificate.
    ///
    /// The PEM must parse as a public key; it is signed byte-for-byte as given.
    /// No proof of possession is asked for: any caller may certify any key
    /// under any id.
    pub fn issue(
        &self,
        user_id: &str,
        user_public_key_pem: &str,
    ) -> Result<Certificate, CertificateError> {
        parse_public_key_pem(user_public_key_pem)?;

        let signature = self.root.sign(&signed_content(user_id, user_public_key_pem));
        info!(user_id, issuer = self.issuer(), "certificate issued");

        Ok(Certificate {
            user_id: user_id.to_string(),
            public_key: user_public_key_pem.to_string(),
            issuer: self.issuer().to_string(),
            signature: STANDARD.encode(signature),
        })
    }

    /// Take the authority down. The root private key is dropped with it.
    pub fn shutdown(self) {
        info!(issuer = self.issuer(), "trust authority shut down");
    }
}

/// The bytes a certificate signature covers.
pub fn signed_content(user_id: &str, public_key_pem: &str) -> Vec<u8> {
    let mut content = Vec::with_capacity(user_id.len() + public_key_pem.len());
    content.extend_from_slice(user_id.as_bytes());
    content.extend_from_slice(public_key_pem.as_bytes());
    content
}

/// Check that `cert` was signed by `root`. Never errors: anything malformed is `false`.
///
/// A `false` result means the certificate's key must not be trusted.
pub fn verify_certificate(cert: &Certificate, root: &RsaPublicKey) -> bool {
    let Ok(signature) = STANDARD.decode(cert.signature.trim()) else {
        debug!(user_id = %cert.user_id, "certificate signature is not base64");
        return false;
    };
    verify_signature(
        root,
        &signed_content(&cert.user_id, &cert.public_key),
        &signature,
    )
}

/// Verify `cert` for `expected_user_id` and return the public key it vouches for.
pub fn trusted_key(
    cert: &Certificate,
    expected_user_id: &str,
    root: &RsaPublicKey,
) -> Result<RsaPublicKey, CertificateError> {
    if !verify_certificate(cert, root) {
        return Err(CertificateError::Invalid);
    }
    if cert.user_id != expected_user_id {
        return Err(CertificateError::SubjectMismatch {
            expected: expected_user_id.to_string(),
            actual: cert.user_id.clone(),
        });
    }
    parse_public_key_pem(&cert.public_key).map_err(|_| CertificateError::Invalid)
}
