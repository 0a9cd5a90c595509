//! Wire protocol shared by peers, the relay, and the trust authority.
//!
//! Every frame is a JSON object tagged by `"type"`. Tags are snake_case and
//! fields camelCase. The relay treats `direct.payload` as opaque JSON; only
//! peers decode it into a [`DirectPayload`].

use rand::rngs::OsRng;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Length in bytes of the random nonce carried by a [`SecurePacket`].
pub const PACKET_NONCE_LEN: usize = 16;

/// A certificate binding a user id to a public key under the authority's signature.
///
/// `public_key` is an SPKI PEM string and `signature` is base64. The signed
/// content is `user_id || public_key` (UTF-8 bytes, no separator).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Certificate {
    pub user_id: String,
    pub public_key: String,
    pub issuer: String,
    pub signature: String,
}

/// One entry of the relay's online list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub has_cert: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Frames a peer sends to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    /// Announce an identity backed by a bare public key.
    Register { id: String, public_key: String },

    /// Announce an identity backed by a certificate; the id is `certificate.user_id`.
    RegisterWithCert { certificate: Certificate },

    /// Ask for the current online list.
    List,

    /// Ask for the certificate a peer registered with.
    GetCert { target_id: String },

    /// Forward `payload` to `target_id` untouched.
    Direct { target_id: String, payload: Value },
}

/// Frames the relay sends to a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum RelayFrame {
    /// Who is online. Broadcast on every registration change and sent in reply to `list`.
    UserList { users: Vec<UserSummary> },

    /// The certificate `target_id` registered with.
    CertResponse {
        target_id: String,
        certificate: Certificate,
    },

    /// A payload forwarded from `sender_id`.
    Direct { sender_id: String, payload: Value },

    /// Relay-originated failure notice.
    ///
    /// `target_id` is set when the failure means that peer is not online.
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_id: Option<String>,
    },
}

impl RelayFrame {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            target_id: None,
        }
    }

    /// An error saying `target_id` is not online.
    pub fn unknown_target(target_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            target_id: Some(target_id.into()),
        }
    }
}

/// Payload of a `direct` frame as seen by the two peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum DirectPayload {
    /// Session key wrapped with the recipient's public key (RSA-OAEP, base64).
    KeyExchange { encrypted_key: String },

    /// Base64 JSON secure envelope.
    Chat { content: String },
}

/// Requests a client sends to the trust authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum AuthorityRequest {
    GetRootKey,
    SignRequest {
        user_id: String,
        user_public_key: String,
    },
}

/// Responses from the trust authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum AuthorityResponse {
    /// The root public key as SPKI PEM.
    RootKey { key: String },
    CertificateIssued { payload: Certificate },
    Error { message: String },
}

/// Plaintext protected inside an envelope when replay defense is active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurePacket {
    /// Milliseconds since the Unix epoch at creation.
    pub timestamp: u64,
    /// 128-bit random value, lowercase hex.
    pub nonce: String,
    pub payload: Value,
}

impl SecurePacket {
    /// Wrap `payload` with the current time and a fresh random nonce.
    pub fn new(payload: Value) -> Self {
        Self::with_timestamp(payload, crate::now_millis())
    }

    /// Wrap `payload` with an explicit timestamp and a fresh random nonce.
    pub fn with_timestamp(payload: Value, timestamp: u64) -> Self {
        let mut nonce = [0u8; PACKET_NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        Self {
            timestamp,
            nonce: hex::encode(nonce),
            payload,
        }
    }
}

/// Decode one text frame of any protocol type.
pub fn decode_frame<T: DeserializeOwned>(text: &str) -> Result<T> {
    serde_json::from_str(text).map_err(Error::invalid_frame)
}

/// Encode one protocol frame as text.
pub fn encode_frame<T: Serialize>(frame: &T) -> Result<String> {
    serde_json::to_string(frame).map_err(Error::encoding)
}
