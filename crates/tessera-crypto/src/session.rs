//! Per-pair session state.
//!
//! Each ordered pair `(local, remote)` owns one [`SessionNegotiator`]:
//!
//! ```text
//!            begin_offer                 confirm_sent
//!   Idle ------------------> Offered -------------------> Established
//!    ^                          |                              |
//!    |        abort_offer       |   teardown / new key_exchange|
//!    +--------------------------+------------------------------+
//!
//!   Idle --receive_key_exchange (unwrap ok)--> Established
//! ```
//!
//! A new `key_exchange` always drops the current key before unwrapping, so a
//! failed unwrap leaves the pair Idle rather than on a stale key.
//!
//! [`SessionTable`] holds one negotiator per remote peer behind its own
//! mutex. Frames for different peers never contend; frames for the same peer
//! are serialized, so a chat can never be decrypted under a half-replaced key.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use rsa::{RsaPrivateKey, RsaPublicKey};
use tessera_common::SecurePacket;
use thiserror::Error;
use tracing::debug;

use crate::envelope::{decrypt, encrypt, EnvelopeError, SecureEnvelope};
use crate::handshake::{
    accept, decode_wrapped_key, encode_wrapped_key, offer, HandshakeError, SessionKey,
};
use crate::replay::{ReplayConfig, ReplayError, ReplayGuard};

/// Session errors.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no session established with {0}")]
    NotEstablished(String),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error("replay rejected: {0}")]
    Replay(#[from] ReplayError),

    /// Decrypted plaintext is not a secure packet.
    #[error("malformed packet: {0}")]
    MalformedPacket(String),
}

/// Handshake state of one pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    Offered,
    Established,
}

/// Handshake state machine and key holder for one remote peer.
#[derive(Debug)]
pub struct SessionNegotiator {
    remote_id: String,
    state: HandshakeState,
    pending: Option<SessionKey>,
    key: Option<Arc<SessionKey>>,
    replay_config: Option<ReplayConfig>,
    replay: Option<ReplayGuard>,
}

impl SessionNegotiator {
    /// `replay_config` enables a replay guard that lives and dies with each session.
    pub fn new(remote_id: impl Into<String>, replay_config: Option<ReplayConfig>) -> Self {
        Self {
            remote_id: remote_id.into(),
            state: HandshakeState::Idle,
            pending: None,
            key: None,
            replay_config,
            replay: None,
        }
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// The live session key, if established.
    pub fn key(&self) -> Option<&Arc<SessionKey>> {
        self.key.as_ref()
    }

    /// The replay guard of the current session, if one is configured and established.
    pub fn replay_guard(&self) -> Option<&ReplayGuard> {
        self.replay.as_ref()
    }

    /// Generate and wrap a fresh key for `remote`. Any existing session is dropped.
    pub fn begin_offer(&mut self, remote: &RsaPublicKey) -> Result<Vec<u8>, HandshakeError> {
        self.teardown();
        let (key, wrapped) = offer(remote)?;
        self.pending = Some(key);
        self.state = HandshakeState::Offered;
        Ok(wrapped)
    }

    /// The offered key has been handed to the transport: start using it.
    ///
    /// Returns `false` if there was no offer outstanding.
    pub fn confirm_sent(&mut self) -> bool {
        match self.pending.take() {
            Some(key) if self.state == HandshakeState::Offered => {
                self.establish(key);
                true
            }
            _ => false,
        }
    }

    /// Discard an outstanding offer. Returns `false` if there was none.
    pub fn abort_offer(&mut self) -> bool {
        if self.state != HandshakeState::Offered {
            return false;
        }
        self.pending = None;
        self.state = HandshakeState::Idle;
        true
    }

    /// Unwrap a received `key_exchange`. The previous session is dropped
    /// first; on failure the pair stays Idle.
    pub fn receive_key_exchange(
        &mut self,
        wrapped: &[u8],
        own: &RsaPrivateKey,
    ) -> Result<(), HandshakeError> {
        if self.state != HandshakeState::Idle {
            debug!(remote = %self.remote_id, "session superseded by new key exchange");
        }
        self.teardown();
        let key = accept(wrapped, own)?;
        self.establish(key);
        Ok(())
    }

    /// Drop all key material and return to Idle.
    pub fn teardown(&mut self) {
        self.pending = None;
        self.key = None;
        self.replay = None;
        self.state = HandshakeState::Idle;
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<SecureEnvelope, SessionError> {
        let key = self.established_key()?;
        Ok(encrypt(plaintext, key)?)
    }

    pub fn decrypt(&self, envelope: &SecureEnvelope) -> Result<Vec<u8>, SessionError> {
        let key = self.established_key()?;
        Ok(decrypt(envelope, key)?)
    }

    fn established_key(&self) -> Result<&SessionKey, SessionError> {
        self.key
            .as_deref()
            .ok_or_else(|| SessionError::NotEstablished(self.remote_id.clone()))
    }

    fn establish(&mut self, key: SessionKey) {
        self.key = Some(Arc::new(key));
        self.replay = self.replay_config.map(ReplayGuard::new);
        self.state = HandshakeState::Established;
    }
}

/// All sessions of one local peer, keyed by remote id.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: RwLock<HashMap<String, Arc<Mutex<SessionNegotiator>>>>,
    replay_config: Option<ReplayConfig>,
}

impl SessionTable {
    /// A table whose sessions carry no replay guard.
    pub fn new() -> Self {
        Self::default()
    }

    /// A table that gives every established session its own replay guard.
    pub fn with_session_replay(config: ReplayConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            replay_config: Some(config),
        }
    }

    fn pair(&self, remote_id: &str) -> Arc<Mutex<SessionNegotiator>> {
        if let Some(pair) = self.existing(remote_id) {
            return pair;
        }

        self.sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(remote_id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(SessionNegotiator::new(
                    remote_id,
                    self.replay_config,
                )))
            })
            .clone()
    }

    fn existing(&self, remote_id: &str) -> Option<Arc<Mutex<SessionNegotiator>>> {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(remote_id)
            .cloned()
    }

    fn with_pair<T>(&self, remote_id: &str, f: impl FnOnce(&mut SessionNegotiator) -> T) -> T {
        let pair = self.pair(remote_id);
        let mut negotiator = pair.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut *negotiator)
    }

    /// Start a handshake with `remote_id`. Returns the base64 `encryptedKey`.
    pub fn initiate(
        &self,
        remote_id: &str,
        remote_key: &RsaPublicKey,
    ) -> Result<String, SessionError> {
        let wrapped = self.with_pair(remote_id, |n| n.begin_offer(remote_key))?;
        Ok(encode_wrapped_key(&wrapped))
    }

    pub fn confirm_sent(&self, remote_id: &str) -> bool {
        self.with_pair(remote_id, SessionNegotiator::confirm_sent)
    }

    pub fn abort(&self, remote_id: &str) -> bool {
        self.with_pair(remote_id, SessionNegotiator::abort_offer)
    }

    /// Handle a received base64 `encryptedKey` from `remote_id`.
    pub fn accept_key_exchange(
        &self,
        remote_id: &str,
        encrypted_key: &str,
        own: &RsaPrivateKey,
    ) -> Result<(), SessionError> {
        self.with_pair(remote_id, |n| -> Result<(), SessionError> {
            let result = decode_wrapped_key(encrypted_key)
                .and_then(|wrapped| n.receive_key_exchange(&wrapped, own));
            if result.is_err() {
                n.teardown();
            }
            Ok(result?)
        })
    }

    /// Encrypt `plaintext` for `remote_id` and return the `chat.content` string.
    pub fn encrypt_for(&self, remote_id: &str, plaintext: &[u8]) -> Result<String, SessionError> {
        let pair = self
            .existing(remote_id)
            .ok_or_else(|| SessionError::NotEstablished(remote_id.to_string()))?;
        let negotiator = pair.lock().unwrap_or_else(|e| e.into_inner());
        Ok(negotiator.encrypt(plaintext)?.to_content())
    }

    /// Decrypt a `chat.content` string received from `remote_id`.
    pub fn decrypt_from(&self, remote_id: &str, content: &str) -> Result<Vec<u8>, SessionError> {
        let pair = self
            .existing(remote_id)
            .ok_or_else(|| SessionError::NotEstablished(remote_id.to_string()))?;
        let negotiator = pair.lock().unwrap_or_else(|e| e.into_inner());
        let envelope = SecureEnvelope::from_content(content)?;
        negotiator.decrypt(&envelope)
    }

    /// Decrypt a `chat.content` carrying a [`SecurePacket`] and pass it
    /// through the session's replay guard, all under the pair lock.
    ///
    /// Sessions without a guard return the packet unchecked.
    pub fn open_packet(&self, remote_id: &str, content: &str) -> Result<SecurePacket, SessionError> {
        let pair = self
            .existing(remote_id)
            .ok_or_else(|| SessionError::NotEstablished(remote_id.to_string()))?;
        let negotiator = pair.lock().unwrap_or_else(|e| e.into_inner());

        let envelope = SecureEnvelope::from_content(content)?;
        let plaintext = negotiator.decrypt(&envelope)?;
        let packet: SecurePacket = serde_json::from_slice(&plaintext)
            .map_err(|e| SessionError::MalformedPacket(e.to_string()))?;

        if let Some(guard) = negotiator.replay_guard() {
            guard.check(&packet)?;
        }
        Ok(packet)
    }

    /// Tear down the session with `remote_id`, if any.
    pub fn teardown(&self, remote_id: &str) {
        if let Some(pair) = self.existing(remote_id) {
            pair.lock().unwrap_or_else(|e| e.into_inner()).teardown();
        }
    }

    pub fn state_of(&self, remote_id: &str) -> HandshakeState {
        self.existing(remote_id)
            .map(|pair| pair.lock().unwrap_or_else(|e| e.into_inner()).state())
            .unwrap_or(HandshakeState::Idle)
    }

    /// Remote ids with an established session.
    pub fn established(&self) -> Vec<String> {
        // Snapshot first: the map lock must not wait on a busy pair.
        let sessions: Vec<(String, Arc<Mutex<SessionNegotiator>>)> = self
            .sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(id, pair)| (id.clone(), pair.clone()))
            .collect();
        let mut ids: Vec<String> = sessions
            .into_iter()
            .filter(|(_, pair)| {
                pair.lock().unwrap_or_else(|e| e.into_inner()).state()
                    == HandshakeState::Established
            })
            .map(|(id, _)| id)
            .collect();
        ids.sort();
        ids
    }
}
