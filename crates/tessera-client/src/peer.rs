//! The peer engine.
//!
//! [`Peer`] is a synchronous, transport-free state machine. Every user action
//! and every frame from the relay goes in through one method and comes back
//! out as an [`Outcome`]: frames to send to the relay, and events to show the
//! user. The hosting loop owns all I/O, which keeps handshakes and races
//! testable without a network.
//!
//! # Trust
//!
//! The only public keys ever used to wrap a session key are:
//! - keys published in the relay's online list (`Encrypted`, `ReplayProtected`)
//! - keys taken from certificates that verified under the root key (`Certified`)
//!
//! In `Certified` mode a `connect` to a peer without a verified key first asks
//! the relay for the peer's certificate and completes once it verifies.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde_json::Value;
use tessera_common::{
    AuthorityRequest, Certificate, ClientFrame, DirectPayload, RelayFrame, SecurePacket,
    UserSummary,
};
use tessera_crypto::authority::CertificateError;
use tessera_crypto::identity::parse_public_key_pem;
use tessera_crypto::{
    trusted_key, HandshakeState, Identity, IdentityError, ReplayConfig, ReplayGuard,
    RsaPublicKey, SessionError, SessionTable,
};
use thiserror::Error;
use tracing::{debug, info, warn};

/// How much protection messages get.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityMode {
    /// Keys from the relay's online list; raw text inside envelopes.
    Encrypted,
    /// Adds timestamped, nonce-tagged packets and a replay guard.
    ReplayProtected,
    /// Adds certificate-anchored keys. Implies replay protection.
    Certified,
}

impl SecurityMode {
    pub fn replay_protected(self) -> bool {
        matches!(self, Self::ReplayProtected | Self::Certified)
    }

    pub fn certified(self) -> bool {
        self == Self::Certified
    }
}

/// Lifetime of the replay guard's memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayScope {
    /// One guard per session, dropped with it.
    PerSession,
    /// One guard for every packet this peer receives.
    Global,
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub mode: SecurityMode,
    pub replay: ReplayConfig,
    pub replay_scope: ReplayScope,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            mode: SecurityMode::Certified,
            replay: ReplayConfig::default(),
            replay_scope: ReplayScope::PerSession,
        }
    }
}

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("no trusted public key for {0}")]
    UnknownPeer(String),

    #[error("no session established with {0}")]
    NotEstablished(String),

    #[error("certified mode requires our own certificate")]
    MissingCertificate,

    #[error("no root key configured")]
    MissingRootKey,

    #[error("certificate rejected: {0}")]
    Certificate(#[from] CertificateError),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Session(SessionError),

    #[error("encoding failed: {0}")]
    Encoding(String),
}

impl From<SessionError> for PeerError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotEstablished(peer) => Self::NotEstablished(peer),
            other => Self::Session(other),
        }
    }
}

impl From<serde_json::Error> for PeerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Encoding(err.to_string())
    }
}

/// Why an inbound message was dropped. Shown to the user, never sent anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Authentication failed or no session. Deliberately unspecific.
    CannotDecrypt,
    Replay,
    KeyUnwrap,
    Malformed,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::CannotDecrypt => "cannot decrypt",
            Self::Replay => "replayed or stale",
            Self::KeyUnwrap => "key exchange failed",
            Self::Malformed => "malformed",
        })
    }
}

/// Something the user should see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    UserList(Vec<UserSummary>),
    SessionEstablished { peer: String, initiated: bool },
    SessionClosed { peer: String },
    Message { from: String, text: String },
    Dropped { from: String, reason: DropReason },
    CertificateVerified { peer: String },
    CertificateRejected { peer: String, reason: String },
    RelayError { message: String },
}

/// Frames to send and events to show, in order.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Outcome {
    pub frames: Vec<ClientFrame>,
    pub events: Vec<PeerEvent>,
}

impl Outcome {
    fn frame(frame: ClientFrame) -> Self {
        Self {
            frames: vec![frame],
            events: Vec::new(),
        }
    }

    fn event(event: PeerEvent) -> Self {
        Self {
            frames: Vec::new(),
            events: vec![event],
        }
    }

    fn extend(&mut self, other: Outcome) {
        self.frames.extend(other.frames);
        self.events.extend(other.events);
    }
}

/// One local peer and all its sessions.
pub struct Peer {
    identity: Identity,
    public_key_pem: String,
    config: PeerConfig,
    sessions: SessionTable,
    global_replay: Option<ReplayGuard>,
    root_key: Option<RsaPublicKey>,
    certificate: Option<Certificate>,
    directory_keys: HashMap<String, RsaPublicKey>,
    verified_keys: HashMap<String, RsaPublicKey>,
    pending_connects: HashSet<String>,
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.identity.id())
            .field("mode", &self.config.mode)
            .field("established", &self.sessions.established())
            .finish_non_exhaustive()
    }
}

impl Peer {
    pub fn new(identity: Identity, config: PeerConfig) -> Result<Self, PeerError> {
        let public_key_pem = identity.public_key_pem()?;

        let protected = config.mode.replay_protected();
        let sessions = match config.replay_scope {
            ReplayScope::PerSession if protected => SessionTable::with_session_replay(config.replay),
            _ => SessionTable::new(),
        };
        let global_replay = (protected && config.replay_scope == ReplayScope::Global)
            .then(|| ReplayGuard::new(config.replay));

        Ok(Self {
            identity,
            public_key_pem,
            config,
            sessions,
            global_replay,
            root_key: None,
            certificate: None,
            directory_keys: HashMap::new(),
            verified_keys: HashMap::new(),
            pending_connects: HashSet::new(),
        })
    }

    pub fn id(&self) -> &str {
        self.identity.id()
    }

    pub fn mode(&self) -> SecurityMode {
        self.config.mode
    }

    pub fn public_key_pem(&self) -> &str {
        &self.public_key_pem
    }

    pub fn state_of(&self, peer: &str) -> HandshakeState {
        self.sessions.state_of(peer)
    }

    pub fn established_peers(&self) -> Vec<String> {
        self.sessions.established()
    }

    /// The frame announcing this peer to the relay.
    pub fn register_frame(&self) -> Result<ClientFrame, PeerError> {
        if self.config.mode.certified() {
            let certificate = self
                .certificate
                .clone()
                .ok_or(PeerError::MissingCertificate)?;
            return Ok(ClientFrame::RegisterWithCert { certificate });
        }
        Ok(ClientFrame::Register {
            id: self.id().to_string(),
            public_key: self.public_key_pem.clone(),
        })
    }

    /// The request asking the authority to certify this peer.
    pub fn sign_request(&self) -> AuthorityRequest {
        AuthorityRequest::SignRequest {
            user_id: self.id().to_string(),
            user_public_key: self.public_key_pem.clone(),
        }
    }

    /// Install the authority's root key (SPKI PEM).
    pub fn set_root_key(&mut self, pem: &str) -> Result<(), PeerError> {
        self.root_key = Some(parse_public_key_pem(pem)?);
        Ok(())
    }

    /// Install our own certificate after checking it names us and our key.
    pub fn set_certificate(&mut self, certificate: Certificate) -> Result<(), PeerError> {
        let root = self.root_key.as_ref().ok_or(PeerError::MissingRootKey)?;
        let key = trusted_key(&certificate, self.identity.id(), root)?;
        if &key != self.identity.public_key() {
            return Err(CertificateError::Invalid.into());
        }
        info!(issuer = %certificate.issuer, "certificate installed");
        self.certificate = Some(certificate);
        Ok(())
    }

    /// Ask the relay for `peer`'s certificate.
    pub fn request_certificate(&self, peer: &str) -> Outcome {
        Outcome::frame(ClientFrame::GetCert {
            target_id: peer.to_string(),
        })
    }

    /// Start a session with `peer`.
    ///
    /// Supersedes any existing session. In `Certified` mode without a
    /// verified key for `peer`, this only requests the certificate.
    pub fn connect(&mut self, peer: &str) -> Result<Outcome, PeerError> {
        if let Some(key) = self.trusted_key_for(peer).cloned() {
            return self.handshake(peer, &key);
        }
        if self.config.mode.certified() {
            debug!(peer, "connect pending certificate");
            self.pending_connects.insert(peer.to_string());
            return Ok(self.request_certificate(peer));
        }
        Err(PeerError::UnknownPeer(peer.to_string()))
    }

    /// Encrypt `text` for `peer`.
    pub fn send_chat(&self, peer: &str, text: &str) -> Result<Outcome, PeerError> {
        let plaintext = if self.config.mode.replay_protected() {
            serde_json::to_vec(&SecurePacket::new(Value::String(text.to_string())))?
        } else {
            text.as_bytes().to_vec()
        };

        let content = self.sessions.encrypt_for(peer, &plaintext)?;
        let payload = serde_json::to_value(DirectPayload::Chat { content })?;
        Ok(Outcome::frame(ClientFrame::Direct {
            target_id: peer.to_string(),
            payload,
        }))
    }

    /// React to one frame from the relay.
    pub fn handle_relay_frame(&mut self, frame: RelayFrame) -> Outcome {
        match frame {
            RelayFrame::UserList { users } => self.on_user_list(users),
            RelayFrame::CertResponse {
                target_id,
                certificate,
            } => self.on_certificate(target_id, certificate),
            RelayFrame::Direct { sender_id, payload } => self.on_direct(sender_id, payload),
            RelayFrame::Error { message, target_id } => {
                debug!("relay error: {}", message);
                let mut outcome = Outcome::default();
                if let Some(peer) = target_id {
                    self.on_unreachable(&peer, &mut outcome);
                }
                outcome.events.push(PeerEvent::RelayError { message });
                outcome
            }
        }
    }

    fn trusted_key_for(&self, peer: &str) -> Option<&RsaPublicKey> {
        if self.config.mode.certified() {
            self.verified_keys.get(peer)
        } else {
            self.directory_keys.get(peer)
        }
    }

    fn handshake(&mut self, peer: &str, key: &RsaPublicKey) -> Result<Outcome, PeerError> {
        self.pending_connects.remove(peer);

        let encrypted_key = self.sessions.initiate(peer, key)?;
        let payload = match serde_json::to_value(DirectPayload::KeyExchange { encrypted_key }) {
            Ok(payload) => payload,
            Err(err) => {
                self.sessions.abort(peer);
                return Err(err.into());
            }
        };
        self.sessions.confirm_sent(peer);
        info!(peer, "session key sent");

        Ok(Outcome {
            frames: vec![ClientFrame::Direct {
                target_id: peer.to_string(),
                payload,
            }],
            events: vec![PeerEvent::SessionEstablished {
                peer: peer.to_string(),
                initiated: true,
            }],
        })
    }

    fn forget(&mut self, peer: &str, outcome: &mut Outcome) {
        self.directory_keys.remove(peer);
        self.verified_keys.remove(peer);
        self.on_unreachable(peer, outcome);
    }

    /// The relay cannot reach `peer`: any key we just sent it was never
    /// delivered, and a pending connect will never complete.
    fn on_unreachable(&mut self, peer: &str, outcome: &mut Outcome) {
        self.pending_connects.remove(peer);
        if self.sessions.state_of(peer) != HandshakeState::Idle {
            self.sessions.teardown(peer);
            info!(peer, "session closed");
            outcome.events.push(PeerEvent::SessionClosed {
                peer: peer.to_string(),
            });
        }
    }

    fn on_user_list(&mut self, users: Vec<UserSummary>) -> Outcome {
        let mut outcome = Outcome::default();
        let online: HashSet<&str> = users.iter().map(|user| user.id.as_str()).collect();

        let mut known: HashSet<String> = self.directory_keys.keys().cloned().collect();
        known.extend(self.verified_keys.keys().cloned());
        known.extend(self.pending_connects.iter().cloned());
        known.extend(self.sessions.established());
        let mut gone: Vec<String> = known
            .into_iter()
            .filter(|peer| !online.contains(peer.as_str()))
            .collect();
        gone.sort();
        for peer in gone {
            self.forget(&peer, &mut outcome);
        }

        for user in &users {
            if user.id == self.id() {
                continue;
            }
            let Some(pem) = &user.public_key else {
                continue;
            };
            match parse_public_key_pem(pem) {
                Ok(key) => {
                    let changed = self
                        .directory_keys
                        .get(&user.id)
                        .is_some_and(|old| old != &key);
                    if changed && !self.config.mode.certified() {
                        // The peer came back with a new identity; its old key material is dead.
                        self.sessions.teardown(&user.id);
                        outcome.events.push(PeerEvent::SessionClosed {
                            peer: user.id.clone(),
                        });
                    }
                    self.directory_keys.insert(user.id.clone(), key);
                }
                Err(err) => debug!("ignoring unparsable key for {}: {}", user.id, err),
            }
        }

        outcome.events.push(PeerEvent::UserList(users));
        outcome
    }

    fn on_certificate(&mut self, peer: String, certificate: Certificate) -> Outcome {
        let was_pending = self.pending_connects.remove(&peer);

        let verified = match &self.root_key {
            Some(root) => trusted_key(&certificate, &peer, root).map_err(|err| err.to_string()),
            None => Err(PeerError::MissingRootKey.to_string()),
        };

        match verified {
            Ok(key) => {
                info!(peer = %peer, issuer = %certificate.issuer, "certificate verified");
                self.verified_keys.insert(peer.clone(), key.clone());
                let mut outcome = Outcome::event(PeerEvent::CertificateVerified { peer: peer.clone() });
                if was_pending {
                    match self.handshake(&peer, &key) {
                        Ok(handshake) => outcome.extend(handshake),
                        Err(err) => warn!(peer = %peer, "handshake failed: {}", err),
                    }
                }
                outcome
            }
            Err(reason) => {
                warn!(peer = %peer, "certificate invalid: {}", reason);
                self.verified_keys.remove(&peer);
                Outcome::event(PeerEvent::CertificateRejected { peer, reason })
            }
        }
    }

    fn on_direct(&mut self, from: String, payload: Value) -> Outcome {
        let payload: DirectPayload = match serde_json::from_value(payload) {
            Ok(payload) => payload,
            Err(err) => {
                debug!(from = %from, "malformed direct payload: {}", err);
                return Outcome::event(PeerEvent::Dropped {
                    from,
                    reason: DropReason::Malformed,
                });
            }
        };

        match payload {
            DirectPayload::KeyExchange { encrypted_key } => {
                match self.sessions.accept_key_exchange(
                    &from,
                    &encrypted_key,
                    self.identity.private_key(),
                ) {
                    Ok(()) => {
                        info!(peer = %from, "session key received");
                        Outcome::event(PeerEvent::SessionEstablished {
                            peer: from,
                            initiated: false,
                        })
                    }
                    Err(err) => {
                        warn!(peer = %from, "key exchange rejected: {}", err);
                        Outcome::event(PeerEvent::Dropped {
                            from,
                            reason: DropReason::KeyUnwrap,
                        })
                    }
                }
            }
            DirectPayload::Chat { content } => match self.open_chat(&from, &content) {
                Ok(text) => Outcome::event(PeerEvent::Message { from, text }),
                Err(reason) => Outcome::event(PeerEvent::Dropped { from, reason }),
            },
        }
    }

    fn open_chat(&self, from: &str, content: &str) -> Result<String, DropReason> {
        if !self.config.mode.replay_protected() {
            let plaintext = self
                .sessions
                .decrypt_from(from, content)
                .map_err(|err| classify(from, err))?;
            return Ok(String::from_utf8_lossy(&plaintext).into_owned());
        }

        let packet = self
            .sessions
            .open_packet(from, content)
            .map_err(|err| classify(from, err))?;
        if let Some(guard) = &self.global_replay {
            guard
                .check(&packet)
                .map_err(|err| classify(from, SessionError::Replay(err)))?;
        }

        Ok(match packet.payload {
            Value::String(text) => text,
            other => other.to_string(),
        })
    }
}

fn classify(from: &str, err: SessionError) -> DropReason {
    match err {
        SessionError::Replay(reason) => {
            debug!(from, %reason, "replay rejected");
            DropReason::Replay
        }
        SessionError::MalformedPacket(reason) => {
            debug!(from, %reason, "malformed packet");
            DropReason::Malformed
        }
        SessionError::Handshake(_) => DropReason::KeyUnwrap,
        SessionError::NotEstablished(_) | SessionError::Envelope(_) => {
            debug!(from, "message could not be decrypted");
            DropReason::CannotDecrypt
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::OnceLock;
    use tessera_crypto::{AuthorityConfig, TrustAuthority};

    // RSA generation is slow; every test clones the same two private keys.
    fn keys() -> &'static (Identity, Identity) {
        static KEYS: OnceLock<(Identity, Identity)> = OnceLock::new();
        KEYS.get_or_init(|| {
            (
                Identity::generate("alice").unwrap(),
                Identity::generate("bob").unwrap(),
            )
        })
    }

    fn authority() -> &'static TrustAuthority {
        static AUTHORITY: OnceLock<TrustAuthority> = OnceLock::new();
        AUTHORITY.get_or_init(|| TrustAuthority::start(AuthorityConfig::default()).unwrap())
    }

    fn clone_identity(identity: &Identity) -> Identity {
        Identity::from_private_key(identity.id(), identity.private_key().clone())
    }

    fn peer(which: usize, mode: SecurityMode) -> Peer {
        let (alice, bob) = keys();
        let identity = clone_identity(if which == 0 { alice } else { bob });
        Peer::new(
            identity,
            PeerConfig {
                mode,
                ..PeerConfig::default()
            },
        )
        .unwrap()
    }

    fn summary(peer: &Peer) -> UserSummary {
        UserSummary {
            id: peer.id().to_string(),
            public_key: Some(peer.public_key_pem().to_string()),
            has_cert: false,
        }
    }

    /// Route a client frame as the relay would, from `from` to whoever it names.
    fn relay(from: &Peer, frame: ClientFrame) -> (String, RelayFrame) {
        match frame {
            ClientFrame::Direct { target_id, payload } => (
                target_id,
                RelayFrame::Direct {
                    sender_id: from.id().to_string(),
                    payload,
                },
            ),
            other => panic!("not a direct frame: {other:?}"),
        }
    }

    fn connected(mode: SecurityMode) -> (Peer, Peer) {
        let mut alice = peer(0, mode);
        let mut bob = peer(1, mode);
        let users = vec![summary(&alice), summary(&bob)];
        alice.handle_relay_frame(RelayFrame::UserList {
            users: users.clone(),
        });
        bob.handle_relay_frame(RelayFrame::UserList { users });

        let outcome = alice.connect("bob").unwrap();
        assert_eq!(
            outcome.events,
            vec![PeerEvent::SessionEstablished {
                peer: "bob".into(),
                initiated: true
            }]
        );
        let (_, frame) = relay(&alice, outcome.frames.into_iter().next().unwrap());
        let outcome = bob.handle_relay_frame(frame);
        assert_eq!(
            outcome.events,
            vec![PeerEvent::SessionEstablished {
                peer: "alice".into(),
                initiated: false
            }]
        );
        (alice, bob)
    }

    fn chat(from: &Peer, to: &mut Peer, text: &str) -> (RelayFrame, Vec<PeerEvent>) {
        let outcome = from.send_chat(to.id(), text).unwrap();
        let (_, frame) = relay(from, outcome.frames.into_iter().next().unwrap());
        let events = to.handle_relay_frame(frame.clone()).events;
        (frame, events)
    }

    #[test]
    fn test_encrypted_mode_round_trip() {
        let (alice, mut bob) = connected(SecurityMode::Encrypted);
        let (_, events) = chat(&alice, &mut bob, "hello bob");
        assert_eq!(
            events,
            vec![PeerEvent::Message {
                from: "alice".into(),
                text: "hello bob".into()
            }]
        );
    }

    #[test]
    fn test_encrypted_mode_has_no_replay_defense() {
        let (alice, mut bob) = connected(SecurityMode::Encrypted);
        let (frame, _) = chat(&alice, &mut bob, "pay 5");
        let replayed = bob.handle_relay_frame(frame).events;
        assert!(matches!(replayed[0], PeerEvent::Message { .. }));
    }

    #[test]
    fn test_replay_protected_mode_drops_duplicates() {
        let (alice, mut bob) = connected(SecurityMode::ReplayProtected);
        let (frame, events) = chat(&alice, &mut bob, "pay 5");
        assert_eq!(
            events,
            vec![PeerEvent::Message {
                from: "alice".into(),
                text: "pay 5".into()
            }]
        );

        assert_eq!(
            bob.handle_relay_frame(frame).events,
            vec![PeerEvent::Dropped {
                from: "alice".into(),
                reason: DropReason::Replay
            }]
        );
    }

    #[test]
    fn test_global_replay_scope() {
        let (alice, _) = keys();
        let mut bob = Peer::new(
            clone_identity(&keys().1),
            PeerConfig {
                mode: SecurityMode::ReplayProtected,
                replay: ReplayConfig::default(),
                replay_scope: ReplayScope::Global,
            },
        )
        .unwrap();
        let mut alice = Peer::new(
            clone_identity(alice),
            PeerConfig {
                mode: SecurityMode::ReplayProtected,
                ..PeerConfig::default()
            },
        )
        .unwrap();
        let users = vec![summary(&alice), summary(&bob)];
        alice.handle_relay_frame(RelayFrame::UserList { users });

        let outcome = alice.connect("bob").unwrap();
        let (_, frame) = relay(&alice, outcome.frames.into_iter().next().unwrap());
        bob.handle_relay_frame(frame);

        let (frame, _) = chat(&alice, &mut bob, "once");
        assert!(matches!(
            bob.handle_relay_frame(frame).events[0],
            PeerEvent::Dropped {
                reason: DropReason::Replay,
                ..
            }
        ));
    }

    #[test]
    fn test_tampered_chat_is_dropped_without_detail() {
        let (alice, mut bob) = connected(SecurityMode::Encrypted);
        let outcome = alice.send_chat("bob", "secret").unwrap();
        let (_, frame) = relay(&alice, outcome.frames.into_iter().next().unwrap());
        let RelayFrame::Direct { sender_id, .. } = frame else {
            unreachable!()
        };

        let forged = tessera_crypto::SecureEnvelope {
            iv: [0; 12],
            ciphertext: vec![1, 2, 3],
            auth_tag: [0; 16],
        };
        let payload = serde_json::to_value(DirectPayload::Chat {
            content: forged.to_content(),
        })
        .unwrap();
        assert_eq!(
            bob.handle_relay_frame(RelayFrame::Direct { sender_id, payload })
                .events,
            vec![PeerEvent::Dropped {
                from: "alice".into(),
                reason: DropReason::CannotDecrypt
            }]
        );
    }

    #[test]
    fn test_chat_without_session() {
        let alice = peer(0, SecurityMode::Encrypted);
        assert!(matches!(
            alice.send_chat("bob", "hi"),
            Err(PeerError::NotEstablished(_))
        ));
    }

    #[test]
    fn test_connect_to_unknown_peer() {
        let mut alice = peer(0, SecurityMode::Encrypted);
        assert!(matches!(
            alice.connect("carol"),
            Err(PeerError::UnknownPeer(_))
        ));
    }

    #[test]
    fn test_bad_key_exchange_leaves_idle() {
        let mut bob = peer(1, SecurityMode::Encrypted);
        let payload = json!({"type": "key_exchange", "encryptedKey": "AAAA"});
        let events = bob
            .handle_relay_frame(RelayFrame::Direct {
                sender_id: "alice".into(),
                payload,
            })
            .events;
        assert_eq!(
            events,
            vec![PeerEvent::Dropped {
                from: "alice".into(),
                reason: DropReason::KeyUnwrap
            }]
        );
        assert_eq!(bob.state_of("alice"), HandshakeState::Idle);
    }

    #[test]
    fn test_malformed_direct_payload() {
        let mut bob = peer(1, SecurityMode::Encrypted);
        let events = bob
            .handle_relay_frame(RelayFrame::Direct {
                sender_id: "alice".into(),
                payload: json!({"type": "teleport"}),
            })
            .events;
        assert!(matches!(
            events[0],
            PeerEvent::Dropped {
                reason: DropReason::Malformed,
                ..
            }
        ));
    }

    #[test]
    fn test_peer_leaving_tears_down_session() {
        let (mut alice, _bob) = connected(SecurityMode::Encrypted);
        assert_eq!(alice.state_of("bob"), HandshakeState::Established);

        let outcome = alice.handle_relay_frame(RelayFrame::UserList {
            users: vec![summary(&alice)],
        });
        assert_eq!(
            outcome.events[0],
            PeerEvent::SessionClosed { peer: "bob".into() }
        );
        assert_eq!(alice.state_of("bob"), HandshakeState::Idle);
        assert!(matches!(
            alice.connect("bob"),
            Err(PeerError::UnknownPeer(_))
        ));
    }

    #[test]
    fn test_rehandshake_supersedes() {
        let (mut alice, mut bob) = connected(SecurityMode::Encrypted);
        let (old_frame, _) = chat(&alice, &mut bob, "old");

        let outcome = alice.connect("bob").unwrap();
        let (_, frame) = relay(&alice, outcome.frames.into_iter().next().unwrap());
        bob.handle_relay_frame(frame);

        let (_, events) = chat(&alice, &mut bob, "new");
        assert!(matches!(events[0], PeerEvent::Message { .. }));
        assert!(matches!(
            bob.handle_relay_frame(old_frame).events[0],
            PeerEvent::Dropped {
                reason: DropReason::CannotDecrypt,
                ..
            }
        ));
    }

    fn certified(which: usize) -> Peer {
        let mut peer = peer(which, SecurityMode::Certified);
        peer.set_root_key(authority().root_public_key_pem()).unwrap();
        let certificate = authority()
            .issue(peer.id(), peer.public_key_pem())
            .unwrap();
        peer.set_certificate(certificate).unwrap();
        peer
    }

    #[test]
    fn test_certified_connect_waits_for_certificate() {
        let alice = certified(0);
        let mut bob = certified(1);

        let outcome = bob.connect("alice").unwrap();
        assert_eq!(
            outcome.frames,
            vec![ClientFrame::GetCert {
                target_id: "alice".into()
            }]
        );
        assert_eq!(bob.state_of("alice"), HandshakeState::Idle);

        let ClientFrame::RegisterWithCert { certificate } = alice.register_frame().unwrap() else {
            panic!("certified peers register with a certificate");
        };
        let outcome = bob.handle_relay_frame(RelayFrame::CertResponse {
            target_id: "alice".into(),
            certificate,
        });
        assert_eq!(
            outcome.events,
            vec![
                PeerEvent::CertificateVerified {
                    peer: "alice".into()
                },
                PeerEvent::SessionEstablished {
                    peer: "alice".into(),
                    initiated: true
                },
            ]
        );
        assert_eq!(outcome.frames.len(), 1);
        assert_eq!(bob.state_of("alice"), HandshakeState::Established);
    }

    #[test]
    fn test_certified_rejects_forged_certificate() {
        let mut bob = certified(1);
        bob.connect("alice").unwrap();

        // Signed by the right root, but for a different name.
        let (alice, _) = keys();
        let certificate = authority()
            .issue("mallory", &alice.public_key_pem().unwrap())
            .unwrap();
        let outcome = bob.handle_relay_frame(RelayFrame::CertResponse {
            target_id: "alice".into(),
            certificate,
        });
        assert!(outcome.frames.is_empty());
        assert!(matches!(
            outcome.events[0],
            PeerEvent::CertificateRejected { .. }
        ));
        assert_eq!(bob.state_of("alice"), HandshakeState::Idle);
    }

    #[test]
    fn test_certified_ignores_directory_keys() {
        let alice = certified(0);
        let mut bob = certified(1);
        bob.handle_relay_frame(RelayFrame::UserList {
            users: vec![summary(&alice)],
        });
        // A key in the online list is not enough: bob asks for the certificate.
        assert!(matches!(
            bob.connect("alice").unwrap().frames[0],
            ClientFrame::GetCert { .. }
        ));
    }

    #[test]
    fn test_set_certificate_checks_binding() {
        let mut alice = peer(0, SecurityMode::Certified);
        assert!(matches!(
            alice.register_frame(),
            Err(PeerError::MissingCertificate)
        ));

        let certificate = authority()
            .issue("alice", &keys().1.public_key_pem().unwrap())
            .unwrap();
        assert!(matches!(
            alice.set_certificate(certificate.clone()),
            Err(PeerError::MissingRootKey)
        ));

        alice.set_root_key(authority().root_public_key_pem()).unwrap();
        assert!(matches!(
            alice.set_certificate(certificate),
            Err(PeerError::Certificate(_))
        ));
    }

    #[test]
    fn test_sign_request_and_register_frame() {
        let alice = peer(0, SecurityMode::Encrypted);
        assert_eq!(
            alice.sign_request(),
            AuthorityRequest::SignRequest {
                user_id: "alice".into(),
                user_public_key: alice.public_key_pem().to_string(),
            }
        );
        assert!(matches!(
            alice.register_frame().unwrap(),
            ClientFrame::Register { .. }
        ));
    }

    #[test]
    fn test_unknown_target_resets_session() {
        let mut alice = peer(0, SecurityMode::Encrypted);
        let bob = peer(1, SecurityMode::Encrypted);
        alice.handle_relay_frame(RelayFrame::UserList {
            users: vec![summary(&alice), summary(&bob)],
        });
        alice.connect("bob").unwrap();
        assert_eq!(alice.state_of("bob"), HandshakeState::Established);

        // bob left before the key exchange reached him.
        let outcome =
            alice.handle_relay_frame(RelayFrame::unknown_target("bob", "User bob not found"));
        assert_eq!(
            outcome.events,
            vec![
                PeerEvent::SessionClosed { peer: "bob".into() },
                PeerEvent::RelayError {
                    message: "User bob not found".into()
                },
            ]
        );
        assert_eq!(alice.state_of("bob"), HandshakeState::Idle);
        assert!(matches!(
            alice.send_chat("bob", "hello?"),
            Err(PeerError::NotEstablished(_))
        ));
    }

    #[test]
    fn test_unknown_target_cancels_pending_connect() {
        let alice = certified(0);
        let mut bob = certified(1);
        bob.connect("alice").unwrap();

        bob.handle_relay_frame(RelayFrame::unknown_target("alice", "No certificate for alice"));

        // A late certificate verifies but no longer starts a handshake.
        let ClientFrame::RegisterWithCert { certificate } = alice.register_frame().unwrap() else {
            panic!("certified peers register with a certificate");
        };
        let outcome = bob.handle_relay_frame(RelayFrame::CertResponse {
            target_id: "alice".into(),
            certificate,
        });
        assert!(outcome.frames.is_empty());
        assert_eq!(bob.state_of("alice"), HandshakeState::Idle);
    }

    #[test]
    fn test_untargeted_relay_error_keeps_sessions() {
        let (mut alice, _bob) = connected(SecurityMode::Encrypted);
        let outcome = alice.handle_relay_frame(RelayFrame::error("Rate limit exceeded"));
        assert_eq!(
            outcome.events,
            vec![PeerEvent::RelayError {
                message: "Rate limit exceeded".into()
            }]
        );
        assert_eq!(alice.state_of("bob"), HandshakeState::Established);
    }
}
