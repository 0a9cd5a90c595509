//! Time-windowed replay protection for [`SecurePacket`]s.
//!
//! A packet is accepted at most once while its nonce is remembered. A packet
//! stays fresh until one window past its own timestamp; its nonce is kept
//! until one window past the later of its timestamp and the time it was
//! accepted. The nonce therefore outlives every packet that can carry it.
//!
//! # Design
//!
//! - Checks run cheapest first: timestamp arithmetic, then the set lookup
//! - Rejections never touch the nonce set
//! - Check and insert happen under one lock, so concurrent deliveries of the
//!   same nonce produce exactly one acceptance
//! - Expired nonces are evicted from the front of an insertion-ordered queue
//!   on every call. Future-dated packets can sit behind an earlier expiry for
//!   at most the clock skew, which only delays their eviction

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use tessera_common::{now_millis, SecurePacket};
use thiserror::Error;

/// Default validity window: 60 seconds.
pub const DEFAULT_WINDOW_MS: u64 = 60_000;

/// Default tolerance for sender clocks running ahead: 5 seconds.
pub const DEFAULT_CLOCK_SKEW_MS: u64 = 5_000;

/// Why a packet was rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReplayError {
    #[error("packet too old: {age_ms}ms exceeds the {window_ms}ms window")]
    Stale { age_ms: u64, window_ms: u64 },

    #[error("packet dated {ahead_ms}ms in the future")]
    FutureDated { ahead_ms: u64 },

    #[error("nonce {nonce} already seen")]
    Duplicate { nonce: String },
}

/// Replay guard configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayConfig {
    pub window_ms: u64,
    pub clock_skew_ms: u64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            window_ms: DEFAULT_WINDOW_MS,
            clock_skew_ms: DEFAULT_CLOCK_SKEW_MS,
        }
    }
}

#[derive(Debug, Default)]
struct NonceSet {
    /// nonce -> expiry (epoch ms)
    seen: HashMap<String, u64>,
    /// (expiry, nonce) in insertion order
    expiries: VecDeque<(u64, String)>,
}

impl NonceSet {
    fn evict_expired(&mut self, now: u64) {
        while let Some((expiry, _)) = self.expiries.front() {
            if *expiry >= now {
                break;
            }
            if let Some((_, nonce)) = self.expiries.pop_front() {
                self.seen.remove(&nonce);
            }
        }
    }
}

/// Accepts each [`SecurePacket`] at most once within the validity window.
#[derive(Debug, Default)]
pub struct ReplayGuard {
    config: ReplayConfig,
    nonces: Mutex<NonceSet>,
}

impl ReplayGuard {
    pub fn new(config: ReplayConfig) -> Self {
        Self {
            config,
            nonces: Mutex::new(NonceSet::default()),
        }
    }

    pub fn config(&self) -> ReplayConfig {
        self.config
    }

    /// Accept or reject `packet` against the current clock.
    pub fn validate(&self, packet: &SecurePacket) -> bool {
        self.check(packet).is_ok()
    }

    /// Like [`validate`](Self::validate) but says why a packet was rejected.
    pub fn check(&self, packet: &SecurePacket) -> Result<(), ReplayError> {
        self.check_at(packet, now_millis())
    }

    /// Check `packet` as if the clock read `now` (epoch ms).
    pub fn check_at(&self, packet: &SecurePacket, now: u64) -> Result<(), ReplayError> {
        let ReplayConfig {
            window_ms,
            clock_skew_ms,
        } = self.config;

        let age_ms = now.saturating_sub(packet.timestamp);
        if age_ms > window_ms {
            return Err(ReplayError::Stale { age_ms, window_ms });
        }

        let ahead_ms = packet.timestamp.saturating_sub(now);
        if ahead_ms > clock_skew_ms {
            return Err(ReplayError::FutureDated { ahead_ms });
        }

        let mut nonces = self.nonces.lock().unwrap_or_else(|e| e.into_inner());
        nonces.evict_expired(now);

        if nonces.seen.contains_key(&packet.nonce) {
            return Err(ReplayError::Duplicate {
                nonce: packet.nonce.clone(),
            });
        }

        let expiry = now.max(packet.timestamp).saturating_add(window_ms);
        nonces.seen.insert(packet.nonce.clone(), expiry);
        nonces.expiries.push_back((expiry, packet.nonce.clone()));
        Ok(())
    }

    /// Number of nonces currently remembered.
    pub fn len(&self) -> usize {
        self.nonces
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .seen
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
