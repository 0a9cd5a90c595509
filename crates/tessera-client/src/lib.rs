//! Tessera peer.
//!
//! - [`peer`]: the transport-free engine that drives the crypto core
//! - [`signaling`]: WebSocket connectors for the relay and the authority
//! - [`command`]: the interactive command language

#![forbid(unsafe_code)]

pub mod command;
pub mod peer;
pub mod signaling;

pub use command::Command;
pub use peer::{
    DropReason, Outcome, Peer, PeerConfig, PeerError, PeerEvent, ReplayScope, SecurityMode,
};
pub use signaling::{AuthorityClient, RecvError, RelayConnection, RelayReceiver, RelaySender};
