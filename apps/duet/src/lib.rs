//! Two-party peer connections over a room relay.
//!
//! A [`Peer`] joins a room, takes the role the relay assigns and keeps a
//! data channel to the other member alive across glare, ICE failures and
//! relay reconnects. Messages sent with [`Peer::send_reliable`] are
//! sequenced, acknowledged, retransmitted and deduplicated on top of it.

pub mod backoff;
pub mod candidates;
pub mod config;
pub mod negotiation;
pub mod peer;
pub mod reliable;
pub mod session;
pub mod signaling;
pub mod telemetry;
pub mod transport;

pub use config::{DuetConfig, NegotiationConfig};
pub use duet_proto::Role;
pub use peer::{Peer, PeerError, PeerStatus};
pub use reliable::{DeliveryFailure, FailureReason};
