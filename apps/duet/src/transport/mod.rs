//! Capability interface over the peer-connection primitive.
//!
//! The negotiation and delivery layers only see these traits. `webrtc` adapts
//! webrtc-rs; `mock` is an in-memory network used by tests and demos.

pub mod mock;
pub mod webrtc;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use duet_proto::{IceCandidate, SessionDescription};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("invalid state for {operation}: {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SignalingState,
    },
    #[error("session description rejected: {0}")]
    Description(String),
    #[error("candidate rejected: {0}")]
    Candidate(String),
    #[error("data channel is not open")]
    ChannelClosed,
    #[error("connection closed")]
    Closed,
}

pub(crate) fn to_setup_error<E: fmt::Display>(err: E) -> TransportError {
    TransportError::Setup(err.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Events raised by a peer connection, in the order the primitive reports them.
pub enum ConnectionEvent {
    NegotiationNeeded,
    /// `None` marks the end of candidate gathering.
    LocalCandidate(Option<IceCandidate>),
    SignalingStateChanged(SignalingState),
    ConnectionStateChanged(ConnectionState),
    /// A channel opened by the remote side.
    DataChannel(Arc<dyn DataChannel>),
}

impl fmt::Debug for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionEvent::NegotiationNeeded => f.write_str("NegotiationNeeded"),
            ConnectionEvent::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            ConnectionEvent::SignalingStateChanged(s) => {
                f.debug_tuple("SignalingStateChanged").field(s).finish()
            }
            ConnectionEvent::ConnectionStateChanged(s) => {
                f.debug_tuple("ConnectionStateChanged").field(s).finish()
            }
            ConnectionEvent::DataChannel(dc) => {
                f.debug_tuple("DataChannel").field(&dc.label()).finish()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Message(String),
    /// Buffered amount fell to the configured low threshold.
    BufferedAmountLow,
    Close,
}

pub type ConnectionEvents = mpsc::UnboundedReceiver<ConnectionEvent>;
pub type ChannelEvents = mpsc::UnboundedReceiver<ChannelEvent>;

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, TransportError>;
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError>;
    async fn set_remote_description(&self, desc: SessionDescription)
        -> Result<(), TransportError>;
    /// Discard an in-flight local offer and return to `Stable`.
    async fn rollback(&self) -> Result<(), TransportError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;
    async fn has_remote_description(&self) -> bool;
    fn signaling_state(&self) -> SignalingState;
    fn connection_state(&self) -> ConnectionState;
    async fn create_data_channel(&self, label: &str)
        -> Result<Arc<dyn DataChannel>, TransportError>;
    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> String;
    fn is_open(&self) -> bool;
    /// Event stream for this channel. Only the first call returns it.
    fn take_events(&self) -> Option<ChannelEvents>;
    async fn send_text(&self, text: String) -> Result<(), TransportError>;
    async fn buffered_amount(&self) -> usize;
    async fn set_buffered_amount_low_threshold(&self, threshold: usize);
    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn create(
        &self,
    ) -> Result<(Arc<dyn PeerConnection>, ConnectionEvents), TransportError>;
}
