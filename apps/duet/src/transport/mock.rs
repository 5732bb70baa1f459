//! In-memory peer connections.
//!
//! Session descriptions are short text tokens naming the connection that
//! produced them, so applying a remote answer links the two connections and
//! opens any pending data channels. The network can drop messages or take all
//! links down to exercise retransmission and restart paths.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use duet_proto::{IceCandidate, SdpType, SessionDescription};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use super::{
    ChannelEvent, ChannelEvents, ConnectionEvent, ConnectionEvents, ConnectionFactory,
    ConnectionState, DataChannel, PeerConnection, SignalingState, TransportError,
};

#[derive(Default)]
struct NetworkInner {
    next_id: u64,
    connections: HashMap<u64, Weak<MockPeerConnection>>,
    drop_next: usize,
    links_down: bool,
    created: usize,
    restart_offers: usize,
}

/// Shared in-memory network; cloning shares the same network.
#[derive(Clone, Default)]
pub struct MockNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Silently lose the next `count` data-channel messages.
    pub fn drop_next(&self, count: usize) {
        self.inner.lock().drop_next += count;
    }

    /// Report every live connection as failed and lose traffic until a
    /// renegotiation completes.
    pub fn fail_links(&self) {
        let connections = {
            let mut inner = self.inner.lock();
            inner.links_down = true;
            inner.live()
        };
        for pc in connections {
            pc.set_connection_state(ConnectionState::Failed);
        }
    }

    /// Number of peer connections created so far.
    pub fn connections_created(&self) -> usize {
        self.inner.lock().created
    }

    pub fn restart_offers(&self) -> usize {
        self.inner.lock().restart_offers
    }

    fn should_drop(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.links_down {
            return true;
        }
        if inner.drop_next > 0 {
            inner.drop_next -= 1;
            return true;
        }
        false
    }

    fn lookup(&self, id: u64) -> Option<Arc<MockPeerConnection>> {
        self.inner.lock().connections.get(&id).and_then(Weak::upgrade)
    }

    /// Called when `offerer` applied the answer produced by `answerer`.
    fn link(&self, offerer: &MockPeerConnection, answerer_id: u64) {
        self.inner.lock().links_down = false;
        let Some(answerer) = self.lookup(answerer_id) else {
            trace!(target = "duet::transport::mock", answerer_id, "answerer gone");
            return;
        };
        offerer.set_connection_state(ConnectionState::Connected);
        answerer.set_connection_state(ConnectionState::Connected);
        offerer.announce_channels(&answerer);
        answerer.announce_channels(offerer);
    }
}

impl NetworkInner {
    fn live(&self) -> Vec<Arc<MockPeerConnection>> {
        self.connections.values().filter_map(Weak::upgrade).collect()
    }
}

impl MockNetwork {
    /// Like [`ConnectionFactory::create`] but keeps the concrete type.
    pub fn create_mock(&self) -> (Arc<MockPeerConnection>, ConnectionEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        inner.created += 1;
        let pc = Arc::new(MockPeerConnection {
            id: inner.next_id,
            network: self.clone(),
            events: tx,
            state: Mutex::new(PcState::default()),
        });
        inner.connections.insert(pc.id, Arc::downgrade(&pc));
        (pc, rx)
    }
}

#[async_trait]
impl ConnectionFactory for MockNetwork {
    async fn create(
        &self,
    ) -> Result<(Arc<dyn PeerConnection>, ConnectionEvents), TransportError> {
        let (pc, events) = self.create_mock();
        let pc: Arc<dyn PeerConnection> = pc;
        Ok((pc, events))
    }
}

struct PcState {
    signaling: SignalingState,
    connection: ConnectionState,
    has_remote: bool,
    remote_peer: Option<u64>,
    version: u64,
    candidates_emitted: u64,
    channels: Vec<Arc<MockDataChannel>>,
    announced: usize,
    remote_candidates: Vec<IceCandidate>,
}

impl Default for PcState {
    fn default() -> Self {
        Self {
            signaling: SignalingState::Stable,
            connection: ConnectionState::New,
            has_remote: false,
            remote_peer: None,
            version: 0,
            candidates_emitted: 0,
            channels: Vec::new(),
            announced: 0,
            remote_candidates: Vec::new(),
        }
    }
}

pub struct MockPeerConnection {
    id: u64,
    network: MockNetwork,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    state: Mutex<PcState>,
}

impl MockPeerConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remote candidates applied so far, in order.
    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().remote_candidates.clone()
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    fn set_signaling(&self, state: &mut PcState, next: SignalingState) {
        if state.signaling != next {
            state.signaling = next;
            self.emit(ConnectionEvent::SignalingStateChanged(next));
        }
    }

    fn set_connection_state(&self, next: ConnectionState) {
        let mut state = self.state.lock();
        if state.connection == next || state.connection == ConnectionState::Closed {
            return;
        }
        if next == ConnectionState::Connected && state.connection == ConnectionState::New {
            state.connection = ConnectionState::Connecting;
            self.emit(ConnectionEvent::ConnectionStateChanged(
                ConnectionState::Connecting,
            ));
        }
        state.connection = next;
        self.emit(ConnectionEvent::ConnectionStateChanged(next));
    }

    fn gather(&self, state: &mut PcState) {
        state.candidates_emitted += 1;
        let candidate = IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host",
                self.id,
                40000 + state.candidates_emitted
            ),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
            username_fragment: Some(format!("mock{}v{}", self.id, state.version)),
        };
        self.emit(ConnectionEvent::LocalCandidate(Some(candidate)));
        self.emit(ConnectionEvent::LocalCandidate(None));
    }

    /// Pair every not-yet-announced local channel with a twin on `remote`.
    fn announce_channels(&self, remote: &MockPeerConnection) {
        let pending: Vec<Arc<MockDataChannel>> = {
            let mut state = self.state.lock();
            let pending = state.channels[state.announced..].to_vec();
            state.announced = state.channels.len();
            pending
        };
        for local in pending {
            let twin = MockDataChannel::new(local.label.clone(), self.network.clone());
            MockDataChannel::pair(&local, &twin);
            remote.emit(ConnectionEvent::DataChannel(twin.clone()));
            local.open();
            twin.open();
        }
    }

    fn description(&self, sdp_type: SdpType, version: u64, restart: bool) -> SessionDescription {
        SessionDescription {
            sdp_type,
            sdp: format!("mock pc={} v={} restart={}", self.id, version, restart),
        }
    }
}

fn sdp_origin(desc: &SessionDescription) -> Option<u64> {
    desc.sdp
        .split_whitespace()
        .find_map(|part| part.strip_prefix("pc="))
        .and_then(|id| id.parse().ok())
}

#[async_trait]
impl PeerConnection for MockPeerConnection {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, TransportError> {
        let mut state = self.state.lock();
        match state.signaling {
            SignalingState::Stable | SignalingState::HaveLocalOffer => {}
            other => {
                return Err(TransportError::InvalidState {
                    operation: "create_offer",
                    state: other,
                })
            }
        }
        if ice_restart {
            self.network.inner.lock().restart_offers += 1;
        }
        state.version += 1;
        Ok(self.description(SdpType::Offer, state.version, ice_restart))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let mut state = self.state.lock();
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(TransportError::InvalidState {
                operation: "create_answer",
                state: state.signaling,
            });
        }
        state.version += 1;
        Ok(self.description(SdpType::Answer, state.version, false))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        match (desc.sdp_type, state.signaling) {
            (SdpType::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                self.set_signaling(&mut state, SignalingState::HaveLocalOffer);
            }
            (SdpType::Answer, SignalingState::HaveRemoteOffer) => {
                self.set_signaling(&mut state, SignalingState::Stable);
            }
            (_, current) => {
                return Err(TransportError::InvalidState {
                    operation: "set_local_description",
                    state: current,
                })
            }
        }
        self.gather(&mut state);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        if desc.sdp_type == SdpType::Rollback {
            return self.rollback().await;
        }
        let origin = sdp_origin(&desc)
            .ok_or_else(|| TransportError::Description(format!("unparseable sdp: {}", desc.sdp)))?;
        let link_with = {
            let mut state = self.state.lock();
            match (desc.sdp_type, state.signaling) {
                (SdpType::Offer, SignalingState::Stable | SignalingState::HaveRemoteOffer) => {
                    state.has_remote = true;
                    state.remote_peer = Some(origin);
                    self.set_signaling(&mut state, SignalingState::HaveRemoteOffer);
                    None
                }
                (SdpType::Answer, SignalingState::HaveLocalOffer) => {
                    state.has_remote = true;
                    state.remote_peer = Some(origin);
                    self.set_signaling(&mut state, SignalingState::Stable);
                    Some(origin)
                }
                (_, current) => {
                    return Err(TransportError::InvalidState {
                        operation: "set_remote_description",
                        state: current,
                    })
                }
            }
        };
        if let Some(answerer) = link_with {
            self.network.link(self, answerer);
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        match state.signaling {
            SignalingState::Closed => Err(TransportError::Closed),
            _ => {
                self.set_signaling(&mut state, SignalingState::Stable);
                Ok(())
            }
        }
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if !state.has_remote {
            return Err(TransportError::Candidate(
                "no remote description".to_string(),
            ));
        }
        state.remote_candidates.push(candidate);
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.state.lock().has_remote
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    fn connection_state(&self) -> ConnectionState {
        self.state.lock().connection
    }

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannel>, TransportError> {
        let channel = MockDataChannel::new(label.to_string(), self.network.clone());
        let remote = {
            let mut state = self.state.lock();
            if state.signaling == SignalingState::Closed {
                return Err(TransportError::Closed);
            }
            state.channels.push(channel.clone());
            match (state.connection, state.remote_peer) {
                (ConnectionState::Connected, Some(remote)) => Some(remote),
                _ => None,
            }
        };
        match remote.and_then(|id| self.network.lookup(id)) {
            Some(remote) => self.announce_channels(&remote),
            None => self.emit(ConnectionEvent::NegotiationNeeded),
        }
        Ok(channel)
    }

    async fn close(&self) -> Result<(), TransportError> {
        let (channels, remote) = {
            let mut state = self.state.lock();
            if state.signaling == SignalingState::Closed {
                return Ok(());
            }
            state.signaling = SignalingState::Closed;
            state.connection = ConnectionState::Closed;
            (std::mem::take(&mut state.channels), state.remote_peer)
        };
        self.emit(ConnectionEvent::ConnectionStateChanged(ConnectionState::Closed));
        for channel in channels {
            channel.shut();
        }
        if let Some(remote) = remote.and_then(|id| self.network.lookup(id)) {
            let linked_here = remote.state.lock().remote_peer == Some(self.id);
            if linked_here {
                remote.set_connection_state(ConnectionState::Disconnected);
            }
        }
        Ok(())
    }
}

struct ChannelState {
    open: bool,
    peer: Option<Weak<MockDataChannel>>,
    buffered: usize,
    low_threshold: usize,
}

pub struct MockDataChannel {
    label: String,
    network: MockNetwork,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    events_rx: Mutex<Option<ChannelEvents>>,
    state: Mutex<ChannelState>,
}

impl MockDataChannel {
    fn new(label: String, network: MockNetwork) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            label,
            network,
            events_tx: tx,
            events_rx: Mutex::new(Some(rx)),
            state: Mutex::new(ChannelState {
                open: false,
                peer: None,
                buffered: 0,
                low_threshold: 0,
            }),
        })
    }

    /// Two already-open channels wired to each other on `network`.
    pub fn open_pair(network: &MockNetwork, label: &str) -> (Arc<Self>, Arc<Self>) {
        let a = Self::new(label.to_string(), network.clone());
        let b = Self::new(label.to_string(), network.clone());
        Self::pair(&a, &b);
        a.open();
        b.open();
        (a, b)
    }

    fn pair(a: &Arc<Self>, b: &Arc<Self>) {
        a.state.lock().peer = Some(Arc::downgrade(b));
        b.state.lock().peer = Some(Arc::downgrade(a));
    }

    fn open(&self) {
        let mut state = self.state.lock();
        if !state.open {
            state.open = true;
            let _ = self.events_tx.send(ChannelEvent::Open);
        }
    }

    /// Close both ends.
    fn shut(&self) {
        let peer = {
            let mut state = self.state.lock();
            let was_open = std::mem::replace(&mut state.open, false);
            if was_open {
                let _ = self.events_tx.send(ChannelEvent::Close);
            }
            state.peer.take()
        };
        if let Some(peer) = peer.and_then(|p| p.upgrade()) {
            peer.shut();
        }
    }

    /// Pretend `amount` bytes are queued. Crossing down to the low threshold
    /// raises `BufferedAmountLow`.
    pub fn set_buffered_amount(&self, amount: usize) {
        let mut state = self.state.lock();
        let crossed = state.buffered > state.low_threshold && amount <= state.low_threshold;
        state.buffered = amount;
        if crossed {
            let _ = self.events_tx.send(ChannelEvent::BufferedAmountLow);
        }
    }
}

#[async_trait]
impl DataChannel for MockDataChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn is_open(&self) -> bool {
        self.state.lock().open
    }

    fn take_events(&self) -> Option<ChannelEvents> {
        self.events_rx.lock().take()
    }

    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        let peer = {
            let state = self.state.lock();
            if !state.open {
                return Err(TransportError::ChannelClosed);
            }
            state.peer.as_ref().and_then(Weak::upgrade)
        };
        let Some(peer) = peer else {
            return Err(TransportError::ChannelClosed);
        };
        if self.network.should_drop() {
            trace!(target = "duet::transport::mock", "dropping message in flight");
            return Ok(());
        }
        let _ = peer.events_tx.send(ChannelEvent::Message(text));
        Ok(())
    }

    async fn buffered_amount(&self) -> usize {
        self.state.lock().buffered
    }

    async fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        self.state.lock().low_threshold = threshold;
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.shut();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn next_channel(events: &mut ConnectionEvents) -> Arc<dyn DataChannel> {
        loop {
            match events.recv().await {
                Some(ConnectionEvent::DataChannel(dc)) => return dc,
                Some(_) => continue,
                None => panic!("event stream ended"),
            }
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn offer_answer_links_connections_and_opens_channel() {
        let network = MockNetwork::new();
        let (offerer, mut offerer_events) = network.create().await.unwrap();
        let (answerer, mut answerer_events) = network.create().await.unwrap();

        let local = offerer.create_data_channel("duet").await.unwrap();
        let mut local_events = local.take_events().unwrap();
        assert!(matches!(
            offerer_events.recv().await,
            Some(ConnectionEvent::NegotiationNeeded)
        ));

        let offer = offerer.create_offer(false).await.unwrap();
        offerer.set_local_description(offer.clone()).await.unwrap();
        answerer.set_remote_description(offer).await.unwrap();
        let answer = answerer.create_answer().await.unwrap();
        answerer.set_local_description(answer.clone()).await.unwrap();
        offerer.set_remote_description(answer).await.unwrap();

        let remote = next_channel(&mut answerer_events).await;
        let mut remote_events = remote.take_events().unwrap();
        assert_eq!(local_events.recv().await, Some(ChannelEvent::Open));
        assert_eq!(remote_events.recv().await, Some(ChannelEvent::Open));

        local.send_text("hi".into()).await.unwrap();
        assert_eq!(
            remote_events.recv().await,
            Some(ChannelEvent::Message("hi".into()))
        );
        assert_eq!(offerer.connection_state(), ConnectionState::Connected);
    }

    #[test_timeout::tokio_timeout_test]
    async fn remote_offer_during_local_offer_is_rejected_without_rollback() {
        let network = MockNetwork::new();
        let (a, _a_events) = network.create().await.unwrap();
        let (b, _b_events) = network.create().await.unwrap();

        let offer_a = a.create_offer(false).await.unwrap();
        a.set_local_description(offer_a).await.unwrap();
        let offer_b = b.create_offer(false).await.unwrap();

        assert!(a.set_remote_description(offer_b.clone()).await.is_err());
        a.rollback().await.unwrap();
        a.set_remote_description(offer_b).await.unwrap();
        assert_eq!(a.signaling_state(), SignalingState::HaveRemoteOffer);
    }

    #[test_timeout::tokio_timeout_test]
    async fn candidates_need_remote_description() {
        let network = MockNetwork::new();
        let (pc, _events) = network.create().await.unwrap();
        let candidate = IceCandidate {
            candidate: "candidate:1".into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        };
        assert!(matches!(
            pc.add_ice_candidate(candidate).await,
            Err(TransportError::Candidate(_))
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn dropped_messages_never_arrive() {
        let network = MockNetwork::new();
        let (a, b) = MockDataChannel::open_pair(&network, "t");
        let mut b_events = b.take_events().unwrap();
        assert_eq!(b_events.recv().await, Some(ChannelEvent::Open));

        network.drop_next(1);
        a.send_text("lost".into()).await.unwrap();
        a.send_text("kept".into()).await.unwrap();
        assert_eq!(
            b_events.recv().await,
            Some(ChannelEvent::Message("kept".into()))
        );
    }
}
