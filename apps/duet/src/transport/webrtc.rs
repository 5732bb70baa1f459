use std::sync::Arc;

use async_trait::async_trait;
use duet_proto::{IceCandidate, SdpType, SessionDescription};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;

use super::{
    to_setup_error, ChannelEvent, ChannelEvents, ConnectionEvent, ConnectionEvents,
    ConnectionFactory, ConnectionState, DataChannel, PeerConnection, SignalingState,
    TransportError,
};

pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

fn build_api() -> Result<API, TransportError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// Creates webrtc-rs peer connections.
pub struct WebRtcFactory {
    api: API,
    ice_servers: Vec<String>,
}

impl WebRtcFactory {
    pub fn new(ice_servers: Vec<String>) -> Result<Self, TransportError> {
        Ok(Self {
            api: build_api()?,
            ice_servers,
        })
    }

    fn configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl ConnectionFactory for WebRtcFactory {
    async fn create(
        &self,
    ) -> Result<(Arc<dyn PeerConnection>, ConnectionEvents), TransportError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.configuration())
                .await
                .map_err(to_setup_error)?,
        );
        let (tx, rx) = mpsc::unbounded_channel();
        register_callbacks(&pc, tx);
        let pc: Arc<dyn PeerConnection> = Arc::new(WebRtcPeerConnection { pc });
        Ok((pc, rx))
    }
}

fn register_callbacks(pc: &Arc<RTCPeerConnection>, events: mpsc::UnboundedSender<ConnectionEvent>) {
    let tx = events.clone();
    pc.on_negotiation_needed(Box::new(move || {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(ConnectionEvent::NegotiationNeeded);
        })
    }));

    let tx = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        let tx = tx.clone();
        Box::pin(async move {
            let converted = match candidate {
                Some(candidate) => match candidate.to_json() {
                    Ok(init) => Some(from_candidate_init(init)),
                    Err(err) => {
                        tracing::warn!(target = "duet::transport::webrtc", error = %err, "failed to serialize local candidate");
                        return;
                    }
                },
                None => None,
            };
            let _ = tx.send(ConnectionEvent::LocalCandidate(converted));
        })
    }));

    let tx = events.clone();
    pc.on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(ConnectionEvent::SignalingStateChanged(map_signaling(state)));
        })
    }));

    let tx = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let tx = tx.clone();
        Box::pin(async move {
            tracing::debug!(target = "duet::transport::webrtc", ?state, "peer connection state");
            let _ = tx.send(ConnectionEvent::ConnectionStateChanged(map_connection(state)));
        })
    }));

    let tx = events;
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let tx = tx.clone();
        Box::pin(async move {
            let channel = WebRtcDataChannel::wrap(dc).await;
            let _ = tx.send(ConnectionEvent::DataChannel(channel));
        })
    }));
}

fn map_signaling(state: RTCSignalingState) -> SignalingState {
    match state {
        RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
        RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
        RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
        RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
        RTCSignalingState::Closed => SignalingState::Closed,
        _ => SignalingState::Stable,
    }
}

fn map_connection(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        _ => ConnectionState::New,
    }
}

fn from_candidate_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_m_line_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn to_candidate_init(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_m_line_index,
        username_fragment: candidate.username_fragment,
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    let invalid = |err: webrtc::Error| TransportError::Description(err.to_string());
    match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp).map_err(invalid),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp).map_err(invalid),
        SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp).map_err(invalid),
        SdpType::Rollback => rollback_description(),
    }
}

fn rollback_description() -> Result<RTCSessionDescription, TransportError> {
    serde_json::from_value(serde_json::json!({ "type": "rollback", "sdp": "" }))
        .map_err(|err| TransportError::Description(err.to_string()))
}

fn from_rtc_description(desc: RTCSessionDescription) -> Result<SessionDescription, TransportError> {
    let sdp_type = match desc.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Unspecified => {
            return Err(TransportError::Description(
                "unspecified sdp type".to_string(),
            ))
        }
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: desc.sdp,
    })
}

pub struct WebRtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerConnection for WebRtcPeerConnection {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, TransportError> {
        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });
        let offer = self
            .pc
            .create_offer(options)
            .await
            .map_err(|err| TransportError::Description(err.to_string()))?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|err| TransportError::Description(err.to_string()))?;
        from_rtc_description(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        let desc = to_rtc_description(desc)?;
        self.pc
            .set_local_description(desc)
            .await
            .map_err(|err| TransportError::Description(err.to_string()))
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        let desc = to_rtc_description(desc)?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|err| TransportError::Description(err.to_string()))
    }

    async fn rollback(&self) -> Result<(), TransportError> {
        self.pc
            .set_local_description(rollback_description()?)
            .await
            .map_err(|err| TransportError::Description(err.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.pc
            .add_ice_candidate(to_candidate_init(candidate))
            .await
            .map_err(|err| TransportError::Candidate(err.to_string()))
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    fn signaling_state(&self) -> SignalingState {
        map_signaling(self.pc.signaling_state())
    }

    fn connection_state(&self) -> ConnectionState {
        map_connection(self.pc.connection_state())
    }

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannel>, TransportError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(to_setup_error)?;
        Ok(WebRtcDataChannel::wrap(dc).await)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.pc.close().await.map_err(to_setup_error)
    }
}

pub struct WebRtcDataChannel {
    dc: Arc<RTCDataChannel>,
    events: Mutex<Option<ChannelEvents>>,
}

impl WebRtcDataChannel {
    async fn wrap(dc: Arc<RTCDataChannel>) -> Arc<dyn DataChannel> {
        let (tx, rx) = mpsc::unbounded_channel();

        // The remote side may open the channel before callbacks are attached.
        if dc.ready_state() == RTCDataChannelState::Open {
            let _ = tx.send(ChannelEvent::Open);
        }

        let open_tx = tx.clone();
        dc.on_open(Box::new(move || {
            let tx = open_tx.clone();
            Box::pin(async move {
                let _ = tx.send(ChannelEvent::Open);
            })
        }));

        let message_tx = tx.clone();
        let label = dc.label().to_string();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let tx = message_tx.clone();
            let label = label.clone();
            Box::pin(async move {
                match String::from_utf8(msg.data.to_vec()) {
                    Ok(text) => {
                        let _ = tx.send(ChannelEvent::Message(text));
                    }
                    Err(_) => {
                        tracing::debug!(target = "duet::transport::webrtc", %label, "ignoring non-utf8 frame");
                    }
                }
            })
        }));

        let low_tx = tx.clone();
        dc.on_buffered_amount_low(Box::new(move || {
            let tx = low_tx.clone();
            Box::pin(async move {
                let _ = tx.send(ChannelEvent::BufferedAmountLow);
            })
        }))
        .await;

        let close_tx = tx;
        dc.on_close(Box::new(move || {
            let tx = close_tx.clone();
            Box::pin(async move {
                let _ = tx.send(ChannelEvent::Close);
            })
        }));

        Arc::new(Self {
            dc,
            events: Mutex::new(Some(rx)),
        })
    }
}

#[async_trait]
impl DataChannel for WebRtcDataChannel {
    fn label(&self) -> String {
        self.dc.label().to_string()
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    fn take_events(&self) -> Option<ChannelEvents> {
        self.events.lock().take()
    }

    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ChannelClosed);
        }
        self.dc
            .send_text(text)
            .await
            .map(|_| ())
            .map_err(to_setup_error)
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    async fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        self.dc.set_buffered_amount_low_threshold(threshold).await;
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.dc.close().await.map_err(to_setup_error)
    }
}
