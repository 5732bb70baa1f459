//! Application-facing peer.
//!
//! [`Peer::connect`] joins a room through the relay and spawns a driver task
//! that owns every piece of connection state: session tracker, negotiator,
//! reliable layer, keepalive and restart governor. The public handle talks
//! to it over a command channel; transport and signaling callbacks reach it
//! through their event channels.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use duet_proto::{generate_peer_identity, Role, ServerMessage};
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::backoff::{RestartDecision, RestartGovernor};
use crate::candidates::CandidateBatch;
use crate::config::DuetConfig;
use crate::negotiation::{Negotiator, OutboundSignal, RemoteOutcome, RemotePayload};
use crate::reliable::backpressure::{spawn_writer, BackpressureGate};
use crate::reliable::keepalive::{Keepalive, KeepaliveAction};
use crate::reliable::{DeliveryFailure, ReliableError, ReliableEvent, ReliableLayer};
use crate::session::SessionTracker;
use crate::signaling::{SignalingClient, SignalingError, SignalingEvent, TerminalReason};
use crate::transport::{
    ChannelEvent, ChannelEvents, ConnectionEvent, ConnectionEvents, ConnectionFactory,
    ConnectionState, DataChannel,
};

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("room {0} is full")]
    RoomFull(String),
    #[error("evicted from room {0}")]
    Evicted(String),
    #[error("no role assignment within {0:?}")]
    JoinTimeout(Duration),
    #[error("signaling stopped before the room was joined")]
    SignalingClosed,
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Reliable(#[from] ReliableError),
    #[error("peer is closed")]
    Closed,
}

impl From<&TerminalReason> for PeerError {
    fn from(reason: &TerminalReason) -> Self {
        match reason {
            TerminalReason::RoomFull { room_id } => PeerError::RoomFull(room_id.clone()),
            TerminalReason::Evicted { room_id } => PeerError::Evicted(room_id.clone()),
        }
    }
}

pub type ReliableHandler = Arc<dyn Fn(&str, &Value) + Send + Sync>;
pub type ChannelHandler = Arc<dyn Fn() + Send + Sync>;
pub type FailureHandler = Arc<dyn Fn(&DeliveryFailure) + Send + Sync>;
pub type SyncProvider = Arc<dyn Fn() -> Option<Value> + Send + Sync>;
pub type SyncHandler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Messages kept for replay while no reliable handler is installed.
const REPLAY_BACKLOG_LIMIT: usize = 1024;

#[derive(Default)]
struct ReliableSlot {
    handler: Option<ReliableHandler>,
    backlog: VecDeque<(String, Value)>,
}

/// Only the newest unhandled snapshot is kept.
#[derive(Default)]
struct SyncSlot {
    handler: Option<SyncHandler>,
    latest: Option<Value>,
}

/// Application callbacks. They run on the driver task and must not block.
#[derive(Default)]
struct Handlers {
    reliable: Mutex<ReliableSlot>,
    raw: Mutex<Option<ReliableHandler>>,
    open: Mutex<Option<ChannelHandler>>,
    close: Mutex<Option<ChannelHandler>>,
    failed: Mutex<Option<FailureHandler>>,
    sync_provider: Mutex<Option<SyncProvider>>,
    remote_sync: Mutex<SyncSlot>,
}

impl Handlers {
    fn deliver(&self, message_type: String, payload: Value) {
        let handler = {
            let mut slot = self.reliable.lock();
            match slot.handler.clone() {
                Some(handler) => handler,
                None => {
                    if slot.backlog.len() >= REPLAY_BACKLOG_LIMIT {
                        if let Some((dropped, _)) = slot.backlog.pop_front() {
                            warn!(
                                target = "duet::peer",
                                message_type = %dropped,
                                limit = REPLAY_BACKLOG_LIMIT,
                                "no reliable handler; dropping oldest undelivered message"
                            );
                        }
                    }
                    slot.backlog.push_back((message_type, payload));
                    return;
                }
            }
        };
        handler(&message_type, &payload);
    }

    /// Install the handler after replaying messages that arrived before it.
    fn set_reliable(&self, handler: ReliableHandler) {
        loop {
            let backlog = {
                let mut slot = self.reliable.lock();
                if slot.backlog.is_empty() {
                    slot.handler = Some(handler);
                    return;
                }
                std::mem::take(&mut slot.backlog)
            };
            for (message_type, payload) in backlog {
                handler(&message_type, &payload);
            }
        }
    }

    fn raw(&self, message_type: &str, data: &Value) {
        let handler = self.raw.lock().clone();
        if let Some(handler) = handler {
            handler(message_type, data);
        }
    }

    fn channel_open(&self) {
        let handler = self.open.lock().clone();
        if let Some(handler) = handler {
            handler();
        }
    }

    fn channel_close(&self) {
        let handler = self.close.lock().clone();
        if let Some(handler) = handler {
            handler();
        }
    }

    fn delivery_failed(&self, failure: &DeliveryFailure) {
        let handler = self.failed.lock().clone();
        if let Some(handler) = handler {
            handler(failure);
        }
    }

    fn sync_state(&self) -> Option<Value> {
        let provider = self.sync_provider.lock().clone();
        provider.and_then(|provider| provider())
    }

    fn remote_sync(&self, state: Value) {
        let handler = {
            let mut slot = self.remote_sync.lock();
            match slot.handler.clone() {
                Some(handler) => handler,
                None => {
                    slot.latest = Some(state);
                    return;
                }
            }
        };
        handler(&state);
    }

    fn set_remote_sync(&self, handler: SyncHandler) {
        let latest = {
            let mut slot = self.remote_sync.lock();
            slot.handler = Some(handler.clone());
            slot.latest.take()
        };
        if let Some(state) = latest {
            handler(&state);
        }
    }
}

/// Snapshot of the driver's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStatus {
    pub identity: String,
    pub role: Option<Role>,
    pub remote: Option<String>,
    pub epoch: u64,
    pub channel_open: bool,
    pub pending: usize,
    pub connection: Option<ConnectionState>,
    /// Round trip measured by the last keepalive pong.
    pub rtt: Option<Duration>,
}

enum PeerCommand {
    SendReliable {
        message_type: String,
        payload: Value,
        reply: oneshot::Sender<Result<String, ReliableError>>,
    },
    SendRaw {
        message_type: String,
        data: Value,
        reply: oneshot::Sender<bool>,
    },
    Status {
        reply: oneshot::Sender<PeerStatus>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

pub struct Peer {
    identity: String,
    role: Role,
    commands: mpsc::UnboundedSender<PeerCommand>,
    handlers: Arc<Handlers>,
    terminated: Arc<Mutex<Option<TerminalReason>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Peer {
    /// Join `room_id` and wait for the first role assignment.
    pub async fn connect(
        config: DuetConfig,
        room_id: &str,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Result<Self, PeerError> {
        let identity = config
            .identity
            .clone()
            .unwrap_or_else(generate_peer_identity);
        let (signaling, signaling_events) = SignalingClient::spawn(
            config.signaling.clone(),
            room_id.to_string(),
            identity.clone(),
        )?;

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (joined_tx, joined_rx) = oneshot::channel();
        let handlers = Arc::new(Handlers::default());
        let terminated = Arc::new(Mutex::new(None));
        let join_timeout = config.negotiation.join_timeout;

        let driver = Driver::new(
            config,
            identity.clone(),
            factory,
            signaling,
            signaling_events,
            command_rx,
            handlers.clone(),
            terminated.clone(),
            joined_tx,
        );
        let task = tokio::spawn(driver.run());

        let role = match timeout(join_timeout, joined_rx).await {
            Ok(Ok(Ok(role))) => role,
            Ok(Ok(Err(err))) => return Err(err),
            Ok(Err(_)) => return Err(PeerError::SignalingClosed),
            Err(_) => {
                task.abort();
                return Err(PeerError::JoinTimeout(join_timeout));
            }
        };
        info!(target = "duet::peer", %identity, room_id, %role, "joined room");

        Ok(Self {
            identity,
            role,
            commands,
            handlers,
            terminated,
            driver: Mutex::new(Some(task)),
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Role assigned when the room was joined; later changes show in
    /// [`Peer::status`].
    pub fn initial_role(&self) -> Role {
        self.role
    }

    /// Queue a message for acknowledged delivery. Returns its message id.
    pub async fn send_reliable(
        &self,
        message_type: &str,
        payload: Value,
    ) -> Result<String, PeerError> {
        let (reply, rx) = oneshot::channel();
        self.command(PeerCommand::SendReliable {
            message_type: message_type.to_string(),
            payload,
            reply,
        })?;
        let result = rx.await.map_err(|_| self.closed_error())?;
        Ok(result?)
    }

    /// Best-effort send. Returns `false` if the channel was not open.
    pub async fn send_raw(&self, message_type: &str, data: Value) -> Result<bool, PeerError> {
        let (reply, rx) = oneshot::channel();
        self.command(PeerCommand::SendRaw {
            message_type: message_type.to_string(),
            data,
            reply,
        })?;
        rx.await.map_err(|_| self.closed_error())
    }

    pub async fn status(&self) -> Result<PeerStatus, PeerError> {
        let (reply, rx) = oneshot::channel();
        self.command(PeerCommand::Status { reply })?;
        rx.await.map_err(|_| self.closed_error())
    }

    /// Messages delivered before a handler is installed are replayed to it.
    pub fn on_reliable(&self, handler: impl Fn(&str, &Value) + Send + Sync + 'static) {
        self.handlers.set_reliable(Arc::new(handler));
    }

    pub fn on_raw(&self, handler: impl Fn(&str, &Value) + Send + Sync + 'static) {
        *self.handlers.raw.lock() = Some(Arc::new(handler));
    }

    pub fn on_channel_open(&self, handler: impl Fn() + Send + Sync + 'static) {
        *self.handlers.open.lock() = Some(Arc::new(handler));
    }

    pub fn on_channel_close(&self, handler: impl Fn() + Send + Sync + 'static) {
        *self.handlers.close.lock() = Some(Arc::new(handler));
    }

    pub fn on_delivery_failed(&self, handler: impl Fn(&DeliveryFailure) + Send + Sync + 'static) {
        *self.handlers.failed.lock() = Some(Arc::new(handler));
    }

    /// Snapshot sent to the remote whenever it says hello on a fresh channel.
    /// Only consulted while this peer holds the second role; `None` sends
    /// nothing.
    pub fn set_sync_provider(&self, provider: impl Fn() -> Option<Value> + Send + Sync + 'static) {
        *self.handlers.sync_provider.lock() = Some(Arc::new(provider));
    }

    /// The latest snapshot received before a handler is installed is replayed to it.
    pub fn on_remote_sync(&self, handler: impl Fn(&Value) + Send + Sync + 'static) {
        self.handlers.set_remote_sync(Arc::new(handler));
    }

    /// Leave the room and tear the connection down.
    pub async fn close(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(PeerCommand::Close { reply }).is_ok() {
            let _ = rx.await;
        }
        let task = self.driver.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    fn command(&self, command: PeerCommand) -> Result<(), PeerError> {
        self.commands
            .send(command)
            .map_err(|_| self.closed_error())
    }

    fn closed_error(&self) -> PeerError {
        match self.terminated.lock().as_ref() {
            Some(reason) => PeerError::from(reason),
            None => PeerError::Closed,
        }
    }
}

struct ChannelLink {
    channel: Arc<dyn DataChannel>,
    events: Option<ChannelEvents>,
    writer: mpsc::UnboundedSender<String>,
    writer_task: JoinHandle<()>,
    gate: BackpressureGate,
    open: bool,
}

impl ChannelLink {
    async fn shutdown(self) {
        self.writer_task.abort();
        if let Err(err) = self.channel.close().await {
            debug!(target = "duet::peer", error = %err, "error closing data channel");
        }
    }
}

/// One peer connection and everything scoped to it.
struct Link {
    negotiator: Negotiator,
    events: Option<ConnectionEvents>,
    channel: Option<ChannelLink>,
    negotiate_at: Option<Instant>,
    restart_at: Option<Instant>,
    candidates: CandidateBatch,
}

impl Link {
    async fn shutdown(mut self) -> bool {
        let was_open = self.channel.as_ref().is_some_and(|channel| channel.open);
        if let Some(channel) = self.channel.take() {
            channel.shutdown().await;
        }
        self.negotiator.close().await;
        was_open
    }

    fn next_deadline(&self) -> Option<Instant> {
        [self.negotiate_at, self.restart_at, self.candidates.deadline()]
            .into_iter()
            .flatten()
            .min()
    }
}

enum LinkEvent {
    Connection(Option<ConnectionEvent>),
    Channel(Option<ChannelEvent>),
}

async fn recv_or_pending<T>(rx: Option<&mut mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_link_event(link: &mut Option<Link>) -> LinkEvent {
    let Some(link) = link.as_mut() else {
        return std::future::pending().await;
    };
    let connection = link.events.as_mut();
    let channel = link.channel.as_mut().and_then(|channel| channel.events.as_mut());
    tokio::select! {
        event = recv_or_pending(connection) => LinkEvent::Connection(event),
        event = recv_or_pending(channel) => LinkEvent::Channel(event),
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

struct Driver {
    config: DuetConfig,
    factory: Arc<dyn ConnectionFactory>,
    signaling: SignalingClient,
    signaling_events: mpsc::UnboundedReceiver<SignalingEvent>,
    commands: mpsc::UnboundedReceiver<PeerCommand>,
    session: SessionTracker,
    /// Last remote seen, kept while the remote is briefly absent.
    last_remote: Option<String>,
    link: Option<Link>,
    reliable: ReliableLayer,
    keepalive: Keepalive,
    governor: RestartGovernor,
    handlers: Arc<Handlers>,
    terminated: Arc<Mutex<Option<TerminalReason>>>,
    joined: Option<oneshot::Sender<Result<Role, PeerError>>>,
    close_reply: Option<oneshot::Sender<()>>,
}

impl Driver {
    #[allow(clippy::too_many_arguments)]
    fn new(
        config: DuetConfig,
        identity: String,
        factory: Arc<dyn ConnectionFactory>,
        signaling: SignalingClient,
        signaling_events: mpsc::UnboundedReceiver<SignalingEvent>,
        commands: mpsc::UnboundedReceiver<PeerCommand>,
        handlers: Arc<Handlers>,
        terminated: Arc<Mutex<Option<TerminalReason>>>,
        joined: oneshot::Sender<Result<Role, PeerError>>,
    ) -> Self {
        let now = Instant::now();
        Self {
            reliable: ReliableLayer::new(config.reliable, now),
            keepalive: Keepalive::new(config.keepalive),
            governor: RestartGovernor::new(
                config.negotiation.restart,
                config.negotiation.restart_window,
            ),
            config,
            factory,
            signaling,
            signaling_events,
            commands,
            session: SessionTracker::new(identity),
            last_remote: None,
            link: None,
            handlers,
            terminated,
            joined: Some(joined),
            close_reply: None,
        }
    }

    async fn run(mut self) {
        loop {
            let deadline = self.next_deadline();
            let flow = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => Flow::Stop,
                },
                event = self.signaling_events.recv() => match event {
                    Some(event) => self.on_signaling_event(event).await,
                    None => Flow::Stop,
                },
                event = next_link_event(&mut self.link) => {
                    match event {
                        LinkEvent::Connection(event) => self.on_connection_event(event).await,
                        LinkEvent::Channel(event) => self.on_channel_event(event).await,
                    }
                    Flow::Continue
                }
                _ = sleep_until_opt(deadline) => {
                    self.on_timers().await;
                    Flow::Continue
                }
            };
            if flow == Flow::Stop {
                break;
            }
        }
        self.shutdown().await;
    }

    async fn shutdown(&mut self) {
        self.teardown_link().await;
        self.signaling.close();
        if let Some(reply) = self.close_reply.take() {
            let _ = reply.send(());
        }
        debug!(target = "duet::peer", identity = %self.session.local_identity(), "driver stopped");
    }

    fn next_deadline(&self) -> Option<Instant> {
        [
            self.link.as_ref().and_then(Link::next_deadline),
            self.reliable.next_deadline(),
            self.keepalive.next_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn on_command(&mut self, command: PeerCommand) -> Flow {
        match command {
            PeerCommand::SendReliable {
                message_type,
                payload,
                reply,
            } => {
                let result = self.reliable.send(&message_type, payload, Instant::now());
                let _ = reply.send(result);
                self.pump();
            }
            PeerCommand::SendRaw {
                message_type,
                data,
                reply,
            } => {
                let sent = self.reliable.send_raw(&message_type, data);
                let _ = reply.send(sent);
                self.pump();
            }
            PeerCommand::Status { reply } => {
                let _ = reply.send(self.status());
            }
            PeerCommand::Close { reply } => {
                self.close_reply = Some(reply);
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    fn status(&self) -> PeerStatus {
        PeerStatus {
            identity: self.session.local_identity().to_string(),
            role: self.session.role(),
            remote: self.session.remote_identity().map(str::to_string),
            epoch: self.session.epoch(),
            channel_open: self
                .link
                .as_ref()
                .and_then(|link| link.channel.as_ref())
                .is_some_and(|channel| channel.open),
            pending: self.reliable.pending_len(),
            connection: self
                .link
                .as_ref()
                .map(|link| link.negotiator.connection().connection_state()),
            rtt: self.reliable.last_rtt(),
        }
    }

    async fn on_signaling_event(&mut self, event: SignalingEvent) -> Flow {
        match event {
            SignalingEvent::Connected { attempt } => {
                debug!(target = "duet::peer", attempt, "signaling up");
            }
            SignalingEvent::Disconnected { reason } => {
                info!(target = "duet::peer", %reason, "signaling down; will rejoin");
            }
            SignalingEvent::Message(message) => self.on_server_message(message).await,
            SignalingEvent::Terminal(reason) => {
                let err = PeerError::from(&reason);
                *self.terminated.lock() = Some(reason);
                match self.joined.take() {
                    Some(joined) => {
                        let _ = joined.send(Err(err));
                    }
                    None => error!(target = "duet::peer", error = %err, "removed from room"),
                }
                return Flow::Stop;
            }
            SignalingEvent::GaveUp | SignalingEvent::Closed => {
                if let Some(joined) = self.joined.take() {
                    let _ = joined.send(Err(PeerError::SignalingClosed));
                }
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    async fn on_server_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Role {
                room_id,
                role,
                peer_list,
            } => self.on_role(room_id, role, peer_list).await,
            ServerMessage::Signal {
                from,
                epoch,
                kind,
                data,
                ..
            } => {
                if self.session.remote_identity() != Some(from.as_str()) {
                    debug!(target = "duet::peer", %from, "signal from a peer that is not our remote");
                    return;
                }
                match RemotePayload::from_signal(kind, data) {
                    Ok(payload) => self.on_remote_signal(epoch, payload).await,
                    Err(err) => warn!(target = "duet::peer", error = %err, "dropping signal"),
                }
            }
            ServerMessage::PeerJoined { peer_identity } => {
                info!(target = "duet::peer", %peer_identity, "peer joined");
            }
            ServerMessage::PeerLeft { peer_identity } => {
                info!(target = "duet::peer", %peer_identity, "peer left");
            }
            other => trace!(target = "duet::peer", relay_message = ?other, "relay message"),
        }
    }

    async fn on_role(&mut self, room_id: String, role: Role, peer_list: Vec<String>) {
        let remote = peer_list
            .iter()
            .find(|peer| peer.as_str() != self.session.local_identity())
            .cloned();
        info!(
            target = "duet::peer",
            %room_id,
            %role,
            remote = ?remote,
            "role assigned"
        );
        self.session.set_role(role);
        if let Some(joined) = self.joined.take() {
            let _ = joined.send(Ok(role));
        }

        if let Some(remote) = &remote {
            if self.last_remote.as_ref().is_some_and(|last| last != remote) {
                info!(target = "duet::peer", %remote, "remote peer replaced; failing in-flight messages");
                self.reliable.reset_remote();
                self.pump();
            }
            self.last_remote = Some(remote.clone());
        }
        if !self.session.set_remote(remote) {
            self.session.reset_remote_epoch();
        }
        self.reliable.forget_remote_epoch();

        let create_channel = role == Role::Second && self.session.remote_identity().is_some();
        self.rebuild(create_channel).await;
    }

    async fn on_remote_signal(&mut self, epoch: u64, payload: RemotePayload) {
        let Some(link) = self.link.as_mut() else {
            debug!(target = "duet::peer", "no connection for signal");
            return;
        };
        let outcome = link
            .negotiator
            .handle_remote(&mut self.session, epoch, payload)
            .await;
        match outcome {
            Ok(RemoteOutcome::Applied {
                answer: Some(answer),
            }) => self.send_signal(OutboundSignal::description(&answer)),
            Ok(RemoteOutcome::RemoteRestarted { description }) => {
                let is_offer = description.is_offer();
                let role = self.session.role();
                self.rebuild(!is_offer && role == Some(Role::Second)).await;
                if is_offer {
                    self.replay_offer(epoch, description).await;
                }
            }
            Ok(outcome) => trace!(target = "duet::peer", ?outcome, "remote signal handled"),
            Err(err) => warn!(target = "duet::peer", error = %err, "failed to handle remote signal"),
        }
    }

    async fn replay_offer(&mut self, epoch: u64, offer: duet_proto::SessionDescription) {
        let Some(link) = self.link.as_mut() else {
            return;
        };
        match link
            .negotiator
            .handle_remote(&mut self.session, epoch, RemotePayload::Description(offer))
            .await
        {
            Ok(RemoteOutcome::Applied {
                answer: Some(answer),
            }) => self.send_signal(OutboundSignal::description(&answer)),
            Ok(outcome) => debug!(target = "duet::peer", ?outcome, "replayed offer"),
            Err(err) => warn!(target = "duet::peer", error = %err, "failed to replay offer"),
        }
    }

    async fn teardown_link(&mut self) {
        if let Some(link) = self.link.take() {
            if link.shutdown().await {
                self.channel_down(Instant::now());
            }
        }
    }

    /// Drop the current connection, advance the epoch and, when a remote is
    /// present, start a fresh one.
    async fn rebuild(&mut self, create_channel: bool) {
        self.teardown_link().await;
        let now = Instant::now();
        let epoch = self.session.bump_epoch();
        self.reliable.set_epoch(epoch, now);
        debug!(target = "duet::peer", epoch, create_channel, "rebuilding connection");

        let Some(role) = self.session.role() else {
            return;
        };
        if self.session.remote_identity().is_none() {
            return;
        }

        let (pc, events) = match self.factory.create().await {
            Ok(created) => created,
            Err(err) => {
                error!(target = "duet::peer", error = %err, "failed to create peer connection");
                return;
            }
        };
        let mut link = Link {
            negotiator: Negotiator::new(pc.clone(), role),
            events: Some(events),
            channel: None,
            negotiate_at: None,
            restart_at: None,
            candidates: CandidateBatch::new(self.config.negotiation.candidate_batch),
        };
        if create_channel {
            match pc.create_data_channel(&self.config.channel_label).await {
                Ok(channel) => link.channel = Some(self.attach_channel(channel)),
                Err(err) => error!(target = "duet::peer", error = %err, "failed to create data channel"),
            }
        }
        self.link = Some(link);
    }

    fn attach_channel(&self, channel: Arc<dyn DataChannel>) -> ChannelLink {
        let gate = BackpressureGate::new(self.config.backpressure);
        let (writer, writer_task) = spawn_writer(channel.clone(), gate.clone());
        ChannelLink {
            events: channel.take_events(),
            channel,
            writer,
            writer_task,
            gate,
            open: false,
        }
    }

    fn channel_down(&mut self, now: Instant) {
        self.reliable.on_channel_closed(now);
        self.keepalive.on_close();
        self.handlers.channel_close();
    }

    async fn on_connection_event(&mut self, event: Option<ConnectionEvent>) {
        let now = Instant::now();
        let Some(link) = self.link.as_mut() else {
            return;
        };
        let Some(event) = event else {
            link.events = None;
            return;
        };
        trace!(target = "duet::peer", ?event, "connection event");
        match event {
            ConnectionEvent::NegotiationNeeded => {
                link.negotiate_at = Some(now + self.config.negotiation.debounce);
            }
            ConnectionEvent::LocalCandidate(Some(candidate)) => {
                link.candidates.push(candidate, now);
            }
            ConnectionEvent::LocalCandidate(None) => {
                if let Some(batch) = link.candidates.take(now, true) {
                    self.send_signal(OutboundSignal::candidates(batch));
                }
            }
            ConnectionEvent::SignalingStateChanged(state) => {
                if let Some(ice_restart) = link.negotiator.on_signaling_state(state) {
                    self.offer(ice_restart).await;
                }
            }
            ConnectionEvent::ConnectionStateChanged(state) => {
                self.on_connection_state(state, now);
            }
            ConnectionEvent::DataChannel(channel) => {
                info!(target = "duet::peer", label = %channel.label(), "remote opened a data channel");
                let replaced = link.channel.take();
                let attached = self.attach_channel(channel);
                if let Some(link) = self.link.as_mut() {
                    link.channel = Some(attached);
                }
                if let Some(old) = replaced {
                    let was_open = old.open;
                    old.shutdown().await;
                    if was_open {
                        self.channel_down(now);
                    }
                }
            }
        }
    }

    fn on_connection_state(&mut self, state: ConnectionState, now: Instant) {
        let restart_owner = self.session.role() == Some(Role::Second);
        let grace = self.config.negotiation.disconnect_grace;
        let Some(link) = self.link.as_mut() else {
            return;
        };
        info!(target = "duet::peer", ?state, "connection state");
        match state {
            ConnectionState::Connected => {
                link.restart_at = None;
                self.governor.on_connected();
            }
            ConnectionState::Connecting => link.restart_at = None,
            ConnectionState::Disconnected if restart_owner => {
                link.restart_at = Some(now + grace);
            }
            ConnectionState::Failed if restart_owner => link.restart_at = Some(now),
            _ => {}
        }
    }

    async fn on_channel_event(&mut self, event: Option<ChannelEvent>) {
        let now = Instant::now();
        let Some(channel) = self.link.as_mut().and_then(|link| link.channel.as_mut()) else {
            return;
        };
        match event {
            Some(ChannelEvent::Open) => {
                if channel.open {
                    return;
                }
                channel.open = true;
                info!(target = "duet::peer", epoch = self.session.epoch(), "data channel open");
                self.reliable.on_channel_open(now);
                self.reliable.hello(self.session.local_identity());
                self.keepalive.on_open(now);
                self.handlers.channel_open();
                self.pump();
            }
            Some(ChannelEvent::Message(text)) => {
                self.keepalive.on_inbound(now);
                if let Err(err) = self.reliable.on_frame(&text, now) {
                    warn!(target = "duet::peer", error = %err, "dropping data channel frame");
                }
                self.pump();
            }
            Some(ChannelEvent::BufferedAmountLow) => channel.gate.on_buffered_amount_low(),
            Some(ChannelEvent::Close) | None => {
                let was_open = channel.open;
                channel.open = false;
                channel.events = None;
                if was_open {
                    info!(target = "duet::peer", "data channel closed");
                    self.channel_down(now);
                }
            }
        }
    }

    async fn on_timers(&mut self) {
        let now = Instant::now();

        let mut offer_due = false;
        let mut restart_due = false;
        let mut batch = None;
        if let Some(link) = self.link.as_mut() {
            offer_due = link.negotiate_at.is_some_and(|at| at <= now);
            if offer_due {
                link.negotiate_at = None;
            }
            restart_due = link.restart_at.is_some_and(|at| at <= now);
            if restart_due {
                link.restart_at = None;
            }
            batch = link.candidates.take(now, false);
        }
        if let Some(batch) = batch {
            self.send_signal(OutboundSignal::candidates(batch));
        }
        if offer_due {
            self.offer(false).await;
        }
        if restart_due {
            self.restart(now).await;
        }

        self.reliable.poll_timers(now);
        match self.keepalive.poll(now) {
            KeepaliveAction::SendPing => self.reliable.ping(now),
            KeepaliveAction::LivenessLost => {
                warn!(target = "duet::peer", "no traffic from remote; liveness lost");
                self.restart(now).await;
            }
            KeepaliveAction::Idle => {}
        }
        self.pump();
    }

    async fn offer(&mut self, ice_restart: bool) {
        let Some(link) = self.link.as_mut() else {
            return;
        };
        match link.negotiator.negotiation_needed(ice_restart).await {
            Ok(Some(offer)) => self.send_signal(OutboundSignal::description(&offer)),
            Ok(None) => {}
            Err(err) => warn!(target = "duet::peer", error = %err, "failed to create offer"),
        }
    }

    /// ICE restart, rate limited; escalates to a full rebuild once the
    /// per-window ceiling is spent. Only the second member restarts.
    async fn restart(&mut self, now: Instant) {
        if self.session.role() != Some(Role::Second) {
            return;
        }
        let Some(link) = self.link.as_mut() else {
            return;
        };
        match self.governor.check(now) {
            RestartDecision::Allowed => match link.negotiator.restart_ice().await {
                Ok(Some(offer)) => {
                    info!(target = "duet::peer", "issuing ice restart");
                    self.governor.record_restart(now);
                    self.send_signal(OutboundSignal::description(&offer));
                }
                Ok(None) => {}
                Err(err) => warn!(target = "duet::peer", error = %err, "ice restart failed"),
            },
            RestartDecision::CoolingDown { until } => {
                debug!(target = "duet::peer", "restart cooling down");
                link.restart_at = Some(until);
            }
            RestartDecision::Exhausted => {
                if self.governor.take_hard_reset(now) {
                    warn!(target = "duet::peer", "restart ceiling reached; rebuilding connection");
                    self.rebuild(true).await;
                } else {
                    debug!(target = "duet::peer", "restart ceiling reached; waiting for window");
                }
            }
        }
    }

    fn send_signal(&self, signal: OutboundSignal) {
        match self.session.stamp(signal.kind, signal.data) {
            Some(message) => {
                if !self.signaling.send(message) {
                    debug!(target = "duet::peer", "signaling task gone; dropping signal");
                }
            }
            None => debug!(target = "duet::peer", "no remote; dropping signal"),
        }
    }

    /// Hand events to the application and queued frames to the writer.
    fn pump(&mut self) {
        while let Some(event) = self.reliable.poll_event() {
            match event {
                ReliableEvent::Delivered {
                    message_type,
                    payload,
                } => self.handlers.deliver(message_type, payload),
                ReliableEvent::Raw { message_type, data } => {
                    self.handlers.raw(&message_type, &data)
                }
                ReliableEvent::DeliveryFailed(failure) => self.handlers.delivery_failed(&failure),
                ReliableEvent::Hello { identity, epoch } => self.on_hello(&identity, epoch),
                ReliableEvent::RemoteSync { state } => self.handlers.remote_sync(state),
            }
        }
        let writer = self
            .link
            .as_ref()
            .and_then(|link| link.channel.as_ref())
            .filter(|channel| channel.open)
            .map(|channel| channel.writer.clone());
        while let Some(frame) = self.reliable.pop_outbound() {
            match &writer {
                Some(writer) => {
                    if writer.send(frame).is_err() {
                        debug!(target = "duet::peer", "writer stopped; frame dropped");
                    }
                }
                None => trace!(target = "duet::peer", "no open channel; frame dropped"),
            }
        }
    }

    /// The second member answers a hello with its application snapshot.
    fn on_hello(&mut self, identity: &str, epoch: u64) {
        debug!(target = "duet::peer", remote = identity, epoch, "remote said hello");
        if self.session.role() != Some(Role::Second) {
            return;
        }
        if let Some(state) = self.handlers.sync_state() {
            if !self.reliable.send_sync(state) {
                debug!(target = "duet::peer", "channel closed; sync snapshot dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test_timeout::timeout]
    fn reliable_backlog_is_replayed_in_order() {
        let handlers = Handlers::default();
        handlers.deliver("a".into(), json!(1));
        handlers.deliver("b".into(), json!(2));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        handlers.set_reliable(Arc::new(move |kind: &str, payload: &Value| {
            sink.lock().push((kind.to_string(), payload.clone()));
        }));
        handlers.deliver("c".into(), json!(3));

        assert_eq!(
            *seen.lock(),
            vec![
                ("a".to_string(), json!(1)),
                ("b".to_string(), json!(2)),
                ("c".to_string(), json!(3)),
            ]
        );
    }

    #[test_timeout::timeout]
    fn reliable_backlog_drops_oldest_beyond_limit() {
        let handlers = Handlers::default();
        for n in 0..=REPLAY_BACKLOG_LIMIT {
            handlers.deliver("n".into(), json!(n));
        }
        assert_eq!(handlers.reliable.lock().backlog.len(), REPLAY_BACKLOG_LIMIT);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        handlers.set_reliable(Arc::new(move |_: &str, payload: &Value| {
            sink.lock().push(payload.clone());
        }));
        let seen = seen.lock();
        assert_eq!(seen.len(), REPLAY_BACKLOG_LIMIT);
        assert_eq!(seen.first(), Some(&json!(1)));
        assert_eq!(seen.last(), Some(&json!(REPLAY_BACKLOG_LIMIT)));
    }

    #[test_timeout::timeout]
    fn latest_remote_sync_is_replayed_to_late_handler() {
        let handlers = Handlers::default();
        assert_eq!(handlers.sync_state(), None);
        *handlers.sync_provider.lock() = Some(Arc::new(|| Some(json!({"turn": 2}))));
        assert_eq!(handlers.sync_state(), Some(json!({"turn": 2})));

        handlers.remote_sync(json!({"turn": 1}));
        handlers.remote_sync(json!({"turn": 2}));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        handlers.set_remote_sync(Arc::new(move |state: &Value| sink.lock().push(state.clone())));
        handlers.remote_sync(json!({"turn": 3}));
        assert_eq!(*seen.lock(), vec![json!({"turn": 2}), json!({"turn": 3})]);
    }

    #[test_timeout::timeout]
    fn terminal_reasons_map_to_errors() {
        assert!(matches!(
            PeerError::from(&TerminalReason::RoomFull { room_id: "r".into() }),
            PeerError::RoomFull(room) if room == "r"
        ));
        assert!(matches!(
            PeerError::from(&TerminalReason::Evicted { room_id: "r".into() }),
            PeerError::Evicted(_)
        ));
    }
}
