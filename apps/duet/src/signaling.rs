//! Signaling socket with automatic reconnect.
//!
//! One task owns the websocket. It joins the room on every (re)connect,
//! heartbeats with `ping`, and reconnects with jittered exponential backoff
//! until the room turns it away or the client is closed.

use std::time::Duration;

use duet_proto::{ClientMessage, ServerMessage};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{error::ProtocolError, Error as WsError, Message};
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::backoff::{Backoff, RetryPolicy};

pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_RECONNECT: RetryPolicy =
    RetryPolicy::new(Duration::from_millis(500), Duration::from_secs(5)).with_jitter(0.2);

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("invalid signaling url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignalingConfig {
    pub url: String,
    pub ping_interval: Duration,
    pub connect_timeout: Duration,
    pub reconnect: RetryPolicy,
}

impl SignalingConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ping_interval: DEFAULT_PING_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnect: DEFAULT_RECONNECT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalReason {
    RoomFull { room_id: String },
    Evicted { room_id: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    /// Socket is up and `join` has been sent.
    Connected { attempt: u32 },
    Message(ServerMessage),
    Disconnected { reason: String },
    /// The relay refused or removed us; no reconnect follows.
    Terminal(TerminalReason),
    /// Reconnect attempts are exhausted.
    GaveUp,
    Closed,
}

enum Command {
    Send(ClientMessage),
    Close,
}

enum SessionEnd {
    Lost(String),
    Terminal(TerminalReason),
    Closed,
}

/// Handle to the signaling task.
pub struct SignalingClient {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl SignalingClient {
    pub fn spawn(
        config: SignalingConfig,
        room_id: String,
        peer_identity: String,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SignalingEvent>), SignalingError> {
        let url = websocket_url(&config.url)?;
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::unbounded_channel();
        let controller = ReconnectController {
            config,
            url,
            room_id,
            peer_identity,
            commands: command_rx,
            events: event_tx,
        };
        let task = tokio::spawn(controller.run());
        Ok((Self { commands, task }, events))
    }

    /// Queue a message for the relay. Messages issued while the socket is
    /// down are dropped; the rejoin resets negotiation anyway.
    pub fn send(&self, message: ClientMessage) -> bool {
        self.commands.send(Command::Send(message)).is_ok()
    }

    /// Send `leave`, close the socket and stop reconnecting.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Close);
    }
}

struct ReconnectController {
    config: SignalingConfig,
    url: Url,
    room_id: String,
    peer_identity: String,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<SignalingEvent>,
}

impl ReconnectController {
    async fn run(mut self) {
        let mut backoff = Backoff::new(self.config.reconnect);
        let mut attempt = 0u32;
        loop {
            attempt = attempt.saturating_add(1);
            debug!(target = "duet::signaling", url = %self.url, attempt, "connecting");
            match timeout(self.config.connect_timeout, connect_async(self.url.as_str())).await {
                Ok(Ok((stream, _))) => {
                    if self.discard_stale_commands() {
                        self.emit(SignalingEvent::Closed);
                        return;
                    }
                    info!(target = "duet::signaling", url = %self.url, attempt, "signaling connected");
                    self.emit(SignalingEvent::Connected { attempt });
                    match self.session(stream, &mut backoff).await {
                        SessionEnd::Closed => {
                            self.emit(SignalingEvent::Closed);
                            return;
                        }
                        SessionEnd::Terminal(reason) => {
                            info!(target = "duet::signaling", ?reason, "relay ended the session");
                            self.emit(SignalingEvent::Terminal(reason));
                            return;
                        }
                        SessionEnd::Lost(reason) => {
                            warn!(target = "duet::signaling", %reason, "signaling connection lost");
                            self.emit(SignalingEvent::Disconnected { reason });
                        }
                    }
                }
                Ok(Err(err)) => {
                    warn!(target = "duet::signaling", error = %err, attempt, "signaling connect failed");
                }
                Err(_) => {
                    warn!(target = "duet::signaling", attempt, "signaling connect timed out");
                }
            }

            let Some(delay) = backoff.next_delay() else {
                warn!(target = "duet::signaling", attempt, "giving up on signaling");
                self.emit(SignalingEvent::GaveUp);
                return;
            };
            debug!(target = "duet::signaling", delay_ms = delay.as_millis() as u64, "reconnecting after delay");
            if !self.wait_disconnected(delay).await {
                self.emit(SignalingEvent::Closed);
                return;
            }
        }
    }

    /// Sleep out the backoff delay. Returns `false` if the client was closed.
    async fn wait_disconnected(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                command = self.commands.recv() => match command {
                    Some(Command::Send(message)) => {
                        trace!(target = "duet::signaling", ?message, "dropping signal while disconnected");
                    }
                    Some(Command::Close) | None => return false,
                },
            }
        }
    }

    /// Drop sends queued before this connection existed. Returns `true` if a
    /// close request was among them.
    fn discard_stale_commands(&mut self) -> bool {
        while let Ok(command) = self.commands.try_recv() {
            if matches!(command, Command::Close) {
                return true;
            }
        }
        false
    }

    async fn session<S>(&mut self, stream: S, backoff: &mut Backoff) -> SessionEnd
    where
        S: futures_util::Stream<Item = Result<Message, WsError>>
            + futures_util::Sink<Message, Error = WsError>
            + Unpin,
    {
        let (mut write, mut read) = stream.split();

        let join = ClientMessage::Join {
            room_id: self.room_id.clone(),
            peer_identity: self.peer_identity.clone(),
        };
        if let Err(reason) = send_json(&mut write, &join).await {
            return SessionEnd::Lost(reason);
        }

        let period = self.config.ping_interval;
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Send(message)) => {
                        if let Err(reason) = send_json(&mut write, &message).await {
                            return SessionEnd::Lost(reason);
                        }
                    }
                    Some(Command::Close) | None => {
                        let _ = send_json(&mut write, &ClientMessage::Leave).await;
                        let _ = write.close().await;
                        return SessionEnd::Closed;
                    }
                },
                _ = heartbeat.tick() => {
                    if let Err(reason) = send_json(&mut write, &ClientMessage::Ping).await {
                        return SessionEnd::Lost(reason);
                    }
                }
                frame = read.next() => {
                    let text = match frame {
                        Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
                        Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                            Ok(text) => text.to_owned(),
                            Err(_) => continue,
                        },
                        Some(Ok(Message::Close(_))) | None => {
                            return SessionEnd::Lost("socket closed by relay".into());
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(err)) => {
                            if !matches!(
                                err,
                                WsError::ConnectionClosed
                                    | WsError::AlreadyClosed
                                    | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake)
                            ) {
                                warn!(target = "duet::signaling", error = %err, "signaling websocket error");
                            }
                            return SessionEnd::Lost(err.to_string());
                        }
                    };
                    match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(message) => {
                            if let Some(end) = self.on_server_message(message, backoff) {
                                return end;
                            }
                        }
                        Err(err) => {
                            warn!(target = "duet::signaling", error = %err, "unparseable relay message");
                        }
                    }
                }
            }
        }
    }

    fn on_server_message(
        &mut self,
        message: ServerMessage,
        backoff: &mut Backoff,
    ) -> Option<SessionEnd> {
        match &message {
            ServerMessage::RoomFull { room_id } => {
                return Some(SessionEnd::Terminal(TerminalReason::RoomFull {
                    room_id: room_id.clone(),
                }));
            }
            ServerMessage::Evicted { room_id } => {
                return Some(SessionEnd::Terminal(TerminalReason::Evicted {
                    room_id: room_id.clone(),
                }));
            }
            ServerMessage::Role { .. } => {
                // Joined successfully.
                backoff.reset();
            }
            ServerMessage::Pong => {
                trace!(target = "duet::signaling", "pong");
                return None;
            }
            ServerMessage::Error { message: text } => {
                warn!(target = "duet::signaling", detail = %text, "relay reported an error");
            }
            _ => {}
        }
        self.emit(SignalingEvent::Message(message));
        None
    }

    fn emit(&self, event: SignalingEvent) {
        let _ = self.events.send(event);
    }
}

async fn send_json<W>(write: &mut W, message: &ClientMessage) -> Result<(), String>
where
    W: futures_util::Sink<Message, Error = WsError> + Unpin,
{
    let text = serde_json::to_string(message).map_err(|err| err.to_string())?;
    write
        .send(Message::Text(text.into()))
        .await
        .map_err(|err| err.to_string())
}

/// Accepts `ws(s)://` or `http(s)://` relay addresses; a bare host gets the
/// `/ws` path.
pub fn websocket_url(raw: &str) -> Result<Url, SignalingError> {
    let invalid = |reason: String| SignalingError::InvalidUrl {
        url: raw.to_string(),
        reason,
    };
    let mut url = Url::parse(raw).map_err(|err| invalid(err.to_string()))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => return Err(invalid(format!("unsupported scheme {other}"))),
    };
    url.set_scheme(scheme)
        .map_err(|_| invalid("cannot switch to websocket scheme".into()))?;
    if url.path().is_empty() || url.path() == "/" {
        url.set_path("/ws");
    }
    url.set_fragment(None);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    #[test_timeout::timeout]
    fn websocket_url_normalizes_scheme_and_path() {
        assert_eq!(
            websocket_url("http://127.0.0.1:8080").unwrap().as_str(),
            "ws://127.0.0.1:8080/ws"
        );
        assert_eq!(
            websocket_url("https://relay.example/custom").unwrap().as_str(),
            "wss://relay.example/custom"
        );
        assert!(matches!(
            websocket_url("ftp://relay.example"),
            Err(SignalingError::InvalidUrl { .. })
        ));
    }

    async fn read_client_message<S>(stream: &mut S) -> ClientMessage
    where
        S: futures_util::Stream<Item = Result<Message, WsError>> + Unpin,
    {
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str(text.as_str()).expect("client message")
                }
                Some(Ok(_)) => continue,
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn rejoins_after_the_socket_drops() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut config = SignalingConfig::new(format!("ws://{addr}/ws"));
        config.reconnect = RetryPolicy::new(Duration::from_millis(10), Duration::from_millis(50));

        let (client, mut events) =
            SignalingClient::spawn(config, "room".into(), "me".into()).unwrap();

        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(tcp).await.unwrap();
        let expected_join = ClientMessage::Join {
            room_id: "room".into(),
            peer_identity: "me".into(),
        };
        assert_eq!(read_client_message(&mut ws).await, expected_join);
        drop(ws);

        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(tcp).await.unwrap();
        assert_eq!(read_client_message(&mut ws).await, expected_join);

        let mut saw_disconnect = false;
        while let Some(event) = events.recv().await {
            match event {
                SignalingEvent::Disconnected { .. } => saw_disconnect = true,
                SignalingEvent::Connected { attempt } if saw_disconnect => {
                    assert!(attempt >= 2);
                    break;
                }
                _ => {}
            }
        }

        client.close();
        assert_eq!(read_client_message(&mut ws).await, ClientMessage::Leave);
    }

    #[test_timeout::tokio_timeout_test]
    async fn room_full_is_terminal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, mut events) =
            SignalingClient::spawn(SignalingConfig::new(format!("ws://{addr}")), "r".into(), "x".into())
                .unwrap();

        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(tcp).await.unwrap();
        read_client_message(&mut ws).await;
        let full = serde_json::to_string(&ServerMessage::RoomFull {
            room_id: "r".into(),
        })
        .unwrap();
        ws.send(Message::Text(full.into())).await.unwrap();

        loop {
            match events.recv().await {
                Some(SignalingEvent::Terminal(reason)) => {
                    assert_eq!(reason, TerminalReason::RoomFull { room_id: "r".into() });
                    break;
                }
                Some(_) => continue,
                None => panic!("event stream ended"),
            }
        }
        assert_eq!(events.recv().await, None);
        assert!(client.is_finished());
    }
}
