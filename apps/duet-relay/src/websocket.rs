use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use duet_proto::{ClientMessage, ServerMessage};
use futures_util::{SinkExt, StreamExt};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::metrics;
use crate::rooms::{JoinOutcome, MemberSender, RoomRegistry};

/// Shared relay state handed to every handler.
#[derive(Clone)]
pub struct SignalingState {
    rooms: RoomRegistry,
    config: Arc<Config>,
    metrics: Option<PrometheusHandle>,
}

impl SignalingState {
    /// Must be called inside a Tokio runtime: it starts the heartbeat monitor.
    pub fn new(config: Config, metrics: Option<PrometheusHandle>) -> Self {
        let state = Self {
            rooms: RoomRegistry::new(config.full_room_policy),
            config: Arc::new(config),
            metrics,
        };

        let monitor_state = state.clone();
        tokio::spawn(async move {
            monitor_state.monitor_heartbeats().await;
        });

        state
    }

    pub fn rooms(&self) -> &RoomRegistry {
        &self.rooms
    }

    pub fn metrics_handle(&self) -> Option<&PrometheusHandle> {
        self.metrics.as_ref()
    }

    /// Remove members that stopped sending pings.
    async fn monitor_heartbeats(&self) {
        let mut interval = tokio::time::interval(self.config.heartbeat_sweep_interval);
        loop {
            interval.tick().await;
            let stale = self
                .rooms
                .stale_members(Instant::now(), self.config.heartbeat_timeout);
            metrics::record_stale_reaped(stale.len());
            for member in stale {
                info!(
                    room_id = %member.room_id,
                    identity = %member.identity,
                    "removing stale member (heartbeat timeout)"
                );
                self.rooms
                    .leave(&member.room_id, &member.identity, member.connection_id);
            }
            metrics::set_rooms_active(self.rooms.room_count());
        }
    }
}

/// Per-socket bookkeeping.
struct Connection {
    id: Uuid,
    tx: MemberSender,
    membership: Option<Membership>,
}

struct Membership {
    room_id: String,
    identity: String,
}

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<SignalingState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: SignalingState) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let mut conn = Connection {
        id: Uuid::new_v4(),
        tx,
        membership: None,
    };

    let connection_id = conn.id;
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let terminal = matches!(
                msg,
                ServerMessage::RoomFull { .. } | ServerMessage::Evicted { .. }
            );
            if let Ok(json) = serde_json::to_string(&msg) {
                if sender.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            if terminal {
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
        }
        debug!(%connection_id, "writer task ended");
    });

    debug!(%connection_id, "websocket connected");

    while let Some(msg_result) = receiver.next().await {
        let msg = match msg_result {
            Ok(m) => m,
            Err(e) => {
                debug!(%connection_id, error = %e, "websocket error");
                break;
            }
        };

        let text = match msg {
            Message::Text(text) => text,
            Message::Binary(data) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => {
                    debug!(%connection_id, "ignoring non-utf8 binary frame");
                    continue;
                }
            },
            Message::Close(_) => break,
            _ => continue,
        };

        match serde_json::from_str::<ClientMessage>(&text) {
            Ok(client_msg) => {
                handle_client_message(client_msg, &mut conn, &state);
            }
            Err(e) => {
                warn!(%connection_id, error = %e, "failed to parse client message");
                let _ = conn.tx.send(ServerMessage::Error {
                    message: format!("invalid message format: {e}"),
                });
            }
        }
        if writer.is_finished() {
            break;
        }
    }

    if let Some(membership) = conn.membership.take() {
        state
            .rooms
            .leave(&membership.room_id, &membership.identity, conn.id);
        metrics::set_rooms_active(state.rooms.room_count());
    }
    writer.abort();
    debug!(%connection_id, "websocket disconnected");
}

fn handle_client_message(
    message: ClientMessage,
    conn: &mut Connection,
    state: &SignalingState,
) {
    match message {
        ClientMessage::Join {
            room_id,
            peer_identity,
        } => {
            if room_id.is_empty() || peer_identity.is_empty() {
                let _ = conn.tx.send(ServerMessage::Error {
                    message: "join requires roomId and peerIdentity".into(),
                });
                return;
            }
            if let Some(previous) = conn.membership.take() {
                if previous.room_id != room_id || previous.identity != peer_identity {
                    state
                        .rooms
                        .leave(&previous.room_id, &previous.identity, conn.id);
                }
            }
            let outcome = state
                .rooms
                .join(&room_id, &peer_identity, conn.id, conn.tx.clone());
            metrics::record_join(&outcome);
            metrics::set_rooms_active(state.rooms.room_count());
            match outcome {
                JoinOutcome::Joined { role, .. } => {
                    info!(%room_id, %peer_identity, %role, "join accepted");
                    conn.membership = Some(Membership {
                        room_id,
                        identity: peer_identity,
                    });
                }
                // The writer closes the socket after delivering `room-full`.
                JoinOutcome::Full => {}
            }
        }
        ClientMessage::Signal {
            to,
            epoch,
            kind,
            data,
        } => {
            let Some(membership) = conn.membership.as_ref() else {
                let _ = conn.tx.send(ServerMessage::Error {
                    message: "signal before join".into(),
                });
                return;
            };
            let outcome = state.rooms.relay(
                &membership.room_id,
                &membership.identity,
                conn.id,
                &to,
                epoch,
                kind,
                data,
            );
            metrics::record_relay(outcome);
        }
        ClientMessage::Leave => {
            if let Some(membership) = conn.membership.take() {
                state
                    .rooms
                    .leave(&membership.room_id, &membership.identity, conn.id);
                metrics::set_rooms_active(state.rooms.room_count());
            }
        }
        ClientMessage::Ping => {
            if let Some(membership) = conn.membership.as_ref() {
                state
                    .rooms
                    .touch(&membership.room_id, &membership.identity, conn.id);
            }
            let _ = conn.tx.send(ServerMessage::Pong);
        }
    }
}
