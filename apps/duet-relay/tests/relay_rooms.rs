use std::net::SocketAddr;
use std::time::Duration;

use duet_proto::{ClientMessage, Role, ServerMessage, SignalKind};
use duet_relay::{Config, FullRoomPolicy, SignalingState};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_relay(policy: FullRoomPolicy) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = Config {
        full_room_policy: policy,
        metrics_enabled: false,
        ..Config::default()
    };
    let state = SignalingState::new(config, None);
    tokio::spawn(async move {
        let _ = duet_relay::serve(listener, state).await;
    });
    addr
}

async fn connect(addr: SocketAddr) -> Socket {
    let (socket, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    socket
}

async fn send(socket: &mut Socket, message: &ClientMessage) {
    let text = serde_json::to_string(message).unwrap();
    socket.send(Message::Text(text.into())).await.unwrap();
}

async fn join(socket: &mut Socket, room: &str, identity: &str) {
    send(
        socket,
        &ClientMessage::Join {
            room_id: room.into(),
            peer_identity: identity.into(),
        },
    )
    .await;
}

async fn recv(socket: &mut Socket) -> Option<ServerMessage> {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for relay")?;
        match frame.ok()? {
            Message::Text(text) => return Some(serde_json::from_str(text.as_str()).unwrap()),
            Message::Close(_) => return None,
            _ => continue,
        }
    }
}

/// Read until a `role` message arrives.
async fn recv_role(socket: &mut Socket) -> (Role, Vec<String>) {
    loop {
        match recv(socket).await {
            Some(ServerMessage::Role {
                role, peer_list, ..
            }) => return (role, peer_list),
            Some(_) => continue,
            None => panic!("socket closed before role"),
        }
    }
}

#[test_timeout::tokio_timeout_test]
async fn two_joiners_get_complementary_roles_and_relay_signals() {
    let addr = spawn_relay(FullRoomPolicy::Reject).await;
    let mut alice = connect(addr).await;
    let mut bob = connect(addr).await;

    join(&mut alice, "lobby", "alice").await;
    assert_eq!(recv_role(&mut alice).await, (Role::First, vec!["alice".to_string()]));

    join(&mut bob, "lobby", "bob").await;
    assert_eq!(
        recv_role(&mut bob).await,
        (Role::Second, vec!["alice".to_string(), "bob".to_string()])
    );
    assert_eq!(recv(&mut alice).await, Some(ServerMessage::PeerJoined {
        peer_identity: "bob".into()
    }));
    assert_eq!(recv_role(&mut alice).await.0, Role::First);

    send(
        &mut bob,
        &ClientMessage::Signal {
            to: "alice".into(),
            epoch: 1,
            kind: SignalKind::Description,
            data: json!({"type": "offer", "sdp": "v=0"}),
        },
    )
    .await;
    match recv(&mut alice).await {
        Some(ServerMessage::Signal {
            from, epoch, kind, ..
        }) => {
            assert_eq!(from, "bob");
            assert_eq!(epoch, 1);
            assert_eq!(kind, SignalKind::Description);
        }
        other => panic!("expected relayed signal, got {other:?}"),
    }
}

#[test_timeout::tokio_timeout_test]
async fn third_joiner_is_told_room_full() {
    let addr = spawn_relay(FullRoomPolicy::Reject).await;
    let mut a = connect(addr).await;
    let mut b = connect(addr).await;
    let mut c = connect(addr).await;
    join(&mut a, "r", "a").await;
    recv_role(&mut a).await;
    join(&mut b, "r", "b").await;
    recv_role(&mut b).await;

    join(&mut c, "r", "c").await;
    assert_eq!(
        recv(&mut c).await,
        Some(ServerMessage::RoomFull { room_id: "r".into() })
    );
}

#[test_timeout::tokio_timeout_test]
async fn evict_policy_replaces_oldest_member() {
    let addr = spawn_relay(FullRoomPolicy::EvictOldest).await;
    let mut a = connect(addr).await;
    let mut b = connect(addr).await;
    let mut c = connect(addr).await;
    join(&mut a, "r", "a").await;
    recv_role(&mut a).await;
    join(&mut b, "r", "b").await;
    recv_role(&mut b).await;
    recv_role(&mut a).await;

    join(&mut c, "r", "c").await;
    assert_eq!(recv_role(&mut c).await.0, Role::Second);
    loop {
        match recv(&mut a).await {
            Some(ServerMessage::Evicted { room_id }) => {
                assert_eq!(room_id, "r");
                break;
            }
            Some(_) => continue,
            None => panic!("evicted member never told"),
        }
    }
    assert_eq!(
        recv_role(&mut b).await,
        (Role::First, vec!["b".to_string(), "c".to_string()])
    );
}

#[test_timeout::tokio_timeout_test]
async fn disconnect_notifies_remaining_member() {
    let addr = spawn_relay(FullRoomPolicy::Reject).await;
    let mut a = connect(addr).await;
    let mut b = connect(addr).await;
    join(&mut a, "r", "a").await;
    recv_role(&mut a).await;
    join(&mut b, "r", "b").await;
    recv_role(&mut b).await;

    a.close(None).await.unwrap();
    assert_eq!(
        recv(&mut b).await,
        Some(ServerMessage::PeerLeft {
            peer_identity: "a".into()
        })
    );
    assert_eq!(recv_role(&mut b).await, (Role::First, vec!["b".to_string()]));
}

#[test_timeout::tokio_timeout_test]
async fn ping_is_answered_with_pong() {
    let addr = spawn_relay(FullRoomPolicy::Reject).await;
    let mut a = connect(addr).await;
    send(&mut a, &ClientMessage::Ping).await;
    assert_eq!(recv(&mut a).await, Some(ServerMessage::Pong));
}
