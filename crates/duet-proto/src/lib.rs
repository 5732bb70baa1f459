//! Signaling wire protocol shared by the duet relay and its clients.
//! Frames are JSON text messages tagged by `type`; field names are camelCase
//! so browser peers can speak the same protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Maximum number of members a room will hold.
pub const ROOM_CAPACITY: usize = 2;

/// Position-derived role of a room member.
///
/// `First` is the earlier joiner and never yields during an offer collision.
/// `Second` is the later joiner: it yields, opens the data channel and owns
/// connection restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    First,
    Second,
}

impl Role {
    /// Role for the member at `index` in join order.
    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(Role::First),
            1 => Some(Role::Second),
            _ => None,
        }
    }

    pub fn is_polite(self) -> bool {
        matches!(self, Role::Second)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::First => "first",
            Role::Second => "second",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a relayed `signal` carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Description,
    Candidate,
    CandidateBatch,
}

/// Messages sent from a client to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Join {
        room_id: String,
        peer_identity: String,
    },
    Signal {
        to: String,
        epoch: u64,
        kind: SignalKind,
        data: Value,
    },
    Leave,
    Ping,
}

/// Messages sent from the relay to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Sent to every member whenever room membership changes.
    Role {
        room_id: String,
        role: Role,
        peer_list: Vec<String>,
    },
    PeerJoined {
        peer_identity: String,
    },
    PeerLeft {
        peer_identity: String,
    },
    Signal {
        from: String,
        to: String,
        epoch: u64,
        kind: SignalKind,
        data: Value,
    },
    RoomFull {
        room_id: String,
    },
    Evicted {
        room_id: String,
    },
    Pong,
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description as carried inside a `description` signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    #[serde(default)]
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn is_offer(&self) -> bool {
        self.sdp_type == SdpType::Offer
    }
}

/// Connectivity candidate as carried inside `candidate` and
/// `candidate-batch` signals.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    /// Stable key used to suppress duplicate candidates.
    pub fn fingerprint(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.candidate,
            self.sdp_mid.as_deref().unwrap_or(""),
            self.sdp_m_line_index
                .map(|index| index.to_string())
                .unwrap_or_default(),
            self.username_fragment.as_deref().unwrap_or("")
        )
    }
}

pub fn generate_peer_identity() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn join_uses_camel_case_fields() {
        let message = ClientMessage::Join {
            room_id: "lobby".into(),
            peer_identity: "alice".into(),
        };
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({"type": "join", "roomId": "lobby", "peerIdentity": "alice"})
        );
    }

    #[test]
    fn relayed_signal_parses_from_browser_shape() {
        let raw = json!({
            "type": "signal",
            "from": "a",
            "to": "b",
            "epoch": 3,
            "kind": "candidate-batch",
            "data": [{"candidate": "candidate:1", "sdpMid": "0", "sdpMLineIndex": 0}]
        });
        let parsed: ServerMessage = serde_json::from_value(raw).unwrap();
        match parsed {
            ServerMessage::Signal { epoch, kind, data, .. } => {
                assert_eq!(epoch, 3);
                assert_eq!(kind, SignalKind::CandidateBatch);
                let batch: Vec<IceCandidate> = serde_json::from_value(data).unwrap();
                assert_eq!(batch[0].sdp_m_line_index, Some(0));
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn unit_variants_carry_only_type() {
        assert_eq!(
            serde_json::to_string(&ServerMessage::Pong).unwrap(),
            r#"{"type":"pong"}"#
        );
        assert_eq!(
            serde_json::to_value(ServerMessage::RoomFull { room_id: "r".into() }).unwrap(),
            json!({"type": "room-full", "roomId": "r"})
        );
    }

    #[test]
    fn roles_follow_join_order() {
        assert_eq!(Role::from_index(0), Some(Role::First));
        assert_eq!(Role::from_index(1), Some(Role::Second));
        assert_eq!(Role::from_index(2), None);
        assert!(Role::Second.is_polite());
        assert!(!Role::First.is_polite());
    }

    #[test]
    fn fingerprint_distinguishes_mid() {
        let a = IceCandidate {
            candidate: "candidate:1".into(),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
            username_fragment: None,
        };
        let mut b = a.clone();
        assert_eq!(a.fingerprint(), b.fingerprint());
        b.sdp_mid = Some("1".into());
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
