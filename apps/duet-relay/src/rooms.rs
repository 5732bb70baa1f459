//! Authoritative room table.
//!
//! Every mutation of a room happens while holding its `DashMap` entry, so
//! joins, leaves and relays for the same room are serialized. Roles are never
//! stored: they are derived from a member's position whenever membership
//! changes and pushed to every member.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use duet_proto::{Role, ServerMessage, SignalKind, ROOM_CAPACITY};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::FullRoomPolicy;

pub type MemberSender = mpsc::UnboundedSender<ServerMessage>;

#[derive(Debug)]
struct Member {
    identity: String,
    connection_id: Uuid,
    tx: MemberSender,
    last_heartbeat: Instant,
}

#[derive(Debug, Default)]
struct Room {
    /// Join order; index 0 is the `first` role.
    members: Vec<Member>,
}

impl Room {
    fn position(&self, identity: &str) -> Option<usize> {
        self.members.iter().position(|m| m.identity == identity)
    }

    fn peer_list(&self) -> Vec<String> {
        self.members.iter().map(|m| m.identity.clone()).collect()
    }

    /// Push each member its current role along with the peer list.
    fn announce_roles(&self, room_id: &str) {
        let peer_list = self.peer_list();
        for (index, member) in self.members.iter().enumerate() {
            let Some(role) = Role::from_index(index) else {
                continue;
            };
            let _ = member.tx.send(ServerMessage::Role {
                room_id: room_id.to_string(),
                role,
                peer_list: peer_list.clone(),
            });
        }
    }

    fn broadcast_except(&self, identity: &str, message: &ServerMessage) {
        for member in self.members.iter().filter(|m| m.identity != identity) {
            let _ = member.tx.send(message.clone());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined {
        role: Role,
        /// The identity was already present and its connection was swapped.
        replaced: bool,
        evicted: Option<String>,
    },
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    UnknownRoom,
    NotAMember,
    TargetAbsent,
    TargetUnreachable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Delivered,
    Dropped(DropReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleMember {
    pub room_id: String,
    pub identity: String,
    pub connection_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct RoomRegistry {
    rooms: Arc<DashMap<String, Room>>,
    policy: FullRoomPolicy,
}

impl RoomRegistry {
    pub fn new(policy: FullRoomPolicy) -> Self {
        Self {
            rooms: Arc::new(DashMap::new()),
            policy,
        }
    }

    pub fn policy(&self) -> FullRoomPolicy {
        self.policy
    }

    /// Admit `identity` into `room_id`, creating the room if needed.
    ///
    /// A rejected joiner is told `room-full` on `tx`; an evicted member is
    /// told `evicted` on its own channel before being dropped.
    pub fn join(
        &self,
        room_id: &str,
        identity: &str,
        connection_id: Uuid,
        tx: MemberSender,
    ) -> JoinOutcome {
        let mut room = self.rooms.entry(room_id.to_string()).or_default();
        let now = Instant::now();

        if let Some(index) = room.position(identity) {
            let member = &mut room.members[index];
            member.connection_id = connection_id;
            member.tx = tx;
            member.last_heartbeat = now;
            debug!(room_id, identity, "member connection replaced");
            room.announce_roles(room_id);
            return JoinOutcome::Joined {
                role: Role::from_index(index).unwrap_or(Role::Second),
                replaced: true,
                evicted: None,
            };
        }

        let mut evicted = None;
        if room.members.len() >= ROOM_CAPACITY {
            match self.policy {
                FullRoomPolicy::Reject => {
                    info!(room_id, identity, "room full, rejecting join");
                    let _ = tx.send(ServerMessage::RoomFull {
                        room_id: room_id.to_string(),
                    });
                    return JoinOutcome::Full;
                }
                FullRoomPolicy::EvictOldest => {
                    let oldest = room.members.remove(0);
                    info!(room_id, evicted = %oldest.identity, joiner = identity, "evicting oldest member");
                    let _ = oldest.tx.send(ServerMessage::Evicted {
                        room_id: room_id.to_string(),
                    });
                    room.broadcast_except(
                        &oldest.identity,
                        &ServerMessage::PeerLeft {
                            peer_identity: oldest.identity.clone(),
                        },
                    );
                    evicted = Some(oldest.identity);
                }
            }
        }

        room.members.push(Member {
            identity: identity.to_string(),
            connection_id,
            tx,
            last_heartbeat: now,
        });
        room.broadcast_except(
            identity,
            &ServerMessage::PeerJoined {
                peer_identity: identity.to_string(),
            },
        );
        room.announce_roles(room_id);

        let index = room.members.len() - 1;
        info!(room_id, identity, members = room.members.len(), "member joined");
        JoinOutcome::Joined {
            role: Role::from_index(index).unwrap_or(Role::Second),
            replaced: false,
            evicted,
        }
    }

    /// Remove a member if `connection_id` still owns its slot. Returns whether
    /// anything was removed. Empty rooms are deleted.
    pub fn leave(&self, room_id: &str, identity: &str, connection_id: Uuid) -> bool {
        let removed = match self.rooms.get_mut(room_id) {
            Some(mut room) => match room.position(identity) {
                Some(index) if room.members[index].connection_id == connection_id => {
                    room.members.remove(index);
                    room.broadcast_except(
                        identity,
                        &ServerMessage::PeerLeft {
                            peer_identity: identity.to_string(),
                        },
                    );
                    room.announce_roles(room_id);
                    true
                }
                _ => false,
            },
            None => false,
        };

        if removed {
            info!(room_id, identity, "member left");
            if self
                .rooms
                .remove_if(room_id, |_, room| room.members.is_empty())
                .is_some()
            {
                debug!(room_id, "room destroyed");
            }
        }
        removed
    }

    /// Forward a signal to `to`, stamping the sender. Never queues.
    #[allow(clippy::too_many_arguments)]
    pub fn relay(
        &self,
        room_id: &str,
        from: &str,
        connection_id: Uuid,
        to: &str,
        epoch: u64,
        kind: SignalKind,
        data: Value,
    ) -> RelayOutcome {
        let Some(room) = self.rooms.get(room_id) else {
            return RelayOutcome::Dropped(DropReason::UnknownRoom);
        };
        let sender_ok = room
            .members
            .iter()
            .any(|m| m.identity == from && m.connection_id == connection_id);
        if !sender_ok {
            warn!(room_id, from, "signal from non-member dropped");
            return RelayOutcome::Dropped(DropReason::NotAMember);
        }
        let Some(target) = room.members.iter().find(|m| m.identity == to && m.identity != from)
        else {
            debug!(room_id, from, to, "signal target absent, dropping");
            return RelayOutcome::Dropped(DropReason::TargetAbsent);
        };
        let message = ServerMessage::Signal {
            from: from.to_string(),
            to: to.to_string(),
            epoch,
            kind,
            data,
        };
        match target.tx.send(message) {
            Ok(()) => RelayOutcome::Delivered,
            Err(_) => RelayOutcome::Dropped(DropReason::TargetUnreachable),
        }
    }

    /// Refresh a member's heartbeat.
    pub fn touch(&self, room_id: &str, identity: &str, connection_id: Uuid) {
        if let Some(mut room) = self.rooms.get_mut(room_id) {
            if let Some(member) = room
                .members
                .iter_mut()
                .find(|m| m.identity == identity && m.connection_id == connection_id)
            {
                member.last_heartbeat = Instant::now();
            }
        }
    }

    /// Members whose last heartbeat is older than `timeout` as of `now`.
    pub fn stale_members(&self, now: Instant, timeout: Duration) -> Vec<StaleMember> {
        let mut stale = Vec::new();
        for room in self.rooms.iter() {
            for member in &room.members {
                if now.saturating_duration_since(member.last_heartbeat) > timeout {
                    stale.push(StaleMember {
                        room_id: room.key().clone(),
                        identity: member.identity.clone(),
                        connection_id: member.connection_id,
                    });
                }
            }
        }
        stale
    }

    /// Members of a room with their current roles, in join order.
    pub fn snapshot(&self, room_id: &str) -> Option<Vec<(String, Role)>> {
        self.rooms.get(room_id).map(|room| {
            room.members
                .iter()
                .enumerate()
                .filter_map(|(index, m)| Role::from_index(index).map(|r| (m.identity.clone(), r)))
                .collect()
        })
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn member() -> (Uuid, MemberSender, UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Uuid::new_v4(), tx, rx)
    }

    fn drain(rx: &mut UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            out.push(message);
        }
        out
    }

    fn last_role(messages: &[ServerMessage]) -> Option<(Role, Vec<String>)> {
        messages.iter().rev().find_map(|m| match m {
            ServerMessage::Role {
                role, peer_list, ..
            } => Some((*role, peer_list.clone())),
            _ => None,
        })
    }

    #[test_timeout::timeout]
    fn roles_follow_join_order() {
        let rooms = RoomRegistry::new(FullRoomPolicy::Reject);
        let (a_id, a_tx, mut a_rx) = member();
        let (b_id, b_tx, mut b_rx) = member();

        assert_eq!(
            rooms.join("r", "a", a_id, a_tx),
            JoinOutcome::Joined {
                role: Role::First,
                replaced: false,
                evicted: None
            }
        );
        rooms.join("r", "b", b_id, b_tx);

        let a_msgs = drain(&mut a_rx);
        assert!(a_msgs
            .iter()
            .any(|m| matches!(m, ServerMessage::PeerJoined { peer_identity } if peer_identity == "b")));
        assert_eq!(
            last_role(&a_msgs),
            Some((Role::First, vec!["a".to_string(), "b".to_string()]))
        );
        assert_eq!(
            last_role(&drain(&mut b_rx)),
            Some((Role::Second, vec!["a".to_string(), "b".to_string()]))
        );
    }

    #[test_timeout::timeout]
    fn third_join_is_rejected_under_reject_policy() {
        let rooms = RoomRegistry::new(FullRoomPolicy::Reject);
        let (a_id, a_tx, _a_rx) = member();
        let (b_id, b_tx, _b_rx) = member();
        let (c_id, c_tx, mut c_rx) = member();
        rooms.join("r", "a", a_id, a_tx);
        rooms.join("r", "b", b_id, b_tx);

        assert_eq!(rooms.join("r", "c", c_id, c_tx), JoinOutcome::Full);
        assert_eq!(
            drain(&mut c_rx),
            vec![ServerMessage::RoomFull {
                room_id: "r".into()
            }]
        );
        assert_eq!(rooms.snapshot("r").map(|m| m.len()), Some(2));
    }

    #[test_timeout::timeout]
    fn third_join_evicts_oldest_under_evict_policy() {
        let rooms = RoomRegistry::new(FullRoomPolicy::EvictOldest);
        let (a_id, a_tx, mut a_rx) = member();
        let (b_id, b_tx, mut b_rx) = member();
        let (c_id, c_tx, mut c_rx) = member();
        rooms.join("r", "a", a_id, a_tx);
        rooms.join("r", "b", b_id, b_tx);
        drain(&mut b_rx);

        assert_eq!(
            rooms.join("r", "c", c_id, c_tx),
            JoinOutcome::Joined {
                role: Role::Second,
                replaced: false,
                evicted: Some("a".into())
            }
        );
        assert!(drain(&mut a_rx)
            .iter()
            .any(|m| matches!(m, ServerMessage::Evicted { .. })));
        // b slides into the first slot.
        assert_eq!(
            last_role(&drain(&mut b_rx)),
            Some((Role::First, vec!["b".to_string(), "c".to_string()]))
        );
        assert_eq!(last_role(&drain(&mut c_rx)).map(|r| r.0), Some(Role::Second));
    }

    #[test_timeout::timeout]
    fn rejoin_keeps_position_and_stale_leave_is_ignored() {
        let rooms = RoomRegistry::new(FullRoomPolicy::Reject);
        let (a_old, a_tx, _a_rx) = member();
        let (b_id, b_tx, _b_rx) = member();
        rooms.join("r", "a", a_old, a_tx);
        rooms.join("r", "b", b_id, b_tx);

        let (a_new, a_tx2, mut a_rx2) = member();
        assert_eq!(
            rooms.join("r", "a", a_new, a_tx2),
            JoinOutcome::Joined {
                role: Role::First,
                replaced: true,
                evicted: None
            }
        );
        assert_eq!(last_role(&drain(&mut a_rx2)).map(|r| r.0), Some(Role::First));

        // The old socket closing must not remove the new connection.
        assert!(!rooms.leave("r", "a", a_old));
        assert_eq!(rooms.snapshot("r").map(|m| m.len()), Some(2));
        assert!(rooms.leave("r", "a", a_new));
    }

    #[test_timeout::timeout]
    fn leave_notifies_remaining_member_and_empty_room_is_destroyed() {
        let rooms = RoomRegistry::new(FullRoomPolicy::Reject);
        let (a_id, a_tx, _a_rx) = member();
        let (b_id, b_tx, mut b_rx) = member();
        rooms.join("r", "a", a_id, a_tx);
        rooms.join("r", "b", b_id, b_tx);
        drain(&mut b_rx);

        assert!(rooms.leave("r", "a", a_id));
        let b_msgs = drain(&mut b_rx);
        assert!(b_msgs
            .iter()
            .any(|m| matches!(m, ServerMessage::PeerLeft { peer_identity } if peer_identity == "a")));
        assert_eq!(last_role(&b_msgs), Some((Role::First, vec!["b".to_string()])));

        assert!(rooms.leave("r", "b", b_id));
        assert_eq!(rooms.room_count(), 0);
        assert!(rooms.snapshot("r").is_none());
    }

    #[test_timeout::timeout]
    fn relay_is_addressed_and_stamped() {
        let rooms = RoomRegistry::new(FullRoomPolicy::Reject);
        let (a_id, a_tx, _a_rx) = member();
        let (b_id, b_tx, mut b_rx) = member();
        rooms.join("r", "a", a_id, a_tx);
        rooms.join("r", "b", b_id, b_tx);
        drain(&mut b_rx);

        let outcome = rooms.relay(
            "r",
            "a",
            a_id,
            "b",
            4,
            SignalKind::Description,
            serde_json::json!({"type": "offer", "sdp": "x"}),
        );
        assert_eq!(outcome, RelayOutcome::Delivered);
        match drain(&mut b_rx).as_slice() {
            [ServerMessage::Signal { from, epoch, .. }] => {
                assert_eq!(from, "a");
                assert_eq!(*epoch, 4);
            }
            other => panic!("unexpected {other:?}"),
        }

        assert_eq!(
            rooms.relay("r", "a", a_id, "ghost", 1, SignalKind::Candidate, Value::Null),
            RelayOutcome::Dropped(DropReason::TargetAbsent)
        );
        assert_eq!(
            rooms.relay("r", "a", Uuid::new_v4(), "b", 1, SignalKind::Candidate, Value::Null),
            RelayOutcome::Dropped(DropReason::NotAMember)
        );
        assert_eq!(
            rooms.relay("nope", "a", a_id, "b", 1, SignalKind::Candidate, Value::Null),
            RelayOutcome::Dropped(DropReason::UnknownRoom)
        );
    }

    #[test_timeout::timeout]
    fn stale_members_are_reported_after_timeout() {
        let rooms = RoomRegistry::new(FullRoomPolicy::Reject);
        let (a_id, a_tx, _a_rx) = member();
        rooms.join("r", "a", a_id, a_tx);

        let now = Instant::now();
        assert!(rooms.stale_members(now, Duration::from_secs(30)).is_empty());
        let later = now + Duration::from_secs(31);
        assert_eq!(
            rooms.stale_members(later, Duration::from_secs(30)),
            vec![StaleMember {
                room_id: "r".into(),
                identity: "a".into(),
                connection_id: a_id
            }]
        );
    }
}
