use duet_proto::{ClientMessage, Role, SignalKind};
use serde_json::Value;
use tracing::debug;

/// Result of comparing an inbound epoch with the last one seen from the
/// current remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochCheck {
    /// Older than the last-seen epoch; the envelope must be dropped.
    Stale,
    Current,
    /// Newer than anything seen so far (or the first epoch seen).
    Advanced { previous: Option<u64> },
}

/// Owns local identity, role and the session epoch.
#[derive(Debug, Clone)]
pub struct SessionTracker {
    local_identity: String,
    role: Option<Role>,
    remote_identity: Option<String>,
    epoch: u64,
    remote_epoch: Option<u64>,
}

impl SessionTracker {
    pub fn new(local_identity: impl Into<String>) -> Self {
        Self {
            local_identity: local_identity.into(),
            role: None,
            remote_identity: None,
            epoch: 0,
            remote_epoch: None,
        }
    }

    pub fn local_identity(&self) -> &str {
        &self.local_identity
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn set_role(&mut self, role: Role) {
        self.role = Some(role);
    }

    pub fn remote_identity(&self) -> Option<&str> {
        self.remote_identity.as_deref()
    }

    /// Returns `true` when the remote identity changed. A new remote restarts
    /// its own epoch counter, so the last-seen remote epoch is forgotten.
    pub fn set_remote(&mut self, remote: Option<String>) -> bool {
        if self.remote_identity == remote {
            return false;
        }
        debug!(
            target = "duet::session",
            previous = ?self.remote_identity,
            next = ?remote,
            "remote peer changed"
        );
        self.remote_identity = remote;
        self.remote_epoch = None;
        true
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn bump_epoch(&mut self) -> u64 {
        self.epoch = self.epoch.saturating_add(1);
        self.epoch
    }

    pub fn remote_epoch(&self) -> Option<u64> {
        self.remote_epoch
    }

    /// Forget the last-seen remote epoch. A role change may come from a
    /// remote that restarted its process and its epoch counter.
    pub fn reset_remote_epoch(&mut self) {
        self.remote_epoch = None;
    }

    pub fn observe_remote_epoch(&mut self, epoch: u64) -> EpochCheck {
        match self.remote_epoch {
            Some(seen) if epoch < seen => EpochCheck::Stale,
            Some(seen) if epoch == seen => EpochCheck::Current,
            previous => {
                self.remote_epoch = Some(epoch);
                EpochCheck::Advanced { previous }
            }
        }
    }

    /// Wrap a signal for the current remote, stamped with the current epoch.
    pub fn stamp(&self, kind: SignalKind, data: Value) -> Option<ClientMessage> {
        let to = self.remote_identity.clone()?;
        Some(ClientMessage::Signal {
            to,
            epoch: self.epoch,
            kind,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn older_epochs_are_stale() {
        let mut session = SessionTracker::new("me");
        assert_eq!(
            session.observe_remote_epoch(2),
            EpochCheck::Advanced { previous: None }
        );
        assert_eq!(session.observe_remote_epoch(2), EpochCheck::Current);
        assert_eq!(
            session.observe_remote_epoch(5),
            EpochCheck::Advanced { previous: Some(2) }
        );
        assert_eq!(session.observe_remote_epoch(3), EpochCheck::Stale);
        assert_eq!(session.remote_epoch(), Some(5));
    }

    #[test_timeout::timeout]
    fn new_remote_forgets_epoch() {
        let mut session = SessionTracker::new("me");
        session.set_remote(Some("a".into()));
        session.observe_remote_epoch(9);
        assert!(!session.set_remote(Some("a".into())));
        assert_eq!(session.remote_epoch(), Some(9));
        assert!(session.set_remote(Some("b".into())));
        assert_eq!(
            session.observe_remote_epoch(1),
            EpochCheck::Advanced { previous: None }
        );
        session.reset_remote_epoch();
        assert_eq!(session.remote_epoch(), None);
    }

    #[test_timeout::timeout]
    fn stamp_uses_current_epoch_and_remote() {
        let mut session = SessionTracker::new("me");
        assert!(session.stamp(SignalKind::Candidate, Value::Null).is_none());
        session.set_remote(Some("peer".into()));
        session.bump_epoch();
        session.bump_epoch();
        assert_eq!(
            session.stamp(SignalKind::Candidate, Value::Null),
            Some(ClientMessage::Signal {
                to: "peer".into(),
                epoch: 2,
                kind: SignalKind::Candidate,
                data: Value::Null,
            })
        );
    }
}
