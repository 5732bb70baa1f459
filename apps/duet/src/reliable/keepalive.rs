use std::time::Duration;

use tokio::time::Instant;

pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_millis(2_500);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(8);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveConfig {
    pub interval: Duration,
    pub idle_timeout: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_PING_INTERVAL,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveAction {
    Idle,
    SendPing,
    /// Nothing arrived within the idle timeout. Reported once per silence.
    LivenessLost,
}

/// Ping scheduling and liveness tracking for an open channel.
#[derive(Debug)]
pub struct Keepalive {
    config: KeepaliveConfig,
    next_ping: Option<Instant>,
    last_inbound: Option<Instant>,
    lost: bool,
}

impl Keepalive {
    pub fn new(config: KeepaliveConfig) -> Self {
        Self {
            config,
            next_ping: None,
            last_inbound: None,
            lost: false,
        }
    }

    pub fn on_open(&mut self, now: Instant) {
        self.next_ping = Some(now + self.config.interval);
        self.last_inbound = Some(now);
        self.lost = false;
    }

    pub fn on_inbound(&mut self, now: Instant) {
        if self.last_inbound.is_some() {
            self.last_inbound = Some(now);
            self.lost = false;
        }
    }

    pub fn on_close(&mut self) {
        self.next_ping = None;
        self.last_inbound = None;
        self.lost = false;
    }

    pub fn is_active(&self) -> bool {
        self.next_ping.is_some()
    }

    pub fn poll(&mut self, now: Instant) -> KeepaliveAction {
        let Some(last_inbound) = self.last_inbound else {
            return KeepaliveAction::Idle;
        };
        if !self.lost && now.saturating_duration_since(last_inbound) >= self.config.idle_timeout {
            self.lost = true;
            return KeepaliveAction::LivenessLost;
        }
        match self.next_ping {
            Some(at) if at <= now => {
                self.next_ping = Some(now + self.config.interval);
                KeepaliveAction::SendPing
            }
            _ => KeepaliveAction::Idle,
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        let idle = match (self.last_inbound, self.lost) {
            (Some(last), false) => Some(last + self.config.idle_timeout),
            _ => None,
        };
        match (self.next_ping, idle) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}
