use std::env;
use std::time::Duration;

use crate::backoff::RetryPolicy;
use crate::reliable::backpressure::BackpressureConfig;
use crate::reliable::chunk::ChunkConfig;
use crate::reliable::keepalive::KeepaliveConfig;
use crate::reliable::ReliableConfig;
use crate::signaling::SignalingConfig;
use crate::transport::webrtc::DEFAULT_STUN_URL;

pub const DEFAULT_SIGNAL_URL: &str = "ws://127.0.0.1:8080/ws";
pub const DEFAULT_RESTART_POLICY: RetryPolicy =
    RetryPolicy::new(Duration::from_secs(5), Duration::from_secs(15)).with_max_attempts(3);

/// Timers of the negotiation and restart paths.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NegotiationConfig {
    /// Bursts of renegotiation requests inside this window collapse into one offer.
    pub debounce: Duration,
    pub candidate_batch: Duration,
    /// How long a `disconnected` connection may recover on its own.
    pub disconnect_grace: Duration,
    /// Cooldown between restarts and the per-window ceiling.
    pub restart: RetryPolicy,
    pub restart_window: Duration,
    /// `Peer::connect` gives up if no role arrives in time.
    pub join_timeout: Duration,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(120),
            candidate_batch: Duration::from_millis(30),
            disconnect_grace: Duration::from_secs(2),
            restart: DEFAULT_RESTART_POLICY,
            restart_window: Duration::from_secs(60),
            join_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DuetConfig {
    /// Stable identity across restarts; a fresh UUID when unset.
    pub identity: Option<String>,
    pub signaling: SignalingConfig,
    pub negotiation: NegotiationConfig,
    pub reliable: ReliableConfig,
    pub keepalive: KeepaliveConfig,
    pub backpressure: BackpressureConfig,
    pub ice_servers: Vec<String>,
    /// Label of the data channel opened by the second member.
    pub channel_label: String,
}

impl Default for DuetConfig {
    fn default() -> Self {
        Self {
            identity: None,
            signaling: SignalingConfig::new(DEFAULT_SIGNAL_URL),
            negotiation: NegotiationConfig::default(),
            reliable: ReliableConfig::default(),
            keepalive: KeepaliveConfig::default(),
            backpressure: BackpressureConfig::default(),
            ice_servers: vec![DEFAULT_STUN_URL.to_string()],
            channel_label: "duet".to_string(),
        }
    }
}

impl DuetConfig {
    /// Defaults overridden by `DUET_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = env::var("DUET_SIGNAL_URL") {
            config.signaling.url = url;
        }
        config.identity = env::var("DUET_PEER_IDENTITY")
            .ok()
            .filter(|value| !value.trim().is_empty());
        if let Ok(servers) = env::var("DUET_ICE_SERVERS") {
            config.ice_servers = parse_list(&servers);
        }
        if let Some(ms) = env_millis("DUET_NEGOTIATION_DEBOUNCE_MS") {
            config.negotiation.debounce = ms;
        }
        if let Some(ms) = env_millis("DUET_CANDIDATE_BATCH_MS") {
            config.negotiation.candidate_batch = ms;
        }
        if let Some(ms) = env_millis("DUET_KEEPALIVE_INTERVAL_MS") {
            config.keepalive.interval = ms;
        }
        if let Some(ms) = env_millis("DUET_KEEPALIVE_IDLE_MS") {
            config.keepalive.idle_timeout = ms;
        }
        config.reliable.chunk = ChunkConfig::from_env();
        config
    }
}

fn env_millis(var: &str) -> Option<Duration> {
    env::var(var)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn defaults_match_documented_timers() {
        let config = DuetConfig::default();
        assert_eq!(config.negotiation.debounce, Duration::from_millis(120));
        assert_eq!(config.negotiation.restart.max_attempts, Some(3));
        assert_eq!(config.keepalive.interval, Duration::from_millis(2_500));
        assert_eq!(config.reliable.dedup_window, 256);
        assert_eq!(config.reliable.chunk.threshold, 12_000);
        assert_eq!(config.backpressure.high_water, 4 * 1024 * 1024);
        assert_eq!(config.channel_label, "duet");
    }

    #[test_timeout::timeout]
    fn ice_server_list_ignores_blanks() {
        assert_eq!(
            parse_list("stun:a:3478, ,turn:b:3478"),
            vec!["stun:a:3478".to_string(), "turn:b:3478".to_string()]
        );
        assert!(parse_list("").is_empty());
    }
}
