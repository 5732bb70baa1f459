use std::env;
use std::str::FromStr;
use std::time::Duration;

use clap::ValueEnum;
use thiserror::Error;

/// What happens when a third identity joins a room that already holds two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FullRoomPolicy {
    /// The joiner receives `room-full` and is not admitted.
    Reject,
    /// The oldest member receives `evicted` and the joiner takes its place.
    EvictOldest,
}

#[derive(Debug, Error)]
#[error("unknown full-room policy `{0}` (expected `reject` or `evict-oldest`)")]
pub struct UnknownPolicy(String);

impl FromStr for FullRoomPolicy {
    type Err = UnknownPolicy;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(FullRoomPolicy::Reject),
            "evict-oldest" | "evict_oldest" | "evict" => Ok(FullRoomPolicy::EvictOldest),
            other => Err(UnknownPolicy(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub full_room_policy: FullRoomPolicy,
    /// Members silent for longer than this are removed from their room.
    pub heartbeat_timeout: Duration,
    pub heartbeat_sweep_interval: Duration,
    pub metrics_enabled: bool,
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let port = env::var("DUET_RELAY_PORT")
            .or_else(|_| env::var("PORT"))
            .ok()
            .and_then(|val| val.parse().ok())
            .unwrap_or(defaults.port);
        let full_room_policy = env::var("DUET_RELAY_FULL_ROOM_POLICY")
            .ok()
            .and_then(|val| val.parse().ok())
            .unwrap_or(defaults.full_room_policy);
        let heartbeat_timeout = env::var("DUET_RELAY_HEARTBEAT_TIMEOUT_SECS")
            .ok()
            .and_then(|val| val.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.heartbeat_timeout);
        let heartbeat_sweep_interval = env::var("DUET_RELAY_HEARTBEAT_SWEEP_SECS")
            .ok()
            .and_then(|val| val.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.heartbeat_sweep_interval);
        let metrics_enabled = env::var("DUET_RELAY_METRICS")
            .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
            .unwrap_or(defaults.metrics_enabled);

        Self {
            port,
            full_room_policy,
            heartbeat_timeout,
            heartbeat_sweep_interval,
            metrics_enabled,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            full_room_policy: FullRoomPolicy::Reject,
            heartbeat_timeout: Duration::from_secs(45),
            heartbeat_sweep_interval: Duration::from_secs(15),
            metrics_enabled: true,
        }
    }
}
