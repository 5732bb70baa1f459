use anyhow::{Context, Result};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::rooms::{DropReason, JoinOutcome, RelayOutcome};

pub fn install_recorder() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install Prometheus metrics recorder")
}

pub fn record_join(outcome: &JoinOutcome) {
    match outcome {
        JoinOutcome::Joined { evicted, .. } => {
            counter!("duet_relay_joins_total", 1, "outcome" => "admitted");
            if evicted.is_some() {
                counter!("duet_relay_evictions_total", 1);
            }
        }
        JoinOutcome::Full => {
            counter!("duet_relay_joins_total", 1, "outcome" => "room_full");
        }
    }
}

pub fn record_relay(outcome: RelayOutcome) {
    match outcome {
        RelayOutcome::Delivered => counter!("duet_relay_signals_forwarded_total", 1),
        RelayOutcome::Dropped(reason) => {
            let reason = match reason {
                DropReason::UnknownRoom => "unknown_room",
                DropReason::NotAMember => "not_a_member",
                DropReason::TargetAbsent => "target_absent",
                DropReason::TargetUnreachable => "target_unreachable",
            };
            counter!("duet_relay_signals_dropped_total", 1, "reason" => reason);
        }
    }
}

pub fn record_stale_reaped(count: usize) {
    if count > 0 {
        counter!("duet_relay_stale_members_reaped_total", count as u64);
    }
}

pub fn set_rooms_active(count: usize) {
    gauge!("duet_relay_rooms_active", count as f64);
}
