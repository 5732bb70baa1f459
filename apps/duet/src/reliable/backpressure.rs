use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::transport::DataChannel;

pub const DEFAULT_HIGH_WATER: usize = 4 * 1024 * 1024;
pub const DEFAULT_LOW_WATER: usize = 512 * 1024;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackpressureConfig {
    pub high_water: usize,
    pub low_water: usize,
    /// Fallback re-check when the low-water callback never fires.
    pub poll_interval: Duration,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            high_water: DEFAULT_HIGH_WATER,
            low_water: DEFAULT_LOW_WATER,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Holds writes while the channel's send buffer is above the high-water mark.
#[derive(Debug, Clone)]
pub struct BackpressureGate {
    config: BackpressureConfig,
    resume: Arc<Notify>,
}

impl BackpressureGate {
    pub fn new(config: BackpressureConfig) -> Self {
        Self {
            config,
            resume: Arc::new(Notify::new()),
        }
    }

    pub fn config(&self) -> BackpressureConfig {
        self.config
    }

    /// Wake a writer parked in [`Self::wait_for_capacity`].
    pub fn on_buffered_amount_low(&self) {
        self.resume.notify_one();
    }

    /// Returns `true` if the writer had to wait.
    pub async fn wait_for_capacity(&self, channel: &dyn DataChannel) -> bool {
        let buffered = channel.buffered_amount().await;
        if buffered <= self.config.high_water {
            return false;
        }
        debug!(
            target = "duet::reliable::backpressure",
            buffered,
            high = self.config.high_water,
            "send buffer above high water; pausing writes"
        );
        loop {
            let _ = timeout(self.config.poll_interval, self.resume.notified()).await;
            if !channel.is_open() {
                return true;
            }
            let buffered = channel.buffered_amount().await;
            if buffered <= self.config.low_water {
                debug!(
                    target = "duet::reliable::backpressure",
                    buffered, "send buffer drained; resuming writes"
                );
                return true;
            }
        }
    }
}

/// Spawn the task that writes frames to `channel` in order, under `gate`.
pub fn spawn_writer(
    channel: Arc<dyn DataChannel>,
    gate: BackpressureGate,
) -> (mpsc::UnboundedSender<String>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let handle = tokio::spawn(async move {
        let low = gate.config().low_water;
        channel.set_buffered_amount_low_threshold(low).await;
        while let Some(frame) = rx.recv().await {
            gate.wait_for_capacity(channel.as_ref()).await;
            let len = frame.len();
            match timeout(SEND_TIMEOUT, channel.send_text(frame)).await {
                Ok(Ok(())) => {
                    trace!(target = "duet::reliable::backpressure", len, "sent frame");
                }
                Ok(Err(err)) => {
                    warn!(target = "duet::reliable::backpressure", error = %err, "channel send failed");
                    break;
                }
                Err(_) => {
                    warn!(target = "duet::reliable::backpressure", "channel send timed out");
                    break;
                }
            }
        }
        trace!(target = "duet::reliable::backpressure", "writer loop ended");
    });
    (tx, handle)
}
