//! Acknowledged delivery over an ordered, best-effort data channel.
//!
//! [`ReliableLayer`] does no I/O. The peer driver feeds it inbound frames and
//! the current time, then drains frames to write and events to surface.

pub mod backpressure;
pub mod chunk;
pub mod keepalive;

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::backoff::RetryPolicy;
use chunk::{split_message, ChunkConfig, ChunkError, ChunkFrame, Reassembler};

pub const DEFAULT_DEDUP_WINDOW: usize = 256;
pub const DEFAULT_HOLD_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_RETRY: RetryPolicy =
    RetryPolicy::new(Duration::from_millis(400), Duration::from_secs(4)).with_max_attempts(5);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReliableConfig {
    /// `max_attempts` counts retransmissions after the first send.
    pub retry: RetryPolicy,
    /// How long a message may wait for a closed channel to open before it
    /// is reported as undeliverable.
    pub hold_timeout: Duration,
    pub dedup_window: usize,
    pub chunk: ChunkConfig,
}

impl Default for ReliableConfig {
    fn default() -> Self {
        Self {
            retry: DEFAULT_RETRY,
            hold_timeout: DEFAULT_HOLD_TIMEOUT,
            dedup_window: DEFAULT_DEDUP_WINDOW,
            chunk: ChunkConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ReliableError {
    #[error("payload could not be serialized: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("frame could not be parsed: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("invalid chunk fragment encoding: {0}")]
    Fragment(#[from] base64::DecodeError),
    #[error(transparent)]
    Chunk(#[from] ChunkError),
}

/// A data-channel frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum Frame {
    Reliable {
        seq: u64,
        epoch: u64,
        #[serde(rename = "type")]
        message_type: String,
        body: Body,
    },
    Ack {
        seq: u64,
        epoch: u64,
    },
    Raw {
        #[serde(rename = "type")]
        message_type: String,
        data: Value,
    },
    Ping {
        sent_at_ms: u64,
    },
    Pong {
        sent_at_ms: u64,
    },
    /// Sent by each side when the channel opens.
    Hello {
        id: String,
        epoch: u64,
    },
    /// Application state snapshot, sent by the second member in reply to `hello`.
    Sync {
        state: Value,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Body {
    Payload(Value),
    Chunk(ChunkMeta),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMeta {
    pub message_id: String,
    pub index: u32,
    pub total: u32,
    /// Base64 slice of the serialized payload.
    pub fragment: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    RetriesExhausted,
    /// The remote peer was replaced before the message was acknowledged.
    SessionReset,
    /// No channel opened within the hold timeout.
    ChannelUnavailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    pub message_id: String,
    pub message_type: String,
    pub reason: FailureReason,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReliableEvent {
    Delivered { message_type: String, payload: Value },
    Raw { message_type: String, data: Value },
    DeliveryFailed(DeliveryFailure),
    Hello { identity: String, epoch: u64 },
    RemoteSync { state: Value },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Timer {
    Retransmit(Instant),
    /// Waiting for the channel; fails the message when it fires.
    Hold(Instant),
}

impl Timer {
    fn at(self) -> Instant {
        match self {
            Timer::Retransmit(at) | Timer::Hold(at) => at,
        }
    }
}

#[derive(Debug)]
struct Pending {
    message_id: String,
    message_type: String,
    body: Body,
    retransmissions: u32,
    timer: Timer,
}

/// Sequence numbers start at a random offset so a restarted process that
/// reuses its identity does not collide with the remote's dedup window.
fn initial_seq() -> u64 {
    u64::from(rand::random::<u32>()) + 1
}

pub struct ReliableLayer {
    config: ReliableConfig,
    origin: Instant,
    next_seq: u64,
    epoch: u64,
    channel_open: bool,
    pending: BTreeMap<u64, Pending>,
    seen_order: VecDeque<u64>,
    seen: HashSet<u64>,
    remote_epoch: Option<u64>,
    reassembler: Reassembler,
    outbound: VecDeque<String>,
    events: VecDeque<ReliableEvent>,
    last_rtt: Option<Duration>,
}

impl ReliableLayer {
    pub fn new(config: ReliableConfig, now: Instant) -> Self {
        Self {
            config,
            origin: now,
            next_seq: initial_seq(),
            epoch: 0,
            channel_open: false,
            pending: BTreeMap::new(),
            seen_order: VecDeque::new(),
            seen: HashSet::new(),
            remote_epoch: None,
            reassembler: Reassembler::new(config.chunk),
            outbound: VecDeque::new(),
            events: VecDeque::new(),
            last_rtt: None,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn last_rtt(&self) -> Option<Duration> {
        self.last_rtt
    }

    /// Queue `payload` for acknowledged delivery. Returns its message id.
    pub fn send(
        &mut self,
        message_type: &str,
        payload: Value,
        now: Instant,
    ) -> Result<String, ReliableError> {
        let serialized = serde_json::to_vec(&payload).map_err(ReliableError::Encode)?;
        let message_id = Uuid::new_v4().to_string();

        let bodies = if self.config.chunk.needs_split(serialized.len()) {
            split_message(&serialized, &message_id, &self.config.chunk)?
                .into_iter()
                .map(|frame| {
                    Body::Chunk(ChunkMeta {
                        message_id: frame.message_id,
                        index: frame.index,
                        total: frame.total,
                        fragment: BASE64.encode(&frame.payload),
                    })
                })
                .collect()
        } else {
            vec![Body::Payload(payload)]
        };

        debug!(
            target = "duet::reliable",
            %message_id,
            message_type,
            fragments = bodies.len(),
            bytes = serialized.len(),
            "queued reliable message"
        );

        for body in bodies {
            let seq = self.next_seq;
            self.next_seq += 1;
            let timer = if self.channel_open {
                Timer::Retransmit(now + self.config.retry.delay(0))
            } else {
                Timer::Hold(now + self.config.hold_timeout)
            };
            let entry = Pending {
                message_id: message_id.clone(),
                message_type: message_type.to_string(),
                body,
                retransmissions: 0,
                timer,
            };
            if self.channel_open {
                self.transmit(seq, &entry);
            }
            self.pending.insert(seq, entry);
        }
        Ok(message_id)
    }

    /// Best-effort frame; dropped when the channel is not open.
    pub fn send_raw(&mut self, message_type: &str, data: Value) -> bool {
        if !self.channel_open {
            return false;
        }
        self.push_frame(&Frame::Raw {
            message_type: message_type.to_string(),
            data,
        });
        true
    }

    pub fn ping(&mut self, now: Instant) {
        if self.channel_open {
            let sent_at_ms = self.millis_since_origin(now);
            self.push_frame(&Frame::Ping { sent_at_ms });
        }
    }

    /// Announce ourselves to the remote. Returns `false` if the channel is closed.
    pub fn hello(&mut self, identity: &str) -> bool {
        if !self.channel_open {
            return false;
        }
        self.push_frame(&Frame::Hello {
            id: identity.to_string(),
            epoch: self.epoch,
        });
        true
    }

    pub fn send_sync(&mut self, state: Value) -> bool {
        if !self.channel_open {
            return false;
        }
        self.push_frame(&Frame::Sync { state });
        true
    }

    pub fn on_channel_open(&mut self, now: Instant) {
        self.channel_open = true;
        self.flush_pending(now);
    }

    /// Unacknowledged entries stop retransmitting and start their hold timer.
    pub fn on_channel_closed(&mut self, now: Instant) {
        self.channel_open = false;
        self.outbound.clear();
        let hold = Timer::Hold(now + self.config.hold_timeout);
        for entry in self.pending.values_mut() {
            entry.timer = hold;
        }
    }

    /// Move to a new local epoch. Unacknowledged entries go out again at once
    /// under the new epoch if the channel is open.
    pub fn set_epoch(&mut self, epoch: u64, now: Instant) {
        if epoch == self.epoch {
            return;
        }
        debug!(
            target = "duet::reliable",
            previous = self.epoch,
            epoch,
            pending = self.pending.len(),
            "reliable epoch advanced"
        );
        self.epoch = epoch;
        if self.channel_open {
            self.flush_pending(now);
        }
    }

    /// The remote peer was replaced: fail everything in flight and forget all
    /// receive-side state.
    pub fn reset_remote(&mut self) {
        let mut failed: Vec<String> = Vec::new();
        for entry in std::mem::take(&mut self.pending).into_values() {
            if failed.contains(&entry.message_id) {
                continue;
            }
            failed.push(entry.message_id.clone());
            self.events.push_back(ReliableEvent::DeliveryFailed(DeliveryFailure {
                message_id: entry.message_id,
                message_type: entry.message_type,
                reason: FailureReason::SessionReset,
            }));
        }
        self.seen.clear();
        self.seen_order.clear();
        self.remote_epoch = None;
        self.reassembler.clear();
        self.outbound.clear();
    }

    /// Accept any epoch from the remote again; the dedup window is kept.
    pub fn forget_remote_epoch(&mut self) {
        self.remote_epoch = None;
    }

    pub fn on_frame(&mut self, text: &str, now: Instant) -> Result<(), ReliableError> {
        let frame: Frame = serde_json::from_str(text).map_err(ReliableError::Decode)?;
        match frame {
            Frame::Reliable {
                seq,
                epoch,
                message_type,
                body,
            } => self.on_reliable(seq, epoch, message_type, body, now),
            Frame::Ack { seq, epoch } => {
                if self.pending.remove(&seq).is_some() {
                    trace!(target = "duet::reliable", seq, epoch, "acknowledged");
                }
                Ok(())
            }
            Frame::Raw { message_type, data } => {
                self.events.push_back(ReliableEvent::Raw { message_type, data });
                Ok(())
            }
            Frame::Ping { sent_at_ms } => {
                self.push_frame(&Frame::Pong { sent_at_ms });
                Ok(())
            }
            Frame::Pong { sent_at_ms } => {
                let rtt = self.millis_since_origin(now).saturating_sub(sent_at_ms);
                self.last_rtt = Some(Duration::from_millis(rtt));
                trace!(target = "duet::reliable", rtt_ms = rtt, "pong");
                Ok(())
            }
            Frame::Hello { id, epoch } => {
                if self.remote_epoch.is_none() {
                    self.remote_epoch = Some(epoch);
                }
                self.events.push_back(ReliableEvent::Hello {
                    identity: id,
                    epoch,
                });
                Ok(())
            }
            Frame::Sync { state } => {
                self.events.push_back(ReliableEvent::RemoteSync { state });
                Ok(())
            }
        }
    }

    fn on_reliable(
        &mut self,
        seq: u64,
        epoch: u64,
        message_type: String,
        body: Body,
        now: Instant,
    ) -> Result<(), ReliableError> {
        if let Some(remote) = self.remote_epoch {
            if epoch < remote {
                debug!(
                    target = "duet::reliable",
                    seq, epoch, remote, "dropping stale retransmission"
                );
                return Ok(());
            }
        }
        self.remote_epoch = Some(self.remote_epoch.map_or(epoch, |remote| remote.max(epoch)));

        self.push_frame(&Frame::Ack { seq, epoch });
        if !self.remember(seq) {
            trace!(target = "duet::reliable", seq, "duplicate suppressed");
            return Ok(());
        }

        match body {
            Body::Payload(payload) => {
                self.events.push_back(ReliableEvent::Delivered {
                    message_type,
                    payload,
                });
            }
            Body::Chunk(meta) => {
                let payload = Bytes::from(BASE64.decode(meta.fragment.as_bytes())?);
                let outcome = self.reassembler.ingest(
                    ChunkFrame {
                        message_id: meta.message_id,
                        index: meta.index,
                        total: meta.total,
                        payload,
                    },
                    now,
                )?;
                for event in outcome.gc_events {
                    warn!(
                        target = "duet::reliable",
                        message_id = %event.message_id,
                        reason = ?event.reason,
                        "dropped incomplete message"
                    );
                }
                if let Some(bytes) = outcome.completed {
                    let payload = serde_json::from_slice(&bytes).map_err(ReliableError::Decode)?;
                    self.events.push_back(ReliableEvent::Delivered {
                        message_type,
                        payload,
                    });
                }
            }
        }
        Ok(())
    }

    /// Retransmit or fail entries whose timers elapsed.
    pub fn poll_timers(&mut self, now: Instant) {
        let due: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, entry)| entry.timer.at() <= now)
            .map(|(seq, _)| *seq)
            .collect();

        for seq in due {
            let Some(mut entry) = self.pending.remove(&seq) else {
                continue;
            };
            if let Timer::Hold(_) = entry.timer {
                self.fail(entry, FailureReason::ChannelUnavailable);
                continue;
            }
            if self.config.retry.allows(entry.retransmissions) {
                entry.retransmissions += 1;
                entry.timer =
                    Timer::Retransmit(now + self.config.retry.delay(entry.retransmissions));
                trace!(
                    target = "duet::reliable",
                    seq,
                    attempt = entry.retransmissions,
                    "retransmitting"
                );
                self.transmit(seq, &entry);
                self.pending.insert(seq, entry);
            } else {
                self.fail(entry, FailureReason::RetriesExhausted);
            }
        }

        for event in self.reassembler.gc(now) {
            warn!(
                target = "duet::reliable",
                message_id = %event.message_id,
                "incomplete message expired"
            );
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        let retransmit = self.pending.values().map(|entry| entry.timer.at()).min();
        match (retransmit, self.reassembler.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn pop_outbound(&mut self) -> Option<String> {
        self.outbound.pop_front()
    }

    pub fn poll_event(&mut self) -> Option<ReliableEvent> {
        self.events.pop_front()
    }

    fn fail(&mut self, entry: Pending, reason: FailureReason) {
        // Sibling fragments share the outcome and are reported once.
        self.pending
            .retain(|_, other| other.message_id != entry.message_id);
        warn!(
            target = "duet::reliable",
            message_id = %entry.message_id,
            message_type = %entry.message_type,
            ?reason,
            "reliable delivery failed"
        );
        self.events
            .push_back(ReliableEvent::DeliveryFailed(DeliveryFailure {
                message_id: entry.message_id,
                message_type: entry.message_type,
                reason,
            }));
    }

    fn flush_pending(&mut self, now: Instant) {
        let delay = self.config.retry.delay(0);
        let seqs: Vec<u64> = self.pending.keys().copied().collect();
        for seq in seqs {
            if let Some(mut entry) = self.pending.remove(&seq) {
                entry.timer = Timer::Retransmit(now + delay);
                self.transmit(seq, &entry);
                self.pending.insert(seq, entry);
            }
        }
    }

    fn transmit(&mut self, seq: u64, entry: &Pending) {
        let frame = Frame::Reliable {
            seq,
            epoch: self.epoch,
            message_type: entry.message_type.clone(),
            body: entry.body.clone(),
        };
        self.push_frame(&frame);
    }

    fn push_frame(&mut self, frame: &Frame) {
        match serde_json::to_string(frame) {
            Ok(text) => self.outbound.push_back(text),
            Err(err) => {
                warn!(target = "duet::reliable", error = %err, "failed to encode frame");
            }
        }
    }

    fn remember(&mut self, seq: u64) -> bool {
        if !self.seen.insert(seq) {
            return false;
        }
        self.seen_order.push_back(seq);
        while self.seen_order.len() > self.config.dedup_window {
            if let Some(evicted) = self.seen_order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }

    fn millis_since_origin(&self, now: Instant) -> u64 {
        u64::try_from(now.saturating_duration_since(self.origin).as_millis()).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{seq::SliceRandom, thread_rng};
    use serde_json::json;

    fn open_layer(now: Instant) -> ReliableLayer {
        let mut layer = ReliableLayer::new(ReliableConfig::default(), now);
        layer.set_epoch(1, now);
        layer.on_channel_open(now);
        layer
    }

    fn drain(layer: &mut ReliableLayer) -> Vec<String> {
        std::iter::from_fn(|| layer.pop_outbound()).collect()
    }

    fn frames(layer: &mut ReliableLayer) -> Vec<Frame> {
        drain(layer)
            .iter()
            .map(|text| serde_json::from_str(text).expect("frame"))
            .collect()
    }

    fn events(layer: &mut ReliableLayer) -> Vec<ReliableEvent> {
        std::iter::from_fn(|| layer.poll_event()).collect()
    }

    #[test_timeout::timeout]
    fn frame_wire_format() {
        let frame = Frame::Reliable {
            seq: 3,
            epoch: 2,
            message_type: "chat".into(),
            body: Body::Payload(json!({"text": "hi"})),
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"kind": "reliable", "seq": 3, "epoch": 2, "type": "chat", "body": {"payload": {"text": "hi"}}})
        );
        let ping: Frame = serde_json::from_str(r#"{"kind":"ping","sentAtMs":12}"#).unwrap();
        assert_eq!(ping, Frame::Ping { sent_at_ms: 12 });
    }

    #[test_timeout::timeout]
    fn duplicate_sequence_delivers_once_and_acks_twice() {
        let now = Instant::now();
        let mut sender = open_layer(now);
        let mut receiver = open_layer(now);
        sender.send("chat", json!("hello"), now).unwrap();
        let wire = drain(&mut sender);
        assert_eq!(wire.len(), 1);

        receiver.on_frame(&wire[0], now).unwrap();
        receiver.on_frame(&wire[0], now).unwrap();
        let Ok(Frame::Reliable { seq, .. }) = serde_json::from_str::<Frame>(&wire[0]) else {
            panic!("expected a reliable frame");
        };
        let acks = frames(&mut receiver);
        assert_eq!(acks, vec![Frame::Ack { seq, epoch: 1 }; 2]);
        assert_eq!(
            events(&mut receiver),
            vec![ReliableEvent::Delivered {
                message_type: "chat".into(),
                payload: json!("hello")
            }]
        );
    }

    #[test_timeout::timeout]
    fn ack_cancels_retransmission() {
        let now = Instant::now();
        let mut sender = open_layer(now);
        let mut receiver = open_layer(now);
        sender.send("chat", json!(1), now).unwrap();
        for text in drain(&mut sender) {
            receiver.on_frame(&text, now).unwrap();
        }
        for text in drain(&mut receiver) {
            sender.on_frame(&text, now).unwrap();
        }
        assert_eq!(sender.pending_len(), 0);
        assert_eq!(sender.next_deadline(), None);
        sender.poll_timers(now + Duration::from_secs(30));
        assert!(drain(&mut sender).is_empty());
    }

    #[test_timeout::timeout]
    fn retransmissions_are_bounded_and_failure_reported_once() {
        let start = Instant::now();
        let mut sender = open_layer(start);
        let id = sender.send("chat", json!("lost"), start).unwrap();
        let mut transmissions = drain(&mut sender).len();

        let mut now = start;
        let mut failures = Vec::new();
        while let Some(deadline) = sender.next_deadline() {
            now = deadline;
            sender.poll_timers(now);
            transmissions += drain(&mut sender).len();
            failures.extend(events(&mut sender));
        }

        assert_eq!(transmissions, 6);
        assert_eq!(
            failures,
            vec![ReliableEvent::DeliveryFailed(DeliveryFailure {
                message_id: id,
                message_type: "chat".into(),
                reason: FailureReason::RetriesExhausted,
            })]
        );
        // 400 + 800 + 1600 + 3200 + 4000 + 4000
        assert_eq!(now - start, Duration::from_millis(14_000));
    }

    #[test_timeout::timeout]
    fn stale_epoch_is_dropped_without_ack() {
        let now = Instant::now();
        let mut receiver = open_layer(now);
        let fresh = Frame::Reliable {
            seq: 10,
            epoch: 3,
            message_type: "t".into(),
            body: Body::Payload(json!(1)),
        };
        let stale = Frame::Reliable {
            seq: 11,
            epoch: 2,
            message_type: "t".into(),
            body: Body::Payload(json!(2)),
        };
        receiver
            .on_frame(&serde_json::to_string(&fresh).unwrap(), now)
            .unwrap();
        receiver
            .on_frame(&serde_json::to_string(&stale).unwrap(), now)
            .unwrap();
        assert_eq!(frames(&mut receiver), vec![Frame::Ack { seq: 10, epoch: 3 }]);
        assert_eq!(events(&mut receiver).len(), 1);

        receiver.forget_remote_epoch();
        receiver
            .on_frame(&serde_json::to_string(&stale).unwrap(), now)
            .unwrap();
        assert_eq!(frames(&mut receiver), vec![Frame::Ack { seq: 11, epoch: 2 }]);
        assert_eq!(events(&mut receiver).len(), 1);
    }

    #[test_timeout::timeout]
    fn large_payload_is_chunked_and_reassembled_in_any_order() {
        let now = Instant::now();
        let mut sender = open_layer(now);
        let mut receiver = open_layer(now);
        let text: String = (0..40_000).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        let payload = json!({ "text": text });
        sender.send("blob", payload.clone(), now).unwrap();

        let mut wire = drain(&mut sender);
        assert!(wire.len() > 1);
        wire.shuffle(&mut thread_rng());
        let duplicate = wire[0].clone();
        wire.push(duplicate);
        for text in &wire {
            receiver.on_frame(text, now).unwrap();
        }
        assert_eq!(
            events(&mut receiver),
            vec![ReliableEvent::Delivered {
                message_type: "blob".into(),
                payload
            }]
        );
        assert_eq!(frames(&mut receiver).len(), wire.len());
    }

    #[test_timeout::timeout]
    fn chunked_failure_is_reported_once_per_message() {
        let now = Instant::now();
        let mut sender = open_layer(now);
        let big = json!("x".repeat(30_000));
        sender.send("blob", big, now).unwrap();
        assert!(sender.pending_len() > 1);
        sender.reset_remote();
        let failures = events(&mut sender);
        assert_eq!(failures.len(), 1);
        assert!(matches!(
            &failures[0],
            ReliableEvent::DeliveryFailed(DeliveryFailure {
                reason: FailureReason::SessionReset,
                ..
            })
        ));
        assert_eq!(sender.pending_len(), 0);
    }

    #[test_timeout::timeout]
    fn epoch_change_resends_pending_under_new_epoch() {
        let now = Instant::now();
        let mut sender = open_layer(now);
        sender.send("chat", json!("a"), now).unwrap();
        drain(&mut sender);

        sender.poll_timers(now + Duration::from_millis(400));
        drain(&mut sender);

        let later = now + Duration::from_millis(500);
        sender.set_epoch(2, later);
        let resent = frames(&mut sender);
        assert!(matches!(
            resent.as_slice(),
            [Frame::Reliable { epoch: 2, .. }]
        ));
        assert_eq!(sender.next_deadline(), Some(later + Duration::from_millis(400)));
    }

    #[test_timeout::timeout]
    fn closed_channel_holds_messages_until_open() {
        let now = Instant::now();
        let mut layer = ReliableLayer::new(ReliableConfig::default(), now);
        layer.send("chat", json!("queued"), now).unwrap();
        assert!(!layer.send_raw("cursor", json!(1)));
        assert!(drain(&mut layer).is_empty());
        assert_eq!(layer.next_deadline(), Some(now + DEFAULT_HOLD_TIMEOUT));

        let opened = now + Duration::from_secs(5);
        layer.on_channel_open(opened);
        assert_eq!(drain(&mut layer).len(), 1);
        assert_eq!(layer.next_deadline(), Some(opened + Duration::from_millis(400)));

        let closed = opened + Duration::from_secs(1);
        layer.on_channel_closed(closed);
        assert_eq!(layer.next_deadline(), Some(closed + DEFAULT_HOLD_TIMEOUT));
        assert_eq!(layer.pending_len(), 1);
        layer.poll_timers(closed + Duration::from_secs(10));
        assert!(drain(&mut layer).is_empty());
        assert!(events(&mut layer).is_empty());
    }

    #[test_timeout::timeout]
    fn held_messages_fail_when_channel_never_opens() {
        let start = Instant::now();
        let mut layer = ReliableLayer::new(ReliableConfig::default(), start);
        layer.set_epoch(1, start);
        let mut ids = Vec::new();
        for n in 0..100 {
            ids.push(layer.send("chat", json!(n), start).unwrap());
        }
        ids.push(layer.send("blob", json!("x".repeat(30_000)), start).unwrap());
        assert!(layer.pending_len() > ids.len());

        layer.poll_timers(start + DEFAULT_HOLD_TIMEOUT - Duration::from_millis(1));
        assert!(events(&mut layer).is_empty());

        layer.poll_timers(start + Duration::from_secs(3_600));
        let failed: Vec<String> = events(&mut layer)
            .into_iter()
            .map(|event| match event {
                ReliableEvent::DeliveryFailed(DeliveryFailure {
                    message_id,
                    reason: FailureReason::ChannelUnavailable,
                    ..
                }) => message_id,
                other => panic!("unexpected event {other:?}"),
            })
            .collect();
        assert_eq!(failed, ids);
        assert_eq!(layer.pending_len(), 0);
        assert_eq!(layer.next_deadline(), None);
        assert!(drain(&mut layer).is_empty());
    }

    #[test_timeout::timeout]
    fn hello_and_sync_surface_as_events() {
        let now = Instant::now();
        let mut a = open_layer(now);
        let mut b = ReliableLayer::new(ReliableConfig::default(), now);
        assert!(!b.hello("bob"));
        assert!(!b.send_sync(json!({})));
        b.set_epoch(4, now);
        b.on_channel_open(now);

        assert!(a.hello("alice"));
        for text in drain(&mut a) {
            b.on_frame(&text, now).unwrap();
        }
        assert_eq!(
            events(&mut b),
            vec![ReliableEvent::Hello {
                identity: "alice".into(),
                epoch: 1
            }]
        );

        assert!(b.send_sync(json!({"score": 3})));
        let wire = drain(&mut b);
        assert_eq!(
            serde_json::from_str::<Value>(&wire[0]).unwrap(),
            json!({"kind": "sync", "state": {"score": 3}})
        );
        a.on_frame(&wire[0], now).unwrap();
        assert_eq!(
            events(&mut a),
            vec![ReliableEvent::RemoteSync {
                state: json!({"score": 3})
            }]
        );
    }

    #[test_timeout::timeout]
    fn ping_is_answered_with_pong() {
        let now = Instant::now();
        let mut a = open_layer(now);
        let mut b = open_layer(now);
        a.ping(now);
        for text in drain(&mut a) {
            b.on_frame(&text, now).unwrap();
        }
        for text in drain(&mut b) {
            a.on_frame(&text, now + Duration::from_millis(30)).unwrap();
        }
        assert_eq!(a.last_rtt(), Some(Duration::from_millis(30)));
    }

    #[test_timeout::timeout]
    fn malformed_frame_is_an_error() {
        let now = Instant::now();
        let mut layer = open_layer(now);
        assert!(matches!(
            layer.on_frame("{\"kind\":\"nope\"}", now),
            Err(ReliableError::Decode(_))
        ));
    }
}
