use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::time::Instant;
use tracing::warn;

pub const DEFAULT_CHUNK_THRESHOLD: usize = 12_000;
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 1024 * 1024;
pub const DEFAULT_GC_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_INFLIGHT: usize = 64;
const MIN_CHUNK_THRESHOLD: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkConfig {
    /// Serialized payloads larger than this are split; also the fragment size.
    pub threshold: usize,
    pub max_message_bytes: usize,
    pub max_inflight: usize,
    pub gc_timeout: Duration,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_CHUNK_THRESHOLD,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            max_inflight: DEFAULT_MAX_INFLIGHT,
            gc_timeout: DEFAULT_GC_TIMEOUT,
        }
    }
}

impl ChunkConfig {
    pub fn from_env() -> Self {
        let threshold = parse_usize_env(
            "DUET_CHUNK_THRESHOLD",
            DEFAULT_CHUNK_THRESHOLD,
            MIN_CHUNK_THRESHOLD,
        );
        let max_message_bytes = parse_usize_env(
            "DUET_MAX_MESSAGE_BYTES",
            DEFAULT_MAX_MESSAGE_BYTES,
            threshold,
        );
        Self {
            threshold,
            max_message_bytes,
            ..Self::default()
        }
    }

    pub fn max_chunks(&self) -> usize {
        let cap = self.threshold.max(1);
        (self.max_message_bytes + cap - 1) / cap
    }

    pub fn needs_split(&self, serialized_len: usize) -> bool {
        serialized_len > self.threshold
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("message exceeds max size: {0} bytes")]
    MessageTooLarge(usize),
    #[error("chunk fragment too large: {0} bytes")]
    FragmentTooLarge(usize),
    #[error("chunk malformed: {0}")]
    Malformed(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFrame {
    pub message_id: String,
    pub index: u32,
    pub total: u32,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcReason {
    Timeout,
    Capacity,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcEvent {
    pub message_id: String,
    pub reason: GcReason,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct IngestOutcome {
    pub completed: Option<Bytes>,
    pub gc_events: Vec<GcEvent>,
}

#[derive(Debug)]
struct PartialMessage {
    created_at: Instant,
    total: u32,
    fragments: Vec<Option<Bytes>>,
    received: u32,
    received_bytes: usize,
}

impl PartialMessage {
    fn new(total: u32, created_at: Instant) -> Self {
        Self {
            created_at,
            total,
            fragments: vec![None; total as usize],
            received: 0,
            received_bytes: 0,
        }
    }

    fn assemble(&self) -> Result<Bytes, ChunkError> {
        let mut combined = Vec::with_capacity(self.received_bytes);
        for fragment in &self.fragments {
            match fragment {
                Some(bytes) => combined.extend_from_slice(bytes),
                None => return Err(ChunkError::Malformed("missing fragment during reassembly")),
            }
        }
        Ok(Bytes::from(combined))
    }
}

/// Rebuilds chunked messages from fragments arriving in any order.
pub struct Reassembler {
    partials: HashMap<String, PartialMessage>,
    config: ChunkConfig,
}

impl Reassembler {
    pub fn new(config: ChunkConfig) -> Self {
        Self {
            partials: HashMap::new(),
            config,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.partials.len()
    }

    pub fn ingest(&mut self, frame: ChunkFrame, now: Instant) -> Result<IngestOutcome, ChunkError> {
        validate_bounds(&frame, &self.config)?;
        let mut outcome = IngestOutcome::default();

        if !self.partials.contains_key(&frame.message_id)
            && self.partials.len() >= self.config.max_inflight
        {
            if let Some(evicted) = self.evict_oldest() {
                outcome.gc_events.push(evicted);
            }
        }

        let ChunkFrame {
            message_id,
            index,
            total,
            payload,
        } = frame;

        let entry = self
            .partials
            .entry(message_id.clone())
            .or_insert_with(|| PartialMessage::new(total, now));

        if entry.total != total {
            self.partials.remove(&message_id);
            return Err(ChunkError::Malformed("fragment total changed for message"));
        }

        let slot = &mut entry.fragments[index as usize];
        if slot.is_none() {
            entry.received_bytes = entry.received_bytes.saturating_add(payload.len());
            entry.received += 1;
            *slot = Some(payload);
        }

        if entry.received_bytes > self.config.max_message_bytes {
            let size = entry.received_bytes;
            self.partials.remove(&message_id);
            return Err(ChunkError::MessageTooLarge(size));
        }

        if entry.received == entry.total {
            let assembled = entry.assemble();
            self.partials.remove(&message_id);
            outcome.completed = Some(assembled?);
        }

        Ok(outcome)
    }

    pub fn gc(&mut self, now: Instant) -> Vec<GcEvent> {
        let mut dropped = Vec::new();
        let timeout = self.config.gc_timeout;
        self.partials.retain(|message_id, partial| {
            let expired = now.saturating_duration_since(partial.created_at) > timeout;
            if expired {
                dropped.push(GcEvent {
                    message_id: message_id.clone(),
                    reason: GcReason::Timeout,
                });
            }
            !expired
        });
        dropped
    }

    /// When the oldest incomplete message expires.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.partials
            .values()
            .map(|partial| partial.created_at + self.config.gc_timeout)
            .min()
    }

    pub fn clear(&mut self) {
        self.partials.clear();
    }

    fn evict_oldest(&mut self) -> Option<GcEvent> {
        let oldest = self
            .partials
            .iter()
            .min_by_key(|(_, partial)| partial.created_at)
            .map(|(message_id, _)| message_id.clone())?;
        self.partials.remove(&oldest);
        Some(GcEvent {
            message_id: oldest,
            reason: GcReason::Capacity,
        })
    }
}

pub fn split_message(
    payload: &[u8],
    message_id: &str,
    config: &ChunkConfig,
) -> Result<Vec<ChunkFrame>, ChunkError> {
    if payload.len() > config.max_message_bytes {
        return Err(ChunkError::MessageTooLarge(payload.len()));
    }
    if payload.is_empty() {
        return Err(ChunkError::Malformed("cannot split an empty payload"));
    }

    let pieces: Vec<&[u8]> = payload.chunks(config.threshold.max(1)).collect();
    let total =
        u32::try_from(pieces.len()).map_err(|_| ChunkError::Malformed("fragment total overflow"))?;

    pieces
        .into_iter()
        .enumerate()
        .map(|(index, piece)| {
            let index = u32::try_from(index)
                .map_err(|_| ChunkError::Malformed("fragment index overflowed u32"))?;
            Ok(ChunkFrame {
                message_id: message_id.to_string(),
                index,
                total,
                payload: Bytes::copy_from_slice(piece),
            })
        })
        .collect()
}

fn validate_bounds(frame: &ChunkFrame, config: &ChunkConfig) -> Result<(), ChunkError> {
    if frame.total == 0 {
        return Err(ChunkError::Malformed("fragment total cannot be zero"));
    }
    if frame.index >= frame.total {
        return Err(ChunkError::Malformed("fragment index out of range"));
    }
    if frame.payload.len() > config.threshold {
        return Err(ChunkError::FragmentTooLarge(frame.payload.len()));
    }
    if frame.total as usize > config.max_chunks() {
        return Err(ChunkError::MessageTooLarge(
            frame.total as usize * config.threshold,
        ));
    }
    Ok(())
}

fn parse_usize_env(var: &str, default: usize, min: usize) -> usize {
    match std::env::var(var) {
        Ok(value) => match value.trim().parse::<usize>() {
            Ok(parsed) if parsed >= min => parsed,
            Ok(parsed) => {
                warn!(
                    target = "duet::reliable::chunk",
                    var, parsed, min, default, "chunk config below minimum; using default"
                );
                default
            }
            Err(err) => {
                warn!(
                    target = "duet::reliable::chunk",
                    var,
                    error = %err,
                    default,
                    "failed to parse chunk config from env; using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{seq::SliceRandom, thread_rng};

    fn small_config() -> ChunkConfig {
        ChunkConfig {
            threshold: 8,
            max_message_bytes: 256,
            max_inflight: 2,
            gc_timeout: Duration::from_millis(50),
        }
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn shuffled_fragments_with_duplicates_reassemble_once() {
        let config = small_config();
        let payload = b"the quick brown fox jumps over the lazy dog".to_vec();
        let frames = split_message(&payload, "m1", &config).expect("split");
        assert!(frames.len() > 2);
        assert!(frames.iter().all(|f| f.total as usize == frames.len()));

        let mut shuffled = frames.clone();
        shuffled.shuffle(&mut thread_rng());
        shuffled.insert(1, shuffled[0].clone());

        let mut reassembler = Reassembler::new(config);
        let mut completed = Vec::new();
        for frame in shuffled {
            if let Some(done) = reassembler.ingest(frame, Instant::now()).expect("ingest").completed {
                completed.push(done);
            }
        }
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].as_ref(), payload.as_slice());
        assert_eq!(reassembler.in_flight(), 0);
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn incomplete_message_is_collected_after_timeout() {
        let config = small_config();
        let mut reassembler = Reassembler::new(config);
        let start = Instant::now();
        let first = ChunkFrame {
            message_id: "m2".into(),
            index: 0,
            total: 2,
            payload: Bytes::from_static(b"hello "),
        };
        reassembler.ingest(first, start).expect("ingest");
        assert_eq!(
            reassembler.next_deadline(),
            Some(start + config.gc_timeout)
        );
        assert!(reassembler.gc(start + Duration::from_millis(10)).is_empty());
        let dropped = reassembler.gc(start + Duration::from_millis(60));
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].reason, GcReason::Timeout);
        assert_eq!(reassembler.in_flight(), 0);
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn capacity_evicts_oldest_partial() {
        let mut reassembler = Reassembler::new(small_config());
        let start = Instant::now();
        for (offset, id) in ["a", "b", "c"].iter().enumerate() {
            let outcome = reassembler
                .ingest(
                    ChunkFrame {
                        message_id: (*id).into(),
                        index: 0,
                        total: 2,
                        payload: Bytes::from_static(b"x"),
                    },
                    start + Duration::from_millis(offset as u64),
                )
                .expect("ingest");
            if *id == "c" {
                assert_eq!(
                    outcome.gc_events,
                    vec![GcEvent {
                        message_id: "a".into(),
                        reason: GcReason::Capacity
                    }]
                );
            }
        }
        assert_eq!(reassembler.in_flight(), 2);
    }

    #[test_timeout::timeout]
    fn oversize_rejected() {
        let config = small_config();
        let err = split_message(&[0u8; 512], "big", &config).expect_err("oversize");
        assert!(matches!(err, ChunkError::MessageTooLarge(512)));
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn out_of_range_index_is_malformed() {
        let mut reassembler = Reassembler::new(small_config());
        let err = reassembler
            .ingest(
                ChunkFrame {
                    message_id: "m".into(),
                    index: 3,
                    total: 2,
                    payload: Bytes::new(),
                },
                Instant::now(),
            )
            .expect_err("malformed");
        assert!(matches!(err, ChunkError::Malformed(_)));
    }
}
