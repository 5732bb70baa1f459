use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use duet_proto::IceCandidate;
use tokio::time::Instant;

/// Inbound candidates that arrived before they could be applied.
///
/// Fingerprints are remembered until [`CandidateBuffer::reset`], so a
/// candidate is queued or applied at most once per connection.
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    queue: VecDeque<IceCandidate>,
    seen: HashSet<String>,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a candidate. Returns `false` for a duplicate.
    pub fn offer(&mut self, candidate: IceCandidate) -> bool {
        if !self.seen.insert(candidate.fingerprint()) {
            return false;
        }
        self.queue.push_back(candidate);
        true
    }

    /// Record a candidate that is applied straight away. Returns `false` for
    /// a duplicate that must be skipped.
    pub fn admit(&mut self, candidate: &IceCandidate) -> bool {
        self.seen.insert(candidate.fingerprint())
    }

    /// Drain queued candidates in arrival order.
    pub fn on_remote_description_applied(&mut self) -> Vec<IceCandidate> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn reset(&mut self) {
        self.queue.clear();
        self.seen.clear();
    }
}

/// Coalesces locally gathered candidates into one `candidate-batch` signal.
#[derive(Debug)]
pub struct CandidateBatch {
    window: Duration,
    pending: Vec<IceCandidate>,
    flush_at: Option<Instant>,
}

impl CandidateBatch {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: Vec::new(),
            flush_at: None,
        }
    }

    pub fn push(&mut self, candidate: IceCandidate, now: Instant) {
        self.pending.push(candidate);
        if self.flush_at.is_none() {
            self.flush_at = Some(now + self.window);
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.flush_at
    }

    /// Take the batch if its window elapsed, or unconditionally when `force`.
    pub fn take(&mut self, now: Instant, force: bool) -> Option<Vec<IceCandidate>> {
        let due = self.flush_at.is_some_and(|at| at <= now);
        if !(force || due) || self.pending.is_empty() {
            if force {
                self.flush_at = None;
            }
            return None;
        }
        self.flush_at = None;
        Some(std::mem::take(&mut self.pending))
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.flush_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000 typ host"),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
            username_fragment: None,
        }
    }

    #[test_timeout::timeout]
    fn duplicates_are_dropped_and_order_kept() {
        let mut buffer = CandidateBuffer::new();
        assert!(buffer.offer(candidate(1)));
        assert!(!buffer.offer(candidate(1)));
        assert!(buffer.offer(candidate(2)));
        assert_eq!(
            buffer.on_remote_description_applied(),
            vec![candidate(1), candidate(2)]
        );
        assert!(buffer.is_empty());
        // Applied candidates stay known until reset.
        assert!(!buffer.admit(&candidate(2)));
    }

    #[test_timeout::timeout]
    fn reset_clears_queue_and_fingerprints() {
        let mut buffer = CandidateBuffer::new();
        buffer.offer(candidate(1));
        buffer.reset();
        assert_eq!(buffer.len(), 0);
        assert!(buffer.offer(candidate(1)));
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn batch_flushes_after_window() {
        let mut batch = CandidateBatch::new(Duration::from_millis(30));
        let start = Instant::now();
        batch.push(candidate(1), start);
        batch.push(candidate(2), start + Duration::from_millis(10));
        assert_eq!(batch.deadline(), Some(start + Duration::from_millis(30)));
        assert!(batch.take(start + Duration::from_millis(20), false).is_none());
        assert_eq!(
            batch.take(start + Duration::from_millis(30), false),
            Some(vec![candidate(1), candidate(2)])
        );
        assert!(batch.deadline().is_none());

        batch.push(candidate(3), start + Duration::from_millis(40));
        assert_eq!(
            batch.take(start + Duration::from_millis(41), true),
            Some(vec![candidate(3)])
        );
    }
}
