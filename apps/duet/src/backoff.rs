//! Exponential backoff shared by signaling reconnects, connection restarts
//! and reliable retransmission.

use std::collections::VecDeque;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

/// `delay(n) = min(base * 2^n, ceiling)`, optionally spread by `±jitter`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub ceiling: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Fraction of the delay used as symmetric jitter, in `0.0..=1.0`.
    pub jitter: f64,
}

impl RetryPolicy {
    pub const fn new(base: Duration, ceiling: Duration) -> Self {
        Self {
            base,
            ceiling,
            max_attempts: None,
            jitter: 0.0,
        }
    }

    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub const fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before attempt `attempt` (0-based), without jitter.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.ceiling)
            .min(self.ceiling)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        if self.jitter <= 0.0 {
            return nominal;
        }
        let spread = self.jitter.min(1.0);
        let factor = rand::thread_rng().gen_range((1.0 - spread)..=(1.0 + spread));
        nominal.mul_f64(factor)
    }

    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt < max)
    }
}

/// Stateful attempt counter over a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.policy.allows(self.attempt) {
            return None;
        }
        let delay = self.policy.delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    Allowed,
    CoolingDown { until: Instant },
    /// The per-window ceiling is spent; escalate to a full reset.
    Exhausted,
}

/// Rate limiter for connection restarts.
///
/// Each restart inside `window` lengthens the cooldown before the next one
/// following the policy; `policy.max_attempts` caps restarts per window.
#[derive(Debug, Clone)]
pub struct RestartGovernor {
    policy: RetryPolicy,
    window: Duration,
    history: VecDeque<Instant>,
    last_hard_reset: Option<Instant>,
}

impl RestartGovernor {
    pub fn new(policy: RetryPolicy, window: Duration) -> Self {
        Self {
            policy,
            window,
            history: VecDeque::new(),
            last_hard_reset: None,
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.history.front() {
            if now.saturating_duration_since(*front) > self.window {
                self.history.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn check(&mut self, now: Instant) -> RestartDecision {
        self.prune(now);
        let used = self.history.len() as u32;
        if !self.policy.allows(used) {
            return RestartDecision::Exhausted;
        }
        if let Some(last) = self.history.back() {
            let until = *last + self.policy.nominal_delay(used.saturating_sub(1));
            if now < until {
                return RestartDecision::CoolingDown { until };
            }
        }
        RestartDecision::Allowed
    }

    pub fn record_restart(&mut self, now: Instant) {
        self.history.push_back(now);
    }

    /// Whether a hard reset may run now; at most one per window.
    pub fn take_hard_reset(&mut self, now: Instant) -> bool {
        match self.last_hard_reset {
            Some(last) if now.saturating_duration_since(last) <= self.window => false,
            _ => {
                self.last_hard_reset = Some(now);
                self.history.clear();
                true
            }
        }
    }

    /// Forget restart history once the connection is healthy again.
    pub fn on_connected(&mut self) {
        self.history.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn delays_double_up_to_ceiling() {
        let policy = RetryPolicy::new(Duration::from_millis(400), Duration::from_secs(4));
        let delays: Vec<_> = (0..6).map(|n| policy.delay(n)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(400),
                Duration::from_millis(800),
                Duration::from_millis(1600),
                Duration::from_millis(3200),
                Duration::from_secs(4),
                Duration::from_secs(4),
            ]
        );
        assert_eq!(policy.delay(200), Duration::from_secs(4));
    }

    #[test_timeout::timeout]
    fn jitter_stays_within_band() {
        let policy = RetryPolicy::new(Duration::from_millis(1000), Duration::from_secs(5))
            .with_jitter(0.2);
        for _ in 0..200 {
            let delay = policy.delay(0);
            assert!(delay >= Duration::from_millis(800), "{delay:?}");
            assert!(delay <= Duration::from_millis(1200), "{delay:?}");
        }
    }

    #[test_timeout::timeout]
    fn backoff_stops_at_max_attempts() {
        let policy =
            RetryPolicy::new(Duration::from_millis(10), Duration::from_millis(40)).with_max_attempts(3);
        let mut backoff = Backoff::new(policy);
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(10)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(20)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(40)));
        assert_eq!(backoff.next_delay(), None);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(10)));
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn governor_applies_cooldown_then_ceiling() {
        let policy =
            RetryPolicy::new(Duration::from_secs(5), Duration::from_secs(15)).with_max_attempts(3);
        let mut governor = RestartGovernor::new(policy, Duration::from_secs(60));
        let start = Instant::now();

        assert_eq!(governor.check(start), RestartDecision::Allowed);
        governor.record_restart(start);
        assert_eq!(
            governor.check(start + Duration::from_secs(1)),
            RestartDecision::CoolingDown {
                until: start + Duration::from_secs(5)
            }
        );

        let second = start + Duration::from_secs(5);
        assert_eq!(governor.check(second), RestartDecision::Allowed);
        governor.record_restart(second);
        // Second cooldown doubles.
        assert!(matches!(
            governor.check(second + Duration::from_secs(6)),
            RestartDecision::CoolingDown { .. }
        ));

        let third = second + Duration::from_secs(10);
        assert_eq!(governor.check(third), RestartDecision::Allowed);
        governor.record_restart(third);
        assert_eq!(
            governor.check(third + Duration::from_secs(30)),
            RestartDecision::Exhausted
        );

        assert!(governor.take_hard_reset(third + Duration::from_secs(30)));
        assert!(!governor.take_hard_reset(third + Duration::from_secs(40)));

        // Outside the window the history is forgotten.
        let later = third + Duration::from_secs(120);
        assert_eq!(governor.check(later), RestartDecision::Allowed);
    }
}
