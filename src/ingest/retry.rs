//! Retry state for one ingestion job.
//!
//! [`RetryState::on_failure`] is a pure step function: it takes the
//! current time and a jitter sample as arguments, so backoff timing can be
//! tested without sleeping.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the uniform jitter added to each delay.
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
            max_jitter: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt`, without jitter:
    /// `base * 2^(attempt - 1)`, capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn sample_jitter(&self) -> Duration {
        let max_ms = u64::try_from(self.max_jitter.as_millis()).unwrap_or(u64::MAX);
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStep {
    /// Attempt number `attempt` becomes eligible after `delay`.
    Retry { attempt: u32, delay: Duration },
    GiveUp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryState {
    attempt: u32,
    next_eligible_at: Instant,
}

impl RetryState {
    pub fn new(now: Instant) -> Self {
        Self {
            attempt: 1,
            next_eligible_at: now,
        }
    }

    /// 1-based number of the attempt currently in flight.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn next_eligible_at(&self) -> Instant {
        self.next_eligible_at
    }

    pub fn on_failure(
        &mut self,
        policy: &RetryPolicy,
        error: &Error,
        now: Instant,
        jitter: Duration,
    ) -> RetryStep {
        if !error.is_transient() || self.attempt >= policy.max_attempts {
            return RetryStep::GiveUp;
        }

        let delay = policy.backoff(self.attempt) + jitter.min(policy.max_jitter);
        self.attempt += 1;
        self.next_eligible_at = now + delay;

        RetryStep::Retry {
            attempt: self.attempt,
            delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            max_jitter: Duration::from_millis(50),
        }
    }

    fn transient() -> Error {
        Error::transient_upstream("test", "503")
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = policy();
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
        assert_eq!(policy.backoff(40), Duration::from_millis(350));
    }

    #[test]
    fn test_step_schedules_next_attempt() {
        let policy = policy();
        let now = Instant::now();
        let mut state = RetryState::new(now);

        let step = state.on_failure(&policy, &transient(), now, Duration::from_millis(7));
        assert_eq!(
            step,
            RetryStep::Retry {
                attempt: 2,
                delay: Duration::from_millis(107)
            }
        );
        assert_eq!(state.attempt(), 2);
        assert_eq!(state.next_eligible_at(), now + Duration::from_millis(107));
    }

    #[test]
    fn test_jitter_is_clamped_to_policy() {
        let policy = policy();
        let now = Instant::now();
        let mut state = RetryState::new(now);

        let step = state.on_failure(&policy, &transient(), now, Duration::from_secs(30));
        assert_eq!(
            step,
            RetryStep::Retry {
                attempt: 2,
                delay: Duration::from_millis(150)
            }
        );
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let policy = policy();
        let now = Instant::now();
        let mut state = RetryState::new(now);

        for expected in 2..=4 {
            match state.on_failure(&policy, &transient(), now, Duration::ZERO) {
                RetryStep::Retry { attempt, .. } => assert_eq!(attempt, expected),
                RetryStep::GiveUp => panic!("gave up early at attempt {}", state.attempt()),
            }
        }
        assert_eq!(
            state.on_failure(&policy, &transient(), now, Duration::ZERO),
            RetryStep::GiveUp
        );
        assert_eq!(state.attempt(), 4);
    }

    #[test]
    fn test_permanent_error_never_retries() {
        let policy = policy();
        let now = Instant::now();
        let mut state = RetryState::new(now);

        let err = Error::permanent_upstream("test", "400 Bad Request");
        assert_eq!(state.on_failure(&policy, &err, now, Duration::ZERO), RetryStep::GiveUp);
        assert_eq!(state.attempt(), 1);
    }

    #[test]
    fn test_sample_jitter_stays_in_range() {
        let policy = policy();
        for _ in 0..100 {
            assert!(policy.sample_jitter() <= policy.max_jitter);
        }
        let none = RetryPolicy {
            max_jitter: Duration::ZERO,
            ..policy
        };
        assert_eq!(none.sample_jitter(), Duration::ZERO);
    }
}
