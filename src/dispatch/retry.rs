//! Bounded retry policy for agent invocations.

use std::time::Duration;

use crate::dispatch::agent::AgentError;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_MIN_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// What to do after a failed invocation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    DeadLetter,
}

/// Exponential backoff with a hard attempt cap. Permanent errors skip the
/// backoff entirely and dead-letter on the first decision.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_attempts: u32,
    min_delay: Duration,
    max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_MIN_DELAY, DEFAULT_MAX_DELAY)
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(max_attempts: u32, min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            min_delay,
            max_delay,
        }
    }

    /// Decides after attempt number `attempt` (1-based) failed with `error`.
    #[must_use]
    pub fn decide(&self, attempt: u32, error: &AgentError) -> RetryDecision {
        if !error.is_transient() || attempt >= self.max_attempts {
            return RetryDecision::DeadLetter;
        }

        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self
            .min_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay);
        RetryDecision::Retry(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transient() -> AgentError {
        AgentError::Timeout
    }

    fn permanent() -> AgentError {
        AgentError::Rejected {
            status: 400,
            message: "bad input".into(),
        }
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let policy = RetryPolicy::new(10, Duration::from_millis(500), Duration::from_secs(3));

        assert_eq!(
            policy.decide(1, &transient()),
            RetryDecision::Retry(Duration::from_millis(500))
        );
        assert_eq!(
            policy.decide(2, &transient()),
            RetryDecision::Retry(Duration::from_secs(1))
        );
        assert_eq!(
            policy.decide(3, &transient()),
            RetryDecision::Retry(Duration::from_secs(2))
        );
        // Capped at max_delay from here on.
        assert_eq!(
            policy.decide(4, &transient()),
            RetryDecision::Retry(Duration::from_secs(3))
        );
        assert_eq!(
            policy.decide(5, &transient()),
            RetryDecision::Retry(Duration::from_secs(3))
        );
    }

    #[test]
    fn transient_errors_dead_letter_at_attempt_cap() {
        let policy = RetryPolicy::default();

        assert!(matches!(
            policy.decide(4, &transient()),
            RetryDecision::Retry(_)
        ));
        assert_eq!(policy.decide(5, &transient()), RetryDecision::DeadLetter);
    }

    #[test]
    fn permanent_errors_dead_letter_immediately() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.decide(1, &permanent()), RetryDecision::DeadLetter);
    }

    #[test]
    fn zero_max_attempts_is_clamped_to_one() {
        let policy = RetryPolicy::new(0, DEFAULT_MIN_DELAY, DEFAULT_MAX_DELAY);

        assert_eq!(policy.decide(1, &transient()), RetryDecision::DeadLetter);
    }
}
