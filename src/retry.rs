//! Retry decisions for failed deliveries.

use std::time::Duration;

use crate::{
    DeliveryConfig, Envelope,
    dead_letter::DeadLetterReason,
    outcome::{DeliveryOutcome, FailureReason},
};

/// What to do with an envelope after its handler returned.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Processing succeeded.
    Ack,
    /// Put the envelope back for another attempt.
    Requeue {
        /// The redelivery, with its attempt count incremented.
        next: Envelope,
        /// Advisory visibility delay. Enforcing it is up to the broker.
        delay: Duration,
        /// Failure that caused the requeue.
        reason: FailureReason,
    },
    /// Quarantine the envelope.
    DeadLetter(DeadLetterReason),
}

/// Pure, deterministic retry policy with capped exponential backoff.
///
/// The backoff before attempt `n + 1` is `base * 2^n`, capped at `cap`.
/// Identical inputs always produce identical decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    backoff_base: Duration,
    backoff_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&DeliveryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(backoff_base: Duration, backoff_cap: Duration) -> Self {
        Self {
            backoff_base,
            backoff_cap,
        }
    }

    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self::new(config.backoff_base, config.backoff_cap)
    }

    /// Delay to apply after a failure on attempt `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        1u32.checked_shl(attempt)
            .and_then(|factor| self.backoff_base.checked_mul(factor))
            .map_or(self.backoff_cap, |delay| delay.min(self.backoff_cap))
    }

    /// Decide the fate of `envelope` given its handler's `outcome`.
    pub fn decide(&self, envelope: &Envelope, outcome: &DeliveryOutcome) -> RetryDecision {
        match outcome {
            DeliveryOutcome::Success => RetryDecision::Ack,
            DeliveryOutcome::FatalFailure(reason) => {
                RetryDecision::DeadLetter(DeadLetterReason::FatalFailure(reason.clone()))
            }
            // `attempt + 1 > max_attempts`, written so it cannot overflow.
            DeliveryOutcome::RetryableFailure(_)
                if envelope.attempt() >= envelope.max_attempts() =>
            {
                RetryDecision::DeadLetter(DeadLetterReason::MaxAttemptsExceeded)
            }
            DeliveryOutcome::RetryableFailure(reason) => RetryDecision::Requeue {
                next: envelope.redelivery(),
                delay: self.backoff(envelope.attempt()),
                reason: reason.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(100), Duration::from_secs(1))
    }

    #[test]
    fn retryable_failure_requeues_with_next_attempt() {
        let envelope = Envelope::new(b"x".to_vec(), 2);

        match policy().decide(&envelope, &DeliveryOutcome::retry("busy")) {
            RetryDecision::Requeue {
                next,
                delay,
                reason,
            } => {
                assert_eq!(next.id(), envelope.id());
                assert_eq!(next.attempt(), 1);
                assert_eq!(delay, Duration::from_millis(100));
                assert_eq!(reason, FailureReason::Other("busy".into()));
            }
            other => panic!("unexpected decision {other:?}"),
        }
    }

    #[test]
    fn retryable_failure_on_last_attempt_dead_letters() {
        let envelope = Envelope::new(Vec::new(), 2).with_attempt(2);

        assert_eq!(
            policy().decide(&envelope, &DeliveryOutcome::retry("busy")),
            RetryDecision::DeadLetter(DeadLetterReason::MaxAttemptsExceeded)
        );
    }

    #[test]
    fn fatal_failure_dead_letters_on_first_attempt() {
        let envelope = Envelope::new(Vec::new(), 5);

        assert_eq!(
            policy().decide(&envelope, &DeliveryOutcome::fatal("malformed")),
            RetryDecision::DeadLetter(DeadLetterReason::FatalFailure(FailureReason::Other(
                "malformed".into()
            )))
        );
    }

    #[test]
    fn zero_max_attempts_never_retries() {
        let envelope = Envelope::new(Vec::new(), 0);

        assert_eq!(
            policy().decide(
                &envelope,
                &DeliveryOutcome::RetryableFailure(FailureReason::Timeout)
            ),
            RetryDecision::DeadLetter(DeadLetterReason::MaxAttemptsExceeded)
        );
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = policy();

        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
        assert_eq!(policy.backoff(4), Duration::from_secs(1));
        assert_eq!(policy.backoff(40), Duration::from_secs(1));
    }

    #[test]
    fn decisions_are_deterministic() {
        let envelope = Envelope::new(b"same".to_vec(), 3).with_attempt(1);
        let outcome = DeliveryOutcome::retry("flaky");

        assert_eq!(
            policy().decide(&envelope, &outcome),
            policy().decide(&envelope, &outcome)
        );
    }
}
