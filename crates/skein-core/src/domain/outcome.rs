//! Outcome model: what a handler reports back for one dispatched action.
//!
//! A failure is not an error. It is a normal outcome that drives the
//! pause/retry state machine of the broker.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How long a failed action waits before its queue is looked at again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum RetryDelay {
    /// Re-check the queue right away; the same head is dispatched again.
    Immediate,

    /// Pause the queue and arm a one-shot timer.
    After(Duration),

    /// Pause the queue until someone calls `restart_queues`.
    Indefinite,
}

impl RetryDelay {
    /// Longest delay a timer is armed for. Anything above is treated as
    /// [`RetryDelay::Indefinite`].
    pub const MAX_TIMER: Duration = Duration::from_secs(i64::MAX as u64 / 1_000_000_000);

    /// Build a delay from a number of seconds.
    ///
    /// - `0.0` -> `Immediate`
    /// - finite and positive -> `After`
    /// - negative, NaN, infinite or above [`Self::MAX_TIMER`] -> `Indefinite`
    pub fn from_secs_f64(secs: f64) -> Self {
        if secs == 0.0 {
            return RetryDelay::Immediate;
        }
        if !secs.is_finite() || secs < 0.0 || secs >= Self::MAX_TIMER.as_secs_f64() {
            return RetryDelay::Indefinite;
        }
        RetryDelay::After(Duration::from_secs_f64(secs))
    }

    /// Same as [`Self::from_secs_f64`] for an already typed duration.
    pub fn from_duration(delay: Duration) -> Self {
        if delay.is_zero() {
            RetryDelay::Immediate
        } else if delay >= Self::MAX_TIMER {
            RetryDelay::Indefinite
        } else {
            RetryDelay::After(delay)
        }
    }
}

/// Result of one handler invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    /// The side effect happened; the action is deleted from the store.
    Success,

    /// The side effect did not happen; the action stays at the head.
    Failure { retry: RetryDelay },
}

impl Outcome {
    pub fn success() -> Self {
        Outcome::Success
    }

    pub fn failure(retry: RetryDelay) -> Self {
        Outcome::Failure { retry }
    }

    pub fn retry_now() -> Self {
        Outcome::failure(RetryDelay::Immediate)
    }

    pub fn retry_after(delay: Duration) -> Self {
        Outcome::failure(RetryDelay::from_duration(delay))
    }

    pub fn retry_manually() -> Self {
        Outcome::failure(RetryDelay::Indefinite)
    }

    /// `(success, retry timeout in seconds)` as handed over by callback style
    /// handlers. The timeout is ignored on success.
    pub fn from_parts(success: bool, retry_secs: f64) -> Self {
        if success {
            Outcome::Success
        } else {
            Outcome::failure(RetryDelay::from_secs_f64(retry_secs))
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0.0, RetryDelay::Immediate)]
    #[case(-1.0, RetryDelay::Indefinite)]
    #[case(f64::INFINITY, RetryDelay::Indefinite)]
    #[case(f64::NAN, RetryDelay::Indefinite)]
    #[case(1e300, RetryDelay::Indefinite)]
    #[case(2.5, RetryDelay::After(Duration::from_millis(2500)))]
    fn retry_delay_from_seconds(#[case] secs: f64, #[case] expected: RetryDelay) {
        assert_eq!(RetryDelay::from_secs_f64(secs), expected);
    }

    #[test]
    fn zero_duration_is_immediate() {
        assert_eq!(Outcome::retry_after(Duration::ZERO), Outcome::retry_now());
    }

    #[test]
    fn success_ignores_retry_timeout() {
        assert_eq!(Outcome::from_parts(true, -1.0), Outcome::Success);
        assert!(Outcome::from_parts(true, 5.0).is_success());
        assert_eq!(
            Outcome::from_parts(false, 5.0),
            Outcome::Failure {
                retry: RetryDelay::After(Duration::from_secs(5))
            }
        );
    }

    #[test]
    fn outcome_serializes_with_kind_tag() {
        let v = serde_json::to_value(Outcome::retry_manually()).unwrap();
        assert_eq!(v["kind"], "FAILURE");
        assert_eq!(v["retry"]["kind"], "indefinite");
    }
}
