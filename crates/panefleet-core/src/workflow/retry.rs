//! Retry policy for failed steps.
//!
//! Stateless: all logic lives in associated functions that take the step
//! declaration as a parameter.

use std::time::Duration;

use panefleet_types::workflow::{BackoffMode, ErrorAction, Step};

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

pub struct RetryPolicy;

impl RetryPolicy {
    /// Total attempts allowed for `step` under `action` (the step's own error
    /// action, or the inherited one). Only `retry` grants extra attempts.
    pub fn max_attempts(step: &Step, action: ErrorAction) -> u32 {
        if action == ErrorAction::Retry {
            step.retry_count.saturating_add(1)
        } else {
            1
        }
    }

    /// Whether another attempt follows a failed `attempt` (1-based).
    pub fn should_retry(attempt: u32, max_attempts: u32) -> bool {
        attempt < max_attempts
    }

    /// Delay before the attempt that follows the failed `attempt`.
    ///
    /// - `none` / unspecified: `base`
    /// - `linear`: `base * attempt`
    /// - `exponential`: `base * 2^(attempt - 1)`
    pub fn calculate_retry_delay(
        base: Duration,
        attempt: u32,
        backoff: Option<BackoffMode>,
    ) -> Duration {
        match backoff.unwrap_or_default() {
            BackoffMode::None => base,
            BackoffMode::Linear => base.saturating_mul(attempt),
            BackoffMode::Exponential => {
                let exponent = attempt.saturating_sub(1).min(31);
                base.saturating_mul(1u32 << exponent)
            }
        }
    }

    /// The step's delay, falling back to `default_delay`.
    pub fn base_delay(step: &Step, default_delay: Duration) -> Duration {
        step.retry_delay.unwrap_or(default_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: Duration = Duration::from_secs(1);

    #[test]
    fn linear_backoff_scales_with_attempt() {
        assert_eq!(
            RetryPolicy::calculate_retry_delay(SEC, 3, Some(BackoffMode::Linear)),
            Duration::from_secs(3)
        );
    }

    #[test]
    fn exponential_backoff_doubles() {
        assert_eq!(
            RetryPolicy::calculate_retry_delay(SEC, 1, Some(BackoffMode::Exponential)),
            SEC
        );
        assert_eq!(
            RetryPolicy::calculate_retry_delay(SEC, 3, Some(BackoffMode::Exponential)),
            Duration::from_secs(4)
        );
    }

    #[test]
    fn no_backoff_is_constant() {
        for attempt in [1, 2, 7, 50] {
            assert_eq!(RetryPolicy::calculate_retry_delay(SEC, attempt, None), SEC);
            assert_eq!(
                RetryPolicy::calculate_retry_delay(SEC, attempt, Some(BackoffMode::None)),
                SEC
            );
        }
    }

    #[test]
    fn huge_attempts_saturate() {
        let delay = RetryPolicy::calculate_retry_delay(SEC, 200, Some(BackoffMode::Exponential));
        assert_eq!(delay, SEC * (1 << 31));
    }

    #[test]
    fn max_attempts_only_for_retry_action() {
        let step = Step {
            id: "s".into(),
            retry_count: 2,
            ..Default::default()
        };
        assert_eq!(RetryPolicy::max_attempts(&step, ErrorAction::Retry), 3);
        assert_eq!(RetryPolicy::max_attempts(&step, ErrorAction::Fail), 1);
        assert_eq!(RetryPolicy::max_attempts(&step, ErrorAction::Continue), 1);
        assert!(RetryPolicy::should_retry(2, 3));
        assert!(!RetryPolicy::should_retry(3, 3));
    }

    #[test]
    fn base_delay_falls_back() {
        let mut step = Step::default();
        assert_eq!(RetryPolicy::base_delay(&step, Duration::from_secs(5)), Duration::from_secs(5));
        step.retry_delay = Some(Duration::from_millis(10));
        assert_eq!(
            RetryPolicy::base_delay(&step, Duration::from_secs(5)),
            Duration::from_millis(10)
        );
    }
}
