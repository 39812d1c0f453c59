//! Retry scheduling for failed steps.
//!
//! Stateless: attempt bookkeeping lives with the caller. Attempts are 1-based
//! and `max_attempts` counts the first execution.

use std::time::Duration;

use marketflow_types::recovery::RecoveryStrategy;
use marketflow_types::workflow::{BackoffKind, RetryPolicy};

/// Upper bound on a single backoff delay.
const MAX_DELAY_MS: u64 = 60 * 60 * 1000;

/// Effective retry settings for one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySchedule {
    pub max_attempts: u32,
    pub backoff: BackoffKind,
    pub base_delay_ms: u64,
}

impl RetrySchedule {
    /// A step's own retry policy wins over the recovery strategy's settings.
    pub fn resolve(step_policy: Option<&RetryPolicy>, strategy: &RecoveryStrategy) -> Self {
        match step_policy {
            Some(policy) => Self {
                max_attempts: policy.max_attempts.max(1),
                backoff: policy.backoff,
                base_delay_ms: policy.base_delay_ms,
            },
            None => Self {
                max_attempts: strategy.max_attempts.max(1),
                backoff: strategy.backoff,
                base_delay_ms: strategy.base_delay_ms,
            },
        }
    }
}

/// Stateless retry handler.
pub struct RetryHandler;

impl RetryHandler {
    /// Whether another attempt is allowed after `attempt` failed.
    pub fn should_retry(schedule: &RetrySchedule, attempt: u32) -> bool {
        attempt < schedule.max_attempts
    }

    /// Delay before the attempt following failed attempt `attempt`.
    ///
    /// Linear: `base * attempt`. Exponential: `base * 2^(attempt - 1)`.
    pub fn backoff_delay(backoff: BackoffKind, base_delay_ms: u64, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let ms = match backoff {
            BackoffKind::Linear => base_delay_ms.saturating_mul(u64::from(attempt)),
            BackoffKind::Exponential => {
                let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
                base_delay_ms.saturating_mul(factor)
            }
        };
        Duration::from_millis(ms.min(MAX_DELAY_MS))
    }

    /// Delay for `schedule` after failed attempt `attempt`.
    pub fn delay_for(schedule: &RetrySchedule, attempt: u32) -> Duration {
        Self::backoff_delay(schedule.backoff, schedule.base_delay_ms, attempt)
    }
}
