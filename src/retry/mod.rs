//! Retry driver.
//!
//! Maps a step's retry policy onto the activity attempt loop: bounded
//! exponential backoff, a cap on any single interval, and a skip list of
//! error kinds that must never be retried. Without a policy a step gets
//! exactly one attempt.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::dsl::RetryPolicy;
use crate::errors::EngineError;

/// Drives attempts of one step activity according to its policy.
pub struct RetryDriver {
    policy: RetryPolicy,
    has_policy: bool,
}

impl RetryDriver {
    /// Builds a driver from an optional step policy. Absent policy means a
    /// single attempt with no backoff.
    pub fn new(policy: Option<&RetryPolicy>) -> Self {
        match policy {
            Some(policy) => Self {
                policy: policy.clone(),
                has_policy: true,
            },
            None => Self {
                policy: RetryPolicy::default(),
                has_policy: false,
            },
        }
    }

    /// Total attempts this driver will make.
    pub fn max_attempts(&self) -> u32 {
        if self.has_policy {
            self.policy.maximum_attempts.max(1)
        } else {
            1
        }
    }

    /// Backoff interval preceding attempt `attempt + 1`, after `attempt`
    /// attempts have failed.
    pub fn interval_after(&self, attempt: u32) -> Duration {
        let factor = self
            .policy
            .backoff_coefficient
            .powi(attempt.saturating_sub(1) as i32);
        let raw = self.policy.initial_interval.as_secs_f64() * factor;
        // Exponentials overflow fast; bound the uncapped case to a day so
        // the f64 -> Duration conversion stays in range.
        let interval = if raw.is_finite() {
            Duration::from_secs_f64(raw.min(86_400.0))
        } else {
            Duration::from_secs(86_400)
        };
        match self.policy.maximum_interval {
            Some(cap) if interval > cap => cap,
            _ => interval,
        }
    }

    /// Whether `error` may be retried under this policy.
    fn may_retry(&self, error: &EngineError) -> bool {
        error.retryable()
            && !self
                .policy
                .non_retryable_errors
                .iter()
                .any(|kind| kind == error.kind())
    }

    /// Runs `operation` until it succeeds, the policy is exhausted, or a
    /// non-retryable error occurs. The closure receives the attempt number
    /// (starting at 1). Returns the value or error together with the number
    /// of attempts actually made.
    pub async fn run<T, F, Fut>(
        &self,
        step_name: &str,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> (Result<T, EngineError>, u32)
    where
        F: FnMut(u32) -> Fut,
        Fut: std::future::Future<Output = Result<T, EngineError>>,
    {
        let max_attempts = self.max_attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;
            match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(step = %step_name, attempt, "step succeeded after retry");
                    }
                    return (Ok(value), attempt);
                }
                Err(error) => {
                    if attempt >= max_attempts || !self.may_retry(&error) {
                        return (Err(error), attempt);
                    }
                    let backoff = self.interval_after(attempt);
                    warn!(
                        step = %step_name,
                        attempt,
                        max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %error,
                        "attempt failed, backing off before retry"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return (Err(EngineError::Cancelled), attempt);
                        }
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }
    }
}
