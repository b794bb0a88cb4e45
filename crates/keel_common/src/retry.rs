//! Bounded exponential backoff for idempotent operations
//!
//! Only read-only, repeatable work (image fetch) goes through here. Every
//! other lifecycle step fails on its first error.

use crate::error::{KeelError, Result};
use std::thread;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): base * multiplier^(retry-1), capped
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(63) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exp);
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }
}

/// Run `op` until it succeeds, it returns a non-transient error, or attempts run out
pub fn retry<T, F>(policy: &RetryPolicy, operation: &str, op: F) -> Result<T>
where
    F: FnMut(u32) -> Result<T>,
{
    retry_with_sleep(policy, operation, op, thread::sleep)
}

/// `retry` with an injectable sleep
pub fn retry_with_sleep<T, F, S>(policy: &RetryPolicy, operation: &str, mut op: F, mut sleep: S) -> Result<T>
where
    F: FnMut(u32) -> Result<T>,
    S: FnMut(Duration),
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) if attempt >= max_attempts => {
                return Err(KeelError::TransientInfrastructure {
                    operation: operation.to_string(),
                    attempts: attempt,
                    last_error: e.to_string(),
                });
            }
            Err(e) => {
                let delay = policy.delay_for(attempt);
                warn!(
                    "{} attempt {}/{} failed: {} (retrying in {:?})",
                    operation, attempt, max_attempts, e, delay
                );
                sleep(delay);
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }

    #[test]
    fn test_delays_double_and_cap() {
        let policy = RetryPolicy {
            max_attempts: 6,
            ..policy()
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(10));
        assert_eq!(policy.delay_for(2), Duration::from_secs(20));
        assert_eq!(policy.delay_for(3), Duration::from_secs(40));
        assert_eq!(policy.delay_for(4), Duration::from_secs(60));
        assert_eq!(policy.delay_for(10), Duration::from_secs(60));
    }

    #[test]
    fn test_succeeds_after_transient_failures() {
        let mut slept = Vec::new();
        let result = retry_with_sleep(
            &policy(),
            "image fetch",
            |attempt| {
                if attempt < 3 {
                    Err(KeelError::runtime("registry timeout"))
                } else {
                    Ok(attempt)
                }
            },
            |d| slept.push(d),
        );

        assert_eq!(result.unwrap(), 3);
        assert_eq!(slept, vec![Duration::from_secs(10), Duration::from_secs(20)]);
    }

    #[test]
    fn test_exhaustion_reports_transient_error() {
        let mut calls = 0;
        let err = retry_with_sleep(
            &policy(),
            "image fetch",
            |_| -> Result<()> {
                calls += 1;
                Err(KeelError::runtime("registry down"))
            },
            |_| {},
        )
        .unwrap_err();

        assert_eq!(calls, 3);
        match err {
            KeelError::TransientInfrastructure { attempts, last_error, .. } => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("registry down"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_validation_error_is_not_retried() {
        let mut calls = 0;
        let err = retry_with_sleep(
            &policy(),
            "image fetch",
            |_| -> Result<()> {
                calls += 1;
                Err(KeelError::validation("bad tag"))
            },
            |_| panic!("must not sleep"),
        )
        .unwrap_err();

        assert_eq!(calls, 1);
        assert_eq!(err.exit_code(), 3);
    }
}
