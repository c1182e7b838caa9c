use std::time::{Duration, Instant};

use backoff::ExponentialBackoffBuilder;
use tracing::warn;

use crate::config::RetryConfig;
use crate::store::StoreError;

/// Caller-supplied bound on the wall-clock time an operation may spend.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    expires_at: Instant,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            expires_at: Instant::now() + budget,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    pub fn check(&self, operation: &str) -> Result<(), StoreError> {
        if self.is_expired() {
            Err(StoreError::Timeout(operation.to_string()))
        } else {
            Ok(())
        }
    }
}

/// Bounded exponential backoff for transient store errors.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Run `op`, retrying only `StoreError::Transient`. Callers must only pass
    /// operations that are safe to repeat.
    pub fn run<T, F>(
        &self,
        deadline: &Deadline,
        operation: &str,
        mut op: F,
    ) -> Result<T, StoreError>
    where
        F: FnMut() -> Result<T, StoreError>,
    {
        deadline.check(operation)?;
        let schedule = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_backoff)
            .with_max_interval(self.max_backoff)
            .with_max_elapsed_time(Some(deadline.remaining()))
            .build();

        let mut attempts = 0u32;
        let result = backoff::retry(schedule, || {
            if deadline.is_expired() {
                return Err(backoff::Error::permanent(StoreError::Timeout(
                    operation.to_string(),
                )));
            }
            attempts += 1;
            match op() {
                Ok(value) => Ok(value),
                Err(err) if err.is_transient() && attempts < self.max_attempts => {
                    warn!(
                        operation,
                        attempt = attempts,
                        error = %err,
                        "transient store error, retrying"
                    );
                    Err(backoff::Error::transient(err))
                }
                Err(err) => Err(backoff::Error::permanent(err)),
            }
        });

        result.map_err(|err| match err {
            backoff::Error::Permanent(err) => err,
            backoff::Error::Transient { err, .. } => {
                if deadline.is_expired() {
                    StoreError::Timeout(operation.to_string())
                } else {
                    err
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        }
    }

    #[test]
    fn transient_errors_are_retried_until_success() {
        let deadline = Deadline::after(Duration::from_secs(5));
        let mut calls = 0;
        let value = fast_policy(4)
            .run(&deadline, "get_tasks", || {
                calls += 1;
                if calls < 3 {
                    Err(StoreError::Transient("rate limited".to_string()))
                } else {
                    Ok(calls)
                }
            })
            .expect("eventually succeeds");
        assert_eq!(value, 3);
    }

    #[test]
    fn attempts_are_bounded() {
        let deadline = Deadline::after(Duration::from_secs(5));
        let mut calls = 0;
        let err = fast_policy(2)
            .run(&deadline, "get_tasks", || -> Result<(), StoreError> {
                calls += 1;
                Err(StoreError::Transient("503".to_string()))
            })
            .expect_err("gives up");
        assert_eq!(calls, 2);
        assert!(err.is_transient());
    }

    #[test]
    fn permanent_errors_are_not_retried() {
        let deadline = Deadline::after(Duration::from_secs(5));
        let mut calls = 0;
        let err = fast_policy(5)
            .run(&deadline, "get_task", || -> Result<(), StoreError> {
                calls += 1;
                Err(StoreError::NotFound("issue-9".to_string()))
            })
            .expect_err("not found");
        assert_eq!(calls, 1);
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn expired_deadline_surfaces_timeout() {
        let deadline = Deadline::after(Duration::ZERO);
        let err = fast_policy(3)
            .run(&deadline, "reorder", || Ok::<_, StoreError>(()))
            .expect_err("expired");
        assert!(matches!(err, StoreError::Timeout(op) if op == "reorder"));
    }
}
