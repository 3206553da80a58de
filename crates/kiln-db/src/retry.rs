//! Bounded retry with exponential backoff for lock contention.

use std::time::Duration;

use tracing::warn;

use crate::error::StorageError;

/// How often, and how patiently, to retry transient storage failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 5,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Never retries.
    pub fn none() -> Self {
        RetryPolicy {
            attempts: 1,
            ..Self::default()
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Runs `op` until it succeeds, fails fatally, or attempts run out.
    ///
    /// Exhausting the attempts on a transient error yields
    /// [`StorageError::Busy`].
    pub fn run<T>(
        &self,
        mut op: impl FnMut() -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let attempts = self.attempts.max(1);
        let mut attempt = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() => {
                    attempt += 1;
                    if attempt >= attempts {
                        return Err(StorageError::Busy {
                            attempts,
                            last: err.to_string(),
                        });
                    }
                    let delay = self.delay_for(attempt - 1);
                    warn!(attempt, ?delay, error = %err, "storage busy, retrying");
                    std::thread::sleep(delay);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn busy() -> StorageError {
        StorageError::Backend {
            reason: "locked".into(),
            transient: true,
        }
    }

    fn fast(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[test]
    fn succeeds_after_transient_failures() {
        let mut calls = 0;
        let result = fast(5).run(|| {
            calls += 1;
            if calls < 3 {
                Err(busy())
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn gives_up_with_busy() {
        let mut calls = 0;
        let err = fast(3)
            .run(|| -> Result<(), _> {
                calls += 1;
                Err(busy())
            })
            .unwrap_err();
        assert_eq!(calls, 3);
        assert!(matches!(err, StorageError::Busy { attempts: 3, .. }));
    }

    #[test]
    fn fatal_errors_are_not_retried() {
        let mut calls = 0;
        let err = fast(5)
            .run(|| -> Result<(), _> {
                calls += 1;
                Err(StorageError::Integrity {
                    reason: "bad".into(),
                })
            })
            .unwrap_err();
        assert_eq!(calls, 1);
        assert!(matches!(err, StorageError::Integrity { .. }));
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_millis(10));
        assert_eq!(policy.delay_for(1), Duration::from_millis(20));
        assert_eq!(policy.delay_for(3), Duration::from_millis(80));
        assert_eq!(policy.delay_for(10), Duration::from_millis(500));
        assert_eq!(policy.delay_for(40), Duration::from_millis(500));
    }
}
