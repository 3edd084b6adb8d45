//! Bounded exponential backoff for commit and abort delivery

use crate::config::RetryConfig;
use crate::coordination::ParticipantId;
use crate::error::{CoordinatorError, CoordinatorResult};

use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};

/// How hard to try before declaring a participant unacknowledged
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Upper bound on each individual attempt
    pub call_timeout: Duration,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            call_timeout: Duration::from_millis(config.call_timeout_ms),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// Run `call` until it succeeds or attempts run out.
    ///
    /// Retryable errors and per-call timeouts are retried; exhaustion, or an
    /// error that cannot heal, yields `ParticipantAckFailure`.
    pub async fn run<F, Fut>(
        &self,
        participant: &ParticipantId,
        operation: &str,
        mut call: F,
    ) -> CoordinatorResult<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CoordinatorResult<()>>,
    {
        let mut attempts = 0;
        let mut backoff = self.initial_backoff;

        while attempts < self.max_attempts {
            attempts += 1;

            match timeout(self.call_timeout, call()).await {
                Ok(Ok(())) => {
                    if attempts > 1 {
                        info!(
                            "Participant {} acknowledged {} (attempt {}/{})",
                            participant, operation, attempts, self.max_attempts
                        );
                    }
                    return Ok(());
                }
                Ok(Err(e)) => {
                    warn!(
                        "Participant {} failed {} (attempt {}/{}): {}",
                        participant, operation, attempts, self.max_attempts, e
                    );
                    if !e.is_retryable() {
                        break;
                    }
                }
                Err(_) => {
                    warn!(
                        "Participant {} {} timeout (attempt {}/{})",
                        participant, operation, attempts, self.max_attempts
                    );
                }
            }

            // Wait before retry
            if attempts < self.max_attempts {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(self.max_backoff);
            }
        }

        Err(CoordinatorError::ParticipantAckFailure {
            participant: participant.to_string(),
            operation: operation.to_string(),
            attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            call_timeout: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let result = policy(5)
            .run(&"a".into(), "commit", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(CoordinatorError::Internal("connection reset".to_string()))
                } else {
                    Ok(())
                }
            })
            .await;

        tokio_test::assert_ok!(result);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_ack_failure() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let result = policy(3)
            .run(&"a".into(), "abort", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(CoordinatorError::Internal("down".to_string()))
            })
            .await;

        match result {
            Err(CoordinatorError::ParticipantAckFailure {
                participant,
                operation,
                attempts,
            }) => {
                assert_eq!(participant, "a");
                assert_eq!(operation, "abort");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_stops_retrying() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let result = policy(5)
            .run(&"a".into(), "abort", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(CoordinatorError::ProtocolViolation {
                    tx_id: "t".to_string(),
                    message: "already committed".to_string(),
                })
            })
            .await;

        assert!(matches!(
            result,
            Err(CoordinatorError::ParticipantAckFailure { attempts: 1, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_slow_calls_count_as_failures() {
        let result = policy(2)
            .run(&"a".into(), "commit", || async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(())
            })
            .await;

        tokio_test::assert_err!(result);
    }

    #[test]
    fn test_policy_from_config_never_zero_attempts() {
        let config = RetryConfig {
            max_attempts: 0,
            initial_backoff_ms: 10,
            max_backoff_ms: 20,
            call_timeout_ms: 30,
        };
        let policy = RetryPolicy::from(&config);
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.call_timeout, Duration::from_millis(30));
    }
}
