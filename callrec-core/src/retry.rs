use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tracing::warn;

use crate::config::OrchestratorSection;

/// How the orchestrator reacts to an error raised by a pipeline step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Retry with backoff.
    Transient,
    /// Record and move on.
    Ignorable,
    /// Abort the run.
    Fatal,
}

/// Exponential backoff: `base * rate^(attempt - 1)` before retry `attempt`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub rate: f64,
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            rate: 1.05,
            max_retries: 3,
        }
    }
}

impl BackoffPolicy {
    pub fn from_section(section: &OrchestratorSection) -> Self {
        Self {
            base: Duration::from_secs(section.retry_base_seconds),
            rate: section.retry_backoff_rate,
            max_retries: section.retry_max_attempts,
        }
    }

    /// Delay before the given retry (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        self.base.mul_f64(self.rate.powi(exponent))
    }

    /// Runs `operation`, retrying while `classify` reports a transient error
    /// and retries remain. The last error is returned otherwise.
    pub async fn retry<T, E, F, Fut, C>(&self, label: &str, classify: C, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> ErrorClass,
        E: std::fmt::Display,
    {
        let mut attempt = 0u32;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if classify(&err) != ErrorClass::Transient || attempt >= self.max_retries {
                        return Err(err);
                    }
                    attempt += 1;
                    let delay = self.delay_for(attempt);
                    warn!(
                        step = label,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delays_grow_by_rate() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for(2), Duration::from_millis(5250));
        assert!(policy.delay_for(3) > policy.delay_for(2));
        assert!(policy.delay_for(3) < Duration::from_millis(5520));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_up_to_the_limit() {
        let calls = AtomicU32::new(0);
        let policy = BackoffPolicy::default();
        let result: Result<(), String> = policy
            .retry(
                "test",
                |_| ErrorClass::Transient,
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("busy".to_string()) }
                },
            )
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failure() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = BackoffPolicy::default()
            .retry(
                "test",
                |_| ErrorClass::Transient,
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n == 0 {
                            Err("busy".to_string())
                        } else {
                            Ok(n)
                        }
                    }
                },
            )
            .await;
        assert_eq!(result.unwrap(), 1);
    }

    #[tokio::test]
    async fn non_transient_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = BackoffPolicy::default()
            .retry(
                "test",
                |_| ErrorClass::Fatal,
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("gone".to_string()) }
                },
            )
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
