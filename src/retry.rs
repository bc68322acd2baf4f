//! Retry with exponential backoff.
//!
//! Classification comes from `AgentError` itself: fatal errors and
//! configuration problems stop immediately, everything `is_retryable()` is
//! tried again after a growing delay.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

use crate::error::{AgentError, AgentResult};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Delay before the retry that follows attempt number `attempt` (0-based).
pub fn calculate_delay(config: &RetryConfig, attempt: usize) -> Duration {
    let delay = config.base_delay_ms as f64 * config.backoff_multiplier.powi(attempt as i32);
    let clamped = delay.min(config.max_delay_ms as f64) as u64;
    Duration::from_millis(clamped)
}

pub async fn with_retry<F, Fut, T>(config: &RetryConfig, operation_name: &str, mut operation: F) -> AgentResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AgentResult<T>>,
{
    let mut last_error = None;

    for attempt in 0..config.max_attempts {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(operation = operation_name, attempt = attempt + 1, "succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) => {
                tracing::warn!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    max = config.max_attempts,
                    error = %e,
                    "attempt failed"
                );

                if !e.is_retryable() || attempt + 1 >= config.max_attempts {
                    return Err(e);
                }

                let delay = calculate_delay(config, attempt);
                tracing::debug!(operation = operation_name, delay_ms = delay.as_millis() as u64, "backing off");
                sleep(delay).await;
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| AgentError::Config(format!("{}: retry budget is zero", operation_name))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast() -> RetryConfig {
        RetryConfig { max_attempts: 3, base_delay_ms: 1, max_delay_ms: 5, backoff_multiplier: 2.0 }
    }

    #[test]
    fn test_calculate_delay() {
        let config = RetryConfig::default();

        assert_eq!(calculate_delay(&config, 0).as_millis(), 1000);
        assert_eq!(calculate_delay(&config, 1).as_millis(), 2000);
        assert_eq!(calculate_delay(&config, 2).as_millis(), 4000);
        assert_eq!(calculate_delay(&config, 10).as_millis(), 30000);
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result = with_retry(&fast(), "login", || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(AgentError::TransientUi("field missing".into()))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_errors_stop_immediately() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result: AgentResult<()> = with_retry(&fast(), "login", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(AgentError::Auth("bad password".into()))
        })
        .await;
        assert!(matches!(result, Err(AgentError::Auth(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_budget_returns_last_error() {
        let result: AgentResult<()> =
            with_retry(&fast(), "login", || async { Err(AgentError::TransientUi("still loading".into())) }).await;
        assert!(matches!(result, Err(AgentError::TransientUi(_))));
    }
}
