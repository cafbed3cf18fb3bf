//! Retry with exponential backoff and full jitter.
//!
//! Network errors, 429 and 5xx responses are retried; everything else
//! (including precondition failures) is returned immediately.

use std::future::Future;
use std::time::{Duration, SystemTime};

use tracing::warn;

use super::error::FirestoreResult;
use super::metrics::record_retry;

/// Retry policy configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts.
    pub max_retries: u32,
    /// Base delay for exponential backoff (in milliseconds).
    pub base_delay_ms: u64,
    /// Maximum delay cap (in milliseconds).
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 5000,
        }
    }
}

impl RetryConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let parse = |key: &str| std::env::var(key).ok().and_then(|s| s.parse::<u64>().ok());

        Self {
            max_retries: parse("FIRESTORE_MAX_RETRIES")
                .map(|n| n as u32)
                .unwrap_or(defaults.max_retries),
            base_delay_ms: parse("FIRESTORE_RETRY_BASE_MS").unwrap_or(defaults.base_delay_ms),
            max_delay_ms: parse("FIRESTORE_RETRY_MAX_MS").unwrap_or(defaults.max_delay_ms),
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub(crate) fn delay_for(&self, attempt: u32, retry_after_ms: Option<u64>) -> Duration {
        if let Some(after) = retry_after_ms {
            return Duration::from_millis(after);
        }

        let exp_delay = self
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt));
        let capped = exp_delay.min(self.max_delay_ms);

        // Time-derived jitter in [0, capped)
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        let jittered = ((capped as f64) * ((nanos % 1000) as f64 / 1000.0)) as u64;

        Duration::from_millis(jittered.max(self.base_delay_ms.min(capped)))
    }
}

/// Execute an async operation, retrying transient failures.
pub async fn with_retry<T, F, Fut>(
    config: &RetryConfig,
    operation: &'static str,
    op: F,
) -> FirestoreResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = FirestoreResult<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(e) if e.is_retryable() && attempt < config.max_retries => {
                let delay = config.delay_for(attempt, e.retry_after_ms());
                warn!(
                    operation,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Firestore operation failed, retrying: {}",
                    e
                );
                record_retry(operation);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}
