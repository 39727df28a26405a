//! Retry with exponential backoff and jitter.
//!
//! `delay = min(max_delay, base_delay · 2^attempt) + U(−jitter, +jitter)`,
//! except a rate-limit error that carries a server `retry-after` hint, which
//! wins over the computed schedule. Only retryable errors are retried; see
//! [`LlmError::is_retryable`].

use std::time::Duration;

use tracing::{debug, warn};

use crate::provider::LlmError;
use relay_core::config::ResilienceConfig;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts per model, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: Duration::from_millis(500),
        }
    }
}

impl RetryConfig {
    pub fn from_resilience(cfg: &ResilienceConfig) -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs_f64(cfg.base_delay.max(0.0)),
            max_delay: Duration::from_secs_f64(cfg.max_delay.max(0.0)),
            jitter: Duration::from_secs_f64(cfg.jitter.max(0.0)),
        }
    }

    /// Backoff before retrying after attempt number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_secs_f64() * 2f64.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        // U(-jitter, +jitter)
        let jitter = self.jitter.as_secs_f64() * (jitter_unit() * 2.0 - 1.0);
        Duration::from_secs_f64((capped + jitter).max(0.0))
    }
}

/// Execute `f` with the retry schedule. Fatal and non-retryable errors
/// propagate immediately.
pub async fn with_retry<F, Fut, T>(
    config: &RetryConfig,
    operation: &str,
    mut f: F,
) -> Result<T, LlmError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, LlmError>>,
{
    let mut last_error = None;

    for attempt in 0..config.max_attempts {
        match f().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(operation, attempt = attempt + 1, "retry succeeded");
                }
                return Ok(value);
            }
            Err(e) => {
                if !e.is_retryable() || attempt + 1 == config.max_attempts {
                    return Err(e);
                }

                let delay = match &e {
                    LlmError::RateLimited {
                        retry_after_secs: Some(secs),
                    } => Duration::from_secs(*secs).min(config.max_delay),
                    _ => config.delay_for(attempt),
                };

                warn!(
                    operation,
                    attempt = attempt + 1,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or(LlmError::Timeout))
}

/// Pseudo-random f64 in [0, 1) from the clock's sub-second noise.
fn jitter_unit() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 10_000) as f64 / 10_000.0
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
