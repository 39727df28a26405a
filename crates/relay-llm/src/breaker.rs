//! Per-provider circuit breaker.
//!
//! `CLOSED` tracks consecutive failures; hitting the threshold opens the
//! circuit and calls fast-fail. After the cooldown the breaker moves to
//! `HALF_OPEN` and admits exactly one probe: success closes the circuit,
//! failure re-opens it and restarts the cooldown.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - calls pass through.
    Closed,
    /// Too many failures - calls are rejected immediately.
    Open,
    /// Cooling down - a single probe is allowed through.
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long the circuit stays open before admitting a probe.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(120),
        }
    }
}

#[derive(Debug)]
struct InnerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Arc<Mutex<InnerState>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Arc::new(Mutex::new(InnerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            })),
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    pub async fn failure_count(&self) -> u32 {
        self.inner.lock().await.consecutive_failures
    }

    /// May a call proceed right now?
    ///
    /// In `HALF_OPEN` only one probe is admitted at a time; further callers
    /// are rejected until the probe reports back.
    pub async fn admit(&self) -> bool {
        let mut guard = self.inner.lock().await;
        match guard.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled = guard
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.cooldown)
                    .unwrap_or(true);
                if cooled {
                    info!(provider = %self.name, "circuit breaker Open -> HalfOpen");
                    guard.state = CircuitState::HalfOpen;
                    guard.probe_in_flight = true;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if guard.probe_in_flight {
                    false
                } else {
                    guard.probe_in_flight = true;
                    true
                }
            }
        }
    }

    pub async fn record_success(&self) {
        let mut guard = self.inner.lock().await;
        guard.probe_in_flight = false;
        match guard.state {
            CircuitState::HalfOpen => {
                info!(provider = %self.name, "circuit breaker HalfOpen -> Closed");
                guard.state = CircuitState::Closed;
                guard.consecutive_failures = 0;
                guard.opened_at = None;
            }
            CircuitState::Closed => {
                guard.consecutive_failures = 0;
            }
            CircuitState::Open => {}
        }
    }

    pub async fn record_failure(&self) {
        let mut guard = self.inner.lock().await;
        guard.probe_in_flight = false;
        guard.consecutive_failures += 1;
        match guard.state {
            CircuitState::Closed => {
                if guard.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        provider = %self.name,
                        failures = guard.consecutive_failures,
                        "circuit breaker Closed -> Open"
                    );
                    guard.state = CircuitState::Open;
                    guard.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                warn!(provider = %self.name, "circuit breaker HalfOpen -> Open (probe failed)");
                guard.state = CircuitState::Open;
                guard.opened_at = Some(Instant::now());
            }
            CircuitState::Open => {}
        }
    }

    /// Manually reset to `CLOSED`.
    pub async fn reset(&self) {
        let mut guard = self.inner.lock().await;
        guard.state = CircuitState::Closed;
        guard.consecutive_failures = 0;
        guard.opened_at = None;
        guard.probe_in_flight = false;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(cooldown_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            BreakerConfig {
                failure_threshold: 3,
                cooldown: Duration::from_millis(cooldown_ms),
            },
        )
    }

    #[tokio::test]
    async fn opens_after_exactly_threshold_failures() {
        let cb = breaker(1_000);
        cb.record_failure().await;
        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Closed);
        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Open);
        assert!(!cb.admit().await);
    }

    #[tokio::test]
    async fn success_resets_failure_streak() {
        let cb = breaker(1_000);
        cb.record_failure().await;
        cb.record_failure().await;
        cb.record_success().await;
        cb.record_failure().await;
        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_admits_exactly_one_probe() {
        let cb = breaker(10);
        for _ in 0..3 {
            cb.record_failure().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(cb.admit().await);
        assert_eq!(cb.state().await, CircuitState::HalfOpen);
        // The probe is still in flight - nobody else gets through.
        assert!(!cb.admit().await);
    }

    #[tokio::test]
    async fn probe_success_closes() {
        let cb = breaker(10);
        for _ in 0..3 {
            cb.record_failure().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cb.admit().await);
        cb.record_success().await;
        assert_eq!(cb.state().await, CircuitState::Closed);
        assert!(cb.admit().await);
    }

    #[tokio::test]
    async fn probe_failure_reopens_and_restarts_cooldown() {
        let cb = breaker(50);
        for _ in 0..3 {
            cb.record_failure().await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(cb.admit().await);
        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Open);
        // Cooldown restarted - still rejecting.
        assert!(!cb.admit().await);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(cb.admit().await);
    }

    #[tokio::test]
    async fn reset_returns_to_closed() {
        let cb = breaker(10_000);
        for _ in 0..3 {
            cb.record_failure().await;
        }
        cb.reset().await;
        assert_eq!(cb.state().await, CircuitState::Closed);
        assert_eq!(cb.failure_count().await, 0);
    }
}
