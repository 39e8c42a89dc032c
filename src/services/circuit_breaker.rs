//! Circuit breaker pattern implementation.
//!
//! `closed -> open -> half-open -> closed`. The circuit opens after
//! `failure_threshold` consecutive failures and fails fast until
//! `recovery_timeout` has elapsed. Exactly one probe is then let through; its
//! success closes the circuit, its failure reopens it.

use crate::core::config::CircuitBreakerConfig;
use crate::core::error::{AppError, Result};
use crate::core::metrics::get_metrics;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CircuitState {
    /// Requests flow normally
    Closed = 0,
    /// Requests are rejected
    Open = 1,
    /// One probe request is testing recovery
    HalfOpen = 2,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Permission to run one call; reports the outcome back to the breaker.
enum Admission {
    Normal,
    Probe,
}

pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        let breaker = Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        };
        breaker.publish(CircuitState::Closed);
        breaker
    }

    pub fn from_config(name: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        Self::new(
            name,
            config.failure_threshold,
            Duration::from_millis(config.recovery_timeout_ms),
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, state: CircuitState) {
        get_metrics()
            .circuit_state
            .with_label_values(&[&self.name])
            .set(state as u8 as f64);
    }

    /// Current state, accounting for an elapsed recovery timeout.
    pub fn state(&self) -> CircuitState {
        let inner = self.lock();
        match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(opened)) if opened.elapsed() >= self.recovery_timeout => {
                CircuitState::HalfOpen
            }
            (state, _) => state,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    fn admit(&self) -> Result<Admission> {
        let mut inner = self.lock();
        let state = inner.state;
        match state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|opened| opened.elapsed())
                    .unwrap_or_default();
                if elapsed >= self.recovery_timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    drop(inner);
                    self.publish(CircuitState::HalfOpen);
                    debug!(circuit = %self.name, "Circuit breaker half-open, sending probe");
                    Ok(Admission::Probe)
                } else {
                    Err(AppError::CircuitOpen(self.name.clone()))
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(AppError::CircuitOpen(self.name.clone()))
                } else {
                    inner.probe_in_flight = true;
                    Ok(Admission::Probe)
                }
            }
        }
    }

    fn on_success(&self, admission: Admission) {
        let mut inner = self.lock();
        inner.consecutive_failures = 0;
        if matches!(admission, Admission::Probe) || inner.state != CircuitState::Closed {
            inner.state = CircuitState::Closed;
            inner.opened_at = None;
            inner.probe_in_flight = false;
            drop(inner);
            self.publish(CircuitState::Closed);
            info!(circuit = %self.name, "Circuit breaker closed");
        }
    }

    fn on_failure(&self, admission: Admission) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        let reopen = match admission {
            Admission::Probe => true,
            Admission::Normal => {
                inner.state == CircuitState::Closed
                    && inner.consecutive_failures >= self.failure_threshold
            }
        };
        if reopen {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            inner.probe_in_flight = false;
            let failures = inner.consecutive_failures;
            drop(inner);
            self.publish(CircuitState::Open);
            warn!(circuit = %self.name, failures, "Circuit breaker opened");
        }
    }

    /// Run `operation` through the breaker. While open, fails fast with
    /// [`AppError::CircuitOpen`] without calling `operation`.
    pub async fn call<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let admission = self.admit()?;
        let guard = ProbeGuard {
            breaker: self,
            armed: matches!(admission, Admission::Probe),
        };

        let result = operation().await;
        guard.disarm();

        match &result {
            Ok(_) => self.on_success(admission),
            Err(_) => self.on_failure(admission),
        }
        result
    }

    /// Force the circuit closed.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
        drop(inner);
        self.publish(CircuitState::Closed);
    }
}

/// Releases the half-open probe slot if the probing call is cancelled before
/// it reports an outcome.
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl ProbeGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.lock().probe_in_flight = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::Arc;

    async fn fail(breaker: &CircuitBreaker) -> Result<()> {
        breaker
            .call(|| async { Err(AppError::Unavailable("down".into())) })
            .await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<u32> {
        breaker.call(|| async { Ok(1) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::new("unit-open", 3, Duration::from_secs(30));
        for _ in 0..3 {
            assert_matches!(fail(&breaker).await, Err(AppError::Unavailable(_)));
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let called = std::sync::atomic::AtomicBool::new(false);
        let result: Result<()> = breaker
            .call(|| async {
                called.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert_matches!(result, Err(AppError::CircuitOpen(_)));
        assert!(!called.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_counter() {
        let breaker = CircuitBreaker::new("unit-reset", 3, Duration::from_secs(30));
        fail(&breaker).await.unwrap_err();
        fail(&breaker).await.unwrap_err();
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.consecutive_failures(), 0);
        fail(&breaker).await.unwrap_err();
        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_probe_success_closes() {
        let breaker = CircuitBreaker::new("unit-probe-ok", 1, Duration::from_secs(30));
        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        assert_eq!(succeed(&breaker).await.unwrap(), 1);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_probe_failure_reopens() {
        let breaker = CircuitBreaker::new("unit-probe-fail", 1, Duration::from_secs(30));
        fail(&breaker).await.unwrap_err();

        tokio::time::advance(Duration::from_secs(31)).await;
        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Open);

        assert_matches!(succeed(&breaker).await, Err(AppError::CircuitOpen(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_probe_in_half_open() {
        let breaker = Arc::new(CircuitBreaker::new("unit-single-probe", 1, Duration::from_secs(1)));
        fail(&breaker).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(2)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let probe = {
            let breaker = breaker.clone();
            tokio::spawn(async move {
                breaker
                    .call(|| async move {
                        let _ = release_rx.await;
                        Ok(())
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;

        // Second caller is refused while the probe is outstanding
        assert_matches!(succeed(&breaker).await, Err(AppError::CircuitOpen(_)));

        release_tx.send(()).unwrap();
        probe.await.unwrap().unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_probe_releases_slot() {
        let breaker = Arc::new(CircuitBreaker::new("unit-cancel-probe", 1, Duration::from_secs(1)));
        fail(&breaker).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(2)).await;

        let probe = {
            let breaker = breaker.clone();
            tokio::spawn(async move {
                breaker
                    .call(|| async {
                        futures::future::pending::<()>().await;
                        Ok(())
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        probe.abort();
        let _ = probe.await;

        assert_eq!(succeed(&breaker).await.unwrap(), 1);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_reset() {
        let breaker = CircuitBreaker::new("unit-manual-reset", 1, Duration::from_secs(30));
        breaker.on_failure(Admission::Normal);
        assert_eq!(breaker.state(), CircuitState::Open);
        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
