//! Per-operation circuit breaker.
//!
//! ```text
//! Closed   -> Open      failure_count >= failure_threshold
//! Open     -> HalfOpen  recovery_timeout elapsed since opened_at
//! HalfOpen -> Closed    success_threshold probes succeeded
//! HalfOpen -> Open      a probe failed (opened_at = now)
//! ```
//!
//! Only one probe runs at a time while half-open; everybody else fails fast.

use crate::domain::{BreakerSnapshot, CircuitState};
use crate::error::ExecuteError;
use crate::events::{publish, BreakerTransitionEvent, ResilienceEvent};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use shared::config::BreakerConfig;
use std::future::Future;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count_in_half_open: u32,
    opened_at: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    probe_in_flight: bool,
}

impl BreakerInner {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count_in_half_open: 0,
            opened_at: None,
            last_failure_at: None,
            probe_in_flight: false,
        }
    }
}

/// How a call got past the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Probe,
}

type Transition = Option<(CircuitState, CircuitState)>;

pub struct CircuitBreaker {
    operation: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    event_broadcaster: Option<broadcast::Sender<ResilienceEvent>>,
}

impl CircuitBreaker {
    pub fn new(operation: impl Into<String>, config: BreakerConfig) -> shared::Result<Self> {
        config.validate()?;
        Ok(Self::build(operation.into(), config, None))
    }

    pub fn with_event_broadcaster(
        operation: impl Into<String>,
        config: BreakerConfig,
        broadcaster: broadcast::Sender<ResilienceEvent>,
    ) -> shared::Result<Self> {
        config.validate()?;
        Ok(Self::build(operation.into(), config, Some(broadcaster)))
    }

    /// Construct from a config the caller has already validated.
    pub(crate) fn build(
        operation: String,
        config: BreakerConfig,
        event_broadcaster: Option<broadcast::Sender<ResilienceEvent>>,
    ) -> Self {
        debug!(
            operation = %operation,
            failure_threshold = config.failure_threshold,
            recovery_timeout_ms = config.recovery_timeout.as_millis() as u64,
            request_timeout_ms = config.request_timeout.as_millis() as u64,
            "Circuit breaker created"
        );
        Self {
            operation,
            config,
            inner: Mutex::new(BreakerInner::closed()),
            event_broadcaster,
        }
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        let retry_after = match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(opened_at)) => Some(self.retry_after(opened_at, Instant::now())),
            _ => None,
        };
        BreakerSnapshot {
            operation: self.operation.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count_in_half_open: inner.success_count_in_half_open,
            probe_in_flight: inner.probe_in_flight,
            last_failure_at: inner.last_failure_at,
            retry_after,
        }
    }

    /// Run `factory` under breaker protection, racing it against the request
    /// timeout. A timed-out factory is dropped and counted as a failure.
    pub async fn execute<F, Fut, T, E>(&self, factory: F) -> Result<T, ExecuteError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let admission = self.admit()?;
        let mut probe = ProbeSlot::hold(self, admission);

        let outcome = tokio::time::timeout(self.config.request_timeout, factory()).await;
        probe.disarm();

        match outcome {
            Ok(Ok(value)) => {
                self.record_success(admission);
                Ok(value)
            }
            Ok(Err(err)) => {
                self.record_failure(admission);
                Err(ExecuteError::backend(err))
            }
            Err(_) => {
                warn!(
                    operation = %self.operation,
                    timeout_ms = self.config.request_timeout.as_millis() as u64,
                    "Backend call timed out"
                );
                self.record_failure(admission);
                Err(ExecuteError::Timeout {
                    operation: self.operation.clone(),
                    after: self.config.request_timeout,
                })
            }
        }
    }

    fn admit<E>(&self) -> Result<Admission, ExecuteError<E>> {
        let now = Instant::now();
        let (admission, transition) = {
            let mut inner = self.inner.lock();
            match inner.state {
                CircuitState::Closed => (Admission::Normal, None),
                CircuitState::Open => {
                    if let Some(opened_at) = inner.opened_at {
                        let retry_after = self.retry_after(opened_at, now);
                        if !retry_after.is_zero() {
                            return Err(self.open_error(retry_after));
                        }
                    }
                    inner.state = CircuitState::HalfOpen;
                    inner.success_count_in_half_open = 0;
                    inner.probe_in_flight = true;
                    (
                        Admission::Probe,
                        Some((CircuitState::Open, CircuitState::HalfOpen)),
                    )
                }
                CircuitState::HalfOpen => {
                    if inner.probe_in_flight {
                        return Err(self.open_error(Duration::ZERO));
                    }
                    inner.probe_in_flight = true;
                    (Admission::Probe, None)
                }
            }
        };
        self.announce(transition);
        if admission == Admission::Probe {
            debug!(operation = %self.operation, "Admitting half-open probe");
        }
        Ok(admission)
    }

    /// Time left until an open circuit admits a probe. A recovery timeout
    /// too large to schedule keeps the circuit open for good.
    fn retry_after(&self, opened_at: Instant, now: Instant) -> Duration {
        match opened_at.checked_add(self.config.recovery_timeout) {
            Some(reopen_at) => reopen_at.saturating_duration_since(now),
            None => self.config.recovery_timeout,
        }
    }

    fn record_success(&self, admission: Admission) {
        let transition = {
            let mut inner = self.inner.lock();
            match (admission, inner.state) {
                (Admission::Probe, CircuitState::HalfOpen) => {
                    inner.probe_in_flight = false;
                    inner.success_count_in_half_open += 1;
                    if inner.success_count_in_half_open >= self.config.success_threshold {
                        *inner = BreakerInner {
                            last_failure_at: inner.last_failure_at,
                            ..BreakerInner::closed()
                        };
                        Some((CircuitState::HalfOpen, CircuitState::Closed))
                    } else {
                        None
                    }
                }
                (Admission::Normal, CircuitState::Closed) => {
                    inner.failure_count = 0;
                    None
                }
                // A call admitted before the breaker tripped; only probes decide recovery.
                _ => None,
            }
        };
        self.announce(transition);
    }

    fn record_failure(&self, admission: Admission) {
        let transition = {
            let mut inner = self.inner.lock();
            inner.last_failure_at = Some(Utc::now());
            match (admission, inner.state) {
                (Admission::Probe, CircuitState::HalfOpen) => {
                    inner.probe_in_flight = false;
                    inner.success_count_in_half_open = 0;
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    Some((CircuitState::HalfOpen, CircuitState::Open))
                }
                (Admission::Normal, CircuitState::Closed) => {
                    inner.failure_count += 1;
                    if inner.failure_count >= self.config.failure_threshold {
                        inner.state = CircuitState::Open;
                        inner.opened_at = Some(Instant::now());
                        Some((CircuitState::Closed, CircuitState::Open))
                    } else {
                        None
                    }
                }
                (Admission::Normal, _) => {
                    inner.failure_count += 1;
                    None
                }
                (Admission::Probe, _) => None,
            }
        };
        self.announce(transition);
    }

    fn release_probe(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.probe_in_flight = false;
        }
        debug!(operation = %self.operation, "Probe abandoned before completion");
    }

    fn open_error<E>(&self, retry_after: Duration) -> ExecuteError<E> {
        debug!(
            operation = %self.operation,
            retry_after_ms = retry_after.as_millis() as u64,
            "Failing fast, circuit not closed"
        );
        ExecuteError::CircuitOpen {
            operation: self.operation.clone(),
            retry_after,
        }
    }

    fn announce(&self, transition: Transition) {
        let Some((from, to)) = transition else {
            return;
        };
        match to {
            CircuitState::Open => warn!(operation = %self.operation, %from, "Circuit opened"),
            CircuitState::HalfOpen => info!(operation = %self.operation, "Circuit half-open"),
            CircuitState::Closed => info!(operation = %self.operation, "Circuit closed"),
        }
        publish(
            self.event_broadcaster.as_ref(),
            ResilienceEvent::BreakerTransition(BreakerTransitionEvent {
                operation: self.operation.clone(),
                from,
                to,
                timestamp: Utc::now(),
            }),
        );
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("operation", &self.operation)
            .field("state", &self.state())
            .finish()
    }
}

/// Frees the half-open probe slot if the caller is dropped mid-call.
struct ProbeSlot<'a> {
    breaker: Option<&'a CircuitBreaker>,
}

impl<'a> ProbeSlot<'a> {
    fn hold(breaker: &'a CircuitBreaker, admission: Admission) -> Self {
        Self {
            breaker: (admission == Admission::Probe).then_some(breaker),
        }
    }

    fn disarm(&mut self) {
        self.breaker = None;
    }
}

impl Drop for ProbeSlot<'_> {
    fn drop(&mut self) {
        if let Some(breaker) = self.breaker.take() {
            breaker.release_probe();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, PartialEq)]
    struct Down;

    fn config(failure_threshold: u32) -> BreakerConfig {
        BreakerConfig {
            failure_threshold,
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(1),
        }
    }

    async fn fail(breaker: &CircuitBreaker, calls: &AtomicUsize) -> Result<(), ExecuteError<Down>> {
        breaker
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Down)
            })
            .await
    }

    async fn succeed(breaker: &CircuitBreaker, calls: &AtomicUsize) -> Result<u32, ExecuteError<Down>> {
        breaker
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Down>(7)
            })
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_fails_fast() {
        let breaker = CircuitBreaker::new("order-data", config(3)).unwrap();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let err = fail(&breaker, &calls).await.unwrap_err();
            assert!(matches!(err, ExecuteError::Backend(_)));
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        // Fourth call must not reach the factory
        let err = fail(&breaker, &calls).await.unwrap_err();
        assert!(err.is_circuit_open());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let breaker = CircuitBreaker::new("order-data", config(3)).unwrap();
        let calls = AtomicUsize::new(0);

        fail(&breaker, &calls).await.unwrap_err();
        fail(&breaker, &calls).await.unwrap_err();
        assert_eq!(succeed(&breaker, &calls).await.unwrap(), 7);
        fail(&breaker, &calls).await.unwrap_err();
        fail(&breaker, &calls).await.unwrap_err();

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().failure_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_shrinks_while_open() {
        let breaker = CircuitBreaker::new("order-data", config(1)).unwrap();
        let calls = AtomicUsize::new(0);
        fail(&breaker, &calls).await.unwrap_err();

        tokio::time::advance(Duration::from_secs(10)).await;

        let err = fail(&breaker, &calls).await.unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(20)));
        assert_eq!(breaker.snapshot().retry_after, Some(Duration::from_secs(20)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_through_probe_then_needs_full_threshold_again() {
        let breaker = CircuitBreaker::new("order-data", config(3)).unwrap();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            fail(&breaker, &calls).await.unwrap_err();
        }
        tokio::time::advance(Duration::from_secs(30)).await;

        // Probe goes through and closes the circuit
        assert_eq!(succeed(&breaker, &calls).await.unwrap(), 7);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        fail(&breaker, &calls).await.unwrap_err();
        fail(&breaker, &calls).await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Closed);
        fail(&breaker, &calls).await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_reopens_with_fresh_timer() {
        let breaker = CircuitBreaker::new("order-data", config(2)).unwrap();
        let calls = AtomicUsize::new(0);

        fail(&breaker, &calls).await.unwrap_err();
        fail(&breaker, &calls).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(31)).await;

        let err = fail(&breaker, &calls).await.unwrap_err();
        assert!(matches!(err, ExecuteError::Backend(_)));
        assert_eq!(breaker.state(), CircuitState::Open);

        let err = succeed(&breaker, &calls).await.unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_probe_while_half_open() {
        let breaker = Arc::new(CircuitBreaker::new("order-data", config(1)).unwrap());
        let calls = AtomicUsize::new(0);
        fail(&breaker, &calls).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(30)).await;

        let (release, gate) = tokio::sync::oneshot::channel::<()>();
        let probe = {
            let breaker = Arc::clone(&breaker);
            tokio::spawn(async move {
                breaker
                    .execute(|| async move {
                        gate.await.ok();
                        Ok::<_, Down>("probe")
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert!(breaker.snapshot().probe_in_flight);

        let err = succeed(&breaker, &calls).await.unwrap_err();
        assert!(err.is_circuit_open());
        assert_eq!(err.retry_after(), Some(Duration::ZERO));

        release.send(()).unwrap();
        assert_eq!(probe.await.unwrap().unwrap(), "probe");
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let breaker = CircuitBreaker::new("order-data", config(1)).unwrap();

        let err = breaker
            .execute(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, Down>(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ExecuteError::Timeout { after, .. } if after == Duration::from_secs(1)));
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.snapshot().last_failure_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_probe_releases_slot() {
        let breaker = CircuitBreaker::new("order-data", config(1)).unwrap();
        let calls = AtomicUsize::new(0);
        fail(&breaker, &calls).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(30)).await;

        // Poll the probe once and abandon it
        let abandoned = breaker
            .execute(std::future::pending::<Result<(), Down>>)
            .now_or_never();
        assert!(abandoned.is_none());
        assert!(!breaker.snapshot().probe_in_flight);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        assert_eq!(succeed(&breaker, &calls).await.unwrap(), 7);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_threshold_requires_several_probes() {
        let breaker = CircuitBreaker::new(
            "order-data",
            BreakerConfig {
                success_threshold: 2,
                ..config(1)
            },
        )
        .unwrap();
        let calls = AtomicUsize::new(0);
        fail(&breaker, &calls).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(30)).await;

        succeed(&breaker, &calls).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.snapshot().success_count_in_half_open, 1);

        succeed(&breaker, &calls).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transitions_are_broadcast() {
        let (tx, mut rx) = broadcast::channel(16);
        let breaker = CircuitBreaker::with_event_broadcaster("order-data", config(1), tx).unwrap();
        let calls = AtomicUsize::new(0);

        fail(&breaker, &calls).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(30)).await;
        succeed(&breaker, &calls).await.unwrap();

        let mut seen = Vec::new();
        while let Ok(ResilienceEvent::BreakerTransition(event)) = rx.try_recv() {
            seen.push((event.from, event.to));
        }
        assert_eq!(
            seen,
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
                (CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
    }

    #[test]
    fn test_zero_thresholds_are_rejected() {
        let no_failures = CircuitBreaker::new("order-data", config(0));
        assert!(matches!(no_failures, Err(shared::Error::Config(_))));

        let no_successes = CircuitBreaker::new(
            "order-data",
            BreakerConfig {
                success_threshold: 0,
                ..config(1)
            },
        );
        assert!(matches!(no_successes, Err(shared::Error::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_recovery_timeout_stays_open() {
        let breaker = CircuitBreaker::new(
            "order-data",
            BreakerConfig {
                recovery_timeout: Duration::MAX,
                ..config(1)
            },
        )
        .unwrap();
        let calls = AtomicUsize::new(0);
        fail(&breaker, &calls).await.unwrap_err();

        tokio::time::advance(Duration::from_secs(24 * 60 * 60)).await;
        let err = succeed(&breaker, &calls).await.unwrap_err();
        assert!(err.is_circuit_open());
        assert!(err.retry_after().unwrap() > Duration::from_secs(24 * 60 * 60));
        assert!(breaker.snapshot().retry_after.is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
