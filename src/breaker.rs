//! Circuit breaker with tracked-error classification and half-open probing.
//!
//! The interior mutex guards state transitions only; the guarded operation
//! always runs outside the lock, and transition callbacks fire after the
//! lock is released.

use crate::error::ResilienceError;
use crate::time::{Clock, MonotonicClock};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

type TransitionCallback = Arc<dyn Fn() + Send + Sync>;

/// Configuration for a [`CircuitBreaker`] over error type `E`.
#[derive(Clone)]
pub struct CircuitBreakerConfig<E> {
    /// Consecutive tracked failures that open the circuit.
    pub failure_threshold: u64,
    /// Consecutive successes in half-open that close it again.
    pub success_threshold: u64,
    /// Time the circuit stays open before probing.
    pub open_timeout: Duration,
    track: Arc<dyn Fn(&E) -> bool + Send + Sync>,
    on_open: Option<TransitionCallback>,
    on_close: Option<TransitionCallback>,
    on_half_open: Option<TransitionCallback>,
}

impl<E> Default for CircuitBreakerConfig<E> {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            open_timeout: Duration::from_secs(60),
            track: Arc::new(|_| true),
            on_open: None,
            on_close: None,
            on_half_open: None,
        }
    }
}

impl<E> std::fmt::Debug for CircuitBreakerConfig<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerConfig")
            .field("failure_threshold", &self.failure_threshold)
            .field("success_threshold", &self.success_threshold)
            .field("open_timeout", &self.open_timeout)
            .finish()
    }
}

impl<E> CircuitBreakerConfig<E> {
    /// Classify which errors count as breaker failures. Untracked errors
    /// pass through without affecting the state machine.
    pub fn track_errors<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.track = Arc::new(predicate);
        self
    }

    pub fn on_open<F: Fn() + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_open = Some(Arc::new(f));
        self
    }

    pub fn on_close<F: Fn() + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_close = Some(Arc::new(f));
        self
    }

    pub fn on_half_open<F: Fn() + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_half_open = Some(Arc::new(f));
        self
    }
}

/// Rolling counters exposed for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    pub consecutive_failures: u64,
    pub consecutive_successes: u64,
    pub total_calls: u64,
    pub total_failures: u64,
    pub total_successes: u64,
    pub rejections: u64,
    pub last_state_change_millis: u64,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u64,
    consecutive_successes: u64,
    state_changed_at: u64,
    total_calls: u64,
    total_failures: u64,
    total_successes: u64,
    rejections: u64,
}

/// Named, thread-safe circuit breaker.
pub struct CircuitBreaker<E> {
    name: String,
    config: CircuitBreakerConfig<E>,
    state: Mutex<BreakerState>,
    clock: Arc<dyn Clock>,
}

impl<E> std::fmt::Debug for CircuitBreaker<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish()
    }
}

impl<E> CircuitBreaker<E> {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig<E>) -> Self {
        Self::with_clock(name, config, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(
        name: impl Into<String>,
        config: CircuitBreakerConfig<E>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now_millis();
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                state_changed_at: now,
                total_calls: 0,
                total_failures: 0,
                total_successes: 0,
                rejections: 0,
            }),
            clock,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, applying the open → half-open timeout transition.
    pub fn state(&self) -> CircuitState {
        let mut guard = self.lock();
        let callback = self.check_open_elapsed(&mut guard);
        let state = guard.state;
        drop(guard);
        if let Some(cb) = callback {
            cb();
        }
        state
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let guard = self.lock();
        CircuitBreakerMetrics {
            state: guard.state,
            consecutive_failures: guard.consecutive_failures,
            consecutive_successes: guard.consecutive_successes,
            total_calls: guard.total_calls,
            total_failures: guard.total_failures,
            total_successes: guard.total_successes,
            rejections: guard.rejections,
            last_state_change_millis: guard.state_changed_at,
        }
    }

    pub fn reset(&self) {
        let mut guard = self.lock();
        guard.state = CircuitState::Closed;
        guard.consecutive_failures = 0;
        guard.consecutive_successes = 0;
        guard.state_changed_at = self.clock.now_millis();
        drop(guard);
        tracing::info!(breaker = %self.name, "circuit breaker reset to closed");
    }

    /// Run `op` through the breaker.
    pub async fn call<T, Fut, Op>(&self, op: Op) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
        Op: FnOnce() -> Fut,
    {
        match self.admit() {
            Admission::Rejected(err) => Err(err),
            Admission::Admitted { was_half_open } => {
                let result = op().await;
                self.settle(result, was_half_open)
            }
        }
    }

    /// Like [`call`](Self::call), but runs `fallback` instead of failing
    /// when the circuit rejects the call.
    pub async fn call_with_fallback<T, Fut, Op, FFut, Fb>(
        &self,
        op: Op,
        fallback: Fb,
    ) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
        Op: FnOnce() -> Fut,
        FFut: Future<Output = T>,
        Fb: FnOnce() -> FFut,
    {
        match self.admit() {
            Admission::Rejected(_) => Ok(fallback().await),
            Admission::Admitted { was_half_open } => {
                let result = op().await;
                self.settle(result, was_half_open)
            }
        }
    }

    fn admit(&self) -> Admission<E> {
        let mut guard = self.lock();
        guard.total_calls += 1;
        let callback = self.check_open_elapsed(&mut guard);

        let admission = match guard.state {
            CircuitState::Open => {
                guard.rejections += 1;
                let failure_count = guard.consecutive_failures;
                let open_for = Duration::from_millis(
                    self.clock.now_millis().saturating_sub(guard.state_changed_at),
                );
                Admission::Rejected(ResilienceError::CircuitOpen { failure_count, open_for })
            }
            CircuitState::HalfOpen => Admission::Admitted { was_half_open: true },
            CircuitState::Closed => Admission::Admitted { was_half_open: false },
        };
        drop(guard);
        if let Some(cb) = callback {
            cb();
        }
        admission
    }

    fn settle<T>(&self, result: Result<T, E>, was_half_open: bool) -> Result<T, ResilienceError<E>> {
        match result {
            Ok(value) => {
                let mut guard = self.lock();
                guard.total_successes += 1;
                guard.consecutive_failures = 0;
                let callback = if was_half_open {
                    guard.consecutive_successes += 1;
                    if guard.consecutive_successes >= self.config.success_threshold {
                        Some(self.transition(&mut guard, CircuitState::Closed))
                    } else {
                        None
                    }
                } else {
                    None
                };
                drop(guard);
                if let Some(cb) = callback.flatten() {
                    cb();
                }
                Ok(value)
            }
            Err(e) => {
                if (self.config.track)(&e) {
                    let mut guard = self.lock();
                    guard.total_failures += 1;
                    guard.consecutive_failures += 1;
                    let callback = match guard.state {
                        CircuitState::HalfOpen => {
                            Some(self.transition(&mut guard, CircuitState::Open))
                        }
                        CircuitState::Closed
                            if guard.consecutive_failures >= self.config.failure_threshold =>
                        {
                            Some(self.transition(&mut guard, CircuitState::Open))
                        }
                        _ => None,
                    };
                    drop(guard);
                    if let Some(cb) = callback.flatten() {
                        cb();
                    }
                }
                Err(ResilienceError::Inner(e))
            }
        }
    }

    /// Open → half-open once the timeout has elapsed. Returns the callback
    /// to invoke after the lock drops.
    fn check_open_elapsed(
        &self,
        guard: &mut MutexGuard<'_, BreakerState>,
    ) -> Option<TransitionCallback> {
        if guard.state == CircuitState::Open {
            let elapsed = self.clock.now_millis().saturating_sub(guard.state_changed_at);
            if elapsed >= self.config.open_timeout.as_millis() as u64 {
                return self.transition(guard, CircuitState::HalfOpen);
            }
        }
        None
    }

    fn transition(
        &self,
        guard: &mut MutexGuard<'_, BreakerState>,
        to: CircuitState,
    ) -> Option<TransitionCallback> {
        let from = guard.state;
        guard.state = to;
        guard.state_changed_at = self.clock.now_millis();
        match to {
            CircuitState::Closed => {
                guard.consecutive_failures = 0;
                guard.consecutive_successes = 0;
            }
            CircuitState::HalfOpen => {
                guard.consecutive_successes = 0;
            }
            CircuitState::Open => {}
        }
        match to {
            CircuitState::Open => {
                tracing::warn!(
                    breaker = %self.name,
                    from = from.as_str(),
                    failures = guard.consecutive_failures,
                    "circuit breaker opened"
                );
                self.config.on_open.clone()
            }
            CircuitState::HalfOpen => {
                tracing::info!(breaker = %self.name, "circuit breaker half-open");
                self.config.on_half_open.clone()
            }
            CircuitState::Closed => {
                tracing::info!(breaker = %self.name, "circuit breaker closed");
                self.config.on_close.clone()
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

enum Admission<E> {
    Admitted { was_half_open: bool },
    Rejected(ResilienceError<E>),
}
