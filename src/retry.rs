//! Retry executor: orchestrates backoff, retry budget, and circuit breaker
//! around an async operation.

use crate::backoff::{BackoffCalculator, BackoffSettings, BackoffStrategy};
use crate::breaker::CircuitBreaker;
use crate::budget::RetryBudget;
use crate::error::{ResilienceError, MAX_RETRY_FAILURES};
use crate::jitter::Jitter;
use crate::time::{Sleeper, TokioSleeper};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Per-operation retry configuration over error type `E`.
#[derive(Clone)]
pub struct RetryConfig<E> {
    pub backoff: BackoffSettings,
    pub max_attempts: u32,
    pub circuit_breaker_enabled: bool,
    pub retry_budget_enabled: bool,
    should_retry: Arc<dyn Fn(&E) -> bool + Send + Sync>,
    on_retry: Option<Arc<dyn Fn(u32, &E) + Send + Sync>>,
}

impl<E> Default for RetryConfig<E> {
    fn default() -> Self {
        Self {
            backoff: BackoffSettings::default(),
            max_attempts: 3,
            circuit_breaker_enabled: true,
            retry_budget_enabled: true,
            should_retry: Arc::new(|_| true),
            on_retry: None,
        }
    }
}

impl<E> std::fmt::Debug for RetryConfig<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryConfig")
            .field("backoff", &self.backoff)
            .field("max_attempts", &self.max_attempts)
            .field("circuit_breaker_enabled", &self.circuit_breaker_enabled)
            .field("retry_budget_enabled", &self.retry_budget_enabled)
            .finish()
    }
}

impl<E> RetryConfig<E> {
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff.strategy = strategy;
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.backoff.initial_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.backoff.max_delay = delay;
        self
    }

    pub fn exponential_base(mut self, base: f64) -> Self {
        self.backoff.exponential_base = base;
        self
    }

    pub fn jitter(mut self, jitter: Jitter) -> Self {
        self.backoff.jitter = jitter;
        self
    }

    pub fn without_circuit_breaker(mut self) -> Self {
        self.circuit_breaker_enabled = false;
        self
    }

    pub fn without_retry_budget(mut self) -> Self {
        self.retry_budget_enabled = false;
        self
    }

    /// Only errors matching the predicate are retried; the rest surface
    /// immediately as [`ResilienceError::Inner`].
    pub fn should_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Arc::new(predicate);
        self
    }

    /// Observe each retry before its backoff sleep (1-indexed attempt).
    pub fn on_retry<F>(mut self, callback: F) -> Self
    where
        F: Fn(u32, &E) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(callback));
        self
    }
}

/// Successful execution summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryOutcome<T> {
    pub value: T,
    pub attempts: u32,
    pub total_delay: Duration,
}

/// Drives an operation to completion under a [`RetryConfig`], consulting
/// the optional budget and breaker attached to this executor.
pub struct RetryExecutor<E> {
    budget: Option<Arc<RetryBudget>>,
    breaker: Option<Arc<CircuitBreaker<E>>>,
    sleeper: Arc<dyn Sleeper>,
}

impl<E> std::fmt::Debug for RetryExecutor<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("budget", &self.budget.is_some())
            .field("breaker", &self.breaker.is_some())
            .finish()
    }
}

impl<E> Default for RetryExecutor<E> {
    fn default() -> Self {
        Self { budget: None, breaker: None, sleeper: Arc::new(TokioSleeper) }
    }
}

impl<E> RetryExecutor<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_budget(mut self, budget: Arc<RetryBudget>) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker<E>>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub async fn execute<T, Fut, Op>(
        &self,
        mut op: Op,
        config: &RetryConfig<E>,
    ) -> Result<RetryOutcome<T>, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
        Op: FnMut() -> Fut,
    {
        let mut calculator = BackoffCalculator::new();
        let mut failures: Vec<E> = Vec::new();
        let mut total_delay = Duration::ZERO;
        let budget =
            if config.retry_budget_enabled { self.budget.as_deref() } else { None };

        for attempt in 0..config.max_attempts {
            if let Some(budget) = budget {
                if attempt > 0 && !budget.can_retry() {
                    tracing::warn!(attempt, "retry denied by budget");
                    return Err(ResilienceError::BudgetExhausted { attempts: attempt });
                }
                budget.record_attempt(attempt > 0);
            }

            let result = match (config.circuit_breaker_enabled, self.breaker.as_ref()) {
                (true, Some(breaker)) => breaker.call(&mut op).await,
                _ => op().await.map_err(ResilienceError::Inner),
            };

            match result {
                Ok(value) => {
                    return Ok(RetryOutcome { value, attempts: attempt + 1, total_delay });
                }
                Err(ResilienceError::Inner(e)) => {
                    if !(config.should_retry)(&e) {
                        return Err(ResilienceError::Inner(e));
                    }
                    if attempt + 1 >= config.max_attempts {
                        push_bounded(&mut failures, e);
                        return Err(ResilienceError::RetryExhausted {
                            attempts: config.max_attempts,
                            failures,
                        });
                    }

                    let delay = calculator.delay(attempt + 1, &config.backoff);
                    total_delay += delay;
                    if let Some(on_retry) = &config.on_retry {
                        on_retry(attempt + 1, &e);
                    }
                    tracing::debug!(
                        attempt = attempt + 1,
                        max = config.max_attempts,
                        ?delay,
                        "retrying after failure"
                    );
                    push_bounded(&mut failures, e);
                    self.sleeper.sleep(delay).await;
                }
                // Breaker rejections are not retried here; callers decide.
                Err(other) => return Err(other),
            }
        }

        Err(ResilienceError::RetryExhausted { attempts: config.max_attempts, failures })
    }
}

fn push_bounded<E>(failures: &mut Vec<E>, e: E) {
    failures.push(e);
    if failures.len() > MAX_RETRY_FAILURES {
        let excess = failures.len() - MAX_RETRY_FAILURES;
        failures.drain(0..excess);
    }
}
