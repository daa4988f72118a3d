//! Retry budget: a sliding-window guard against retry storms.

use crate::time::{Clock, MonotonicClock};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryBudgetConfig {
    /// Maximum percentage of requests in the window that may be retries.
    pub budget_percent: f64,
    /// Observations required before the budget starts denying.
    pub min_requests: u64,
    /// Sliding window length.
    pub window: Duration,
    /// Token refill rate for the secondary rate limit.
    pub tokens_per_second: f64,
    pub max_tokens: f64,
}

impl Default for RetryBudgetConfig {
    fn default() -> Self {
        Self {
            budget_percent: 10.0,
            min_requests: 100,
            window: Duration::from_secs(60),
            tokens_per_second: 10.0,
            max_tokens: 100.0,
        }
    }
}

/// Point-in-time view of the budget, for metrics.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryBudgetSnapshot {
    pub total_in_window: u64,
    pub retries_in_window: u64,
    pub retry_percent: f64,
    pub budget_percent: f64,
    pub remaining_percent: f64,
    pub tokens_available: f64,
}

#[derive(Debug)]
struct BudgetState {
    window: VecDeque<(u64, bool)>,
    total: u64,
    retries: u64,
    tokens: f64,
    last_refill_millis: u64,
}

/// Thread-safe retry budget. All accessors take the interior mutex for the
/// duration of the bookkeeping only.
#[derive(Debug)]
pub struct RetryBudget {
    config: RetryBudgetConfig,
    state: Mutex<BudgetState>,
    clock: Arc<dyn Clock>,
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self::new(RetryBudgetConfig::default())
    }
}

impl RetryBudget {
    pub fn new(config: RetryBudgetConfig) -> Self {
        Self::with_clock(config, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(config: RetryBudgetConfig, clock: Arc<dyn Clock>) -> Self {
        let tokens = config.max_tokens;
        Self {
            config,
            state: Mutex::new(BudgetState {
                window: VecDeque::new(),
                total: 0,
                retries: 0,
                tokens,
                last_refill_millis: clock.now_millis(),
            }),
            clock,
        }
    }

    /// Whether one more retry fits in the budget.
    pub fn can_retry(&self) -> bool {
        let now = self.clock.now_millis();
        let mut state = self.lock();
        self.evict(&mut state, now);
        self.refill(&mut state, now);

        if state.total < self.config.min_requests {
            return true;
        }

        let future_percent = (state.retries + 1) as f64 / (state.total + 1) as f64 * 100.0;
        future_percent <= self.config.budget_percent && state.tokens >= 1.0
    }

    /// Record an attempt. Retries also consume a token.
    pub fn record_attempt(&self, is_retry: bool) {
        let now = self.clock.now_millis();
        let mut state = self.lock();
        self.evict(&mut state, now);
        state.window.push_back((now, is_retry));
        state.total += 1;
        if is_retry {
            state.retries += 1;
            state.tokens = (state.tokens - 1.0).max(0.0);
        }
    }

    /// Budget percentage still unspent in the current window.
    pub fn remaining_percent(&self) -> f64 {
        self.snapshot().remaining_percent
    }

    pub fn snapshot(&self) -> RetryBudgetSnapshot {
        let now = self.clock.now_millis();
        let mut state = self.lock();
        self.evict(&mut state, now);
        self.refill(&mut state, now);

        let retry_percent = if state.total == 0 {
            0.0
        } else {
            state.retries as f64 / state.total as f64 * 100.0
        };
        RetryBudgetSnapshot {
            total_in_window: state.total,
            retries_in_window: state.retries,
            retry_percent,
            budget_percent: self.config.budget_percent,
            remaining_percent: (self.config.budget_percent - retry_percent).max(0.0),
            tokens_available: state.tokens,
        }
    }

    pub fn reset(&self) {
        let now = self.clock.now_millis();
        let mut state = self.lock();
        state.window.clear();
        state.total = 0;
        state.retries = 0;
        state.tokens = self.config.max_tokens;
        state.last_refill_millis = now;
    }

    fn evict(&self, state: &mut BudgetState, now: u64) {
        let cutoff = now.saturating_sub(self.config.window.as_millis() as u64);
        while let Some(&(at, is_retry)) = state.window.front() {
            if at >= cutoff {
                break;
            }
            state.window.pop_front();
            state.total -= 1;
            if is_retry {
                state.retries -= 1;
            }
        }
    }

    fn refill(&self, state: &mut BudgetState, now: u64) {
        let elapsed = now.saturating_sub(state.last_refill_millis) as f64 / 1000.0;
        let add = elapsed * self.config.tokens_per_second;
        if add >= 1.0 {
            state.tokens = (state.tokens + add).min(self.config.max_tokens);
            state.last_refill_millis = now;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BudgetState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}
