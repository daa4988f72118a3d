//! Backoff calculation for retry scheduling.
//!
//! Pure attempt → delay math, with the one exception of decorrelated
//! jitter, which keeps per-calculator state as the AWS algorithm requires.

use crate::jitter::Jitter;
use rand::Rng;
use std::time::Duration;

/// How the base delay grows across attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// Constant `initial_delay`.
    Fixed,
    /// `initial_delay * attempt`.
    Linear,
    /// `initial_delay * exponential_base^(attempt - 1)`.
    Exponential,
    /// Exponential growth, intended to be paired with jitter.
    ExponentialWithJitter,
    /// `initial_delay * fib(attempt)`.
    Fibonacci,
    /// `last = uniform(initial_delay, last * 3)`, capped at `max_delay`.
    DecorrelatedJitter,
    /// Preset: 100ms base, x1.3 growth.
    Aggressive,
    /// Preset: 1s base, x2 growth.
    Standard,
    /// Preset: 2s base, x3 growth.
    Conservative,
}

/// Numeric inputs to the backoff calculation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffSettings {
    pub strategy: BackoffStrategy,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
    pub jitter: Jitter,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::ExponentialWithJitter,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            exponential_base: 2.0,
            jitter: Jitter::Partial { factor: 0.1 },
        }
    }
}

/// Computes retry delays. Holds the running state for
/// [`BackoffStrategy::DecorrelatedJitter`]; every other strategy is pure.
#[derive(Debug, Clone, Default)]
pub struct BackoffCalculator {
    last_delay: Option<Duration>,
}

impl BackoffCalculator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay before retry `attempt` (1-indexed), jittered and capped at
    /// `settings.max_delay`.
    pub fn delay(&mut self, attempt: u32, settings: &BackoffSettings) -> Duration {
        self.delay_with_rng(attempt, settings, &mut rand::rng())
    }

    /// Deterministic variant for tests.
    pub fn delay_with_rng<R: Rng>(
        &mut self,
        attempt: u32,
        settings: &BackoffSettings,
        rng: &mut R,
    ) -> Duration {
        let attempt = attempt.max(1);
        let base = self.base_delay(attempt, settings, rng);
        let jittered = settings.jitter.apply_with_rng(base, rng);
        jittered.min(settings.max_delay)
    }

    fn base_delay<R: Rng>(
        &mut self,
        attempt: u32,
        settings: &BackoffSettings,
        rng: &mut R,
    ) -> Duration {
        let initial = settings.initial_delay.as_secs_f64();
        let exponent = (attempt - 1) as f64;
        let secs = match settings.strategy {
            BackoffStrategy::Fixed => initial,
            BackoffStrategy::Linear => initial * attempt as f64,
            BackoffStrategy::Exponential | BackoffStrategy::ExponentialWithJitter => {
                initial * settings.exponential_base.powf(exponent)
            }
            BackoffStrategy::Fibonacci => initial * fibonacci(attempt) as f64,
            BackoffStrategy::DecorrelatedJitter => {
                let last = self.last_delay.unwrap_or(settings.initial_delay).as_secs_f64();
                let upper = (last * 3.0).max(initial);
                let next = if upper > initial { rng.random_range(initial..=upper) } else { initial };
                let capped = next.min(settings.max_delay.as_secs_f64());
                self.last_delay = Some(Duration::from_secs_f64(capped));
                capped
            }
            BackoffStrategy::Aggressive => 0.1 * 1.3f64.powf(exponent),
            BackoffStrategy::Standard => 1.0 * 2.0f64.powf(exponent),
            BackoffStrategy::Conservative => 2.0 * 3.0f64.powf(exponent),
        };
        Duration::from_secs_f64(secs.min(settings.max_delay.as_secs_f64()).max(0.0))
    }

    /// Forget decorrelated-jitter state.
    pub fn reset(&mut self) {
        self.last_delay = None;
    }
}

fn fibonacci(n: u32) -> u64 {
    if n <= 1 {
        return n as u64;
    }
    let (mut a, mut b) = (0u64, 1u64);
    for _ in 2..=n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    b
}
