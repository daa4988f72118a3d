//! Jitter strategies to spread retry delays across callers.

use rand::Rng;
use std::time::Duration;

/// Randomization applied to a computed backoff delay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// Use the exact delay.
    None,
    /// Uniform in `[0, delay]`.
    Full,
    /// `delay ± delay * factor`, clamped at zero.
    Partial { factor: f64 },
}

impl Jitter {
    pub fn full() -> Self {
        Jitter::Full
    }

    pub fn partial(factor: f64) -> Self {
        Jitter::Partial { factor }
    }

    /// Build from the config pair used by retry policies: a jitter flag and
    /// a factor. A factor >= 1.0 means full jitter.
    pub fn from_factor(enabled: bool, factor: f64) -> Self {
        if !enabled {
            Jitter::None
        } else if factor >= 1.0 {
            Jitter::Full
        } else {
            Jitter::Partial { factor }
        }
    }

    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rand::rng())
    }

    /// Deterministic variant for tests.
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        let millis = delay.as_millis() as u64;
        match self {
            Jitter::None => delay,
            Jitter::Full => {
                if millis == 0 {
                    return Duration::ZERO;
                }
                Duration::from_millis(rng.random_range(0..=millis))
            }
            Jitter::Partial { factor } => {
                if millis == 0 {
                    return Duration::ZERO;
                }
                let range = (millis as f64 * factor).round() as i64;
                if range == 0 {
                    return delay;
                }
                let offset = rng.random_range(-range..=range);
                let jittered = (millis as i64).saturating_add(offset).max(0);
                Duration::from_millis(jittered as u64)
            }
        }
    }
}
