//! Unified error type for the resilience stack.

use std::fmt;
use std::time::Duration;

/// Cap on failures retained inside `RetryExhausted` to bound memory.
pub const MAX_RETRY_FAILURES: usize = 10;

/// Boxed error used at dynamic boundaries (message handlers, sinks).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error produced by the retry executor and circuit breaker around a
/// fallible operation with error type `E`.
#[derive(Debug)]
pub enum ResilienceError<E> {
    /// The circuit breaker rejected the call without running it.
    CircuitOpen { failure_count: u64, open_for: Duration },
    /// The retry budget refused another retry before it was attempted.
    BudgetExhausted { attempts: u32 },
    /// Every allowed attempt failed.
    RetryExhausted { attempts: u32, failures: Vec<E> },
    /// The underlying operation failed (non-retryable, or surfaced as-is).
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for ResilienceError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CircuitOpen { failure_count, open_for } => write!(
                f,
                "circuit breaker open ({failure_count} failures, open for {open_for:?})"
            ),
            Self::BudgetExhausted { attempts } => {
                write!(f, "retry budget exhausted after {attempts} attempts")
            }
            Self::RetryExhausted { attempts, failures } => {
                let last = failures.last().map(|e| e.to_string()).unwrap_or_default();
                write!(f, "retry exhausted after {attempts} attempts, last error: {last}")
            }
            Self::Inner(e) => write!(f, "{e}"),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for ResilienceError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::RetryExhausted { failures, .. } => {
                failures.last().map(|e| e as &dyn std::error::Error)
            }
            _ => None,
        }
    }
}

impl<E> ResilienceError<E> {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    pub fn is_budget_exhausted(&self) -> bool {
        matches!(self, Self::BudgetExhausted { .. })
    }

    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self, Self::RetryExhausted { .. })
    }

    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }

    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// The last failure observed, for `Inner` and `RetryExhausted`.
    pub fn last_failure(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::RetryExhausted { failures, .. } => failures.last(),
            _ => None,
        }
    }
}
