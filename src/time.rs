//! Time abstractions: monotonic clocks, wall clocks, and sleepers.
//!
//! Every time-sensitive component (circuit breaker, retry budget, lock
//! cleanup, DLQ scheduling) takes its time source through these traits so
//! tests run deterministically without real delays.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Monotonic clock in milliseconds.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_millis(&self) -> u64;
}

/// Monotonic clock backed by `Instant::now()`.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    start: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self { start: Instant::now() }
    }
}

impl Clock for MonotonicClock {
    fn now_millis(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

/// Manually advanced clock for deterministic tests.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Wall clock producing UTC timestamps for persisted records.
pub trait WallClock: Send + Sync + std::fmt::Debug {
    fn now_utc(&self) -> DateTime<Utc>;
}

/// Production wall clock backed by `Utc::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemWallClock;

impl WallClock for SystemWallClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced wall clock. Starts at a fixed epoch so timestamps in
/// tests are reproducible.
#[derive(Debug, Clone)]
pub struct ManualWallClock {
    base: DateTime<Utc>,
    offset_millis: Arc<AtomicI64>,
}

impl Default for ManualWallClock {
    fn default() -> Self {
        Self {
            base: DateTime::from_timestamp(1_700_000_000, 0).unwrap_or_else(Utc::now),
            offset_millis: Arc::new(AtomicI64::new(0)),
        }
    }
}

impl ManualWallClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, duration: Duration) {
        self.offset_millis.fetch_add(duration.as_millis() as i64, Ordering::SeqCst);
    }
}

impl WallClock for ManualWallClock {
    fn now_utc(&self) -> DateTime<Utc> {
        self.base + ChronoDuration::milliseconds(self.offset_millis.load(Ordering::SeqCst))
    }
}

/// Abstraction over waiting between retry attempts.
#[async_trait]
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    async fn sleep(&self, duration: Duration);
}

/// Production sleeper using the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Test sleeper that returns immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct InstantSleeper;

#[async_trait]
impl Sleeper for InstantSleeper {
    async fn sleep(&self, _duration: Duration) {}
}

/// Test sleeper recording every requested duration.
#[derive(Debug, Clone, Default)]
pub struct TrackingSleeper {
    calls: Arc<Mutex<Vec<Duration>>>,
}

impl TrackingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Duration> {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn total_slept(&self) -> Duration {
        self.calls().iter().sum()
    }
}

#[async_trait]
impl Sleeper for TrackingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).push(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new();
        assert_eq!(clock.now_millis(), 0);
        clock.advance(1500);
        assert_eq!(clock.now_millis(), 1500);
    }

    #[test]
    fn manual_wall_clock_advances() {
        let clock = ManualWallClock::new();
        let start = clock.now_utc();
        clock.advance(Duration::from_secs(90));
        assert_eq!((clock.now_utc() - start).num_seconds(), 90);
    }

    #[tokio::test]
    async fn tracking_sleeper_records_calls() {
        let sleeper = TrackingSleeper::new();
        sleeper.sleep(Duration::from_millis(100)).await;
        sleeper.sleep(Duration::from_millis(200)).await;
        assert_eq!(
            sleeper.calls(),
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
        assert_eq!(sleeper.total_slept(), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn instant_sleeper_does_not_block() {
        let start = Instant::now();
        InstantSleeper.sleep(Duration::from_secs(5)).await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }
}
