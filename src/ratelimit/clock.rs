//! Time sources used by the limiter.
//!
//! The limiter never calls `Instant::now` or sleeps directly; it goes through a
//! [`Clock`] so that tests can drive time by hand with [`ManualClock`].

use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

/// A monotonic time source with blocking and async sleep primitives.
#[async_trait]
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current monotonic time.
    fn now(&self) -> Instant;

    /// Block the calling thread for `duration`.
    fn sleep(&self, duration: Duration);

    /// Suspend the calling task for `duration` without blocking its thread.
    async fn sleep_async(&self, duration: Duration);
}

/// The real clock: `Instant::now`, `std::thread::sleep` and `tokio::time::sleep`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }

    async fn sleep_async(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// A clock that only moves when told to.
///
/// Sleeping advances the clock by the requested duration and returns at once.
/// Every sleep is recorded so tests can assert on the waits the limiter chose.
#[derive(Debug)]
pub struct ManualClock {
    state: Mutex<ManualState>,
}

#[derive(Debug)]
struct ManualState {
    now: Instant,
    sleeps: Vec<Duration>,
}

impl ManualClock {
    /// Create a clock frozen at the current real time.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ManualState {
                now: Instant::now(),
                sleeps: Vec::new(),
            }),
        }
    }

    /// Move the clock forward without recording a sleep.
    pub fn advance(&self, duration: Duration) {
        self.state.lock().now += duration;
    }

    /// All sleeps requested so far, in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.state.lock().sleeps.clone()
    }

    /// Forget recorded sleeps.
    pub fn clear_sleeps(&self) {
        self.state.lock().sleeps.clear();
    }

    fn record_sleep(&self, duration: Duration) {
        let mut state = self.state.lock();
        state.now += duration;
        state.sleeps.push(duration);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.state.lock().now
    }

    fn sleep(&self, duration: Duration) {
        self.record_sleep(duration);
    }

    async fn sleep_async(&self, duration: Duration) {
        self.record_sleep(duration);
        tokio::task::yield_now().await;
    }
}
