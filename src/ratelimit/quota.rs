//! Sliding-window quotas and the timestamp history that enforces them.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::error::{Result, RlimError};

/// At most `max_calls` calls within any trailing `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Quota {
    max_calls: usize,
    window: Duration,
}

impl Quota {
    /// Create a new quota.
    pub fn new(max_calls: usize, window: Duration) -> Result<Self> {
        if max_calls < 1 {
            return Err(RlimError::Config(
                "quota must allow at least one call".to_string(),
            ));
        }
        if window.is_zero() {
            return Err(RlimError::Config(
                "quota window must be longer than zero".to_string(),
            ));
        }
        Ok(Self { max_calls, window })
    }

    /// Create a quota with a window given in seconds.
    pub fn from_secs_f64(max_calls: usize, window_secs: f64) -> Result<Self> {
        if !window_secs.is_finite() || window_secs <= 0.0 {
            return Err(RlimError::Config(format!(
                "quota window must be a positive number of seconds, got {}",
                window_secs
            )));
        }
        let window = Duration::try_from_secs_f64(window_secs)
            .map_err(|e| RlimError::Config(format!("quota window {}: {}", window_secs, e)))?;
        Self::new(max_calls, window)
    }

    /// Maximum calls allowed in the window.
    pub fn max_calls(&self) -> usize {
        self.max_calls
    }

    /// Length of the trailing window.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Average spacing implied by this quota (`window / max_calls`).
    pub fn implied_interval(&self) -> Duration {
        self.window.div_f64(self.max_calls as f64)
    }
}

/// Timestamps of committed calls for a single quota.
#[derive(Debug, Clone)]
pub struct History {
    quota: Quota,
    stamps: VecDeque<Instant>,
}

impl History {
    /// Create an empty history for `quota`.
    pub fn new(quota: Quota) -> Self {
        Self {
            quota,
            stamps: VecDeque::with_capacity(quota.max_calls),
        }
    }

    /// Create a history already at capacity, every slot taken at `now`.
    pub fn saturated(quota: Quota, now: Instant) -> Self {
        Self {
            quota,
            stamps: std::iter::repeat(now).take(quota.max_calls).collect(),
        }
    }

    /// Number of retained timestamps.
    pub fn len(&self) -> usize {
        self.stamps.len()
    }

    /// Whether no timestamps are retained.
    pub fn is_empty(&self) -> bool {
        self.stamps.is_empty()
    }

    /// Retained timestamps, oldest first.
    pub fn stamps(&self) -> Vec<Instant> {
        self.stamps.iter().copied().collect()
    }

    /// Drop every timestamp that has left the window ending at `now`.
    pub fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.stamps.front() {
            if now.saturating_duration_since(oldest) >= self.quota.window {
                self.stamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// Prune, then return how long a call at `now` must wait for a free slot.
    ///
    /// A slot freed past the end of representable time waits `Duration::MAX`.
    pub fn wait(&mut self, now: Instant) -> Duration {
        self.prune(now);

        let len = self.stamps.len();
        if len < self.quota.max_calls {
            return Duration::ZERO;
        }

        // The entry whose expiry frees a slot; the front when len == max_calls.
        let freeing = self.stamps[len - self.quota.max_calls];
        match freeing.checked_add(self.quota.window) {
            Some(free_at) => free_at.saturating_duration_since(now),
            None => Duration::MAX,
        }
    }

    /// Prune, then append a committed call at `now`.
    pub fn record(&mut self, now: Instant) {
        self.prune(now);
        self.stamps.push_back(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn test_quota_validation() {
        assert!(matches!(Quota::new(0, secs(1)), Err(RlimError::Config(_))));
        assert!(matches!(Quota::new(1, Duration::ZERO), Err(RlimError::Config(_))));
        assert!(Quota::from_secs_f64(3, -1.0).is_err());
        assert!(Quota::from_secs_f64(3, 0.5).is_ok());
        assert!(matches!(
            Quota::from_secs_f64(1, 1e30),
            Err(RlimError::Config(_))
        ));
    }

    #[test]
    fn test_huge_window_saturates() {
        let mut history = History::new(Quota::new(1, Duration::MAX).unwrap());
        let t0 = Instant::now();

        history.record(t0);
        assert_eq!(history.wait(t0 + secs(1)), Duration::MAX);
    }

    #[test]
    fn test_implied_interval() {
        let quota = Quota::new(50, secs(40)).unwrap();
        assert_eq!(quota.implied_interval(), Duration::from_millis(800));
    }

    #[test]
    fn test_wait_zero_below_capacity() {
        let mut history = History::new(Quota::new(3, secs(10)).unwrap());
        let t0 = Instant::now();

        history.record(t0);
        history.record(t0 + secs(1));

        assert_eq!(history.wait(t0 + secs(2)), Duration::ZERO);
    }

    #[test]
    fn test_wait_until_oldest_expires() {
        let mut history = History::new(Quota::new(2, secs(10)).unwrap());
        let t0 = Instant::now();

        history.record(t0);
        history.record(t0 + secs(3));

        assert_eq!(history.wait(t0 + secs(4)), secs(6));
    }

    #[test]
    fn test_prune_boundary_is_inclusive() {
        let mut history = History::new(Quota::new(1, secs(5)).unwrap());
        let t0 = Instant::now();

        history.record(t0);
        // Exactly one window later the entry no longer counts
        assert_eq!(history.wait(t0 + secs(5)), Duration::ZERO);
        assert!(history.is_empty());
    }

    #[test]
    fn test_record_prunes_stale_entries() {
        let mut history = History::new(Quota::new(2, secs(1)).unwrap());
        let t0 = Instant::now();

        history.record(t0);
        history.record(t0 + Duration::from_millis(500));
        history.record(t0 + secs(3));

        assert_eq!(history.len(), 1);
        assert_eq!(history.stamps(), vec![t0 + secs(3)]);
    }

    #[test]
    fn test_saturated_history_blocks_first_call() {
        let t0 = Instant::now();
        let mut history = History::saturated(Quota::new(4, secs(2)).unwrap(), t0);

        assert_eq!(history.len(), 4);
        assert_eq!(history.wait(t0), secs(2));
    }
}
