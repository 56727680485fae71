//! Constant-interval pacing with optional jitter.

use std::time::{Duration, Instant};

use rand::Rng;

use crate::error::{Result, RlimError};

/// Minimum spacing between consecutive calls.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pacing {
    /// Seconds per call
    interval: Duration,
    /// Jitter fraction in `[0, 1)`
    variation: f64,
}

impl Pacing {
    /// Pace calls `interval` apart, without jitter.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            variation: 0.0,
        }
    }

    /// Pace calls `secs` seconds apart.
    pub fn from_secs_f64(secs: f64) -> Result<Self> {
        if !secs.is_finite() || secs < 0.0 {
            return Err(RlimError::Config(format!(
                "pacing interval must be a non-negative number of seconds, got {}",
                secs
            )));
        }
        let interval = Duration::try_from_secs_f64(secs)
            .map_err(|e| RlimError::Config(format!("pacing interval {}: {}", secs, e)))?;
        Ok(Self::new(interval))
    }

    /// Allow `calls` calls every `period`, spread evenly.
    ///
    /// `Pacing::per_period(2, Duration::from_secs(1))` paces calls 0.5s apart.
    pub fn per_period(calls: u32, period: Duration) -> Result<Self> {
        if calls == 0 {
            return Err(RlimError::Config(
                "pacing needs at least one call per period".to_string(),
            ));
        }
        Ok(Self::new(period / calls))
    }

    /// Perturb the interval by up to `variation * interval` in either direction
    /// on every evaluation.
    pub fn with_variation(mut self, variation: f64) -> Result<Self> {
        if !variation.is_finite() || !(0.0..1.0).contains(&variation) {
            return Err(RlimError::Config(format!(
                "pacing variation must be in [0, 1), got {}",
                variation
            )));
        }
        self.variation = variation;
        Ok(self)
    }

    /// The nominal interval between calls.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// The jitter fraction.
    pub fn variation(&self) -> f64 {
        self.variation
    }

    /// Sample the interval to enforce for one decision.
    ///
    /// Saturates at `Duration::MAX`.
    pub fn effective_interval<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        if self.variation == 0.0 {
            return self.interval;
        }
        let offset = rng.gen_range(-self.variation..=self.variation);
        Duration::try_from_secs_f64(self.interval.as_secs_f64() * (1.0 + offset).max(0.0))
            .unwrap_or(Duration::MAX)
    }

    /// How long a call arriving at `now` must wait given the previous call.
    ///
    /// An interval reaching past the end of representable time waits `Duration::MAX`.
    pub fn wait<R: Rng + ?Sized>(
        &self,
        last_call: Option<Instant>,
        now: Instant,
        rng: &mut R,
    ) -> Duration {
        match last_call {
            Some(last) => match last.checked_add(self.effective_interval(rng)) {
                Some(next) => next.saturating_duration_since(now),
                None => Duration::MAX,
            },
            None => Duration::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_first_call_never_waits() {
        let pacing = Pacing::new(Duration::from_secs(1));
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(pacing.wait(None, Instant::now(), &mut rng), Duration::ZERO);
    }

    #[test]
    fn test_wait_is_remaining_interval() {
        let pacing = Pacing::new(Duration::from_millis(500));
        let mut rng = StdRng::seed_from_u64(7);
        let last = Instant::now();

        let wait = pacing.wait(Some(last), last + Duration::from_millis(200), &mut rng);
        assert_eq!(wait, Duration::from_millis(300));

        let wait = pacing.wait(Some(last), last + Duration::from_secs(2), &mut rng);
        assert_eq!(wait, Duration::ZERO);
    }

    #[test]
    fn test_per_period() {
        let pacing = Pacing::per_period(2, Duration::from_secs(1)).unwrap();
        assert_eq!(pacing.interval(), Duration::from_millis(500));

        assert!(matches!(
            Pacing::per_period(0, Duration::from_secs(1)),
            Err(RlimError::Config(_))
        ));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(Pacing::from_secs_f64(-0.1).is_err());
        assert!(Pacing::from_secs_f64(f64::NAN).is_err());
        assert!(Pacing::from_secs_f64(0.0).is_ok());

        let pacing = Pacing::new(Duration::from_secs(1));
        assert!(pacing.with_variation(1.0).is_err());
        assert!(pacing.with_variation(-0.01).is_err());
        assert!(pacing.with_variation(0.99).is_ok());
    }

    #[test]
    fn test_out_of_range_interval_rejected() {
        assert!(matches!(
            Pacing::from_secs_f64(1e30),
            Err(RlimError::Config(_))
        ));
    }

    #[test]
    fn test_huge_interval_saturates() {
        let mut rng = StdRng::seed_from_u64(7);
        let last = Instant::now();

        let pacing = Pacing::new(Duration::MAX);
        assert_eq!(pacing.wait(Some(last), last, &mut rng), Duration::MAX);

        let jittered = Pacing::new(Duration::MAX).with_variation(0.5).unwrap();
        for _ in 0..50 {
            // Never panics; any sample that still fits is far beyond `last`
            let wait = jittered.wait(Some(last), last, &mut rng);
            assert!(wait >= Duration::MAX / 4);
        }
    }

    #[test]
    fn test_jitter_stays_in_bounds_and_varies() {
        let pacing = Pacing::new(Duration::from_secs(1))
            .with_variation(0.25)
            .unwrap();
        let mut rng = StdRng::seed_from_u64(42);

        let samples: Vec<Duration> = (0..200).map(|_| pacing.effective_interval(&mut rng)).collect();

        for sample in &samples {
            assert!(*sample >= Duration::from_millis(750));
            assert!(*sample <= Duration::from_millis(1250));
        }
        // Re-sampled on every evaluation
        assert!(samples.iter().any(|s| *s != samples[0]));
    }
}
