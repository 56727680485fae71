//! Core rate limiter implementation.
//!
//! A [`Limiter`] combines an optional [`Pacing`] with any number of
//! [`Quota`]s. Acquiring it computes the longest wait any of them demands,
//! sleeps for that long (or rejects the call), and then records the call in
//! every quota's history.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, instrument, trace};

use super::clock::{Clock, SystemClock};
use super::pacing::Pacing;
use super::quota::{History, Quota};
use super::wrapper::{Limited, LimitedAsync};
use crate::error::{Result, RlimError};

/// Field overrides applied when copying a limiter.
///
/// `None` keeps the value of the limiter being copied.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Overrides {
    /// Replace the explicit pacing; `Some(None)` removes it
    pub pacing: Option<Option<Pacing>>,
    pub reject_on_wait: Option<bool>,
    pub autorate: Option<bool>,
    pub safe_start: Option<bool>,
    pub enabled: Option<bool>,
}

impl Overrides {
    /// Layer `other` on top of `self`; values set in `other` win.
    pub fn merge(self, other: Overrides) -> Overrides {
        Overrides {
            pacing: other.pacing.or(self.pacing),
            reject_on_wait: other.reject_on_wait.or(self.reject_on_wait),
            autorate: other.autorate.or(self.autorate),
            safe_start: other.safe_start.or(self.safe_start),
            enabled: other.enabled.or(self.enabled),
        }
    }
}

/// Builder for [`Limiter`].
#[derive(Debug, Clone)]
pub struct LimiterBuilder {
    pacing: Option<Pacing>,
    quotas: Vec<Quota>,
    reject_on_wait: bool,
    autorate: bool,
    safe_start: bool,
    enabled: bool,
    clock: Option<Arc<dyn Clock>>,
}

impl Default for LimiterBuilder {
    fn default() -> Self {
        Self {
            pacing: None,
            quotas: Vec::new(),
            reject_on_wait: false,
            autorate: false,
            safe_start: false,
            enabled: true,
            clock: None,
        }
    }
}

impl LimiterBuilder {
    /// Enforce a minimum spacing between calls.
    pub fn pacing(mut self, pacing: Pacing) -> Self {
        self.pacing = Some(pacing);
        self
    }

    /// Add a sliding-window quota. May be called repeatedly.
    pub fn quota(mut self, quota: Quota) -> Self {
        self.quotas.push(quota);
        self
    }

    /// Add several quotas at once.
    pub fn quotas<I: IntoIterator<Item = Quota>>(mut self, quotas: I) -> Self {
        self.quotas.extend(quotas);
        self
    }

    /// Fail with [`RlimError::RateLimitExceeded`] instead of waiting.
    pub fn reject_on_wait(mut self, reject: bool) -> Self {
        self.reject_on_wait = reject;
        self
    }

    /// Without explicit pacing, pace at the tightest rate implied by the quotas.
    pub fn autorate(mut self, autorate: bool) -> Self {
        self.autorate = autorate;
        self
    }

    /// Start with every quota exhausted so the first call is already limited.
    pub fn safe_start(mut self, safe_start: bool) -> Self {
        self.safe_start = safe_start;
        self
    }

    /// Initial value of the enabled flag.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Use a specific clock instead of the system clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Build the limiter.
    pub fn build(self) -> Limiter {
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let effective_pacing = match self.pacing {
            Some(pacing) => Some(pacing),
            None if self.autorate => tightest_pacing(&self.quotas),
            None => None,
        };

        let state = if self.safe_start {
            let now = clock.now();
            State {
                last_call: Some(now),
                histories: self.quotas.iter().map(|q| History::saturated(*q, now)).collect(),
            }
        } else {
            State {
                last_call: None,
                histories: self.quotas.iter().map(|q| History::new(*q)).collect(),
            }
        };

        debug!(
            pacing = ?effective_pacing.map(|p| p.interval()),
            quotas = self.quotas.len(),
            reject_on_wait = self.reject_on_wait,
            "Creating rate limiter"
        );

        Limiter {
            inner: Arc::new(Inner {
                settings: Settings {
                    pacing: self.pacing,
                    quotas: self.quotas,
                    reject_on_wait: self.reject_on_wait,
                    autorate: self.autorate,
                    safe_start: self.safe_start,
                },
                pacing: effective_pacing,
                enabled: AtomicBool::new(self.enabled),
                state: Mutex::new(state),
                blocking_gate: Mutex::new(()),
                async_gate: tokio::sync::Mutex::new(()),
                clock,
            }),
        }
    }
}

/// Derive a pacing from the quota with the smallest `window / max_calls`.
fn tightest_pacing(quotas: &[Quota]) -> Option<Pacing> {
    quotas
        .iter()
        .map(Quota::implied_interval)
        .min()
        .map(Pacing::new)
}

/// What the limiter was built from; used to make copies.
#[derive(Debug, Clone)]
struct Settings {
    pacing: Option<Pacing>,
    quotas: Vec<Quota>,
    reject_on_wait: bool,
    autorate: bool,
    safe_start: bool,
}

/// Mutable call history, only touched while a gate is held.
#[derive(Debug)]
struct State {
    last_call: Option<Instant>,
    histories: Vec<History>,
}

struct Inner {
    settings: Settings,
    /// Explicit pacing, or the one derived by autorate
    pacing: Option<Pacing>,
    enabled: AtomicBool,
    state: Mutex<State>,
    /// Serializes thread callers
    blocking_gate: Mutex<()>,
    /// Serializes async callers
    async_gate: tokio::sync::Mutex<()>,
    clock: Arc<dyn Clock>,
}

/// A pacing and quota rate limiter.
///
/// Cloning a `Limiter` yields another handle to the same limiter: clones share
/// history and the enabled flag. Use [`Limiter::copy`] for an independent
/// limiter with the same settings.
///
/// Thread callers ([`acquire`](Self::acquire)) and async callers
/// ([`acquire_async`](Self::acquire_async)) are each serialized by their own
/// gate. The two gates do not exclude each other, so mixing both kinds of
/// caller on one limiter at the same time can let them jointly exceed the
/// limits; add external synchronization if you need that.
#[derive(Clone)]
pub struct Limiter {
    inner: Arc<Inner>,
}

impl Limiter {
    /// Start building a limiter.
    pub fn builder() -> LimiterBuilder {
        LimiterBuilder::default()
    }

    /// Create a limiter from an optional pacing and a set of quotas.
    pub fn new(pacing: Option<Pacing>, quotas: Vec<Quota>) -> Self {
        let builder = Self::builder().quotas(quotas);
        match pacing {
            Some(pacing) => builder.pacing(pacing).build(),
            None => builder.build(),
        }
    }

    /// Wait until a call is allowed, blocking the current thread, then record it.
    ///
    /// Returns [`RlimError::RateLimitExceeded`] instead of waiting when the
    /// limiter rejects on wait.
    #[instrument(level = "trace", skip(self))]
    pub fn acquire(&self) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }

        let _gate = self.inner.blocking_gate.lock();
        let wait = self.decide()?;
        if !wait.is_zero() {
            debug!(wait = ?wait, "Waiting before call");
            self.inner.clock.sleep(wait);
        }
        self.commit();
        Ok(())
    }

    /// Wait until a call is allowed without blocking the thread, then record it.
    ///
    /// If the returned future is dropped while waiting, nothing is recorded.
    #[instrument(level = "trace", skip(self))]
    pub async fn acquire_async(&self) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }

        let _gate = self.inner.async_gate.lock().await;
        let wait = self.decide()?;
        if !wait.is_zero() {
            debug!(wait = ?wait, "Waiting before call");
            self.inner.clock.sleep_async(wait).await;
        }
        self.commit();
        Ok(())
    }

    /// Throttle a point in code. Same as [`acquire`](Self::acquire).
    ///
    /// The call is recorded as soon as the wait ends, not when the code after
    /// the pause finishes, so slow work after a pause can stretch the real
    /// spacing beyond the configured minimum.
    pub fn pause(&self) -> Result<()> {
        self.acquire()
    }

    /// Async version of [`pause`](Self::pause).
    pub async fn pause_async(&self) -> Result<()> {
        self.acquire_async().await
    }

    /// Acquire, then run `f`.
    pub fn scope<R>(&self, f: impl FnOnce() -> R) -> Result<R> {
        self.acquire()?;
        Ok(f())
    }

    /// Acquire asynchronously, then await `fut`.
    pub async fn scope_async<F: Future>(&self, fut: F) -> Result<F::Output> {
        self.acquire_async().await?;
        Ok(fut.await)
    }

    /// Wrap a blocking callable so that every call acquires this limiter first.
    pub fn apply<F>(&self, func: F) -> Limited<F> {
        Limited::new(Some(self.clone()), func)
    }

    /// Wrap a future-returning callable so that every call acquires this
    /// limiter asynchronously first.
    pub fn apply_async<F>(&self, func: F) -> LimitedAsync<F> {
        LimitedAsync::new(Some(self.clone()), func)
    }

    /// A new limiter with the same settings and empty history.
    pub fn copy(&self) -> Limiter {
        self.copy_with(&Overrides::default())
    }

    /// A new limiter with the same settings, `overrides` applied, and empty history.
    pub fn copy_with(&self, overrides: &Overrides) -> Limiter {
        let settings = &self.inner.settings;
        let builder = Limiter::builder()
            .quotas(settings.quotas.iter().copied())
            .reject_on_wait(overrides.reject_on_wait.unwrap_or(settings.reject_on_wait))
            .autorate(overrides.autorate.unwrap_or(settings.autorate))
            .safe_start(overrides.safe_start.unwrap_or(settings.safe_start))
            .enabled(overrides.enabled.unwrap_or_else(|| self.is_enabled()))
            .clock(Arc::clone(&self.inner.clock));

        match overrides.pacing.unwrap_or(settings.pacing) {
            Some(pacing) => builder.pacing(pacing).build(),
            None => builder.build(),
        }
    }

    /// Whether acquisitions are enforced.
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Turn enforcement on or off. History is kept either way.
    pub fn set_enabled(&self, enabled: bool) {
        info!(enabled, "Rate limiter toggled");
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    /// The pacing in effect, including one derived by autorate.
    pub fn pacing(&self) -> Option<Pacing> {
        self.inner.pacing
    }

    /// The configured quotas.
    pub fn quotas(&self) -> &[Quota] {
        &self.inner.settings.quotas
    }

    /// Whether the limiter rejects instead of waiting.
    pub fn reject_on_wait(&self) -> bool {
        self.inner.settings.reject_on_wait
    }

    /// Whether pacing was to be derived from the quotas.
    pub fn autorate(&self) -> bool {
        self.inner.settings.autorate
    }

    /// Whether the limiter started with exhausted quotas.
    pub fn safe_start(&self) -> bool {
        self.inner.settings.safe_start
    }

    /// Time of the last recorded call.
    pub fn last_call(&self) -> Option<Instant> {
        self.inner.state.lock().last_call
    }

    /// Retained timestamps for each quota, in quota order.
    pub fn history(&self) -> Vec<Vec<Instant>> {
        self.inner
            .state
            .lock()
            .histories
            .iter()
            .map(History::stamps)
            .collect()
    }

    /// Whether `self` and `other` are handles to the same limiter.
    pub fn ptr_eq(&self, other: &Limiter) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Compute the wait for a call arriving now; reject it if configured to.
    fn decide(&self) -> Result<Duration> {
        let mut state = self.inner.state.lock();
        let now = self.inner.clock.now();

        let pace_wait = match &self.inner.pacing {
            Some(pacing) => pacing.wait(state.last_call, now, &mut rand::thread_rng()),
            None => Duration::ZERO,
        };
        let quota_wait = state
            .histories
            .iter_mut()
            .map(|history| history.wait(now))
            .max()
            .unwrap_or(Duration::ZERO);
        let wait = pace_wait.max(quota_wait);

        trace!(pace_wait = ?pace_wait, quota_wait = ?quota_wait, "Computed wait");

        if !wait.is_zero() && self.inner.settings.reject_on_wait {
            debug!(wait = ?wait, "Rate limit exceeded, rejecting call");
            return Err(RlimError::RateLimitExceeded {
                wait,
                limiter: self.clone(),
            });
        }
        Ok(wait)
    }

    /// Record a completed call at the current time.
    fn commit(&self) {
        let now = self.inner.clock.now();
        let mut state = self.inner.state.lock();

        state.last_call = Some(match state.last_call {
            Some(last) => last.max(now),
            None => now,
        });
        for history in state.histories.iter_mut() {
            history.record(now);
        }
    }
}

impl PartialEq for Limiter {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Limiter {}

impl fmt::Debug for Limiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Limiter")
            .field("pacing", &self.inner.pacing)
            .field("quotas", &self.inner.settings.quotas)
            .field("reject_on_wait", &self.inner.settings.reject_on_wait)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}
