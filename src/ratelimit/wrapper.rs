//! Rate-limited callables.
//!
//! [`Limited`] wraps a blocking callable and [`LimitedAsync`] wraps one that
//! returns a future. Both carry an optional [`Limiter`] and their own enabled
//! flag, exposed through the [`RateLimited`] capability trait so that code such
//! as [`Bundle`](crate::bundle::Bundle) can attach, swap or inspect limiters
//! without knowing the wrapped type.

use std::fmt;
use std::future::Future;

use super::limiter::Limiter;
use crate::error::{Result, RlimError};

/// Something that can carry a rate limiter.
pub trait RateLimited {
    /// The attached limiter, if any.
    fn limiter(&self) -> Option<&Limiter>;

    /// Attach, replace or detach the limiter.
    fn set_limiter(&mut self, limiter: Option<Limiter>);

    /// Whether this wrapper applies its limiter when called.
    fn limiter_enabled(&self) -> bool;

    /// Turn limiting for this wrapper on or off.
    fn set_limiter_enabled(&mut self, enabled: bool);
}

/// A [`RateLimited`] wrapper around some inner callable.
pub trait Wrapped: RateLimited + Sized {
    type Inner;

    /// Discard the wrapper and return the callable.
    fn into_inner(self) -> Self::Inner;
}

macro_rules! impl_rate_limited {
    ($wrapper:ident) => {
        impl<F> RateLimited for $wrapper<F> {
            fn limiter(&self) -> Option<&Limiter> {
                self.limiter.as_ref()
            }

            fn set_limiter(&mut self, limiter: Option<Limiter>) {
                self.limiter = limiter;
            }

            fn limiter_enabled(&self) -> bool {
                self.enabled
            }

            fn set_limiter_enabled(&mut self, enabled: bool) {
                self.enabled = enabled;
            }
        }

        impl<F> Wrapped for $wrapper<F> {
            type Inner = F;

            fn into_inner(self) -> F {
                self.func
            }
        }

        impl<F> $wrapper<F> {
            pub(crate) fn new(limiter: Option<Limiter>, func: F) -> Self {
                Self {
                    limiter,
                    enabled: true,
                    func,
                }
            }

            /// The wrapped callable.
            pub fn get_ref(&self) -> &F {
                &self.func
            }

            fn active_limiter(&self) -> Option<&Limiter> {
                self.limiter.as_ref().filter(|_| self.enabled)
            }
        }

        impl<F> fmt::Debug for $wrapper<F> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($wrapper))
                    .field("limiter", &self.limiter)
                    .field("enabled", &self.enabled)
                    .finish_non_exhaustive()
            }
        }
    };
}

/// A blocking callable that acquires its limiter before every call.
#[derive(Clone)]
pub struct Limited<F> {
    limiter: Option<Limiter>,
    enabled: bool,
    func: F,
}

impl_rate_limited!(Limited);

impl<F> Limited<F> {
    /// Acquire the limiter (if attached and enabled), then call the inner function.
    ///
    /// Whatever the inner function returns is passed through unchanged inside
    /// `Ok`; only a rejection by the limiter produces `Err`.
    pub fn call<A, R>(&self, args: A) -> Result<R>
    where
        F: Fn(A) -> R,
    {
        if let Some(limiter) = self.active_limiter() {
            limiter.acquire()?;
        }
        Ok((self.func)(args))
    }

    /// Like [`call`](Self::call) for callables that need mutable state.
    pub fn call_mut<A, R>(&mut self, args: A) -> Result<R>
    where
        F: FnMut(A) -> R,
    {
        if let Some(limiter) = self.active_limiter() {
            limiter.acquire()?;
        }
        Ok((self.func)(args))
    }
}

/// A future-returning callable that acquires its limiter asynchronously
/// before every call.
#[derive(Clone)]
pub struct LimitedAsync<F> {
    limiter: Option<Limiter>,
    enabled: bool,
    func: F,
}

impl_rate_limited!(LimitedAsync);

impl<F> LimitedAsync<F> {
    /// Acquire the limiter (if attached and enabled), then call and await the
    /// inner function.
    pub async fn call<A, Fut>(&self, args: A) -> Result<Fut::Output>
    where
        F: Fn(A) -> Fut,
        Fut: Future,
    {
        if let Some(limiter) = self.active_limiter() {
            limiter.acquire_async().await?;
        }
        Ok((self.func)(args).await)
    }
}

/// Wrap `func` so a limiter can be attached later.
pub fn placeholder<F>(func: F) -> Limited<F> {
    Limited::new(None, func)
}

/// Async version of [`placeholder`].
pub fn placeholder_async<F>(func: F) -> LimitedAsync<F> {
    LimitedAsync::new(None, func)
}

/// Whether `target` has a limiter attached.
pub fn has_limiter<T: RateLimited + ?Sized>(target: &T) -> bool {
    target.limiter().is_some()
}

/// Fail with [`RlimError::MissingLimiter`] unless `target` has a limiter.
pub fn ensure_limiter<T: RateLimited + ?Sized>(target: &T) -> Result<()> {
    if has_limiter(target) {
        Ok(())
    } else {
        Err(RlimError::MissingLimiter(
            "target has no rate limiter attached; use Limiter::apply or set_limiter_state"
                .to_string(),
        ))
    }
}

/// Remove rate limiting and return the wrapped callable.
pub fn strip_limiter<T: Wrapped>(target: T) -> T::Inner {
    target.into_inner()
}

/// The attached limiter and whether the wrapper applies it.
pub fn get_limiter_state<T: RateLimited + ?Sized>(target: &T) -> (Option<Limiter>, bool) {
    (target.limiter().cloned(), target.limiter_enabled())
}

/// Replace the limiter and/or the enabled flag. `None` leaves a field as is.
pub fn set_limiter_state<T: RateLimited + ?Sized>(
    target: &mut T,
    limiter: Option<Option<Limiter>>,
    enabled: Option<bool>,
) {
    if let Some(limiter) = limiter {
        target.set_limiter(limiter);
    }
    if let Some(enabled) = enabled {
        target.set_limiter_enabled(enabled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::{Pacing, Quota};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn limiter_with(clock: Arc<ManualClock>) -> Limiter {
        Limiter::builder()
            .pacing(Pacing::new(Duration::from_secs(1)))
            .quota(Quota::new(100, Duration::from_secs(3600)).unwrap())
            .clock(clock)
            .build()
    }

    #[test]
    fn test_apply_waits_then_calls() {
        let clock = Arc::new(ManualClock::new());
        let limiter = limiter_with(clock.clone());
        let double = limiter.apply(|x: u32| x * 2);

        assert_eq!(double.call(2).unwrap(), 4);
        assert_eq!(double.call(5).unwrap(), 10);
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(1)]);
        assert!(has_limiter(&double));
    }

    #[test]
    fn test_inner_failure_propagates_and_counts() {
        let limiter = limiter_with(Arc::new(ManualClock::new()));
        let failing = limiter.apply(|_: ()| -> std::result::Result<(), String> {
            Err("upstream said no".to_string())
        });

        let outcome = failing.call(()).unwrap();
        assert_eq!(outcome, Err("upstream said no".to_string()));
        assert_eq!(limiter.history()[0].len(), 1);
    }

    #[test]
    fn test_rejected_call_is_never_made() {
        let clock = Arc::new(ManualClock::new());
        let limiter = limiter_with(clock.clone()).copy_with(&crate::ratelimit::Overrides {
            reject_on_wait: Some(true),
            ..Default::default()
        });
        let calls = AtomicUsize::new(0);
        let counted = limiter.apply(|_: ()| calls.fetch_add(1, Ordering::SeqCst));

        counted.call(()).unwrap();
        let err = counted.call(()).unwrap_err();

        assert!(matches!(err, RlimError::RateLimitExceeded { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_call_mut() {
        let limiter = limiter_with(Arc::new(ManualClock::new()));
        let mut total = 0;
        let mut add = limiter.apply(|x: i32| {
            total += x;
            total
        });

        add.call_mut(3).unwrap();
        assert_eq!(add.call_mut(4).unwrap(), 7);
    }

    #[test]
    fn test_placeholder_has_no_limiter() {
        let wrapped = placeholder(|x: i32| x + 1);

        assert!(!has_limiter(&wrapped));
        assert!(matches!(ensure_limiter(&wrapped), Err(RlimError::MissingLimiter(_))));
        assert_eq!(get_limiter_state(&wrapped), (None, true));
        assert_eq!(wrapped.call(1).unwrap(), 2);
    }

    #[test]
    fn test_set_and_get_limiter_state() {
        let limiter = limiter_with(Arc::new(ManualClock::new()));
        let mut wrapped = placeholder(|_: ()| ());

        set_limiter_state(&mut wrapped, Some(Some(limiter.clone())), None);
        assert_eq!(get_limiter_state(&wrapped), (Some(limiter.clone()), true));
        ensure_limiter(&wrapped).unwrap();

        set_limiter_state(&mut wrapped, None, Some(false));
        assert_eq!(get_limiter_state(&wrapped), (Some(limiter), false));

        set_limiter_state(&mut wrapped, Some(None), None);
        assert!(!has_limiter(&wrapped));
    }

    #[test]
    fn test_disabled_wrapper_skips_limiter() {
        let clock = Arc::new(ManualClock::new());
        let limiter = limiter_with(clock.clone());
        let mut wrapped = limiter.apply(|_: ()| ());
        wrapped.set_limiter_enabled(false);

        for _ in 0..5 {
            wrapped.call(()).unwrap();
        }
        assert!(clock.sleeps().is_empty());
        assert!(limiter.history()[0].is_empty());
    }

    #[test]
    fn test_strip_limiter() {
        let limiter = limiter_with(Arc::new(ManualClock::new()));
        let wrapped = limiter.apply(|x: u8| x);

        let plain = strip_limiter(wrapped);
        assert_eq!(plain(9), 9);
        assert!(limiter.history()[0].is_empty());
    }

    #[tokio::test]
    async fn test_apply_async() {
        let clock = Arc::new(ManualClock::new());
        let limiter = limiter_with(clock.clone());
        let fetch = limiter.apply_async(|id: u32| async move { format!("item-{id}") });

        assert_eq!(fetch.call(1).await.unwrap(), "item-1");
        assert_eq!(fetch.call(2).await.unwrap(), "item-2");
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(1)]);
        assert_eq!(limiter.history()[0].len(), 2);
    }

    #[tokio::test]
    async fn test_placeholder_async() {
        let mut wrapped = placeholder_async(|x: u32| async move { x });
        assert_eq!(wrapped.call(3).await.unwrap(), 3);

        let limiter = limiter_with(Arc::new(ManualClock::new()));
        wrapped.set_limiter(Some(limiter.clone()));
        wrapped.call(4).await.unwrap();
        assert_eq!(limiter.history()[0].len(), 1);
    }
}
