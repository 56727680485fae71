//! rlim - pacing and sliding-window rate limiting for outgoing calls
//!
//! This crate throttles calls so that they never exceed a minimum spacing
//! ("pacing") or any of several call quotas over trailing time windows. It is
//! meant for client code talking to rate-limited APIs, from threads or from
//! async tasks. All state is local to a limiter; nothing is coordinated across
//! processes.

pub mod bundle;
pub mod config;
pub mod error;
pub mod ratelimit;

pub use bundle::{ApplyOptions, Bundle, Members};
pub use error::{Result, RlimError};
pub use ratelimit::{Limiter, LimiterBuilder, Overrides, Pacing, Quota};
