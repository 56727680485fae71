//! Error types for rlim.

use std::time::Duration;

use thiserror::Error;

use crate::ratelimit::Limiter;

/// Main error type for rlim operations.
#[derive(Error, Debug)]
pub enum RlimError {
    /// Invalid limiter configuration (bad interval, jitter, window or capacity)
    #[error("Configuration error: {0}")]
    Config(String),

    /// The limiter is in rejection mode and the call would have had to wait.
    #[error("Rate limit exceeded: call would have waited {wait:?}")]
    RateLimitExceeded {
        /// How long the call would have had to wait
        wait: Duration,
        /// The limiter that rejected the call
        limiter: Limiter,
    },

    /// A target was expected to carry a rate limiter but does not.
    #[error("Missing rate limiter: {0}")]
    MissingLimiter(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RlimError {
    /// The wait carried by a rejection, if this is one.
    pub fn wait(&self) -> Option<Duration> {
        match self {
            RlimError::RateLimitExceeded { wait, .. } => Some(*wait),
            _ => None,
        }
    }
}

/// Result type alias for rlim operations.
pub type Result<T> = std::result::Result<T, RlimError>;
