//! Configuration management for rlim.
//!
//! Limiters and bundles can be described in YAML:
//!
//! ```yaml
//! limiters:
//!   search:
//!     pacing:
//!       interval_secs: 0.5
//!       variation: 0.1
//!     quotas:
//!       - max_calls: 50
//!         window_secs: 40
//!   upload:
//!     quotas:
//!       - max_calls: 10
//!         window_secs: 60
//!     autorate: true
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::bundle::{ApplyOptions, Bundle};
use crate::error::{Result, RlimError};
use crate::ratelimit::{Limiter, Pacing, Quota};

/// Pacing section of a limiter configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacingConfig {
    /// Seconds between calls
    pub interval_secs: f64,
    /// Jitter fraction in [0, 1)
    #[serde(default)]
    pub variation: f64,
}

impl PacingConfig {
    /// Validate and convert into a [`Pacing`].
    pub fn build(&self) -> Result<Pacing> {
        Pacing::from_secs_f64(self.interval_secs)?.with_variation(self.variation)
    }
}

/// One sliding-window quota.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Maximum calls inside the window
    pub max_calls: usize,
    /// Window length in seconds
    pub window_secs: f64,
}

impl QuotaConfig {
    /// Validate and convert into a [`Quota`].
    pub fn build(&self) -> Result<Quota> {
        Quota::from_secs_f64(self.max_calls, self.window_secs)
    }
}

/// Configuration for a single limiter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterConfig {
    #[serde(default)]
    pub pacing: Option<PacingConfig>,

    #[serde(default)]
    pub quotas: Vec<QuotaConfig>,

    /// Reject calls that would have to wait
    #[serde(default)]
    pub reject_on_wait: bool,

    /// Derive pacing from the tightest quota when none is given
    #[serde(default)]
    pub autorate: bool,

    /// Start with every quota exhausted
    #[serde(default)]
    pub safe_start: bool,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            pacing: None,
            quotas: Vec::new(),
            reject_on_wait: false,
            autorate: false,
            safe_start: false,
            enabled: default_enabled(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

impl LimiterConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading limiter configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| RlimError::Config(format!("Failed to parse limiter config: {}", e)))
    }

    /// Validate every value and build the limiter.
    pub fn build(&self) -> Result<Limiter> {
        let quotas = self
            .quotas
            .iter()
            .map(QuotaConfig::build)
            .collect::<Result<Vec<_>>>()?;

        let mut builder = Limiter::builder()
            .quotas(quotas)
            .reject_on_wait(self.reject_on_wait)
            .autorate(self.autorate)
            .safe_start(self.safe_start)
            .enabled(self.enabled);
        if let Some(pacing) = &self.pacing {
            builder = builder.pacing(pacing.build()?);
        }

        Ok(builder.build())
    }
}

/// A named set of limiters plus default application options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BundleConfig {
    #[serde(default)]
    pub limiters: BTreeMap<String, LimiterConfig>,

    /// Default for skipping missing members
    #[serde(default)]
    pub ignore: Option<bool>,

    /// Default for attaching copies instead of shared limiters
    #[serde(default)]
    pub copy: Option<bool>,
}

impl BundleConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading bundle configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| RlimError::Config(format!("Failed to parse bundle config: {}", e)))
    }

    /// Build every limiter and bake the default options into the bundle.
    pub fn build(&self) -> Result<Bundle> {
        let mut bundle = Bundle::new();
        for (name, config) in &self.limiters {
            let limiter = config
                .build()
                .map_err(|e| RlimError::Config(format!("limiter {:?}: {}", name, e)))?;
            bundle.insert(name.clone(), limiter);
        }

        Ok(bundle.bake(ApplyOptions {
            ignore: self.ignore,
            copy: self.copy,
            ..ApplyOptions::default()
        }))
    }

    /// Get the configuration for one limiter.
    pub fn get(&self, name: &str) -> Option<&LimiterConfig> {
        self.limiters.get(name)
    }
}
