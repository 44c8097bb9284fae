//! Controller configuration
//!
//! Every field has a default so a TOML overlay only needs the values it
//! changes. Durations are written in seconds (`*_secs`) or milliseconds
//! (`*_millis`) to keep the file format plain.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cloud::{ClassifierRule, PatternClassifier};
use crate::error::{Error, Result};

/// Exponential retry schedule for the generic "try again" helper
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub initial_millis: u64,
    pub factor: f64,
    pub steps: u32,
    /// Each delay is stretched by up to `jitter` times itself
    pub jitter: f64,
}

impl RetryPolicy {
    /// Schedule used around load balancer deletion
    pub fn deletion() -> Self {
        Self {
            initial_millis: 1000,
            factor: 2.0,
            steps: 8,
            jitter: 4.0,
        }
    }

    /// Shorter schedule used around status writes
    pub fn status() -> Self {
        Self {
            steps: 3,
            ..Self::deletion()
        }
    }

    pub fn initial(&self) -> Duration {
        Duration::from_millis(self.initial_millis)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::deletion()
    }
}

/// Requeue backoff applied when the cloud API throttles us
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub floor_secs: u64,
    pub factor: f64,
    /// Delay that, once exceeded, drops the backoff to `plateau_secs`
    pub ceiling_secs: u64,
    pub plateau_secs: u64,
    /// How long without throttling before the delay falls back to the floor
    pub quiet_period_secs: u64,
    pub decay_check_secs: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            floor_secs: 5,
            factor: 1.5,
            ceiling_secs: 120,
            plateau_secs: 30,
            quiet_period_secs: 60,
            decay_check_secs: 20,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub cluster_name: String,
    pub workers: usize,
    /// Requeue delay for failures that are not throttling
    pub error_requeue_secs: u64,
    /// Interval at which every tracked service is re-ensured; 0 disables
    pub resync_secs: u64,
    pub backoff: BackoffConfig,
    pub delete_retry: RetryPolicy,
    pub status_retry: RetryPolicy,
    pub classifier_rules: Vec<ClassifierRule>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            cluster_name: "kubernetes".to_string(),
            workers: 2,
            error_requeue_secs: 5,
            resync_secs: 600,
            backoff: BackoffConfig::default(),
            delete_retry: RetryPolicy::deletion(),
            status_retry: RetryPolicy::status(),
            classifier_rules: PatternClassifier::default_rules(),
        }
    }
}

impl ControllerConfig {
    /// Load a TOML overlay on top of the defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: ControllerConfig = toml::from_str(&raw).map_err(|e| {
            Error::ConfigError(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::ConfigError("workers must be at least 1".to_string()));
        }
        check_factor("backoff.factor", self.backoff.factor)?;
        if self.backoff.floor_secs == 0 || self.backoff.decay_check_secs == 0 {
            return Err(Error::ConfigError(
                "backoff.floor_secs and backoff.decay_check_secs must be positive".to_string(),
            ));
        }
        if self.backoff.ceiling_secs < self.backoff.floor_secs {
            return Err(Error::ConfigError(
                "backoff.ceiling_secs must be >= backoff.floor_secs".to_string(),
            ));
        }
        if self.backoff.plateau_secs > self.backoff.ceiling_secs {
            return Err(Error::ConfigError(
                "backoff.plateau_secs must be <= backoff.ceiling_secs".to_string(),
            ));
        }
        for (name, policy) in [
            ("delete_retry", &self.delete_retry),
            ("status_retry", &self.status_retry),
        ] {
            if policy.steps == 0 {
                return Err(Error::ConfigError(format!("{}.steps must be positive", name)));
            }
            check_factor(&format!("{}.factor", name), policy.factor)?;
            if !policy.jitter.is_finite() || policy.jitter < 0.0 {
                return Err(Error::ConfigError(format!(
                    "{}.jitter must be a finite number >= 0, got {}",
                    name, policy.jitter
                )));
            }
        }
        Ok(())
    }

    pub fn error_requeue(&self) -> Duration {
        Duration::from_secs(self.error_requeue_secs)
    }

    pub fn resync_period(&self) -> Option<Duration> {
        (self.resync_secs > 0).then(|| Duration::from_secs(self.resync_secs))
    }

    pub fn classifier(&self) -> PatternClassifier {
        PatternClassifier::new(self.classifier_rules.clone())
    }
}

/// Growth factors must not shrink delays or leave them undefined
fn check_factor(name: &str, factor: f64) -> Result<()> {
    if factor.is_finite() && factor >= 1.0 {
        Ok(())
    } else {
        Err(Error::ConfigError(format!(
            "{} must be a finite number >= 1.0, got {}",
            name, factor
        )))
    }
}
