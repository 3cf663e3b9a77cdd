//! Poll/backoff budgets per resource kind.
//!
//! Cluster creation legitimately takes far longer than applying a deployment,
//! so every kind carries its own create and teardown [`PollPolicy`]. Budgets
//! can be overridden from a TOML file:
//!
//! ```toml
//! [cluster.create]
//! timeout_secs = 3600
//!
//! [node_pool.teardown]
//! initial_interval_secs = 5
//! max_attempts = 100
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::spec::ResourceKind;

/// Default first wait between polls.
pub const DEFAULT_INITIAL_INTERVAL: Duration = Duration::from_secs(2);

/// Default cap for the exponential backoff.
pub const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(30);

/// Default backoff multiplier.
pub const DEFAULT_MULTIPLIER: f64 = 2.0;

/// Bounded exponential backoff for one wait.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollPolicy {
    /// Wait after the first unsuccessful poll.
    pub initial_interval: Duration,
    /// Upper bound for any single wait.
    pub max_interval: Duration,
    /// Growth factor applied after each wait.
    pub multiplier: f64,
    /// Total budget for the whole wait.
    pub timeout: Duration,
    /// Optional cap on the number of polls.
    pub max_attempts: Option<u32>,
}

impl PollPolicy {
    /// Policy with the default backoff and the given total budget.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            initial_interval: DEFAULT_INITIAL_INTERVAL,
            max_interval: DEFAULT_MAX_INTERVAL,
            multiplier: DEFAULT_MULTIPLIER,
            timeout,
            max_attempts: None,
        }
    }

    /// Fixed interval, no growth.
    #[must_use]
    pub fn fixed(interval: Duration, timeout: Duration) -> Self {
        Self {
            initial_interval: interval,
            max_interval: interval,
            multiplier: 1.0,
            timeout,
            max_attempts: None,
        }
    }

    /// The wait that follows `current`, never above `max_interval`.
    #[must_use]
    pub fn next_interval(&self, current: Duration) -> Duration {
        Duration::try_from_secs_f64(current.as_secs_f64() * self.multiplier)
            .map_or(self.max_interval, |next| next.min(self.max_interval))
    }
}

/// Create and teardown budgets for one kind.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KindPolicy {
    pub create: PollPolicy,
    pub teardown: PollPolicy,
}

impl KindPolicy {
    fn minutes(create: u64, teardown: u64) -> Self {
        Self {
            create: PollPolicy::with_timeout(Duration::from_secs(create * 60)),
            teardown: PollPolicy::with_timeout(Duration::from_secs(teardown * 60)),
        }
    }
}

/// Lifecycle budgets for every kind.
#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleConfig {
    pub cluster: KindPolicy,
    pub node_pool: KindPolicy,
    pub deployment: KindPolicy,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            cluster: KindPolicy::minutes(30, 20),
            node_pool: KindPolicy::minutes(20, 15),
            deployment: KindPolicy::minutes(10, 5),
        }
    }
}

impl LifecycleConfig {
    /// Same policy for every kind. Mostly useful in tests.
    #[must_use]
    pub fn uniform(policy: KindPolicy) -> Self {
        Self {
            cluster: policy,
            node_pool: policy,
            deployment: policy,
        }
    }

    #[must_use]
    pub fn policy(&self, kind: ResourceKind) -> &KindPolicy {
        match kind {
            ResourceKind::Cluster => &self.cluster,
            ResourceKind::NodePool => &self.node_pool,
            ResourceKind::Deployment => &self.deployment,
        }
    }

    /// Defaults overridden by the TOML document `text`.
    ///
    /// # Errors
    /// Returns [`Error::Config`] on malformed TOML, unknown keys or
    /// out-of-range values.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        let defaults = Self::default();
        Ok(Self {
            cluster: file.cluster.apply("cluster", defaults.cluster)?,
            node_pool: file.node_pool.apply("node_pool", defaults.node_pool)?,
            deployment: file.deployment.apply("deployment", defaults.deployment)?,
        })
    }

    /// Load overrides from a TOML file.
    ///
    /// # Errors
    /// Returns [`Error::Config`] if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    cluster: KindOverride,
    node_pool: KindOverride,
    deployment: KindOverride,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct KindOverride {
    create: PollOverride,
    teardown: PollOverride,
}

impl KindOverride {
    fn apply(self, kind: &str, base: KindPolicy) -> Result<KindPolicy> {
        Ok(KindPolicy {
            create: self.create.apply(&format!("{kind}.create"), base.create)?,
            teardown: self.teardown.apply(&format!("{kind}.teardown"), base.teardown)?,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct PollOverride {
    initial_interval_secs: Option<f64>,
    max_interval_secs: Option<f64>,
    multiplier: Option<f64>,
    timeout_secs: Option<f64>,
    max_attempts: Option<u32>,
}

impl PollOverride {
    fn apply(self, section: &str, base: PollPolicy) -> Result<PollPolicy> {
        let secs = |key: &str, value: Option<f64>, fallback: Duration| -> Result<Duration> {
            match value {
                None => Ok(fallback),
                Some(v) => Duration::try_from_secs_f64(v)
                    .map_err(|e| Error::Config(format!("{section}.{key}: {e}"))),
            }
        };

        let policy = PollPolicy {
            initial_interval: secs(
                "initial_interval_secs",
                self.initial_interval_secs,
                base.initial_interval,
            )?,
            max_interval: secs("max_interval_secs", self.max_interval_secs, base.max_interval)?,
            multiplier: self.multiplier.unwrap_or(base.multiplier),
            timeout: secs("timeout_secs", self.timeout_secs, base.timeout)?,
            max_attempts: self.max_attempts.or(base.max_attempts),
        };

        if !policy.multiplier.is_finite() || policy.multiplier < 1.0 {
            return Err(Error::Config(format!(
                "{section}.multiplier must be >= 1.0, got {}",
                policy.multiplier
            )));
        }
        if policy.initial_interval > policy.max_interval {
            return Err(Error::Config(format!(
                "{section}.initial_interval_secs exceeds max_interval_secs"
            )));
        }
        if policy.max_attempts == Some(0) {
            return Err(Error::Config(format!("{section}.max_attempts must be positive")));
        }
        Ok(policy)
    }
}
