//! Configuration for ratekit limiters.
//!
//! Two layers live here: the typed parameter structs every limiter
//! constructor validates ([`RateConfig`], [`SlidingWindowConfig`]), and the
//! YAML file format ([`RatekitConfig`]) that names a set of limiters and the
//! store shared variants talk to.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{RateLimitError, Result};

/// Rate and window shared by every algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateConfig {
    /// Maximum units permitted per window
    pub rate: u64,
    /// Window length
    pub duration: Duration,
}

impl RateConfig {
    /// Create a new rate configuration. Call [`validate`](Self::validate)
    /// (limiter constructors do) before using it.
    pub fn new(rate: u64, duration: Duration) -> Self {
        Self { rate, duration }
    }

    /// Reject parameters that would make the interval arithmetic meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.rate == 0 {
            return Err(invalid("rate must be greater than zero"));
        }
        if i64::try_from(self.rate).is_err() {
            return Err(invalid("rate does not fit in a signed 64-bit integer"));
        }
        if self.duration.is_zero() {
            return Err(invalid("duration must be greater than zero"));
        }
        if self.interval().is_zero() {
            return Err(invalid(format!(
                "duration {:?} is too short for a rate of {}",
                self.duration, self.rate
            )));
        }
        Ok(())
    }

    /// Validation for limiters that ship spans to the store as microseconds.
    pub(crate) fn validate_shared(&self) -> Result<()> {
        self.validate()?;
        if self.interval().as_micros() == 0 {
            return Err(invalid(format!(
                "interval {:?} is below the one microsecond store resolution",
                self.interval()
            )));
        }
        Ok(())
    }

    /// Spacing between units at the configured rate: `duration / rate`.
    pub fn interval(&self) -> Duration {
        divide(self.duration, self.rate)
    }
}

/// Parameters for the sliding window algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlidingWindowConfig {
    /// Maximum units permitted per window
    pub rate: u64,
    /// Window length
    pub duration: Duration,
    /// Number of sub-windows the local variant divides the window into
    pub size: u32,
}

impl SlidingWindowConfig {
    /// Create a new sliding window configuration.
    pub fn new(rate: u64, duration: Duration, size: u32) -> Self {
        Self {
            rate,
            duration,
            size,
        }
    }

    /// Validate rate and duration, then the sub-window layout.
    pub fn validate(&self) -> Result<()> {
        self.rate_config().validate()?;
        if self.size == 0 {
            return Err(invalid("size must be greater than zero"));
        }
        if self.duration.as_nanos() % u128::from(self.size) != 0 {
            return Err(invalid(format!(
                "duration {:?} is not evenly divisible into {} sub-windows",
                self.duration, self.size
            )));
        }
        if self.sub_duration().is_zero() {
            return Err(invalid("sub-window duration must be greater than zero"));
        }
        Ok(())
    }

    /// Length of one sub-window: `duration / size`.
    pub fn sub_duration(&self) -> Duration {
        divide(self.duration, u64::from(self.size))
    }

    /// The rate and window without the sub-window count.
    pub fn rate_config(&self) -> RateConfig {
        RateConfig::new(self.rate, self.duration)
    }
}

fn divide(duration: Duration, by: u64) -> Duration {
    if by == 0 {
        return Duration::ZERO;
    }
    let nanos = duration.as_nanos() / u128::from(by);
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

fn invalid(message: impl Into<String>) -> RateLimitError {
    RateLimitError::InvalidConfig(message.into())
}

/// The admission algorithm a limiter runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    FixedPeriod,
    LeakyBucket,
    SlidingWindow,
    TokenBucket,
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Algorithm::FixedPeriod => "fixed_period",
            Algorithm::LeakyBucket => "leaky_bucket",
            Algorithm::SlidingWindow => "sliding_window",
            Algorithm::TokenBucket => "token_bucket",
        };
        f.write_str(name)
    }
}

/// Where limiter state lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// In this process, behind the limiter's own lock
    #[default]
    Local,
    /// In the shared store, updated by one atomic script per call
    Shared,
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RatekitConfig {
    /// Store used by shared limiters
    #[serde(default)]
    pub store: StoreConfig,

    /// Named limiters
    #[serde(default)]
    pub limiters: Vec<LimiterSpec>,
}

/// Store connection settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Which store implementation to use
    #[serde(default)]
    pub backend: StoreBackend,

    /// Connection URL, required for `redis`
    #[serde(default)]
    pub url: Option<String>,
}

/// Supported store implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store, shared only between limiters of one process
    #[default]
    Memory,
    /// Redis server (requires the `redis` feature)
    Redis,
}

/// One limiter as written in the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterSpec {
    /// Name used to select the limiter
    pub name: String,

    /// Admission algorithm
    pub algorithm: Algorithm,

    /// Local or shared state
    #[serde(default)]
    pub mode: Mode,

    /// Units permitted per window
    pub rate: u64,

    /// Window length in milliseconds
    pub duration_ms: u64,

    /// Sub-window count, sliding window only
    #[serde(default)]
    pub size: Option<u32>,

    /// Store key, shared mode only
    #[serde(default)]
    pub key: Option<String>,
}

impl LimiterSpec {
    /// Window length as a [`Duration`].
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    /// Rate parameters of this spec.
    pub fn rate_config(&self) -> RateConfig {
        RateConfig::new(self.rate, self.duration())
    }

    /// Sliding window parameters; `size` is mandatory for that algorithm.
    pub fn sliding_window_config(&self) -> Result<SlidingWindowConfig> {
        let size = self.size.ok_or_else(|| {
            invalid(format!("limiter '{}': sliding_window requires a size", self.name))
        })?;
        Ok(SlidingWindowConfig::new(self.rate, self.duration(), size))
    }

    /// Store key for shared mode, falling back to the limiter name.
    pub fn store_key(&self) -> &str {
        self.key.as_deref().unwrap_or(&self.name)
    }
}

impl RatekitConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading ratekit configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: RatekitConfig = serde_yaml::from_str(yaml)
            .map_err(|e| RateLimitError::Config(format!("Failed to parse config: {}", e)))?;

        for (i, spec) in config.limiters.iter().enumerate() {
            if config.limiters[..i].iter().any(|other| other.name == spec.name) {
                return Err(RateLimitError::Config(format!(
                    "duplicate limiter name '{}'",
                    spec.name
                )));
            }
        }
        Ok(config)
    }

    /// Look up a limiter by name.
    pub fn limiter(&self, name: &str) -> Option<&LimiterSpec> {
        self.limiters.iter().find(|spec| spec.name == name)
    }
}
