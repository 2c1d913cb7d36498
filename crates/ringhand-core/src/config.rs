use std::path::Path;
use std::time::Duration;

use ::config as cfg;
use once_cell::sync::OnceCell;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ConfigError, Result};

/// Environment prefix for overrides, e.g. `RINGHAND__YIELD_DURATION_US=100`.
pub const ENV_PREFIX: &str = "RINGHAND";

/// Default number of spin hints issued per pause burst.
pub const DEFAULT_PAUSE_CYCLES: u32 = 20;

/// Default base unit for coarse yield backoff.
pub const DEFAULT_YIELD_DURATION_US: u64 = 250;

const MAX_PAUSE_CYCLES: u32 = 1024;
const MAX_YIELD_DURATION_US: u64 = 1_000_000;

/// Tuning for the spin/yield backoff used by blocking queue helpers.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Base unit for `yield_backoff(level)`, which sleeps `level² × unit`.
    /// 50-250us suits latency-sensitive paths, 1-4ms general workloads.
    #[serde(default = "BackoffConfig::default_yield_duration_us")]
    pub yield_duration_us: u64,

    /// Spin hints issued per pause burst.
    #[serde(default = "BackoffConfig::default_pause_cycles")]
    pub pause_cycles: u32,
}

impl BackoffConfig {
    fn default_yield_duration_us() -> u64 {
        DEFAULT_YIELD_DURATION_US
    }

    fn default_pause_cycles() -> u32 {
        DEFAULT_PAUSE_CYCLES
    }

    pub fn for_latency_sensitive() -> Self {
        Self {
            yield_duration_us: 100,
            pause_cycles: DEFAULT_PAUSE_CYCLES,
        }
    }

    pub fn for_general() -> Self {
        Self {
            yield_duration_us: 2_000,
            pause_cycles: DEFAULT_PAUSE_CYCLES,
        }
    }

    pub fn yield_duration(&self) -> Duration {
        Duration::from_micros(self.yield_duration_us)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pause_cycles == 0 || self.pause_cycles > MAX_PAUSE_CYCLES {
            return Err(ConfigError::Invalid(format!(
                "pause_cycles must be 1..={}, got {}",
                MAX_PAUSE_CYCLES, self.pause_cycles
            )));
        }
        if self.yield_duration_us > MAX_YIELD_DURATION_US {
            return Err(ConfigError::Invalid(format!(
                "yield_duration_us must be <= {}, got {}",
                MAX_YIELD_DURATION_US, self.yield_duration_us
            )));
        }
        Ok(())
    }

    /// Load defaults, then `path` (toml/yaml/json by extension) if given, then
    /// `RINGHAND__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = cfg::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(cfg::File::from(path).required(true));
        }
        builder = builder.add_source(
            cfg::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config: BackoffConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            yield_duration_us: Self::default_yield_duration_us(),
            pause_cycles: Self::default_pause_cycles(),
        }
    }
}

/// Resolved, immutable backoff settings shared by the whole process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffSettings {
    pub yield_duration: Duration,
    pub pause_cycles: u32,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            yield_duration: Duration::from_micros(DEFAULT_YIELD_DURATION_US),
            pause_cycles: DEFAULT_PAUSE_CYCLES,
        }
    }
}

impl From<&BackoffConfig> for BackoffSettings {
    fn from(config: &BackoffConfig) -> Self {
        Self {
            yield_duration: config.yield_duration(),
            pause_cycles: config.pause_cycles,
        }
    }
}

static SETTINGS: OnceCell<BackoffSettings> = OnceCell::new();

/// Install process-wide backoff settings.
///
/// Settable once: fails with `AlreadyInstalled` after a previous install or
/// after `backoff()` already fell back to defaults.
pub fn install(config: &BackoffConfig) -> Result<&'static BackoffSettings> {
    config.validate()?;
    let settings = BackoffSettings::from(config);
    let installed = SETTINGS
        .try_insert(settings)
        .map_err(|_| ConfigError::AlreadyInstalled)?;
    info!(
        yield_duration_us = config.yield_duration_us,
        pause_cycles = config.pause_cycles,
        "backoff settings installed"
    );
    Ok(installed)
}

/// Install a yield base unit, keeping the default pause cycle count.
pub fn set_yield_duration(duration: Duration) -> Result<&'static BackoffSettings> {
    let config = BackoffConfig {
        yield_duration_us: u64::try_from(duration.as_micros()).unwrap_or(u64::MAX),
        ..BackoffConfig::default()
    };
    install(&config)
}

/// Current process-wide settings; locks in the defaults if nothing was installed.
#[inline]
pub fn backoff() -> &'static BackoffSettings {
    SETTINGS.get_or_init(BackoffSettings::default)
}
