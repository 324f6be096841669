//! Engine configuration
//!
//! Loaded from TOML, then overridden from the environment:
//!
//! | Variable                 | Field        | Format                  |
//! |--------------------------|--------------|-------------------------|
//! | `WARP_FIXITY_THRESHOLD`  | `threshold`  | relative duration       |
//! | `WARP_FIXITY_BATCH_SIZE` | `batch_size` | integer                 |
//! | `WARP_FIXITY_ALGORITHMS` | `algorithms` | comma separated names   |
//! | `WARP_FIXITY_SOURCES`    | `sources`    | comma separated ids     |

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hash::AlgorithmSet;
use crate::schedule::RelativeDuration;
use crate::telemetry::LogConfig;

/// Overrides `threshold`
pub const ENV_THRESHOLD: &str = "WARP_FIXITY_THRESHOLD";
/// Overrides `batch_size`
pub const ENV_BATCH_SIZE: &str = "WARP_FIXITY_BATCH_SIZE";
/// Overrides `algorithms`
pub const ENV_ALGORITHMS: &str = "WARP_FIXITY_ALGORITHMS";
/// Overrides `sources`
pub const ENV_SOURCES: &str = "WARP_FIXITY_SOURCES";

/// Fixity engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FixityConfig {
    /// How long a check stays current, e.g. `"-1 month"`
    pub threshold: String,

    /// Objects per batch chunk
    pub batch_size: usize,

    /// Hash algorithms, in evaluation order
    pub algorithms: Vec<String>,

    /// Candidate source identifiers enabled before periodic runs
    pub sources: Vec<String>,

    /// Most records admitted to the work queue per tick
    pub queue_limit: usize,

    /// Seconds a queue marker may be held before it is reclaimed
    pub reclaim_after: u64,

    /// Seconds between daemon ticks
    pub tick_interval_secs: u64,

    /// Concurrent queue workers in the daemon
    pub worker_count: usize,

    /// Diagnostic messages kept per batch run
    pub max_diagnostics: usize,

    /// Candidates enrolled per source per tick
    pub source_chunk: usize,

    /// Logging
    pub logging: LogConfig,
}

impl Default for FixityConfig {
    fn default() -> Self {
        Self {
            threshold: "-1 month".to_string(),
            batch_size: 100,
            algorithms: vec!["sha256".to_string()],
            sources: Vec::new(),
            queue_limit: 1000,
            reclaim_after: 86_400,
            tick_interval_secs: 60,
            worker_count: 2,
            max_diagnostics: 100,
            source_chunk: 1000,
            logging: LogConfig::default(),
        }
    }
}

impl FixityConfig {
    /// Parse TOML without applying environment overrides
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let config: Self = toml::from_str(toml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file and apply environment overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut config: Self = toml::from_str(&text)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults with environment overrides applied
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from `lookup`
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(threshold) = lookup(ENV_THRESHOLD) {
            self.threshold = threshold;
        }
        if let Some(batch_size) = lookup(ENV_BATCH_SIZE) {
            self.batch_size = batch_size.trim().parse().map_err(|_| {
                Error::Config(format!("{ENV_BATCH_SIZE} must be an integer, got '{batch_size}'"))
            })?;
        }
        if let Some(algorithms) = lookup(ENV_ALGORITHMS) {
            self.algorithms = split_list(&algorithms);
        }
        if let Some(sources) = lookup(ENV_SOURCES) {
            self.sources = split_list(&sources);
        }
        Ok(())
    }

    /// Check every field
    pub fn validate(&self) -> Result<()> {
        self.interval()?;
        self.algorithm_set()?;
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be greater than zero".into()));
        }
        if self.queue_limit == 0 {
            return Err(Error::Config("queue_limit must be greater than zero".into()));
        }
        if self.worker_count == 0 {
            return Err(Error::Config("worker_count must be greater than zero".into()));
        }
        if self.tick_interval_secs == 0 {
            return Err(Error::Config(
                "tick_interval_secs must be greater than zero".into(),
            ));
        }
        if self.source_chunk == 0 {
            return Err(Error::Config("source_chunk must be greater than zero".into()));
        }
        if let Some(blank) = self.sources.iter().find(|s| s.trim().is_empty()) {
            return Err(Error::Config(format!("invalid source identifier '{blank}'")));
        }
        Ok(())
    }

    /// Parsed threshold interval
    pub fn interval(&self) -> Result<RelativeDuration> {
        self.threshold.parse()
    }

    /// Parsed algorithm list
    pub fn algorithm_set(&self) -> Result<AlgorithmSet> {
        AlgorithmSet::from_names(&self.algorithms)
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
