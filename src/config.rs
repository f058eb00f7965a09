//! Selector and selection-strategy configuration
//!
//! Strategies are registered from a JSON blob naming a known strategy kind:
//!
//! ```json
//! {
//!   "name": "NewDataStrategy",
//!   "maximum_keys_in_memory": 2,
//!   "config": { "limit": -1, "reset_after_trigger": true }
//! }
//! ```
//!
//! Unknown names, unknown fields and out-of-range values are rejected when
//! the configuration is parsed, never at first use.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

const fn default_insertion_threads() -> usize {
    8
}

const fn default_sample_batch_size() -> usize {
    10_000
}

const fn default_limit() -> i64 {
    -1
}

const fn default_presampling_ratio() -> i64 {
    100
}

/// Engine-wide settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SelectorConfig {
    /// Maximum number of concurrent writer tasks per `inform` call
    #[serde(default = "default_insertion_threads")]
    pub insertion_threads: usize,
    /// Maximum number of (key, weight) pairs per streamed response batch
    #[serde(default = "default_sample_batch_size")]
    pub sample_batch_size: usize,
    /// Spill finalized trigger partitions to Parquet files in this directory
    #[serde(default)]
    pub trigger_sample_directory: Option<PathBuf>,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            insertion_threads: default_insertion_threads(),
            sample_batch_size: default_sample_batch_size(),
            trigger_sample_directory: None,
        }
    }
}

impl SelectorConfig {
    /// Check value ranges
    ///
    /// # Errors
    /// Returns `InvalidConfiguration` if a count is zero
    pub fn validate(&self) -> Result<()> {
        if self.insertion_threads == 0 {
            return Err(Error::InvalidConfiguration(
                "insertion_threads must be at least 1".to_string(),
            ));
        }
        if self.sample_batch_size == 0 {
            return Err(Error::InvalidConfiguration(
                "sample_batch_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Parse and validate a JSON document
    ///
    /// # Errors
    /// Returns `InvalidConfiguration` on malformed JSON or invalid values
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::InvalidConfiguration(format!("selector config: {e}")))?;
        config.validate()?;
        Ok(config)
    }
}

/// How FullHistory/NewData shrink an eligible set larger than `limit`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LimitReset {
    /// Keep the `limit` most recently informed records
    #[default]
    #[serde(rename = "lastX")]
    LastX,
    /// Keep a uniform random subset of `limit` records
    #[serde(rename = "sampleUAR")]
    SampleUar,
}

/// Configuration of the FullHistory strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FullHistoryConfig {
    /// Maximum training-set size, `-1` for unbounded
    #[serde(default = "default_limit")]
    pub limit: i64,
    /// Policy applied when the limit bites
    #[serde(default)]
    pub limit_reset: LimitReset,
}

impl Default for FullHistoryConfig {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            limit_reset: LimitReset::default(),
        }
    }
}

/// Configuration of the NewData strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewDataConfig {
    /// Maximum training-set size, `-1` for unbounded
    #[serde(default = "default_limit")]
    pub limit: i64,
    /// Mark selected records used so later triggers only see newer data
    #[serde(default)]
    pub reset_after_trigger: bool,
    /// Policy applied when the limit bites
    #[serde(default)]
    pub limit_reset: LimitReset,
}

impl Default for NewDataConfig {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            reset_after_trigger: false,
            limit_reset: LimitReset::default(),
        }
    }
}

/// Configuration of the downsampling family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DownsamplingConfig {
    /// Percentage of the eligible set targeted, in `(0, 100]`
    #[serde(default = "default_presampling_ratio")]
    pub presampling_ratio: i64,
    /// Maximum training-set size, `-1` for unbounded
    #[serde(default = "default_limit")]
    pub limit: i64,
    /// Mark the eligible pool used after each trigger
    #[serde(default)]
    pub reset_after_trigger: bool,
}

impl Default for DownsamplingConfig {
    fn default() -> Self {
        Self {
            presampling_ratio: default_presampling_ratio(),
            limit: default_limit(),
            reset_after_trigger: false,
        }
    }
}

/// Closed set of known strategy kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    /// Replay the whole history
    FullHistory(FullHistoryConfig),
    /// Train on data informed since the last trigger
    NewData(NewDataConfig),
    /// Ratio-based presampling with inverse-probability weights
    Downsampling(DownsamplingConfig),
}

impl StrategyKind {
    /// Name used in configuration blobs
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::FullHistory(_) => "FullHistoryStrategy",
            Self::NewData(_) => "NewDataStrategy",
            Self::Downsampling(_) => "DownsamplingStrategy",
        }
    }
}

/// A validated strategy configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrategyConfig {
    /// Strategy kind and its parameters
    pub kind: StrategyKind,
    /// Upper bound on keys per partition
    pub maximum_keys_in_memory: usize,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStrategyConfig {
    name: String,
    maximum_keys_in_memory: usize,
    #[serde(default)]
    config: Option<serde_json::Value>,
}

impl StrategyConfig {
    /// Create and validate a configuration
    ///
    /// # Errors
    /// Returns `InvalidConfiguration` if a parameter is out of range
    pub fn new(kind: StrategyKind, maximum_keys_in_memory: usize) -> Result<Self> {
        let config = Self {
            kind,
            maximum_keys_in_memory,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    ///
    /// # Errors
    /// Returns `InvalidConfiguration` describing the first offending field
    pub fn validate(&self) -> Result<()> {
        if self.maximum_keys_in_memory == 0 {
            return Err(Error::InvalidConfiguration(
                "maximum_keys_in_memory must be at least 1".to_string(),
            ));
        }

        let limit = match self.kind {
            StrategyKind::FullHistory(c) => c.limit,
            StrategyKind::NewData(c) => c.limit,
            StrategyKind::Downsampling(c) => {
                if c.presampling_ratio <= 0 || c.presampling_ratio > 100 {
                    return Err(Error::InvalidConfiguration(format!(
                        "presampling_ratio must be in (0, 100], got {}",
                        c.presampling_ratio
                    )));
                }
                c.limit
            }
        };
        if limit < -1 {
            return Err(Error::InvalidConfiguration(format!(
                "limit must be -1 (unbounded) or non-negative, got {limit}"
            )));
        }
        Ok(())
    }

    /// Parse and validate a strategy blob
    ///
    /// # Errors
    /// Returns `InvalidConfiguration` for malformed JSON, unknown strategy
    /// names, unknown fields or out-of-range values
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: RawStrategyConfig = serde_json::from_str(json)
            .map_err(|e| Error::InvalidConfiguration(format!("strategy config: {e}")))?;
        let params = raw
            .config
            .unwrap_or_else(|| serde_json::Value::Object(serde_json::Map::new()));

        let kind = match raw.name.as_str() {
            "FullHistoryStrategy" => StrategyKind::FullHistory(Self::params(&raw.name, params)?),
            "NewDataStrategy" => StrategyKind::NewData(Self::params(&raw.name, params)?),
            "DownsamplingStrategy" | "AbstractDownsampleStrategy" => {
                StrategyKind::Downsampling(Self::params(&raw.name, params)?)
            }
            other => {
                return Err(Error::InvalidConfiguration(format!(
                    "unknown selection strategy: {other}"
                )))
            }
        };

        Self::new(kind, raw.maximum_keys_in_memory)
    }

    fn params<T: serde::de::DeserializeOwned>(name: &str, value: serde_json::Value) -> Result<T> {
        serde_json::from_value(value)
            .map_err(|e| Error::InvalidConfiguration(format!("{name} config: {e}")))
    }
}

impl FromStr for StrategyConfig {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_json(s)
    }
}
