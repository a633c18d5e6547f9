//! Engine configuration
//!
//! All knobs have defaults; a partial JSON document only overrides the fields
//! it names.
//!
//! ```rust
//! use splitlab::config::EngineConfig;
//!
//! let config = EngineConfig::from_json_str(r#"{"tick_interval_ms": 500}"#)?;
//! assert_eq!(config.tick_interval().as_millis(), 500);
//! assert_eq!(config.retention_days, 30);
//! # Ok::<(), splitlab::Error>(())
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

const MS_PER_DAY: u64 = 24 * 60 * 60 * 1000;

/// Traffic model used by the simulation scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrafficConfig {
    /// Lower bound of the per-tick visitor draw (before allocation scaling)
    pub min_visitors_per_tick: u32,
    /// Upper bound of the per-tick visitor draw (before allocation scaling)
    pub max_visitors_per_tick: u32,
    /// Conversion probability of the control arm
    pub baseline_conversion_rate: f64,
    /// Uniform noise added to the control rate, `[0, control_jitter)`
    pub control_jitter: f64,
    /// Uniform noise added to treatment rates, `[0, treatment_jitter)`
    pub treatment_jitter: f64,
    /// Largest deterministic lift a treatment arm receives
    pub max_treatment_lift: f64,
    /// Seed for a reproducible simulation; entropy when `None`
    pub seed: Option<u64>,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            min_visitors_per_tick: 5,
            max_visitors_per_tick: 25,
            baseline_conversion_rate: 0.05,
            control_jitter: 0.02,
            treatment_jitter: 0.01,
            max_treatment_lift: 0.04,
            seed: None,
        }
    }
}

/// Engine-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Period of the simulation tick
    pub tick_interval_ms: u64,
    /// Period of idle keep-alive events on live feeds
    pub keep_alive_interval_ms: u64,
    /// Wall-clock length of one experiment "day"
    pub day_length_ms: u64,
    /// Complete a running experiment as soon as it reaches its confidence level
    pub complete_on_significance: bool,
    /// Terminal experiments older than this are removed by `purge_expired`
    pub retention_days: u32,
    /// Buffered frames per live feed before updates are dropped
    pub live_buffer: usize,
    /// Simulated traffic model
    pub traffic: TrafficConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 2_000,
            keep_alive_interval_ms: 15_000,
            day_length_ms: MS_PER_DAY,
            complete_on_significance: false,
            retention_days: 30,
            live_buffer: 64,
            traffic: TrafficConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parse a (possibly partial) JSON document and validate it.
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` for malformed JSON or `Error::Config`
    /// if [`EngineConfig::validate`] rejects the values.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Simulation tick period.
    #[must_use]
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Live feed keep-alive period.
    #[must_use]
    pub const fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }

    /// Length of one experiment day.
    #[must_use]
    pub const fn day_length(&self) -> Duration {
        Duration::from_millis(self.day_length_ms)
    }

    /// Retention window for terminal experiments, saturating at
    /// `Duration::MAX`.
    #[must_use]
    pub const fn retention(&self) -> Duration {
        self.day_length().saturating_mul(self.retention_days)
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for zero periods, a keep-alive period equal to
    /// the tick period, an empty or inverted visitor range, rates outside
    /// `[0, 1]`, or a zero live buffer.
    pub fn validate(&self) -> Result<()> {
        if self.tick_interval_ms == 0 {
            return Err(Error::Config("tick_interval_ms must be > 0".to_string()));
        }
        if self.keep_alive_interval_ms == 0 {
            return Err(Error::Config(
                "keep_alive_interval_ms must be > 0".to_string(),
            ));
        }
        if self.keep_alive_interval_ms == self.tick_interval_ms {
            return Err(Error::Config(
                "keep_alive_interval_ms must differ from tick_interval_ms".to_string(),
            ));
        }
        if self.day_length_ms == 0 {
            return Err(Error::Config("day_length_ms must be > 0".to_string()));
        }
        if self.live_buffer == 0 {
            return Err(Error::Config("live_buffer must be > 0".to_string()));
        }

        let traffic = &self.traffic;
        if traffic.max_visitors_per_tick == 0
            || traffic.min_visitors_per_tick > traffic.max_visitors_per_tick
        {
            return Err(Error::Config(format!(
                "visitor range {}..={} is empty",
                traffic.min_visitors_per_tick, traffic.max_visitors_per_tick
            )));
        }
        for (name, value) in [
            ("baseline_conversion_rate", traffic.baseline_conversion_rate),
            ("control_jitter", traffic.control_jitter),
            ("treatment_jitter", traffic.treatment_jitter),
            ("max_treatment_lift", traffic.max_treatment_lift),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::Config(format!(
                    "{name} must be within [0, 1] (got {value})"
                )));
            }
        }
        Ok(())
    }
}
