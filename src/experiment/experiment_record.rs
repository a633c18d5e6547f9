//! Experiment Record - root entity of the split-test engine

use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use super::Variant;
use crate::{Error, Result};

/// Lifecycle status of an experiment.
///
/// ```text
/// draft ──start──> running ──stop──> completed
///                  │  ^    ──abort─> stopped
///             pause│  │start
///                  v  │
///                  paused
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExperimentStatus {
    /// Created, never started.
    Draft,
    /// Simulation ticks are active.
    Running,
    /// Temporarily halted, can be resumed with `start`.
    Paused,
    /// Finished naturally or concluded by the operator (terminal).
    Completed,
    /// Aborted by the operator (terminal).
    Stopped,
}

impl ExperimentStatus {
    /// Wire name of the status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Stopped => "stopped",
        }
    }

    /// Terminal statuses never transition again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Stopped)
    }

    /// Statuses from which `start` is accepted.
    #[must_use]
    pub const fn can_start(self) -> bool {
        matches!(self, Self::Draft | Self::Paused)
    }
}

impl fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Confidence level an experiment must reach before a winner is declared.
///
/// Serialized as the plain percentage (`80`, `90`, `95`, `99`).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "u8", into = "u8")]
pub enum ConfidenceLevel {
    /// 80% confidence
    P80,
    /// 90% confidence
    P90,
    /// 95% confidence
    #[default]
    P95,
    /// 99% confidence
    P99,
}

impl ConfidenceLevel {
    /// All levels, lowest first.
    pub const ALL: [Self; 4] = [Self::P80, Self::P90, Self::P95, Self::P99];

    /// Level as a percentage.
    #[must_use]
    pub const fn percent(self) -> u8 {
        match self {
            Self::P80 => 80,
            Self::P90 => 90,
            Self::P95 => 95,
            Self::P99 => 99,
        }
    }

    /// Critical z value for this level.
    #[must_use]
    pub const fn z_critical(self) -> f64 {
        match self {
            Self::P80 => 1.282,
            Self::P90 => 1.645,
            Self::P95 => 1.96,
            Self::P99 => 2.576,
        }
    }

    /// Level as a significance value comparable with
    /// [`Experiment::statistical_significance`].
    #[must_use]
    pub fn as_significance(self) -> f64 {
        f64::from(self.percent())
    }
}

impl TryFrom<u8> for ConfidenceLevel {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            80 => Ok(Self::P80),
            90 => Ok(Self::P90),
            95 => Ok(Self::P95),
            99 => Ok(Self::P99),
            other => Err(Error::Validation(format!(
                "confidence level must be one of 80, 90, 95, 99 (got {other})"
            ))),
        }
    }
}

impl From<ConfidenceLevel> for u8 {
    fn from(level: ConfidenceLevel) -> Self {
        level.percent()
    }
}

/// A split-test experiment.
///
/// Records are owned by the [`ExperimentStore`](super::ExperimentStore); every
/// other component only holds the experiment id and reads snapshots (clones).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Experiment {
    id: String,
    name: String,
    description: String,
    target_audience: String,
    variants: Vec<Variant>,
    metrics: Vec<String>,
    #[serde(rename = "duration")]
    duration_days: u32,
    traffic_allocation: f64,
    confidence_level: ConfidenceLevel,
    status: ExperimentStatus,
    statistical_significance: f64,
    winner: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    start_date: Option<DateTime<Utc>>,
    end_date: Option<DateTime<Utc>>,
}

impl Experiment {
    /// Assemble a fresh `draft` record. Callers validate first.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn draft(
        id: String,
        name: String,
        description: String,
        target_audience: String,
        variants: Vec<Variant>,
        metrics: Vec<String>,
        duration_days: u32,
        traffic_allocation: f64,
        confidence_level: ConfidenceLevel,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            name,
            description,
            target_audience,
            variants,
            metrics,
            duration_days,
            traffic_allocation,
            confidence_level,
            status: ExperimentStatus::Draft,
            statistical_significance: 0.0,
            winner: None,
            created_at: now,
            updated_at: now,
            start_date: None,
            end_date: None,
        }
    }

    /// Get the experiment ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get the experiment name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the description.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Get the free-text target audience.
    #[must_use]
    pub fn target_audience(&self) -> &str {
        &self.target_audience
    }

    /// Variants in insertion order.
    #[must_use]
    pub fn variants(&self) -> &[Variant] {
        &self.variants
    }

    /// The control variant.
    #[must_use]
    pub fn control(&self) -> Option<&Variant> {
        self.variants.iter().find(|v| v.is_control())
    }

    /// Look up a variant by name.
    #[must_use]
    pub fn variant_named(&self, name: &str) -> Option<&Variant> {
        self.variants.iter().find(|v| v.name() == name)
    }

    /// Tracked metric names.
    #[must_use]
    pub fn metrics(&self) -> &[String] {
        &self.metrics
    }

    /// Configured duration in days.
    #[must_use]
    pub const fn duration_days(&self) -> u32 {
        self.duration_days
    }

    /// Share of traffic (percent, 0-100) entering the experiment.
    #[must_use]
    pub const fn traffic_allocation(&self) -> f64 {
        self.traffic_allocation
    }

    /// Confidence level required to declare a winner.
    #[must_use]
    pub const fn confidence_level(&self) -> ConfidenceLevel {
        self.confidence_level
    }

    /// Current lifecycle status.
    #[must_use]
    pub const fn status(&self) -> ExperimentStatus {
        self.status
    }

    /// Last computed significance (percent, one of 0/80/90/95/99).
    #[must_use]
    pub const fn statistical_significance(&self) -> f64 {
        self.statistical_significance
    }

    /// Name of the winning variant, if one was declared.
    #[must_use]
    pub fn winner(&self) -> Option<&str> {
        self.winner.as_deref()
    }

    /// Creation timestamp.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Timestamp of the last write.
    #[must_use]
    pub const fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// First transition into `running`, if any.
    #[must_use]
    pub const fn start_date(&self) -> Option<DateTime<Utc>> {
        self.start_date
    }

    /// Transition into a terminal status, if any.
    #[must_use]
    pub const fn end_date(&self) -> Option<DateTime<Utc>> {
        self.end_date
    }

    /// Visitors summed over all variants.
    #[must_use]
    pub fn total_visitors(&self) -> u64 {
        self.variants.iter().map(Variant::visitors).sum()
    }

    /// Time spent since the first start, measured at `now`.
    #[must_use]
    pub fn elapsed_running(&self, now: DateTime<Utc>) -> Option<TimeDelta> {
        self.start_date.map(|start| now - start)
    }

    /// Check the record-level invariants: non-empty name and description,
    /// at least two uniquely named variants with exactly one control, a
    /// duration of at least one day, at least one metric, and a traffic
    /// allocation within 0-100.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` naming the first violated invariant.
    pub fn check_invariants(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Validation("name is required".to_string()));
        }
        if self.description.trim().is_empty() {
            return Err(Error::Validation("description is required".to_string()));
        }
        super::new_experiment::check_variants(&self.variants)?;
        if self.duration_days == 0 {
            return Err(Error::Validation(
                "duration must be at least 1 day".to_string(),
            ));
        }
        if self.metrics.is_empty() {
            return Err(Error::Validation(
                "at least 1 metric is required".to_string(),
            ));
        }
        super::new_experiment::check_allocation(self.traffic_allocation)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Crate-internal mutations (always performed through the store)
    // ------------------------------------------------------------------

    /// Bump `updated_at`, strictly increasing even when the clock has not moved.
    pub(crate) fn touch(&mut self) {
        let now = Utc::now();
        self.updated_at = if now > self.updated_at {
            now
        } else {
            self.updated_at + TimeDelta::microseconds(1)
        };
    }

    pub(crate) fn set_name(&mut self, name: String) {
        self.name = name;
    }

    pub(crate) fn set_description(&mut self, description: String) {
        self.description = description;
    }

    pub(crate) fn set_target_audience(&mut self, target_audience: String) {
        self.target_audience = target_audience;
    }

    pub(crate) fn set_variants(&mut self, variants: Vec<Variant>) {
        self.variants = variants;
    }

    pub(crate) fn set_metrics(&mut self, metrics: Vec<String>) {
        self.metrics = metrics;
    }

    pub(crate) fn set_duration_days(&mut self, days: u32) {
        self.duration_days = days;
    }

    pub(crate) fn set_traffic_allocation(&mut self, allocation: f64) {
        self.traffic_allocation = allocation;
    }

    pub(crate) fn set_confidence_level(&mut self, level: ConfidenceLevel) {
        self.confidence_level = level;
    }

    pub(crate) fn set_status(&mut self, status: ExperimentStatus) {
        self.status = status;
    }

    pub(crate) fn variants_mut(&mut self) -> &mut [Variant] {
        &mut self.variants
    }

    /// Enter `running`; `start_date` is only set on the first start.
    pub(crate) fn mark_running(&mut self, now: DateTime<Utc>) {
        self.status = ExperimentStatus::Running;
        self.start_date.get_or_insert(now);
    }

    /// Record the outcome of a statistical analysis.
    pub(crate) fn record_analysis(&mut self, significance: f64, winner: Option<String>) {
        self.statistical_significance = significance;
        self.winner = winner;
    }

    /// Enter a terminal status.
    pub(crate) fn mark_finished(&mut self, status: ExperimentStatus, now: DateTime<Utc>) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.end_date = Some(now);
    }
}
