//! Typed partial updates

use serde::{Deserialize, Serialize};

use super::{ConfidenceLevel, Experiment, ExperimentStatus, NewVariant};
use crate::{Error, Result};

/// Partial update of an experiment.
///
/// Enumerates exactly the fields collaborators may change. Unknown fields are
/// rejected at deserialization (`deny_unknown_fields`), so arbitrary JSON is
/// never merged into a record. System-owned fields (id, timestamps,
/// significance, winner) are not patchable.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExperimentPatch {
    /// New name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// New description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// New target audience.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_audience: Option<String>,
    /// Replacement variant list (same invariants as creation).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variants: Option<Vec<NewVariant>>,
    /// Replacement metric list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Vec<String>>,
    /// New duration in days.
    #[serde(default, rename = "duration", skip_serializing_if = "Option::is_none")]
    pub duration_days: Option<u32>,
    /// New traffic allocation percentage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traffic_allocation: Option<f64>,
    /// New confidence level.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_level: Option<ConfidenceLevel>,
    /// Requested status (routed through the lifecycle by the manager).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ExperimentStatus>,
}

impl ExperimentPatch {
    /// Empty patch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the description.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set the target audience.
    #[must_use]
    pub fn target_audience(mut self, audience: impl Into<String>) -> Self {
        self.target_audience = Some(audience.into());
        self
    }

    /// Replace the variants.
    #[must_use]
    pub fn variants(mut self, variants: Vec<NewVariant>) -> Self {
        self.variants = Some(variants);
        self
    }

    /// Replace the metrics.
    #[must_use]
    pub fn metrics<I, S>(mut self, metrics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.metrics = Some(metrics.into_iter().map(Into::into).collect());
        self
    }

    /// Set the duration in days.
    #[must_use]
    pub const fn duration_days(mut self, days: u32) -> Self {
        self.duration_days = Some(days);
        self
    }

    /// Set the traffic allocation.
    #[must_use]
    pub const fn traffic_allocation(mut self, percent: f64) -> Self {
        self.traffic_allocation = Some(percent);
        self
    }

    /// Set the confidence level.
    #[must_use]
    pub const fn confidence_level(mut self, level: ConfidenceLevel) -> Self {
        self.confidence_level = Some(level);
        self
    }

    /// Request a status change.
    #[must_use]
    pub const fn status(mut self, status: ExperimentStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// True when no field is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Split off the requested status, leaving only descriptive fields.
    #[must_use]
    pub fn take_status(&mut self) -> Option<ExperimentStatus> {
        self.status.take()
    }

    /// Merge the descriptive fields into `target`. All-or-nothing: on error
    /// `target` is untouched.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` if a status is still set (take it with
    /// [`ExperimentPatch::take_status`] first) or the merged record breaks an
    /// invariant.
    pub(crate) fn apply_to(self, target: &mut Experiment) -> Result<()> {
        if let Some(status) = self.status {
            return Err(Error::Validation(format!(
                "status '{status}' cannot be patched directly; use the lifecycle operations"
            )));
        }
        let mut merged = target.clone();

        if let Some(name) = self.name {
            merged.set_name(name);
        }
        if let Some(description) = self.description {
            merged.set_description(description);
        }
        if let Some(audience) = self.target_audience {
            merged.set_target_audience(audience);
        }
        if let Some(variants) = self.variants {
            let variants = variants
                .into_iter()
                .enumerate()
                .map(|(position, input)| input.into_variant(position))
                .collect::<Result<Vec<_>>>()?;
            merged.set_variants(variants);
        }
        if let Some(metrics) = self.metrics {
            merged.set_metrics(super::new_experiment::dedup_metrics(metrics));
        }
        if let Some(days) = self.duration_days {
            merged.set_duration_days(days);
        }
        if let Some(allocation) = self.traffic_allocation {
            merged.set_traffic_allocation(allocation);
        }
        if let Some(level) = self.confidence_level {
            merged.set_confidence_level(level);
        }

        merged.check_invariants()?;
        *target = merged;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_fields_are_rejected() {
        let result: std::result::Result<ExperimentPatch, _> =
            serde_json::from_value(serde_json::json!({"name": "x", "winner": "b"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_wire_shape() {
        let patch: ExperimentPatch = serde_json::from_value(serde_json::json!({
            "name": "renamed",
            "duration": 7,
            "confidenceLevel": 90
        }))
        .unwrap();
        assert_eq!(patch.name.as_deref(), Some("renamed"));
        assert_eq!(patch.duration_days, Some(7));
        assert_eq!(patch.confidence_level, Some(ConfidenceLevel::P90));
    }

    #[test]
    fn test_take_status() {
        let mut patch = ExperimentPatch::new().name("x").status(ExperimentStatus::Paused);
        assert_eq!(patch.take_status(), Some(ExperimentStatus::Paused));
        assert!(patch.status.is_none());
        assert!(!patch.is_empty());
        assert!(ExperimentPatch::new().is_empty());
    }
}
