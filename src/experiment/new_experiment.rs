//! Creation input for experiments (Poka-Yoke: validated before anything is stored)

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::{ConfidenceLevel, Experiment, Variant};
use crate::{Error, Result};

const DEFAULT_DURATION_DAYS: u32 = 14;
const DEFAULT_TRAFFIC_ALLOCATION: f64 = 100.0;

/// Creation input for one variant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewVariant {
    /// Optional caller-chosen id; `variant-<n>` (1-based position) otherwise.
    #[serde(default)]
    pub id: Option<String>,
    /// Display name, unique within the experiment.
    pub name: String,
    /// Baseline flag; exactly one variant must set it.
    #[serde(default)]
    pub is_control: bool,
    /// Initial visitor count (normally 0).
    #[serde(default)]
    pub visitors: u64,
    /// Initial conversion count (normally 0).
    #[serde(default)]
    pub conversions: u64,
    /// Share of experiment traffic in percent, even split when absent.
    #[serde(default)]
    pub traffic_percentage: Option<f64>,
}

impl NewVariant {
    /// The control arm.
    #[must_use]
    pub fn control(name: impl Into<String>) -> Self {
        Self::new(name, true)
    }

    /// A treatment arm.
    #[must_use]
    pub fn treatment(name: impl Into<String>) -> Self {
        Self::new(name, false)
    }

    fn new(name: impl Into<String>, is_control: bool) -> Self {
        Self {
            id: None,
            name: name.into(),
            is_control,
            visitors: 0,
            conversions: 0,
            traffic_percentage: None,
        }
    }

    /// Set initial counters.
    #[must_use]
    pub const fn counts(mut self, visitors: u64, conversions: u64) -> Self {
        self.visitors = visitors;
        self.conversions = conversions;
        self
    }

    /// Set an explicit id.
    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the traffic share in percent.
    #[must_use]
    pub const fn traffic_percentage(mut self, percentage: f64) -> Self {
        self.traffic_percentage = Some(percentage);
        self
    }

    /// Materialize into a [`Variant`] at the given position.
    pub(crate) fn into_variant(self, position: usize) -> Result<Variant> {
        let id = self
            .id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("variant-{}", position + 1));
        let variant = Variant::with_counts(
            id,
            self.name,
            self.is_control,
            self.visitors,
            self.conversions,
        )?;
        Ok(variant.with_traffic_percentage(self.traffic_percentage))
    }
}

/// Creation input for an experiment.
///
/// Deserializes from the camelCase wire shape; omitted optional fields take
/// the defaults (`duration` 14 days, `trafficAllocation` 100, `confidenceLevel` 95).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewExperiment {
    /// Experiment name (required).
    #[serde(default)]
    pub name: String,
    /// Description (required).
    #[serde(default)]
    pub description: String,
    /// Free-text audience description.
    #[serde(default)]
    pub target_audience: String,
    /// At least two variants, exactly one control.
    #[serde(default)]
    pub variants: Vec<NewVariant>,
    /// At least one metric name.
    #[serde(default)]
    pub metrics: Vec<String>,
    /// Duration in days.
    #[serde(default = "default_duration", rename = "duration")]
    pub duration_days: u32,
    /// Percent of traffic entering the experiment (0-100).
    #[serde(default = "default_allocation")]
    pub traffic_allocation: f64,
    /// Confidence required to declare a winner.
    #[serde(default)]
    pub confidence_level: ConfidenceLevel,
}

const fn default_duration() -> u32 {
    DEFAULT_DURATION_DAYS
}

const fn default_allocation() -> f64 {
    DEFAULT_TRAFFIC_ALLOCATION
}

impl NewExperiment {
    /// Start building an experiment with the two required descriptive fields.
    #[must_use]
    pub fn builder(name: impl Into<String>, description: impl Into<String>) -> NewExperimentBuilder {
        NewExperimentBuilder::new(name, description)
    }

    /// Check the input without storing anything.
    ///
    /// # Errors
    ///
    /// Same conditions as [`NewExperiment::into_experiment`].
    pub fn validate(&self) -> Result<()> {
        self.clone().into_experiment(String::from("validation")).map(|_| ())
    }

    /// Validate and materialize a `draft` record with the given id.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` when the name or description is missing,
    /// fewer than two variants are given, the control count is not exactly
    /// one, variant names/ids repeat, no metric is given, or counters or
    /// allocation are out of range.
    pub fn into_experiment(self, id: String) -> Result<Experiment> {
        let variants = self
            .variants
            .into_iter()
            .enumerate()
            .map(|(position, input)| input.into_variant(position))
            .collect::<Result<Vec<_>>>()?;

        let experiment = Experiment::draft(
            id,
            self.name,
            self.description,
            self.target_audience,
            variants,
            dedup_metrics(self.metrics),
            self.duration_days,
            self.traffic_allocation,
            self.confidence_level,
        );
        experiment.check_invariants()?;
        Ok(experiment)
    }
}

/// Builder for `NewExperiment`.
#[derive(Debug)]
pub struct NewExperimentBuilder {
    input: NewExperiment,
}

impl NewExperimentBuilder {
    /// Create a new builder with required fields.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            input: NewExperiment {
                name: name.into(),
                description: description.into(),
                target_audience: String::new(),
                variants: Vec::new(),
                metrics: Vec::new(),
                duration_days: DEFAULT_DURATION_DAYS,
                traffic_allocation: DEFAULT_TRAFFIC_ALLOCATION,
                confidence_level: ConfidenceLevel::default(),
            },
        }
    }

    /// Append a variant.
    #[must_use]
    pub fn variant(mut self, variant: NewVariant) -> Self {
        self.input.variants.push(variant);
        self
    }

    /// Append a tracked metric.
    #[must_use]
    pub fn metric(mut self, metric: impl Into<String>) -> Self {
        self.input.metrics.push(metric.into());
        self
    }

    /// Set the target audience.
    #[must_use]
    pub fn target_audience(mut self, audience: impl Into<String>) -> Self {
        self.input.target_audience = audience.into();
        self
    }

    /// Set the duration in days.
    #[must_use]
    pub const fn duration_days(mut self, days: u32) -> Self {
        self.input.duration_days = days;
        self
    }

    /// Set the traffic allocation percentage.
    #[must_use]
    pub const fn traffic_allocation(mut self, percent: f64) -> Self {
        self.input.traffic_allocation = percent;
        self
    }

    /// Set the confidence level.
    #[must_use]
    pub const fn confidence_level(mut self, level: ConfidenceLevel) -> Self {
        self.input.confidence_level = level;
        self
    }

    /// Build the `NewExperiment` (validation happens on create).
    #[must_use]
    pub fn build(self) -> NewExperiment {
        self.input
    }
}

pub(crate) fn dedup_metrics(metrics: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    metrics
        .into_iter()
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty() && seen.insert(m.clone()))
        .collect()
}

/// Slack for shares like 33.3 + 33.3 + 33.4 that miss 100 by float error.
const SHARE_TOLERANCE: f64 = 1e-9;

/// Variant-list invariants shared by creation and patches.
pub(crate) fn check_variants(variants: &[Variant]) -> Result<()> {
    if variants.len() < 2 {
        return Err(Error::Validation(
            "at least 2 variants are required".to_string(),
        ));
    }

    let controls = variants.iter().filter(|v| v.is_control()).count();
    if controls != 1 {
        return Err(Error::Validation(format!(
            "exactly one control variant is required (got {controls})"
        )));
    }

    let mut names = HashSet::new();
    let mut ids = HashSet::new();
    for variant in variants {
        if variant.name().trim().is_empty() {
            return Err(Error::Validation("variant name is required".to_string()));
        }
        if !names.insert(variant.name()) {
            return Err(Error::Validation(format!(
                "duplicate variant name '{}'",
                variant.name()
            )));
        }
        if !ids.insert(variant.id()) {
            return Err(Error::Validation(format!(
                "duplicate variant id '{}'",
                variant.id()
            )));
        }
        if let Some(share) = variant.traffic_percentage() {
            if !(0.0..=100.0).contains(&share) {
                return Err(Error::Validation(format!(
                    "variant '{}' traffic percentage must be within 0-100 (got {share})",
                    variant.name()
                )));
            }
        }
    }

    let assigned: f64 = variants.iter().filter_map(Variant::traffic_percentage).sum();
    if assigned > 100.0 + SHARE_TOLERANCE {
        return Err(Error::Validation(format!(
            "variant traffic percentages add up to {assigned}, more than 100"
        )));
    }
    Ok(())
}

pub(crate) fn check_allocation(allocation: f64) -> Result<()> {
    if (0.0..=100.0).contains(&allocation) {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "traffic allocation must be within 0-100 (got {allocation})"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> NewExperimentBuilder {
        NewExperiment::builder("Headline test", "Short vs long headline")
            .variant(NewVariant::control("short"))
            .variant(NewVariant::treatment("long"))
            .metric("signup")
    }

    #[test]
    fn test_builder_defaults() {
        let input = valid().build();
        assert_eq!(input.duration_days, 14);
        assert!((input.traffic_allocation - 100.0).abs() < f64::EPSILON);
        assert_eq!(input.confidence_level, ConfidenceLevel::P95);
    }

    #[test]
    fn test_generated_variant_ids() {
        let exp = valid().build().into_experiment("exp-1".into()).unwrap();
        let ids: Vec<&str> = exp.variants().iter().map(Variant::id).collect();
        assert_eq!(ids, vec!["variant-1", "variant-2"]);
    }

    #[test]
    fn test_rejects_two_controls() {
        let input = NewExperiment::builder("n", "d")
            .variant(NewVariant::control("a"))
            .variant(NewVariant::control("b"))
            .metric("m")
            .build();
        let err = input.into_experiment("x".into()).unwrap_err();
        assert!(err.to_string().contains("exactly one control"));
    }

    #[test]
    fn test_validate_rejects_zero_duration() {
        assert!(valid().build().validate().is_ok());
        let err = valid().duration_days(0).build().validate().unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_rejects_duplicate_names() {
        let input = NewExperiment::builder("n", "d")
            .variant(NewVariant::control("a"))
            .variant(NewVariant::treatment("a"))
            .metric("m")
            .build();
        assert!(input.into_experiment("x".into()).is_err());
    }

    #[test]
    fn test_metrics_are_deduplicated() {
        let exp = valid()
            .metric("signup")
            .metric(" ")
            .metric("revenue")
            .build()
            .into_experiment("x".into())
            .unwrap();
        assert_eq!(exp.metrics(), ["signup".to_string(), "revenue".to_string()]);
    }

    #[test]
    fn test_deserialize_wire_defaults() {
        let input: NewExperiment = serde_json::from_value(serde_json::json!({
            "name": "n",
            "description": "d",
            "variants": [
                {"name": "a", "isControl": true},
                {"name": "b", "visitors": 10, "conversions": 2}
            ],
            "metrics": ["clicks"]
        }))
        .unwrap();
        assert_eq!(input.duration_days, 14);
        assert_eq!(input.variants[1].visitors, 10);
        assert!(input.into_experiment("x".into()).is_ok());
    }

    #[test]
    fn test_traffic_shares_must_fit_in_100() {
        let over = NewExperiment::builder("Split", "shares")
            .variant(NewVariant::control("a").traffic_percentage(100.0))
            .variant(NewVariant::treatment("b").traffic_percentage(100.0))
            .metric("m")
            .build();
        assert!(over.validate().unwrap_err().is_validation());

        let thirds = NewExperiment::builder("Split", "shares")
            .variant(NewVariant::control("a").traffic_percentage(33.3))
            .variant(NewVariant::treatment("b").traffic_percentage(33.3))
            .variant(NewVariant::treatment("c").traffic_percentage(33.4))
            .metric("m")
            .build();
        assert!(thirds.validate().is_ok());
    }
}
