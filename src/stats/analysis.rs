//! Experiment-level analysis: per-variant breakdown, winner and recommendations

use serde::{Deserialize, Serialize};

use super::{relative_improvement, z_score, LOW_SAMPLE_TOTAL, MIN_SAMPLE_SIZE};
use crate::experiment::{ConfidenceLevel, Experiment, Variant};

/// Comparison of one treatment variant against the control.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VariantAnalysis {
    /// Variant id
    pub variant_id: String,
    /// Variant name
    pub variant_name: String,
    /// Visitors of the variant
    pub visitors: u64,
    /// Conversions of the variant
    pub conversions: u64,
    /// Conversion rate of the variant
    pub conversion_rate: f64,
    /// Absolute rate difference to the control (`p₂ − p₁`)
    pub improvement: f64,
    /// Relative improvement over the control in percent
    pub relative_improvement: f64,
    /// z statistic, `None` when the pair could not be tested
    pub z_score: Option<f64>,
    /// Significance in percent (0, 80, 90, 95, 99)
    pub significance: f64,
    /// Both sides reached the minimum sample size
    pub sufficient_sample: bool,
}

/// Why an analysis does not (yet) recommend shipping a variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContinueReason {
    /// The experiment has no control variant.
    NoControl,
    /// The experiment has no treatment variant.
    NoTreatments,
    /// No pair reached the minimum sample size.
    InsufficientSample,
    /// No improving variant reached the configured confidence level.
    NotSignificant,
    /// A winner exists but total traffic is below the low-sample threshold.
    LowSampleSize,
}

/// Overall verdict of an analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Verdict {
    /// Keep the experiment running.
    ContinueTesting {
        /// Why no winner can be shipped yet
        reason: ContinueReason,
    },
    /// A variant significantly outperforms the control.
    #[serde(rename_all = "camelCase")]
    DeclareWinner {
        /// Winning variant name
        variant: String,
        /// Its relative improvement over the control in percent
        relative_improvement: f64,
    },
}

/// Full result of analyzing an experiment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    /// Analyzed experiment
    pub experiment_id: String,
    /// Highest per-variant significance in percent
    pub significance: f64,
    /// Name of the winning variant, if any
    pub winner: Option<String>,
    /// Confidence level the winner had to reach
    pub confidence_level: ConfidenceLevel,
    /// Visitors over all variants (control included)
    pub total_visitors: u64,
    /// One row per treatment variant, in variant order
    pub variants: Vec<VariantAnalysis>,
    /// Overall verdict
    pub verdict: Verdict,
    /// Human-readable recommendations
    pub recommendations: Vec<String>,
}

impl AnalysisResult {
    /// The analysis reached the experiment's configured confidence level.
    #[must_use]
    pub fn reached_confidence(&self) -> bool {
        self.significance >= self.confidence_level.as_significance()
    }
}

/// Analyze every treatment variant of `experiment` against its control.
///
/// The winner is the variant with the largest positive relative improvement
/// among those whose significance reaches the experiment's confidence level.
///
/// # Examples
///
/// ```rust
/// use splitlab::experiment::{ExperimentStore, NewExperiment, NewVariant};
/// use splitlab::stats::{analyze, Verdict};
///
/// let store = ExperimentStore::new();
/// let experiment = store.create(
///     NewExperiment::builder("Pricing page", "Annual toggle")
///         .variant(NewVariant::control("monthly").counts(2000, 200))
///         .variant(NewVariant::treatment("annual").counts(2000, 300))
///         .metric("subscribe")
///         .build(),
/// )?;
///
/// let analysis = analyze(&experiment);
/// assert_eq!(analysis.winner.as_deref(), Some("annual"));
/// assert!(matches!(analysis.verdict, Verdict::DeclareWinner { .. }));
/// # Ok::<(), splitlab::Error>(())
/// ```
#[must_use]
pub fn analyze(experiment: &Experiment) -> AnalysisResult {
    let level = experiment.confidence_level();
    let total_visitors = experiment.total_visitors();

    let Some(control) = experiment.control() else {
        return finish(experiment, Vec::new(), None, ContinueReason::NoControl);
    };

    let rows: Vec<VariantAnalysis> = experiment
        .variants()
        .iter()
        .filter(|v| !v.is_control())
        .map(|treatment| compare(control, treatment))
        .collect();

    if rows.is_empty() {
        return finish(experiment, rows, None, ContinueReason::NoTreatments);
    }

    let threshold = level.as_significance();
    let winner = rows
        .iter()
        .filter(|row| row.significance >= threshold && row.relative_improvement > 0.0)
        .fold(None::<&VariantAnalysis>, |best, row| match best {
            Some(best) if best.relative_improvement >= row.relative_improvement => Some(best),
            _ => Some(row),
        })
        .cloned();

    let reason = if winner.is_some() {
        ContinueReason::LowSampleSize
    } else if rows.iter().all(|row| !row.sufficient_sample) {
        ContinueReason::InsufficientSample
    } else {
        ContinueReason::NotSignificant
    };

    if total_visitors < LOW_SAMPLE_TOTAL || winner.is_none() {
        return finish(experiment, rows, winner, reason);
    }

    let mut result = finish(experiment, rows, winner.clone(), reason);
    if let Some(best) = winner {
        result.verdict = Verdict::DeclareWinner {
            variant: best.variant_name.clone(),
            relative_improvement: best.relative_improvement,
        };
        result.recommendations = vec![
            format!(
                "\"{}\" shows {:.1}% improvement",
                best.variant_name, best.relative_improvement
            ),
            "Ready to implement the winning variant".to_string(),
        ];
    }
    result
}

fn compare(control: &Variant, treatment: &Variant) -> VariantAnalysis {
    let z = z_score(control, treatment);
    let significance = z
        .and_then(super::confidence_for_z)
        .map_or(0.0, ConfidenceLevel::as_significance);

    VariantAnalysis {
        variant_id: treatment.id().to_string(),
        variant_name: treatment.name().to_string(),
        visitors: treatment.visitors(),
        conversions: treatment.conversions(),
        conversion_rate: treatment.conversion_rate(),
        improvement: treatment.conversion_rate() - control.conversion_rate(),
        relative_improvement: relative_improvement(
            control.conversion_rate(),
            treatment.conversion_rate(),
        ),
        z_score: z,
        significance,
        sufficient_sample: control.visitors() >= MIN_SAMPLE_SIZE
            && treatment.visitors() >= MIN_SAMPLE_SIZE,
    }
}

/// Assemble a "keep testing" result.
fn finish(
    experiment: &Experiment,
    rows: Vec<VariantAnalysis>,
    winner: Option<VariantAnalysis>,
    reason: ContinueReason,
) -> AnalysisResult {
    let total_visitors = experiment.total_visitors();
    let significance = rows.iter().map(|row| row.significance).fold(0.0, f64::max);

    let mut recommendations = match reason {
        ContinueReason::NoControl => vec!["No control variant found".to_string()],
        ContinueReason::NoTreatments => {
            vec!["Continue running the experiment to collect more data".to_string()]
        }
        ContinueReason::InsufficientSample => vec![
            format!("Each variant needs at least {MIN_SAMPLE_SIZE} visitors before it can be compared"),
            "Continue running the experiment to collect more data".to_string(),
        ],
        ContinueReason::NotSignificant => vec![
            "No statistically significant results yet".to_string(),
            "Consider increasing sample size or extending test duration".to_string(),
        ],
        ContinueReason::LowSampleSize => winner
            .iter()
            .map(|best| {
                format!(
                    "\"{}\" leads with {:.1}% improvement, continue running to confirm",
                    best.variant_name, best.relative_improvement
                )
            })
            .collect(),
    };

    if total_visitors < LOW_SAMPLE_TOTAL {
        recommendations.push("Low sample size - results may not be reliable".to_string());
    }

    AnalysisResult {
        experiment_id: experiment.id().to_string(),
        significance,
        winner: winner.map(|best| best.variant_name),
        confidence_level: experiment.confidence_level(),
        total_visitors,
        variants: rows,
        verdict: Verdict::ContinueTesting { reason },
        recommendations,
    }
}
