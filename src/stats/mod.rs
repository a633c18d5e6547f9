//! Significance testing for split tests
//!
//! **Method**: two-proportion z-test with an unpooled standard error
//!
//! ```text
//! p₁ = x₁/n₁   p₂ = x₂/n₂
//! se = √(p₁(1−p₁)/n₁ + p₂(1−p₂)/n₂)
//! z  = |p₂ − p₁| / se
//! ```
//!
//! `z` is mapped to the largest satisfied confidence bucket
//! (80% → 1.282, 90% → 1.645, 95% → 1.96, 99% → 2.576). Samples below
//! [`MIN_SAMPLE_SIZE`] visitors are not tested; that is reported as
//! significance 0, never as an error.
//!
//! Toyota Way Principles:
//! - **Jidoka**: insufficient data stops the verdict instead of guessing
//!
//! Everything here is a pure function of the counters.

mod analysis;

pub use analysis::{analyze, AnalysisResult, ContinueReason, VariantAnalysis, Verdict};

use crate::experiment::{ConfidenceLevel, Variant};

/// Visitors each side needs before a pair is tested.
pub const MIN_SAMPLE_SIZE: u64 = 30;

/// Experiments with fewer total visitors are flagged as low-sample.
pub const LOW_SAMPLE_TOTAL: u64 = 1000;

/// z statistic of `treatment` against `control`.
///
/// Returns `None` when either side has fewer than [`MIN_SAMPLE_SIZE`]
/// visitors or the standard error is zero (both rates 0 or 1).
///
/// # Examples
///
/// ```rust
/// use splitlab::experiment::Variant;
/// use splitlab::stats::z_score;
///
/// let control = Variant::with_counts("a", "control", true, 1000, 100)?;
/// let treatment = Variant::with_counts("b", "treatment", false, 1000, 130)?;
///
/// let z = z_score(&control, &treatment).unwrap();
/// assert!(z > 1.96 && z < 2.576);
/// # Ok::<(), splitlab::Error>(())
/// ```
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn z_score(control: &Variant, treatment: &Variant) -> Option<f64> {
    if control.visitors() < MIN_SAMPLE_SIZE || treatment.visitors() < MIN_SAMPLE_SIZE {
        return None;
    }

    let p1 = control.conversion_rate();
    let p2 = treatment.conversion_rate();
    let n1 = control.visitors() as f64;
    let n2 = treatment.visitors() as f64;

    let se = (p1 * (1.0 - p1) / n1 + p2 * (1.0 - p2) / n2).sqrt();
    if se <= 0.0 || !se.is_finite() {
        return None;
    }

    Some((p2 - p1).abs() / se)
}

/// Largest confidence bucket whose critical value `z` reaches.
#[must_use]
pub fn confidence_for_z(z: f64) -> Option<ConfidenceLevel> {
    ConfidenceLevel::ALL
        .iter()
        .rev()
        .copied()
        .find(|level| z >= level.z_critical())
}

/// Significance (percent: 0, 80, 90, 95 or 99) of `treatment` vs `control`.
#[must_use]
pub fn significance(control: &Variant, treatment: &Variant) -> f64 {
    z_score(control, treatment)
        .and_then(confidence_for_z)
        .map_or(0.0, ConfidenceLevel::as_significance)
}

/// Relative improvement in percent, `(p₂ − p₁) / p₁ × 100`; 0 when `p₁` is 0.
#[must_use]
pub fn relative_improvement(control_rate: f64, treatment_rate: f64) -> f64 {
    if control_rate <= 0.0 {
        0.0
    } else {
        (treatment_rate - control_rate) / control_rate * 100.0
    }
}
