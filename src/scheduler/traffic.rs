//! Simulated visitor traffic
//!
//! Each tick draws one visitor count for the experiment, scales it by the
//! traffic allocation and splits it across variants. Every visitor converts
//! independently with its variant's rate for that tick, so conversions never
//! exceed visitors.
//!
//! Variant rates: the control converts at `baseline + U[0, control_jitter)`;
//! treatment `i` gets a deterministic lift `(sin(i) + 1) / 2 * max_lift` on
//! top of the baseline plus `U[0, treatment_jitter)`, clamped to
//! [`TREATMENT_RATE_RANGE`].

use std::fmt;
use std::sync::{Mutex, PoisonError};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::TrafficConfig;
use crate::experiment::{Experiment, Variant};

/// Bounds of a treatment arm's per-tick conversion rate.
pub const TREATMENT_RATE_RANGE: (f64, f64) = (0.01, 0.15);

/// Increments for one variant produced by one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VariantDraw {
    /// New visitors
    pub visitors: u64,
    /// New conversions, `<= visitors`
    pub conversions: u64,
}

/// Random traffic source shared by all scheduled experiments.
pub struct TrafficSimulator {
    config: TrafficConfig,
    rng: Mutex<StdRng>,
}

impl fmt::Debug for TrafficSimulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrafficSimulator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TrafficSimulator {
    /// Create a simulator; seeded from `config.seed` or from entropy.
    #[must_use]
    pub fn new(config: TrafficConfig) -> Self {
        let rng = config
            .seed
            .map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);
        Self {
            config,
            rng: Mutex::new(rng),
        }
    }

    /// Traffic model in use.
    #[must_use]
    pub const fn config(&self) -> &TrafficConfig {
        &self.config
    }

    /// Draw one tick of traffic, one entry per variant in variant order.
    #[must_use]
    pub fn draw(&self, experiment: &Experiment) -> Vec<VariantDraw> {
        let variants = experiment.variants();
        if variants.is_empty() {
            return Vec::new();
        }

        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        let lo = self.config.min_visitors_per_tick.min(self.config.max_visitors_per_tick);
        let hi = self.config.max_visitors_per_tick.max(lo);
        let arrivals = u64::from(rng.gen_range(lo..=hi));
        let admitted = allocated(arrivals, experiment.traffic_allocation());
        let visitors = split_visitors(variants, admitted);

        let mut treatment_index = 0_u32;
        variants
            .iter()
            .zip(visitors)
            .map(|(variant, visitors)| {
                let rate = if variant.is_control() {
                    self.control_rate(&mut *rng)
                } else {
                    treatment_index += 1;
                    self.treatment_rate(treatment_index, &mut *rng)
                };
                let conversions = (0..visitors).filter(|_| rng.gen_bool(rate)).count() as u64;
                VariantDraw {
                    visitors,
                    conversions,
                }
            })
            .collect()
    }

    fn control_rate(&self, rng: &mut impl Rng) -> f64 {
        let noise = jitter(rng, self.config.control_jitter);
        (self.config.baseline_conversion_rate + noise).clamp(0.0, 1.0)
    }

    fn treatment_rate(&self, index: u32, rng: &mut impl Rng) -> f64 {
        let noise = jitter(rng, self.config.treatment_jitter);
        let (lo, hi) = TREATMENT_RATE_RANGE;
        (self.config.baseline_conversion_rate + self.lift(index) + noise).clamp(lo, hi)
    }

    /// Deterministic lift of the `index`-th treatment (1-based).
    #[must_use]
    pub fn lift(&self, index: u32) -> f64 {
        (f64::from(index).sin() + 1.0) / 2.0 * self.config.max_treatment_lift
    }
}

fn jitter(rng: &mut impl Rng, width: f64) -> f64 {
    if width > 0.0 {
        rng.gen_range(0.0..width)
    } else {
        0.0
    }
}

/// Arrivals admitted by the traffic allocation, rounded down.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn allocated(arrivals: u64, allocation_percent: f64) -> u64 {
    let admitted = (arrivals as f64 * (allocation_percent / 100.0).clamp(0.0, 1.0)).floor();
    (admitted as u64).min(arrivals)
}

/// Split `allocated` visitors across variants.
///
/// A variant with a `traffic_percentage` gets that share; variants without
/// one split what is left of 100% evenly. Each variant gets the floor of its
/// quota and the leftover units go to the largest remainders, so the total
/// never exceeds `allocated`.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn split_visitors(variants: &[Variant], allocated: u64) -> Vec<u64> {
    let assigned: f64 = variants.iter().filter_map(Variant::traffic_percentage).sum();
    let unassigned = variants
        .iter()
        .filter(|v| v.traffic_percentage().is_none())
        .count();
    let even = if unassigned == 0 {
        0.0
    } else {
        (100.0 - assigned).max(0.0) / 100.0 / unassigned as f64
    };

    let pool = allocated as f64;
    let quotas: Vec<f64> = variants
        .iter()
        .map(|v| pool * v.traffic_percentage().map_or(even, |percent| percent / 100.0))
        .collect();
    let target = ((quotas.iter().sum::<f64>() + 1e-9).floor() as u64).min(allocated);

    let mut counts: Vec<u64> = quotas.iter().map(|q| q.floor().max(0.0) as u64).collect();
    let mut spare = target.saturating_sub(counts.iter().sum());

    let mut by_remainder: Vec<usize> = (0..quotas.len()).collect();
    by_remainder.sort_by(|&a, &b| {
        (quotas[b] - quotas[b].floor())
            .total_cmp(&(quotas[a] - quotas[a].floor()))
            .then(a.cmp(&b))
    });
    for index in by_remainder {
        if spare == 0 {
            break;
        }
        counts[index] += 1;
        spare -= 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::{ExperimentStore, NewExperiment, NewVariant};

    fn seeded(seed: u64) -> TrafficSimulator {
        TrafficSimulator::new(TrafficConfig {
            seed: Some(seed),
            ..TrafficConfig::default()
        })
    }

    fn experiment(allocation: f64) -> Experiment {
        ExperimentStore::new()
            .create(
                NewExperiment::builder("traffic", "fixture")
                    .variant(NewVariant::control("control"))
                    .variant(NewVariant::treatment("b"))
                    .variant(NewVariant::treatment("c"))
                    .metric("signup")
                    .traffic_allocation(allocation)
                    .build(),
            )
            .unwrap()
    }

    #[test]
    fn test_draw_has_one_entry_per_variant() {
        let draws = seeded(1).draw(&experiment(100.0));
        assert_eq!(draws.len(), 3);
        for draw in draws {
            assert!(draw.conversions <= draw.visitors);
            assert!(draw.visitors <= 25);
        }
    }

    #[test]
    fn test_same_seed_same_traffic() {
        let exp = experiment(100.0);
        let a: Vec<_> = (0..10).map(|_| seeded(42)).map(|s| s.draw(&exp)).collect();
        assert!(a.windows(2).all(|pair| pair[0] == pair[1]));
    }

    #[test]
    fn test_zero_allocation_draws_nothing() {
        let sim = seeded(3);
        let exp = experiment(0.0);
        for _ in 0..20 {
            assert!(sim.draw(&exp).iter().all(|d| d.visitors == 0 && d.conversions == 0));
        }
    }

    #[test]
    fn test_lift_is_bounded() {
        let sim = seeded(0);
        for index in 1..50 {
            let lift = sim.lift(index);
            assert!((0.0..=0.04).contains(&lift), "lift {lift} out of range");
        }
    }

    #[test]
    fn test_traffic_share_is_respected() {
        let exp = ExperimentStore::new()
            .create(
                NewExperiment::builder("split", "fixture")
                    .variant(NewVariant::control("a").traffic_percentage(100.0))
                    .variant(NewVariant::treatment("b").traffic_percentage(0.0))
                    .metric("m")
                    .build(),
            )
            .unwrap();
        let sim = seeded(9);
        for _ in 0..20 {
            let draws = sim.draw(&exp);
            assert!(draws[0].visitors >= 5);
            assert_eq!(draws[1].visitors, 0);
        }
    }

    #[test]
    fn test_even_split_never_exceeds_arrivals() {
        let sim = TrafficSimulator::new(TrafficConfig {
            min_visitors_per_tick: 5,
            max_visitors_per_tick: 5,
            seed: Some(4),
            ..TrafficConfig::default()
        });
        let exp = ExperimentStore::new()
            .create(
                NewExperiment::builder("odd", "fixture")
                    .variant(NewVariant::control("a"))
                    .variant(NewVariant::treatment("b"))
                    .metric("m")
                    .build(),
            )
            .unwrap();

        for _ in 0..20 {
            let draws = sim.draw(&exp);
            assert_eq!(draws.iter().map(|d| d.visitors).sum::<u64>(), 5);
            assert!(draws.iter().all(|d| d.visitors == 2 || d.visitors == 3));
        }
    }

    #[test]
    fn test_unassigned_variants_share_the_rest() {
        let variants = vec![
            Variant::new("a", "a", true).with_traffic_percentage(Some(50.0)),
            Variant::new("b", "b", false),
            Variant::new("c", "c", false),
        ];
        assert_eq!(split_visitors(&variants, 20), vec![10, 5, 5]);
        assert_eq!(split_visitors(&variants, 7).iter().sum::<u64>(), 7);
    }

    #[test]
    fn test_partial_shares_leave_traffic_unused() {
        let variants = vec![
            Variant::new("a", "a", true).with_traffic_percentage(Some(30.0)),
            Variant::new("b", "b", false).with_traffic_percentage(Some(30.0)),
        ];
        assert_eq!(split_visitors(&variants, 10), vec![3, 3]);
        assert_eq!(allocated(25, 50.0), 12);
    }
}
