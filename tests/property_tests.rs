//! Property-based tests for splitlab
//!
//! - Counter invariants survive any sequence of simulated ticks
//! - Significance is always one of the bucket values
//! - Creation accepts exactly the inputs with one control
//! - A tick never hands out more visitors than the allocation admits
//! - Run with ProptestConfig::with_cases(100)

use proptest::prelude::*;
use splitlab::config::TrafficConfig;
use splitlab::experiment::{ExperimentStore, Variant};
use splitlab::scheduler::TrafficSimulator;
use splitlab::stats;
use splitlab::{NewExperiment, NewVariant};

// ============================================================================
// Strategies
// ============================================================================

/// (visitors, conversions) with conversions <= visitors
fn arb_counts() -> impl Strategy<Value = (u64, u64)> {
    (0u64..20_000).prop_flat_map(|visitors| (Just(visitors), 0..=visitors))
}

fn arb_variant_flags() -> impl Strategy<Value = Vec<bool>> {
    proptest::collection::vec(any::<bool>(), 0..6)
}

fn experiment_with(flags: &[bool]) -> NewExperiment {
    let mut builder = NewExperiment::builder("prop", "generated").metric("m");
    for (i, is_control) in flags.iter().enumerate() {
        let variant = if *is_control {
            NewVariant::control(format!("v{i}"))
        } else {
            NewVariant::treatment(format!("v{i}"))
        };
        builder = builder.variant(variant);
    }
    builder.build()
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: significance is always a bucket value
    #[test]
    fn prop_significance_is_a_bucket(control in arb_counts(), treatment in arb_counts()) {
        let c = Variant::with_counts("c", "control", true, control.0, control.1).unwrap();
        let t = Variant::with_counts("t", "treatment", false, treatment.0, treatment.1).unwrap();
        let s = stats::significance(&c, &t);
        prop_assert!([0.0, 80.0, 90.0, 95.0, 99.0].contains(&s));
    }

    /// Property: small samples are never significant
    #[test]
    fn prop_small_samples_never_significant(
        control in (0u64..30).prop_flat_map(|n| (Just(n), 0..=n)),
        treatment in arb_counts(),
    ) {
        let c = Variant::with_counts("c", "control", true, control.0, control.1).unwrap();
        let t = Variant::with_counts("t", "treatment", false, treatment.0, treatment.1).unwrap();
        prop_assert!(stats::significance(&c, &t).abs() < f64::EPSILON);
    }

    /// Property: the winner, if any, improves on the control
    #[test]
    fn prop_winner_beats_control(control in arb_counts(), a in arb_counts(), b in arb_counts()) {
        let exp = ExperimentStore::new().create(
            NewExperiment::builder("w", "winner")
                .variant(NewVariant::control("c").counts(control.0, control.1))
                .variant(NewVariant::treatment("a").counts(a.0, a.1))
                .variant(NewVariant::treatment("b").counts(b.0, b.1))
                .metric("m")
                .build(),
        ).unwrap();

        let analysis = stats::analyze(&exp);
        if let Some(winner) = &analysis.winner {
            let row = analysis.variants.iter().find(|r| &r.variant_name == winner).unwrap();
            prop_assert!(row.relative_improvement > 0.0);
            prop_assert!(row.significance >= exp.confidence_level().as_significance());
        }
        prop_assert!(analysis.variants.iter().all(|r| r.significance <= analysis.significance));
    }

    /// Property: creation succeeds iff there are >= 2 variants and exactly one control
    #[test]
    fn prop_exactly_one_control(flags in arb_variant_flags()) {
        let store = ExperimentStore::new();
        let controls = flags.iter().filter(|f| **f).count();
        let result = store.create(experiment_with(&flags));

        if flags.len() >= 2 && controls == 1 {
            let exp = result.unwrap();
            prop_assert_eq!(exp.variants().iter().filter(|v| v.is_control()).count(), 1);
        } else {
            prop_assert!(result.unwrap_err().is_validation());
            prop_assert!(store.is_empty());
        }
    }

    /// Property: simulated traffic keeps conversions <= visitors
    #[test]
    fn prop_draws_preserve_counter_invariant(seed in any::<u64>(), allocation in 0.0f64..=100.0) {
        let sim = TrafficSimulator::new(TrafficConfig { seed: Some(seed), ..TrafficConfig::default() });
        let exp = ExperimentStore::new().create(
            NewExperiment::builder("t", "traffic")
                .variant(NewVariant::control("c"))
                .variant(NewVariant::treatment("a"))
                .variant(NewVariant::treatment("b"))
                .metric("m")
                .traffic_allocation(allocation)
                .build(),
        ).unwrap();

        for _ in 0..10 {
            for draw in sim.draw(&exp) {
                prop_assert!(draw.conversions <= draw.visitors);
                prop_assert!(draw.visitors <= 25);
            }
        }
    }

    /// Property: per-tick visitors never exceed arrivals scaled by the allocation
    #[test]
    fn prop_draw_total_within_allocation(
        seed in any::<u64>(),
        arrivals in 1u32..200,
        allocation in 0.0f64..=100.0,
        shares in proptest::collection::vec(proptest::option::of(0.0f64..=40.0), 2..6),
    ) {
        let sim = TrafficSimulator::new(TrafficConfig {
            min_visitors_per_tick: arrivals,
            max_visitors_per_tick: arrivals,
            seed: Some(seed),
            ..TrafficConfig::default()
        });
        let mut builder = NewExperiment::builder("t", "allocation")
            .metric("m")
            .traffic_allocation(allocation);
        for (i, share) in shares.iter().enumerate() {
            let variant = if i == 0 {
                NewVariant::control(format!("v{i}"))
            } else {
                NewVariant::treatment(format!("v{i}"))
            };
            builder = builder.variant(match share {
                Some(percent) => variant.traffic_percentage(*percent),
                None => variant,
            });
        }
        let assigned: f64 = shares.iter().flatten().sum();
        let result = ExperimentStore::new().create(builder.build());
        if assigned > 100.0 + 1e-9 {
            prop_assert!(result.unwrap_err().is_validation());
            return Ok(());
        }
        let exp = result.unwrap();

        let admitted = (f64::from(arrivals) * (allocation / 100.0)).floor() as u64;
        for _ in 0..5 {
            let total: u64 = sim.draw(&exp).iter().map(|d| d.visitors).sum();
            prop_assert!(total <= admitted, "{} visitors for {} admitted", total, admitted);
            if shares.iter().all(Option::is_none) {
                prop_assert_eq!(total, admitted);
            }
        }
    }
}
