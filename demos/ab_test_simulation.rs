//! A/B Test Simulation Example
//!
//! Creates a three-arm checkout experiment, runs the traffic simulation on a
//! fast tick, follows it through a live feed and prints the final analysis.
//!
//! Run with: cargo run --example ab_test_simulation

use splitlab::config::{EngineConfig, TrafficConfig};
use splitlab::telemetry::{init_tracing, DEFAULT_DIRECTIVE};
use splitlab::{ExperimentManager, LiveEvent, NewExperiment, NewVariant};

#[tokio::main]
async fn main() -> splitlab::Result<()> {
    init_tracing(DEFAULT_DIRECTIVE)?;

    println!("=== Splitlab A/B Test Simulation ===\n");

    let config = EngineConfig {
        tick_interval_ms: 100,
        traffic: TrafficConfig {
            min_visitors_per_tick: 200,
            max_visitors_per_tick: 400,
            seed: Some(2024),
            ..TrafficConfig::default()
        },
        ..EngineConfig::default()
    };
    let manager = ExperimentManager::builder().config(config).build()?;

    // -------------------------------------------------------------------------
    // 1. Create the experiment
    // -------------------------------------------------------------------------
    println!("1. Creating experiment...");

    let experiment = manager.create(
        NewExperiment::builder("Checkout button", "Button color on the checkout page")
            .variant(NewVariant::control("blue"))
            .variant(NewVariant::treatment("green"))
            .variant(NewVariant::treatment("orange"))
            .metric("purchase")
            .target_audience("returning customers")
            .build(),
    )?;
    let id = experiment.id().to_string();

    println!("   ID: {id}");
    println!("   Status: {}", experiment.status());
    println!("   Variants: {}", experiment.variants().len());

    // -------------------------------------------------------------------------
    // 2. Follow it live while the simulation runs
    // -------------------------------------------------------------------------
    println!("\n2. Running simulation...");

    let mut feed = manager.live_feed(&id)?;
    manager.start(&id)?;

    let mut updates = 0;
    while updates < 20 {
        match feed.next_event().await {
            Some(LiveEvent::Experiment { experiment }) => {
                updates += 1;
                println!(
                    "   [{:>2}] {:<9} visitors={}",
                    updates,
                    experiment.status().as_str(),
                    experiment.total_visitors()
                );
            }
            Some(LiveEvent::KeepAlive) => println!("   (keep-alive)"),
            None => break,
        }
    }
    feed.close();

    // -------------------------------------------------------------------------
    // 3. Stop and analyze
    // -------------------------------------------------------------------------
    println!("\n3. Stopping experiment...");

    let finished = manager.stop(&id)?;
    println!("   Status: {}", finished.status());
    println!("   Ended: {:?}", finished.end_date());

    let analysis = manager.analyze(&id)?;

    println!("\n4. Analysis ({}% confidence):", analysis.confidence_level.percent());
    for row in &analysis.variants {
        println!(
            "   {:<7} {:>6} visitors {:>5} conversions  rate {:>6.2}%  lift {:>+7.2}%  significance {:>4}%",
            row.variant_name,
            row.visitors,
            row.conversions,
            row.conversion_rate * 100.0,
            row.relative_improvement,
            row.significance
        );
    }
    println!("   Winner: {}", analysis.winner.as_deref().unwrap_or("none"));
    println!("   Verdict: {:?}", analysis.verdict);

    println!("\n5. Recommendations:");
    for recommendation in &analysis.recommendations {
        println!("   - {recommendation}");
    }

    println!("\n=== Simulation complete ===");
    Ok(())
}
