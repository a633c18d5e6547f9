//! # Splitlab: In-Process A/B-Testing Engine
//!
//! **Version**: 0.1.0
//!
//! Splitlab manages the lifecycle of split-test experiments, simulates
//! per-variant visitor and conversion traffic over time, decides winners with
//! a two-proportion z-test and streams every state change to live observers.
//!
//! ## Design Principles (Toyota Way Aligned)
//!
//! - **Poka-Yoke**: records are validated before they are stored; patches are
//!   typed and lifecycle transitions are checked
//! - **Jidoka**: insufficient samples stop the verdict; failing listeners and
//!   failed ticks are logged and isolated
//! - **Heijunka**: one writer per experiment id, reads are lock-free snapshots
//! - **Genchi Genbutsu**: every transition and tick is traced with `tracing`
//!
//! ## Example Usage
//!
//! ```rust
//! use splitlab::{ExperimentManager, NewExperiment, NewVariant};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> splitlab::Result<()> {
//! let engine = ExperimentManager::builder().build()?;
//!
//! let experiment = engine.create(
//!     NewExperiment::builder("Pricing page", "Annual plan toggle")
//!         .variant(NewVariant::control("monthly"))
//!         .variant(NewVariant::treatment("annual"))
//!         .metric("subscribe")
//!         .build(),
//! )?;
//!
//! let handle = engine.subscribe(experiment.id(), |snapshot| {
//!     println!("{} visitors", snapshot.total_visitors());
//!     Ok(())
//! })?;
//!
//! engine.start(experiment.id())?;
//! engine.simulate_tick(experiment.id())?;
//! let analysis = engine.analyze(experiment.id())?;
//! println!("recommendations: {:?}", analysis.recommendations);
//!
//! engine.unsubscribe(&handle);
//! engine.stop(experiment.id())?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod config;
pub mod error;
pub mod experiment;
pub mod hub;
pub mod live;
pub mod locks;
pub mod manager;
pub mod scheduler;
pub mod stats;
pub mod telemetry;

pub use config::{EngineConfig, TrafficConfig};
pub use error::{Error, Result};
pub use experiment::{
    ConfidenceLevel, Experiment, ExperimentPatch, ExperimentStatus, NewExperiment, NewVariant,
    Variant,
};
pub use hub::SubscriptionHandle;
pub use live::{LiveEvent, LiveFeed};
pub use manager::{ExperimentManager, ExperimentManagerBuilder};
pub use scheduler::StopReason;
pub use stats::AnalysisResult;
