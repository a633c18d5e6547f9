//! Experiment data model and store
//!
//! ## Schema Overview
//!
//! ```text
//! Experiment (1) ──< Variant (N, ≥ 2, exactly one control)
//!      │
//!      ├── metrics (≥ 1 name)
//!      └── status: draft → running ⇄ paused → completed | stopped
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use splitlab::experiment::{ExperimentStore, ExperimentPatch, NewExperiment, NewVariant};
//!
//! let store = ExperimentStore::new();
//!
//! let experiment = store.create(
//!     NewExperiment::builder("Checkout button", "Green vs. blue")
//!         .variant(NewVariant::control("blue"))
//!         .variant(NewVariant::treatment("green"))
//!         .metric("purchase")
//!         .build(),
//! )?;
//!
//! let renamed = store.update(experiment.id(), ExperimentPatch::new().name("Checkout CTA"))?;
//! assert_eq!(renamed.name(), "Checkout CTA");
//! # Ok::<(), splitlab::Error>(())
//! ```

mod experiment_record;
mod new_experiment;
mod patch;
mod store;
mod variant_record;

pub use experiment_record::{ConfidenceLevel, Experiment, ExperimentStatus};
pub use new_experiment::{NewExperiment, NewExperimentBuilder, NewVariant};
pub use patch::ExperimentPatch;
pub use store::ExperimentStore;
pub use variant_record::Variant;
