//! Experiment Manager - the engine facade
//!
//! Wires the store, listener hub, per-id locks and simulation scheduler
//! together and exposes the operations the transport layer calls. Every
//! mutation of an experiment runs under its [`IdLocks`] entry and notifies
//! the hub before the lock is released.
//!
//! ```rust
//! use splitlab::{ExperimentManager, ExperimentStatus, NewExperiment, NewVariant};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let manager = ExperimentManager::builder().build().unwrap();
//! let experiment = manager
//!     .create(
//!         NewExperiment::builder("Checkout button", "Green vs blue")
//!             .variant(NewVariant::control("blue"))
//!             .variant(NewVariant::treatment("green"))
//!             .metric("purchase")
//!             .build(),
//!     )
//!     .unwrap();
//!
//! manager.start(experiment.id()).unwrap();
//! manager.simulate_tick(experiment.id()).unwrap();
//! let done = manager.stop(experiment.id()).unwrap();
//! assert_eq!(done.status(), ExperimentStatus::Completed);
//! # }
//! ```

use std::fmt;
use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use tokio::runtime::Handle;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::experiment::{
    Experiment, ExperimentPatch, ExperimentStatus, ExperimentStore, NewExperiment,
};
use crate::hub::{ListenerHub, SubscriptionHandle};
use crate::live::LiveFeed;
use crate::locks::IdLocks;
use crate::scheduler::{SimulationScheduler, StopReason};
use crate::stats::{self, AnalysisResult};
use crate::{Error, Result};

/// Builder for [`ExperimentManager`].
#[derive(Debug, Default)]
pub struct ExperimentManagerBuilder {
    config: EngineConfig,
    runtime: Option<Handle>,
}

impl ExperimentManagerBuilder {
    /// Replace the engine configuration.
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Runtime that runs simulation ticks. Defaults to the current one.
    #[must_use]
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Build the engine.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for an invalid configuration or
    /// `Error::RuntimeUnavailable` when no runtime was given and none is
    /// current.
    pub fn build(self) -> Result<ExperimentManager> {
        self.config.validate()?;
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|_| Error::RuntimeUnavailable)?,
        };

        let store = Arc::new(ExperimentStore::new());
        let hub = Arc::new(ListenerHub::new());
        let locks = Arc::new(IdLocks::new());
        let scheduler = SimulationScheduler::new(
            Arc::clone(&store),
            Arc::clone(&hub),
            Arc::clone(&locks),
            &self.config,
            runtime.clone(),
        );

        info!(
            tick_interval_ms = self.config.tick_interval_ms,
            complete_on_significance = self.config.complete_on_significance,
            "experiment engine ready"
        );
        Ok(ExperimentManager {
            store,
            hub,
            locks,
            scheduler,
            config: self.config,
            runtime,
        })
    }
}

/// A/B-testing engine: experiment lifecycle, simulation, analysis and live
/// updates.
///
/// Instances are independent; each owns its own store, hub and tasks.
pub struct ExperimentManager {
    store: Arc<ExperimentStore>,
    hub: Arc<ListenerHub>,
    locks: Arc<IdLocks>,
    scheduler: SimulationScheduler,
    config: EngineConfig,
    runtime: Handle,
}

impl fmt::Debug for ExperimentManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExperimentManager")
            .field("experiments", &self.store.len())
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

impl ExperimentManager {
    /// Start building an engine.
    #[must_use]
    pub fn builder() -> ExperimentManagerBuilder {
        ExperimentManagerBuilder::default()
    }

    /// Configuration in use.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Underlying scheduler.
    #[must_use]
    pub const fn scheduler(&self) -> &SimulationScheduler {
        &self.scheduler
    }

    /// Validate and store a new `draft` experiment.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation`; nothing is stored in that case.
    pub fn create(&self, input: NewExperiment) -> Result<Experiment> {
        let experiment = self.store.create(input)?;
        info!(
            experiment_id = experiment.id(),
            name = experiment.name(),
            variants = experiment.variants().len(),
            "experiment created"
        );
        Ok(experiment)
    }

    /// Snapshot of one experiment.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for an unknown id.
    pub fn get(&self, id: &str) -> Result<Experiment> {
        self.store.get(id)
    }

    /// All experiments in creation order.
    #[must_use]
    pub fn list(&self) -> Vec<Experiment> {
        self.store.list()
    }

    /// Apply a partial update.
    ///
    /// Field changes are validated against the merged record. A `status` in
    /// the patch is routed through the lifecycle: `running` starts or
    /// resumes, `paused` pauses, `completed` stops and `stopped` aborts.
    /// The transition is checked before any field is written.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound`, `Error::Validation`, or
    /// `Error::InvalidState` for a status change the lifecycle rejects.
    pub fn update(&self, id: &str, mut patch: ExperimentPatch) -> Result<Experiment> {
        self.locks.with(id, || {
            let target = patch.take_status();
            let current = self.store.get(id)?;
            let transition = match target {
                Some(status) if status != current.status() => {
                    check_transition(&current, status)?;
                    Some(status)
                }
                _ => None,
            };

            let mut snapshot = current;
            if !patch.is_empty() || transition.is_none() {
                snapshot = self.store.update(id, patch)?;
                self.hub.notify(id, &snapshot);
            }
            if let Some(status) = transition {
                snapshot = self.transition_locked(id, status)?;
            }
            Ok(snapshot)
        })
    }

    /// Remove an experiment, cancelling its simulation and dropping its
    /// listeners. Returns the prior record.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for an unknown id.
    pub fn delete(&self, id: &str) -> Result<Experiment> {
        let removed: Result<Experiment> = self.locks.with(id, || {
            let removed = self.store.delete(id)?;
            self.scheduler.cancel(id);
            let listeners = self.hub.clear(id);
            info!(experiment_id = id, listeners, "experiment deleted");
            Ok(removed)
        });
        self.locks.forget(id);
        removed
    }

    /// Start or resume an experiment.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound`, or `Error::InvalidState` unless the
    /// experiment is `draft` or `paused`.
    pub fn start(&self, id: &str) -> Result<Experiment> {
        self.scheduler.start(id)
    }

    /// Pause a running experiment.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound`, or `Error::InvalidState` unless the
    /// experiment is `running`.
    pub fn pause(&self, id: &str) -> Result<Experiment> {
        self.scheduler.pause(id)
    }

    /// Stop a running experiment with a final analysis; ends in `completed`.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound`, or `Error::InvalidState` unless the
    /// experiment is `running`.
    pub fn stop(&self, id: &str) -> Result<Experiment> {
        self.scheduler
            .stop(id, StopReason::Concluded)
            .map(|(experiment, _)| experiment)
    }

    /// Abort a running experiment with a final analysis; ends in `stopped`.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound`, or `Error::InvalidState` unless the
    /// experiment is `running`.
    pub fn abort(&self, id: &str) -> Result<Experiment> {
        self.scheduler
            .stop(id, StopReason::Aborted)
            .map(|(experiment, _)| experiment)
    }

    /// Analyze every treatment against the control, persist the best
    /// significance and winner, and notify listeners.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for an unknown id.
    pub fn analyze(&self, id: &str) -> Result<AnalysisResult> {
        self.locks.with(id, || {
            let current = self.store.get(id)?;
            let analysis = stats::analyze(&current);
            let updated = self.store.modify(id, |experiment| {
                experiment.record_analysis(analysis.significance, analysis.winner.clone());
            })?;
            self.hub.notify(id, &updated);

            info!(
                experiment_id = id,
                significance = analysis.significance,
                winner = ?analysis.winner,
                "experiment analyzed"
            );
            Ok(analysis)
        })
    }

    /// Register a listener for every snapshot of `id`.
    ///
    /// The callback runs synchronously under the experiment's lock and must
    /// not call back into this manager for the same id.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for an unknown id.
    pub fn subscribe<F>(&self, id: &str, callback: F) -> Result<SubscriptionHandle>
    where
        F: Fn(&Experiment) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.locks.with(id, || {
            if !self.store.contains(id) {
                return Err(Error::NotFound(id.to_string()));
            }
            Ok(self.hub.add_listener(id, callback))
        })
    }

    /// Remove a listener. Idempotent. Once this returns the listener
    /// receives no further snapshots.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        self.hub.remove_listener(handle);
    }

    /// Number of listeners currently registered for `id`.
    #[must_use]
    pub fn listener_count(&self, id: &str) -> usize {
        self.hub.listener_count(id)
    }

    /// Run one simulation step for a running experiment right now.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound`, or `Error::InvalidState` unless the
    /// experiment is `running`.
    pub fn simulate_tick(&self, id: &str) -> Result<Experiment> {
        self.scheduler.tick_now(id).map(|outcome| outcome.into_experiment())
    }

    /// Delete terminal experiments whose end date is older than the
    /// retention window. Returns the removed ids.
    pub fn purge_expired(&self) -> Vec<String> {
        let Some(cutoff) = TimeDelta::from_std(self.config.retention())
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
        else {
            return Vec::new();
        };

        let mut purged = Vec::new();
        for id in self.store.finished_before(cutoff) {
            match self.delete(&id) {
                Ok(_) => purged.push(id),
                Err(err) => warn!(experiment_id = id.as_str(), error = %err, "purge skipped"),
            }
        }
        if !purged.is_empty() {
            info!(count = purged.len(), "expired experiments purged");
        }
        purged
    }

    /// Open a live feed: the current snapshot first, then every update,
    /// interleaved with keep-alives.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for an unknown id.
    pub fn live_feed(&self, id: &str) -> Result<LiveFeed> {
        let _runtime = self.runtime.enter();
        self.locks.with(id, || {
            let current = self.store.get(id)?;
            Ok(LiveFeed::open(
                Arc::clone(&self.hub),
                current,
                self.config.live_buffer,
                self.config.keep_alive_interval(),
            ))
        })
    }

    fn transition_locked(&self, id: &str, status: ExperimentStatus) -> Result<Experiment> {
        match status {
            ExperimentStatus::Running => self.scheduler.start_locked(id),
            ExperimentStatus::Paused => self.scheduler.pause_locked(id),
            ExperimentStatus::Completed => self
                .scheduler
                .stop_locked(id, StopReason::Concluded)
                .map(|(experiment, _)| experiment),
            ExperimentStatus::Stopped => self
                .scheduler
                .stop_locked(id, StopReason::Aborted)
                .map(|(experiment, _)| experiment),
            ExperimentStatus::Draft => Err(Error::InvalidState {
                id: id.to_string(),
                status: self.store.get(id)?.status().to_string(),
                operation: "reset to draft",
                allowed: "none",
            }),
        }
    }
}

/// Reject a status change the lifecycle does not allow, before anything is
/// written.
fn check_transition(current: &Experiment, target: ExperimentStatus) -> Result<()> {
    let status = current.status();
    let running = status == ExperimentStatus::Running;
    let (operation, allowed, ok) = match target {
        ExperimentStatus::Running => ("start", "draft, paused", status.can_start()),
        ExperimentStatus::Paused => ("pause", "running", running),
        ExperimentStatus::Completed => ("stop", "running", running),
        ExperimentStatus::Stopped => ("abort", "running", running),
        ExperimentStatus::Draft => ("reset to draft", "none", false),
    };
    if ok {
        Ok(())
    } else {
        Err(Error::InvalidState {
            id: current.id().to_string(),
            status: current.status().to_string(),
            operation,
            allowed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::NewVariant;

    fn input() -> NewExperiment {
        NewExperiment::builder("Manager", "fixture")
            .variant(NewVariant::control("a"))
            .variant(NewVariant::treatment("b"))
            .metric("m")
            .build()
    }

    #[test]
    fn test_build_without_runtime_fails() {
        let result = ExperimentManager::builder().build();
        assert!(matches!(result, Err(Error::RuntimeUnavailable)));
    }

    #[test]
    fn test_build_with_explicit_runtime() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let manager = ExperimentManager::builder()
            .runtime(runtime.handle().clone())
            .build()
            .unwrap();
        assert!(manager.list().is_empty());
    }

    #[tokio::test]
    async fn test_build_rejects_bad_config() {
        let config = EngineConfig {
            tick_interval_ms: 0,
            ..EngineConfig::default()
        };
        let result = ExperimentManager::builder().config(config).build();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_status_patch_goes_through_lifecycle() {
        let manager = ExperimentManager::builder().build().unwrap();
        let id = manager.create(input()).unwrap().id().to_string();

        let running = manager
            .update(&id, ExperimentPatch::new().status(ExperimentStatus::Running))
            .unwrap();
        assert_eq!(running.status(), ExperimentStatus::Running);
        assert!(manager.scheduler().is_scheduled(&id));

        let err = manager
            .update(
                &id,
                ExperimentPatch::new()
                    .name("renamed")
                    .status(ExperimentStatus::Draft),
            )
            .unwrap_err();
        assert!(err.is_invalid_state());
        assert_eq!(manager.get(&id).unwrap().name(), "Manager");

        let completed = manager
            .update(&id, ExperimentPatch::new().status(ExperimentStatus::Completed))
            .unwrap();
        assert_eq!(completed.status(), ExperimentStatus::Completed);
        assert!(!manager.scheduler().is_scheduled(&id));
    }

    #[tokio::test]
    async fn test_analyze_persists_result() {
        let manager = ExperimentManager::builder().build().unwrap();
        let id = manager
            .create(
                NewExperiment::builder("Persist", "fixture")
                    .variant(NewVariant::control("a").counts(2000, 200))
                    .variant(NewVariant::treatment("b").counts(2000, 300))
                    .metric("m")
                    .build(),
            )
            .unwrap()
            .id()
            .to_string();

        let analysis = manager.analyze(&id).unwrap();
        let stored = manager.get(&id).unwrap();
        assert_eq!(stored.winner(), analysis.winner.as_deref());
        assert!((stored.statistical_significance() - analysis.significance).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_subscribe_unknown_id() {
        let manager = ExperimentManager::builder().build().unwrap();
        let err = manager.subscribe("nope", |_| Ok(())).unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_purge_with_unbounded_retention_keeps_everything() {
        let config = EngineConfig {
            day_length_ms: u64::MAX,
            retention_days: u32::MAX,
            ..EngineConfig::default()
        };
        let manager = ExperimentManager::builder().config(config).build().unwrap();
        let id = manager.create(input()).unwrap().id().to_string();
        manager.start(&id).unwrap();
        manager.stop(&id).unwrap();

        assert!(manager.purge_expired().is_empty());
        assert!(manager.get(&id).is_ok());
    }

    #[tokio::test]
    async fn test_delete_cascades() {
        let manager = ExperimentManager::builder().build().unwrap();
        let id = manager.create(input()).unwrap().id().to_string();
        manager.subscribe(&id, |_| Ok(())).unwrap();
        manager.start(&id).unwrap();

        manager.delete(&id).unwrap();
        assert_eq!(manager.listener_count(&id), 0);
        assert!(!manager.scheduler().is_scheduled(&id));
        assert!(manager.get(&id).unwrap_err().is_not_found());
    }
}
