//! Simulation Scheduler - periodic traffic for running experiments
//!
//! Each running experiment owns one tokio task that wakes up every tick
//! interval, adds simulated traffic and notifies listeners. The task table is
//! keyed by experiment id, so an experiment has at most one task.
//!
//! ## Lifecycle
//!
//! ```text
//! draft ──start──▶ running ──pause──▶ paused ──start──▶ running
//!                     │
//!                     ├──stop / duration elapsed / significance──▶ completed
//!                     └──abort──────────────────────────────────▶ stopped
//! ```
//!
//! Every transition and every tick runs under the experiment's
//! [`IdLocks`] entry, so a stop that returns has already cancelled the task
//! and no later tick can touch the record.
//!
//! ## Toyota Way: Jidoka
//!
//! A tick whose write fails is logged and skipped; the task keeps running.
//! A tick that finds its experiment gone or no longer running ends the task.

mod traffic;

pub use traffic::{TrafficSimulator, VariantDraw, TREATMENT_RATE_RANGE};

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::experiment::{Experiment, ExperimentStatus, ExperimentStore};
use crate::hub::ListenerHub;
use crate::locks::IdLocks;
use crate::stats::{self, AnalysisResult, Verdict};
use crate::{Error, Result};

/// Why a running experiment was finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Stopped on request after a normal run
    Concluded,
    /// The configured duration has elapsed
    DurationElapsed,
    /// The configured confidence level was reached
    SignificanceReached,
    /// Cancelled on request; the result is not meant to be shipped
    Aborted,
}

impl StopReason {
    /// Status the experiment ends in.
    #[must_use]
    pub const fn final_status(self) -> ExperimentStatus {
        match self {
            Self::Aborted => ExperimentStatus::Stopped,
            Self::Concluded | Self::DurationElapsed | Self::SignificanceReached => {
                ExperimentStatus::Completed
            }
        }
    }

    /// Label used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Concluded => "concluded",
            Self::DurationElapsed => "duration_elapsed",
            Self::SignificanceReached => "significance_reached",
            Self::Aborted => "aborted",
        }
    }
}

/// Result of one tick.
#[derive(Debug, Clone)]
pub enum TickOutcome {
    /// Traffic was added; the experiment keeps running
    Advanced(Experiment),
    /// The experiment was finished by this tick
    Finished(Experiment),
}

impl TickOutcome {
    /// Snapshot after the tick.
    #[must_use]
    pub fn into_experiment(self) -> Experiment {
        match self {
            Self::Advanced(experiment) | Self::Finished(experiment) => experiment,
        }
    }
}

struct ScheduledTask {
    generation: u64,
    handle: JoinHandle<()>,
}

/// State shared between the scheduler and its tick tasks.
#[derive(Clone)]
struct TickContext {
    store: Arc<ExperimentStore>,
    hub: Arc<ListenerHub>,
    locks: Arc<IdLocks>,
    traffic: Arc<TrafficSimulator>,
    tasks: Arc<DashMap<String, ScheduledTask>>,
    generation: Arc<AtomicU64>,
    day_length: Duration,
    complete_on_significance: bool,
}

impl TickContext {
    async fn run(self, id: String, generation: u64, period: Duration) {
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match self.locks.with(&id, || self.tick_locked(&id)) {
                Ok(TickOutcome::Advanced(_)) => {}
                Ok(TickOutcome::Finished(_)) => break,
                Err(err) if err.is_not_found() || err.is_invalid_state() => {
                    debug!(experiment_id = id.as_str(), "simulation task ended");
                    break;
                }
                Err(err) => {
                    warn!(experiment_id = id.as_str(), error = %err, "simulation tick skipped");
                }
            }
        }

        self.tasks
            .remove_if(&id, |_, task| task.generation == generation);
    }

    fn tick_locked(&self, id: &str) -> Result<TickOutcome> {
        let current = self.store.get(id)?;
        if current.status() != ExperimentStatus::Running {
            return Err(invalid_state(&current, "tick", "running"));
        }

        if self.duration_elapsed(&current) {
            let (finished, _) = self.finish_locked(id, &current, StopReason::DurationElapsed)?;
            return Ok(TickOutcome::Finished(finished));
        }

        let draws = self.traffic.draw(&current);
        let updated = self.store.try_modify(id, |experiment| {
            for (variant, draw) in experiment.variants_mut().iter_mut().zip(&draws) {
                variant.record_traffic(draw.visitors, draw.conversions)?;
            }
            Ok(())
        })?;
        self.hub.notify(id, &updated);
        debug!(
            experiment_id = id,
            total_visitors = updated.total_visitors(),
            "simulation tick"
        );

        if self.complete_on_significance {
            let analysis = stats::analyze(&updated);
            if matches!(analysis.verdict, Verdict::DeclareWinner { .. }) {
                let (finished, _) =
                    self.finish_locked(id, &updated, StopReason::SignificanceReached)?;
                return Ok(TickOutcome::Finished(finished));
            }
        }

        Ok(TickOutcome::Advanced(updated))
    }

    fn duration_elapsed(&self, experiment: &Experiment) -> bool {
        let limit = self.day_length.saturating_mul(experiment.duration_days());
        experiment
            .elapsed_running(Utc::now())
            .and_then(|elapsed| elapsed.to_std().ok())
            .is_some_and(|elapsed| elapsed >= limit)
    }

    fn stop_locked(&self, id: &str, reason: StopReason) -> Result<(Experiment, AnalysisResult)> {
        let current = self.store.get(id)?;
        if current.status() != ExperimentStatus::Running {
            let operation = if reason == StopReason::Aborted { "abort" } else { "stop" };
            return Err(invalid_state(&current, operation, "running"));
        }
        self.finish_locked(id, &current, reason)
    }

    fn finish_locked(
        &self,
        id: &str,
        current: &Experiment,
        reason: StopReason,
    ) -> Result<(Experiment, AnalysisResult)> {
        self.cancel(id);

        let analysis = stats::analyze(current);
        let now = Utc::now();
        let finished = self.store.modify(id, |experiment| {
            experiment.record_analysis(analysis.significance, analysis.winner.clone());
            experiment.mark_finished(reason.final_status(), now);
        })?;
        self.hub.notify(id, &finished);

        info!(
            experiment_id = id,
            reason = reason.as_str(),
            status = finished.status().as_str(),
            winner = ?finished.winner(),
            significance = finished.statistical_significance(),
            "experiment finished"
        );
        Ok((finished, analysis))
    }

    fn cancel(&self, id: &str) -> bool {
        self.tasks.remove(id).is_some_and(|(_, task)| {
            task.handle.abort();
            true
        })
    }
}

fn invalid_state(experiment: &Experiment, operation: &'static str, allowed: &'static str) -> Error {
    Error::InvalidState {
        id: experiment.id().to_string(),
        status: experiment.status().to_string(),
        operation,
        allowed,
    }
}

/// Owns the per-experiment simulation tasks.
///
/// Tasks are spawned on the runtime captured at construction. Dropping the
/// scheduler aborts every task.
pub struct SimulationScheduler {
    ctx: TickContext,
    runtime: Handle,
    tick_interval: Duration,
}

impl fmt::Debug for SimulationScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulationScheduler")
            .field("active", &self.ctx.tasks.len())
            .field("tick_interval", &self.tick_interval)
            .finish_non_exhaustive()
    }
}

impl SimulationScheduler {
    /// Create a scheduler over shared engine state.
    #[must_use]
    pub fn new(
        store: Arc<ExperimentStore>,
        hub: Arc<ListenerHub>,
        locks: Arc<IdLocks>,
        config: &EngineConfig,
        runtime: Handle,
    ) -> Self {
        Self {
            ctx: TickContext {
                store,
                hub,
                locks,
                traffic: Arc::new(TrafficSimulator::new(config.traffic.clone())),
                tasks: Arc::new(DashMap::new()),
                generation: Arc::new(AtomicU64::new(0)),
                day_length: config.day_length(),
                complete_on_significance: config.complete_on_significance,
            },
            runtime,
            tick_interval: config.tick_interval(),
        }
    }

    /// Start (or resume) an experiment and schedule its ticks.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for an unknown id or `Error::InvalidState`
    /// unless the experiment is `draft` or `paused`.
    pub fn start(&self, id: &str) -> Result<Experiment> {
        self.ctx.locks.with(id, || self.start_locked(id))
    }

    /// Pause a running experiment. Counters are kept.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for an unknown id or `Error::InvalidState`
    /// unless the experiment is `running`.
    pub fn pause(&self, id: &str) -> Result<Experiment> {
        self.ctx.locks.with(id, || self.pause_locked(id))
    }

    /// Finish a running experiment: cancel its task, run a final analysis
    /// and move it to the status `reason` implies.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for an unknown id or `Error::InvalidState`
    /// unless the experiment is `running`.
    pub fn stop(&self, id: &str, reason: StopReason) -> Result<(Experiment, AnalysisResult)> {
        self.ctx.locks.with(id, || self.stop_locked(id, reason))
    }

    /// Run one tick immediately, outside the timer.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for an unknown id or `Error::InvalidState`
    /// unless the experiment is `running`.
    pub fn tick_now(&self, id: &str) -> Result<TickOutcome> {
        self.ctx.locks.with(id, || self.ctx.tick_locked(id))
    }

    /// Abort the task of `id` without touching the record. Returns whether a
    /// task existed.
    pub fn cancel(&self, id: &str) -> bool {
        self.ctx.cancel(id)
    }

    /// Whether `id` currently has a simulation task.
    #[must_use]
    pub fn is_scheduled(&self, id: &str) -> bool {
        self.ctx.tasks.contains_key(id)
    }

    /// Number of scheduled experiments.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.ctx.tasks.len()
    }

    // The `*_locked` variants expect the caller to hold the id lock.

    pub(crate) fn start_locked(&self, id: &str) -> Result<Experiment> {
        let current = self.ctx.store.get(id)?;
        if !current.status().can_start() || self.is_scheduled(id) {
            return Err(invalid_state(&current, "start", "draft, paused"));
        }

        let now = Utc::now();
        let started = self.ctx.store.modify(id, |experiment| experiment.mark_running(now))?;
        self.spawn_ticks(id);
        self.ctx.hub.notify(id, &started);

        info!(
            experiment_id = id,
            tick_interval_ms = u64::try_from(self.tick_interval.as_millis()).unwrap_or(u64::MAX),
            "experiment started"
        );
        Ok(started)
    }

    pub(crate) fn pause_locked(&self, id: &str) -> Result<Experiment> {
        let current = self.ctx.store.get(id)?;
        if current.status() != ExperimentStatus::Running {
            return Err(invalid_state(&current, "pause", "running"));
        }

        self.ctx.cancel(id);
        let paused = self
            .ctx
            .store
            .modify(id, |experiment| experiment.set_status(ExperimentStatus::Paused))?;
        self.ctx.hub.notify(id, &paused);

        info!(experiment_id = id, "experiment paused");
        Ok(paused)
    }

    pub(crate) fn stop_locked(
        &self,
        id: &str,
        reason: StopReason,
    ) -> Result<(Experiment, AnalysisResult)> {
        self.ctx.stop_locked(id, reason)
    }

    fn spawn_ticks(&self, id: &str) {
        let generation = self.ctx.generation.fetch_add(1, Ordering::Relaxed);
        let ctx = self.ctx.clone();
        let handle = self
            .runtime
            .spawn(ctx.run(id.to_string(), generation, self.tick_interval));
        self.ctx
            .tasks
            .insert(id.to_string(), ScheduledTask { generation, handle });
    }
}

impl Drop for SimulationScheduler {
    fn drop(&mut self) {
        for task in self.ctx.tasks.iter() {
            task.handle.abort();
        }
        self.ctx.tasks.clear();
    }
}
