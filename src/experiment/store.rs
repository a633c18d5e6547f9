//! Experiment Store - in-memory registry of experiment records
//!
//! This is the only owner of experiment state. Data is lost on process
//! restart. Every other component refers to experiments by id and works on
//! cloned snapshots.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use super::{Experiment, ExperimentPatch, NewExperiment};
use crate::{Error, Result};

#[derive(Debug)]
struct Slot {
    seq: u64,
    record: Experiment,
}

/// In-memory store for experiments.
///
/// ## Design
///
/// Records live in a `DashMap` keyed by id, so reads are cheap snapshots and
/// a write replaces a record atomically under its shard lock. A monotonic
/// sequence number assigned at insertion keeps `list()` in creation order.
///
/// The store never holds an inconsistent record: creation input and patches
/// are validated against the merged result before being written. Serializing
/// writers per id is the caller's job (see [`crate::locks::IdLocks`]).
#[derive(Debug, Default)]
pub struct ExperimentStore {
    records: DashMap<String, Slot>,
    next_seq: AtomicU64,
}

impl ExperimentStore {
    /// Create a new empty experiment store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Get the number of experiments in the store.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Validate `input`, assign an id and timestamps, and store it as `draft`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` if the input breaks an invariant; nothing
    /// is stored in that case.
    pub fn create(&self, input: NewExperiment) -> Result<Experiment> {
        let id = format!("exp_{}", Uuid::new_v4().simple());
        let record = input.into_experiment(id.clone())?;
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.records.insert(
            id,
            Slot {
                seq,
                record: record.clone(),
            },
        );
        Ok(record)
    }

    /// Get a snapshot of an experiment.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for an unknown id.
    pub fn get(&self, id: &str) -> Result<Experiment> {
        self.records
            .get(id)
            .map(|slot| slot.record.clone())
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Check whether an experiment exists.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    /// Snapshots of all experiments in creation order.
    #[must_use]
    pub fn list(&self) -> Vec<Experiment> {
        let mut slots: Vec<(u64, Experiment)> = self
            .records
            .iter()
            .map(|entry| (entry.seq, entry.record.clone()))
            .collect();

        slots.sort_by_key(|(seq, _)| *seq);

        slots.into_iter().map(|(_, record)| record).collect()
    }

    /// Merge a patch into an experiment and bump `updated_at`.
    ///
    /// Status is not patchable here; lifecycle changes go through
    /// `ExperimentManager::update` or the scheduler.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for an unknown id, or `Error::Validation` if
    /// the patch carries a status or the merged record would break an
    /// invariant (the record is unchanged).
    pub fn update(&self, id: &str, patch: ExperimentPatch) -> Result<Experiment> {
        let mut slot = self
            .records
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        patch.apply_to(&mut slot.record)?;
        slot.record.touch();
        Ok(slot.record.clone())
    }

    /// Apply a system-owned mutation (counters, lifecycle, analysis results)
    /// and bump `updated_at`.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for an unknown id.
    pub(crate) fn modify<F>(&self, id: &str, mutate: F) -> Result<Experiment>
    where
        F: FnOnce(&mut Experiment),
    {
        let mut slot = self
            .records
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        mutate(&mut slot.record);
        slot.record.touch();
        Ok(slot.record.clone())
    }

    /// Like [`ExperimentStore::modify`] for mutations that can fail. The
    /// mutation runs on a copy; on error the stored record is untouched.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for an unknown id, or the mutation's error.
    pub(crate) fn try_modify<F>(&self, id: &str, mutate: F) -> Result<Experiment>
    where
        F: FnOnce(&mut Experiment) -> Result<()>,
    {
        let mut slot = self
            .records
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        let mut next = slot.record.clone();
        mutate(&mut next)?;
        next.touch();
        slot.record = next;
        Ok(slot.record.clone())
    }

    /// Remove an experiment, returning the prior record.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for an unknown id.
    pub fn delete(&self, id: &str) -> Result<Experiment> {
        self.records
            .remove(id)
            .map(|(_, slot)| slot.record)
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Ids of terminal experiments that ended before `cutoff`, oldest first.
    #[must_use]
    pub fn finished_before(&self, cutoff: DateTime<Utc>) -> Vec<String> {
        let mut expired: Vec<(DateTime<Utc>, String)> = self
            .records
            .iter()
            .filter(|entry| entry.record.status().is_terminal())
            .filter_map(|entry| {
                entry
                    .record
                    .end_date()
                    .filter(|ended| *ended < cutoff)
                    .map(|ended| (ended, entry.key().clone()))
            })
            .collect();

        expired.sort();

        expired.into_iter().map(|(_, id)| id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::{ExperimentStatus, NewVariant};

    fn input(name: &str) -> NewExperiment {
        NewExperiment::builder(name, "description")
            .variant(NewVariant::control("control"))
            .variant(NewVariant::treatment("treatment"))
            .metric("conversion")
            .build()
    }

    #[test]
    fn test_store_default() {
        let store = ExperimentStore::new();
        assert!(store.is_empty());
        assert_eq!(store.len(), 0);
        assert!(store.list().is_empty());
    }

    #[test]
    fn test_create_and_get() {
        let store = ExperimentStore::new();
        let created = store.create(input("a")).unwrap();

        assert!(created.id().starts_with("exp_"));
        assert_eq!(created.status(), ExperimentStatus::Draft);
        assert_eq!(store.get(created.id()).unwrap(), created);
        assert!(store.contains(created.id()));
    }

    #[test]
    fn test_list_preserves_creation_order() {
        let store = ExperimentStore::new();
        for name in ["first", "second", "third", "fourth"] {
            store.create(input(name)).unwrap();
        }

        let names: Vec<String> = store.list().iter().map(|e| e.name().to_string()).collect();
        assert_eq!(names, vec!["first", "second", "third", "fourth"]);
    }

    #[test]
    fn test_invalid_input_is_not_stored() {
        let store = ExperimentStore::new();
        let bad = NewExperiment::builder("a", "b")
            .variant(NewVariant::control("only"))
            .metric("m")
            .build();

        assert!(store.create(bad).is_err());
        assert!(store.is_empty());
    }

    #[test]
    fn test_update_rejects_breaking_patch() {
        let store = ExperimentStore::new();
        let created = store.create(input("a")).unwrap();

        let patch = ExperimentPatch::new()
            .name("renamed")
            .variants(vec![NewVariant::treatment("x"), NewVariant::treatment("y")]);
        assert!(store.update(created.id(), patch).is_err());

        let unchanged = store.get(created.id()).unwrap();
        assert_eq!(unchanged.name(), "a");
        assert_eq!(unchanged.updated_at(), created.updated_at());
    }

    #[test]
    fn test_update_refuses_status_change() {
        let store = ExperimentStore::new();
        let created = store.create(input("a")).unwrap();

        for status in [
            ExperimentStatus::Running,
            ExperimentStatus::Completed,
            ExperimentStatus::Draft,
        ] {
            let patch = ExperimentPatch::new().name("renamed").status(status);
            assert!(store.update(created.id(), patch).unwrap_err().is_validation());
        }

        let unchanged = store.get(created.id()).unwrap();
        assert_eq!(unchanged, created);
        assert!(unchanged.start_date().is_none());
    }

    #[test]
    fn test_try_modify_is_all_or_nothing() {
        let store = ExperimentStore::new();
        let created = store.create(input("a")).unwrap();

        let err = store
            .try_modify(created.id(), |exp| {
                exp.record_analysis(99.0, Some("treatment".into()));
                Err(Error::Other("write failed".to_string()))
            })
            .unwrap_err();
        assert!(matches!(err, Error::Other(_)));
        assert_eq!(store.get(created.id()).unwrap(), created);
    }

    #[test]
    fn test_delete_unknown_is_not_found() {
        let store = ExperimentStore::new();
        assert!(store.delete("missing").unwrap_err().is_not_found());
    }

    #[test]
    fn test_modify_bumps_updated_at() {
        let store = ExperimentStore::new();
        let created = store.create(input("a")).unwrap();
        let modified = store
            .modify(created.id(), |exp| exp.record_analysis(95.0, Some("treatment".into())))
            .unwrap();

        assert!(modified.updated_at() > created.updated_at());
        assert_eq!(modified.winner(), Some("treatment"));
    }
}
