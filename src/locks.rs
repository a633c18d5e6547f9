//! Per-experiment write serialization
//!
//! Every mutation of an experiment (manual update, simulation tick,
//! start/pause/stop, analyze) and the listener delivery that follows it run
//! inside [`IdLocks::with`] for that experiment id. One writer at a time per
//! id, so a tick can never overwrite a concurrent manual edit and listeners
//! always see a self-consistent snapshot. Reads bypass the locks and go
//! straight to the store.

use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;

/// Table of per-id mutexes, created lazily.
#[derive(Debug, Default)]
pub struct IdLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl IdLocks {
    /// Create an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `critical` while holding the lock for `id`.
    ///
    /// The lock is not reentrant: `critical` (and any listener it notifies)
    /// must not call back into an operation that locks the same id.
    pub fn with<R>(&self, id: &str, critical: impl FnOnce() -> R) -> R {
        let lock = self.handle(id);
        // Records are replaced whole, a poisoned lock guards no partial state.
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        critical()
    }

    /// Drop the lock entry of a deleted experiment.
    pub fn forget(&self, id: &str) {
        self.locks.remove(id);
    }

    /// Number of ids with a lock entry.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// True when no id has a lock entry.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    fn handle(&self, id: &str) -> Arc<Mutex<()>> {
        if let Some(existing) = self.locks.get(id) {
            return Arc::clone(existing.value());
        }
        Arc::clone(
            self.locks
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_with_returns_value() {
        let locks = IdLocks::new();
        assert_eq!(locks.with("a", || 41 + 1), 42);
        assert_eq!(locks.len(), 1);

        locks.forget("a");
        assert!(locks.is_empty());
    }

    #[test]
    fn test_same_id_is_serialized() {
        let locks = Arc::new(IdLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let inside = Arc::clone(&inside);
                let overlaps = Arc::clone(&overlaps);
                thread::spawn(move || {
                    for _ in 0..100 {
                        locks.with("exp", || {
                            if inside.fetch_add(1, Ordering::SeqCst) > 0 {
                                overlaps.fetch_add(1, Ordering::SeqCst);
                            }
                            inside.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }
}
