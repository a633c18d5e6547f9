//! Listener Hub - per-experiment publish/subscribe
//!
//! Every state change of an experiment is delivered to all listeners
//! currently registered for that experiment id, synchronously and in
//! registration order.
//!
//! ## Guarantees
//!
//! - A listener that returns an error or panics is logged and skipped; the
//!   remaining listeners still receive the snapshot and the caller of
//!   [`ListenerHub::notify`] never sees the failure.
//! - Delivery for one experiment holds that experiment's listener list for
//!   the whole dispatch. [`ListenerHub::remove_listener`] waits for an
//!   in-flight dispatch to finish, so once it returns the listener receives
//!   nothing dispatched afterwards.
//! - Listeners must be fast and must not (un)subscribe on the same
//!   experiment from inside the callback. Slow consumers hand the snapshot
//!   off to their own task (see [`crate::live::LiveFeed`]).

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{error, trace};

use crate::experiment::Experiment;

/// Callback invoked with every snapshot of a subscribed experiment.
pub type Listener = Arc<dyn Fn(&Experiment) -> anyhow::Result<()> + Send + Sync>;

/// Opaque handle returned by a subscription, used to unsubscribe.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionHandle {
    experiment_id: String,
    id: u64,
}

impl SubscriptionHandle {
    /// Experiment this subscription listens to.
    #[must_use]
    pub fn experiment_id(&self) -> &str {
        &self.experiment_id
    }

    /// Hub-wide unique subscription number.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }
}

/// Outcome of one `notify` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Listeners that accepted the snapshot
    pub delivered: usize,
    /// Listeners that returned an error or panicked
    pub failed: usize,
}

struct Subscriber {
    id: u64,
    callback: Listener,
}

#[derive(Default)]
struct Topic {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl Topic {
    fn subscribers(&self) -> std::sync::MutexGuard<'_, Vec<Subscriber>> {
        // Callbacks run under catch_unwind, the list is never left half-edited.
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Registry of listeners keyed by experiment id.
#[derive(Default)]
pub struct ListenerHub {
    topics: DashMap<String, Arc<Topic>>,
    next_id: AtomicU64,
}

impl fmt::Debug for ListenerHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHub")
            .field("experiments", &self.topics.len())
            .finish_non_exhaustive()
    }
}

impl ListenerHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for `experiment_id`.
    pub fn add_listener<F>(&self, experiment_id: &str, callback: F) -> SubscriptionHandle
    where
        F: Fn(&Experiment) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        // Push while the map entry is held so a concurrent prune cannot
        // drop the topic in between.
        self.topics
            .entry(experiment_id.to_string())
            .or_default()
            .subscribers()
            .push(Subscriber {
                id,
                callback: Arc::new(callback),
            });

        trace!(experiment_id, subscription = id, "listener added");
        SubscriptionHandle {
            experiment_id: experiment_id.to_string(),
            id,
        }
    }

    /// Unregister a listener. Idempotent: unknown or already removed handles
    /// are a no-op. Returns whether a listener was removed.
    pub fn remove_listener(&self, handle: &SubscriptionHandle) -> bool {
        let Some(topic) = self.existing_topic(&handle.experiment_id) else {
            return false;
        };

        let removed = {
            let mut subscribers = topic.subscribers();
            let before = subscribers.len();
            subscribers.retain(|s| s.id != handle.id);
            subscribers.len() != before
        };

        if removed {
            self.prune(&handle.experiment_id);
            trace!(
                experiment_id = handle.experiment_id.as_str(),
                subscription = handle.id,
                "listener removed"
            );
        }
        removed
    }

    /// Drop every listener of an experiment, returning how many were removed.
    pub fn clear(&self, experiment_id: &str) -> usize {
        self.topics
            .remove(experiment_id)
            .map_or(0, |(_, topic)| {
                let mut subscribers = topic.subscribers();
                let count = subscribers.len();
                subscribers.clear();
                count
            })
    }

    /// Deliver `snapshot` to every listener of `experiment_id`, in
    /// registration order.
    pub fn notify(&self, experiment_id: &str, snapshot: &Experiment) -> Delivery {
        let Some(topic) = self.existing_topic(experiment_id) else {
            return Delivery::default();
        };

        let subscribers = topic.subscribers();
        let mut delivery = Delivery::default();

        for subscriber in subscribers.iter() {
            match catch_unwind(AssertUnwindSafe(|| (subscriber.callback)(snapshot))) {
                Ok(Ok(())) => delivery.delivered += 1,
                Ok(Err(err)) => {
                    delivery.failed += 1;
                    error!(
                        experiment_id,
                        subscription = subscriber.id,
                        error = %err,
                        "listener failed"
                    );
                }
                Err(_) => {
                    delivery.failed += 1;
                    error!(experiment_id, subscription = subscriber.id, "listener panicked");
                }
            }
        }

        delivery
    }

    /// Number of experiments with at least one listener registered.
    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    /// Number of listeners registered for `experiment_id`.
    #[must_use]
    pub fn listener_count(&self, experiment_id: &str) -> usize {
        self.existing_topic(experiment_id)
            .map_or(0, |topic| topic.subscribers().len())
    }

    /// Drop the topic of `experiment_id` once its last listener is gone. A
    /// topic busy with a dispatch is left for the next removal.
    fn prune(&self, experiment_id: &str) {
        self.topics.remove_if(experiment_id, |_, topic| {
            topic
                .subscribers
                .try_lock()
                .is_ok_and(|subscribers| subscribers.is_empty())
        });
    }

    fn existing_topic(&self, experiment_id: &str) -> Option<Arc<Topic>> {
        self.topics
            .get(experiment_id)
            .map(|topic| Arc::clone(topic.value()))
    }
}
