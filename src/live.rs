//! Live experiment feed
//!
//! A [`LiveFeed`] turns hub notifications into a stream of server-sent event
//! frames for one observer. The hub callback only does a non-blocking
//! `try_send` into a bounded channel; the transport awaits
//! [`LiveFeed::next_frame`] on its own task, so a slow client never stalls a
//! mutation. When the buffer is full the update is dropped for that feed and
//! the hub logs the failure.
//!
//! Wire format, one frame per event:
//!
//! ```text
//! data: {"type":"experiment","experiment":{...}}\n\n
//! : keep-alive\n\n
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::debug;

use crate::experiment::Experiment;
use crate::hub::{ListenerHub, SubscriptionHandle};
use crate::Result;

/// Comment frame sent on idle intervals.
pub const KEEP_ALIVE_FRAME: &str = ": keep-alive\n\n";

/// One event on a live feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LiveEvent {
    /// A snapshot of the experiment
    Experiment {
        /// The snapshot
        experiment: Box<Experiment>,
    },
    /// Idle keep-alive
    #[serde(rename = "keep-alive")]
    KeepAlive,
}

impl LiveEvent {
    /// Wrap a snapshot.
    #[must_use]
    pub fn experiment(experiment: Experiment) -> Self {
        Self::Experiment {
            experiment: Box::new(experiment),
        }
    }

    /// Encode as a server-sent event frame.
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` if the snapshot cannot be encoded.
    pub fn to_sse_frame(&self) -> Result<String> {
        match self {
            Self::KeepAlive => Ok(KEEP_ALIVE_FRAME.to_string()),
            Self::Experiment { .. } => Ok(format!("data: {}\n\n", serde_json::to_string(self)?)),
        }
    }
}

/// Stream of live events for one experiment and one observer.
///
/// Ends (returns `None`) once the experiment's listeners are dropped, e.g.
/// when the experiment is deleted. Closing or dropping the feed
/// unsubscribes it.
pub struct LiveFeed {
    experiment_id: String,
    updates: mpsc::Receiver<Experiment>,
    keep_alive: Interval,
    hub: Arc<ListenerHub>,
    subscription: Option<SubscriptionHandle>,
}

impl fmt::Debug for LiveFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveFeed")
            .field("experiment_id", &self.experiment_id)
            .field("subscription", &self.subscription)
            .finish_non_exhaustive()
    }
}

impl LiveFeed {
    /// Subscribe a new feed. `initial` is queued ahead of any notification.
    ///
    /// Must be called within a tokio runtime, with the experiment's id lock
    /// held so no notification slips in between `initial` and the
    /// subscription.
    pub(crate) fn open(
        hub: Arc<ListenerHub>,
        initial: Experiment,
        buffer: usize,
        keep_alive: Duration,
    ) -> Self {
        let experiment_id = initial.id().to_string();
        let (tx, updates) = mpsc::channel(buffer.max(1));
        // Capacity is at least one and the channel is fresh.
        let _ = tx.try_send(initial);

        let subscription = hub.add_listener(&experiment_id, move |snapshot| {
            tx.try_send(snapshot.clone()).map_err(|err| match err {
                TrySendError::Full(_) => anyhow::anyhow!("live feed buffer full, update dropped"),
                TrySendError::Closed(_) => anyhow::anyhow!("live feed closed"),
            })
        });

        let mut keep_alive = time::interval_at(Instant::now() + keep_alive, keep_alive);
        keep_alive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(
            experiment_id = experiment_id.as_str(),
            subscription = subscription.id(),
            "live feed opened"
        );
        Self {
            experiment_id,
            updates,
            keep_alive,
            hub,
            subscription: Some(subscription),
        }
    }

    /// Experiment this feed follows.
    #[must_use]
    pub fn experiment_id(&self) -> &str {
        &self.experiment_id
    }

    /// Subscription backing this feed, `None` once closed.
    #[must_use]
    pub const fn subscription(&self) -> Option<&SubscriptionHandle> {
        self.subscription.as_ref()
    }

    /// Wait for the next event. Queued snapshots take precedence over
    /// keep-alives. Returns `None` when the feed has ended.
    pub async fn next_event(&mut self) -> Option<LiveEvent> {
        tokio::select! {
            biased;
            update = self.updates.recv() => update.map(LiveEvent::experiment),
            _ = self.keep_alive.tick() => Some(LiveEvent::KeepAlive),
        }
    }

    /// Wait for the next event, encoded as a server-sent event frame.
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` if a snapshot cannot be encoded.
    pub async fn next_frame(&mut self) -> Result<Option<String>> {
        self.next_event()
            .await
            .map(|event| event.to_sse_frame())
            .transpose()
    }

    /// Unsubscribe. Already queued snapshots can still be drained.
    /// Idempotent.
    pub fn close(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            self.hub.remove_listener(&subscription);
            debug!(
                experiment_id = self.experiment_id.as_str(),
                subscription = subscription.id(),
                "live feed closed"
            );
        }
    }
}

impl Drop for LiveFeed {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::{ExperimentStore, NewExperiment, NewVariant};

    fn snapshot() -> Experiment {
        ExperimentStore::new()
            .create(
                NewExperiment::builder("live", "fixture")
                    .variant(NewVariant::control("a"))
                    .variant(NewVariant::treatment("b"))
                    .metric("m")
                    .build(),
            )
            .unwrap()
    }

    #[test]
    fn test_event_wire_shape() {
        let exp = snapshot();
        let value = serde_json::to_value(LiveEvent::experiment(exp.clone())).unwrap();
        assert_eq!(value["type"], "experiment");
        assert_eq!(value["experiment"]["id"], exp.id());

        let frame = LiveEvent::experiment(exp).to_sse_frame().unwrap();
        assert!(frame.starts_with("data: {\"type\":\"experiment\""));
        assert!(frame.ends_with("\n\n"));
        assert_eq!(LiveEvent::KeepAlive.to_sse_frame().unwrap(), KEEP_ALIVE_FRAME);
    }

    #[tokio::test]
    async fn test_initial_snapshot_then_updates() {
        let hub = Arc::new(ListenerHub::new());
        let exp = snapshot();
        let mut feed = LiveFeed::open(Arc::clone(&hub), exp.clone(), 4, Duration::from_secs(60));

        hub.notify(exp.id(), &exp);
        assert!(matches!(feed.next_event().await, Some(LiveEvent::Experiment { .. })));
        assert!(matches!(feed.next_event().await, Some(LiveEvent::Experiment { .. })));
    }

    #[tokio::test]
    async fn test_full_buffer_drops_and_reports() {
        let hub = Arc::new(ListenerHub::new());
        let exp = snapshot();
        let _feed = LiveFeed::open(Arc::clone(&hub), exp.clone(), 1, Duration::from_secs(60));

        // The initial snapshot already fills the buffer.
        let delivery = hub.notify(exp.id(), &exp);
        assert_eq!(delivery.failed, 1);
    }

    #[tokio::test]
    async fn test_close_unsubscribes() {
        let hub = Arc::new(ListenerHub::new());
        let exp = snapshot();
        let mut feed = LiveFeed::open(Arc::clone(&hub), exp.clone(), 4, Duration::from_secs(60));
        assert_eq!(hub.listener_count(exp.id()), 1);

        feed.close();
        feed.close();
        assert_eq!(hub.listener_count(exp.id()), 0);
        assert!(feed.subscription().is_none());

        drop(feed);
        assert_eq!(hub.listener_count(exp.id()), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_when_idle() {
        let hub = Arc::new(ListenerHub::new());
        let exp = snapshot();
        let mut feed = LiveFeed::open(Arc::clone(&hub), exp, 4, Duration::from_secs(15));

        assert!(matches!(feed.next_event().await, Some(LiveEvent::Experiment { .. })));
        assert_eq!(feed.next_frame().await.unwrap().as_deref(), Some(KEEP_ALIVE_FRAME));
    }

    #[tokio::test]
    async fn test_feed_ends_when_listeners_cleared() {
        let hub = Arc::new(ListenerHub::new());
        let exp = snapshot();
        let mut feed = LiveFeed::open(Arc::clone(&hub), exp.clone(), 4, Duration::from_secs(60));

        hub.clear(exp.id());
        assert!(feed.next_event().await.is_some());
        assert!(feed.next_event().await.is_none());
    }
}
