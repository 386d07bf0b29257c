//! Broadcast hub - fans live run messages out to observers.
//!
//! The hub keeps one room per run. Publishing never waits on observers:
//! messages go into a bounded room ingress, and a per-room fan-out task
//! copies them into each subscriber's own bounded queue. Observers only
//! receive messages published after they joined, plus the latest run
//! status delivered on join.

mod room;
mod subscriber;

pub use subscriber::{CloseReason, OverflowPolicy, Subscriber, SubscriberId, Subscription};

use dashmap::DashMap;
use shared_types::{LiveMessage, RunId};
use std::sync::Arc;
use std::time::Duration;

use room::Room;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum HubError {
    #[error("No room for run {0}")]
    UnknownRun(RunId),

    #[error("Room for run {0} is closed")]
    RoomClosed(RunId),

    #[error("Publish to run {run_id} timed out after {timeout_ms}ms")]
    PublishTimeout { run_id: RunId, timeout_ms: u64 },
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Per-subscriber queue capacity
    pub subscriber_capacity: usize,
    /// Per-room ingress capacity
    pub ingress_capacity: usize,
    /// How long an ordered publish may wait on a full ingress
    pub publish_timeout: Duration,
    pub ordered_overflow: OverflowPolicy,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: 64,
            ingress_capacity: 1024,
            publish_timeout: Duration::from_millis(50),
            ordered_overflow: OverflowPolicy::DropOldest,
        }
    }
}

#[derive(Debug)]
struct HubInner {
    rooms: DashMap<RunId, Arc<Room>>,
    config: HubConfig,
}

/// Cheaply cloneable handle on the shared room registry
#[derive(Debug, Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            inner: Arc::new(HubInner {
                rooms: DashMap::new(),
                config,
            }),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    fn room(&self, run_id: &RunId) -> Result<Arc<Room>, HubError> {
        self.inner
            .rooms
            .get(run_id)
            .map(|room| room.value().clone())
            .ok_or_else(|| HubError::UnknownRun(run_id.clone()))
    }

    /// Create the room for a run if it does not exist yet.
    pub fn open_room(&self, run_id: &RunId) {
        let config = &self.inner.config;
        self.inner.rooms.entry(run_id.clone()).or_insert_with(|| {
            Arc::new(Room::open(
                run_id.clone(),
                config.ingress_capacity,
                config.ordered_overflow,
            ))
        });
    }

    pub fn has_room(&self, run_id: &RunId) -> bool {
        self.inner.rooms.contains_key(run_id)
    }

    /// A subscriber with the configured queue capacity
    pub fn subscriber(&self) -> (Subscriber, Subscription) {
        Subscriber::new(self.inner.config.subscriber_capacity)
    }

    /// Register a subscriber; idempotent per subscriber id.
    pub fn join(&self, run_id: &RunId, subscriber: &Subscriber) -> Result<(), HubError> {
        let room = self.room(run_id)?;
        room.join(subscriber, self.inner.config.ordered_overflow);
        Ok(())
    }

    /// Remove a subscriber; returns false when it was not a member.
    pub fn leave(&self, run_id: &RunId, subscriber_id: &SubscriberId) -> bool {
        match self.room(run_id) {
            Ok(room) => room.leave(subscriber_id),
            Err(_) => false,
        }
    }

    /// Create a subscriber and join it in one step.
    pub fn subscribe(&self, run_id: &RunId) -> Result<(Subscriber, Subscription), HubError> {
        let (subscriber, subscription) = self.subscriber();
        self.join(run_id, &subscriber)?;
        Ok((subscriber, subscription))
    }

    /// Publish a message to every current subscriber of the run.
    ///
    /// Screencast frames never wait; other messages wait at most the
    /// configured publish timeout for ingress space.
    pub async fn publish(&self, run_id: &RunId, message: LiveMessage) -> Result<(), HubError> {
        let room = self.room(run_id)?;
        room.publish(message, self.inner.config.publish_timeout).await
    }

    /// Publish without waiting for ingress space. Returns false when the
    /// room is saturated and the message was dropped.
    pub fn try_publish(&self, run_id: &RunId, message: LiveMessage) -> Result<bool, HubError> {
        self.room(run_id)?.try_publish(message)
    }

    /// Publish one base64-encoded screencast frame, numbering it per room.
    pub fn publish_frame(&self, run_id: &RunId, frame: String) -> Result<u64, HubError> {
        let room = self.room(run_id)?;
        let seq = room.next_frame_seq();
        room.publish_lossy(LiveMessage::ScreencastFrame { seq, frame })?;
        Ok(seq)
    }

    pub fn current_status(&self, run_id: &RunId) -> Option<LiveMessage> {
        self.room(run_id).ok().and_then(|room| room.last_status())
    }

    pub fn subscriber_count(&self, run_id: &RunId) -> usize {
        self.room(run_id)
            .map(|room| room.subscriber_count())
            .unwrap_or(0)
    }

    pub fn dropped_frames(&self, run_id: &RunId) -> u64 {
        self.room(run_id)
            .map(|room| room.dropped_frames())
            .unwrap_or(0)
    }

    /// Close a room and end every subscription in it.
    pub fn close_room(&self, run_id: &RunId) -> bool {
        match self.inner.rooms.remove(run_id) {
            Some((_, room)) => {
                room.close();
                true
            }
            None => false,
        }
    }

    /// Close rooms whose run has been terminal for longer than `retention`.
    pub fn prune(&self, retention: Duration) -> Vec<RunId> {
        let expired: Vec<RunId> = self
            .inner
            .rooms
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .terminal_for()
                    .is_some_and(|elapsed| elapsed >= retention)
            })
            .map(|entry| entry.key().clone())
            .collect();

        for run_id in &expired {
            self.close_room(run_id);
        }
        if !expired.is_empty() {
            tracing::info!(pruned = expired.len(), "Pruned terminal rooms");
        }
        expired
    }
}
