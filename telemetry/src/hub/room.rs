//! One room per run: bounded ingress, a fan-out task, the subscriber set
//! and the latest status snapshot.

use shared_types::{LiveMessage, RunId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::subscriber::{CloseReason, OverflowPolicy, PushOutcome, Subscriber, SubscriberId};
use super::HubError;

/// A message tagged with its room-local publish number
#[derive(Debug)]
struct Stamped {
    publish_no: u64,
    message: LiveMessage,
}

#[derive(Debug)]
struct Member {
    subscriber: Subscriber,
    /// Publish counter at join time; earlier messages are not delivered
    joined_after: u64,
}

type Members = Arc<Mutex<HashMap<SubscriberId, Member>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug)]
pub(crate) struct Room {
    run_id: RunId,
    ingress: mpsc::Sender<Stamped>,
    members: Members,
    publish_no: AtomicU64,
    frame_seq: AtomicU64,
    dropped_frames: AtomicU64,
    last_status: Mutex<Option<LiveMessage>>,
    terminal_at: Mutex<Option<Instant>>,
    fanout: JoinHandle<()>,
}

impl Room {
    /// Must be called from within a Tokio runtime; spawns the fan-out task.
    pub(crate) fn open(run_id: RunId, ingress_capacity: usize, policy: OverflowPolicy) -> Self {
        let (tx, rx) = mpsc::channel(ingress_capacity.max(1));
        let members: Members = Arc::new(Mutex::new(HashMap::new()));
        let fanout = tokio::spawn(run_fanout(run_id.clone(), rx, members.clone(), policy));

        tracing::info!(run_id = %run_id, ingress_capacity, ?policy, "Room opened");

        Self {
            run_id,
            ingress: tx,
            members,
            publish_no: AtomicU64::new(0),
            frame_seq: AtomicU64::new(0),
            dropped_frames: AtomicU64::new(0),
            last_status: Mutex::new(None),
            terminal_at: Mutex::new(None),
            fanout,
        }
    }

    fn stamp(&self, message: LiveMessage) -> Stamped {
        if let LiveMessage::RunStatus { status, .. } = &message {
            if status.is_terminal() {
                lock(&self.terminal_at).get_or_insert_with(Instant::now);
            }
            *lock(&self.last_status) = Some(message.clone());
        }
        Stamped {
            publish_no: self.publish_no.fetch_add(1, Ordering::SeqCst) + 1,
            message,
        }
    }

    pub(crate) async fn publish(
        &self,
        message: LiveMessage,
        timeout: Duration,
    ) -> Result<(), HubError> {
        if message.is_screencast() {
            return self.publish_lossy(message);
        }

        let stamped = self.stamp(message);
        match tokio::time::timeout(timeout, self.ingress.send(stamped)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(HubError::RoomClosed(self.run_id.clone())),
            Err(_) => {
                tracing::warn!(
                    run_id = %self.run_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Room ingress full; publish timed out"
                );
                Err(HubError::PublishTimeout {
                    run_id: self.run_id.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Never waits; `Ok(false)` when the ingress is full and the message
    /// was dropped.
    pub(crate) fn try_publish(&self, message: LiveMessage) -> Result<bool, HubError> {
        let stamped = self.stamp(message);
        match self.ingress.try_send(stamped) {
            Ok(()) => Ok(true),
            Err(mpsc::error::TrySendError::Full(_)) => Ok(false),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(HubError::RoomClosed(self.run_id.clone()))
            }
        }
    }

    /// Frames never wait: a full ingress drops the frame.
    pub(crate) fn publish_lossy(&self, message: LiveMessage) -> Result<(), HubError> {
        if !self.try_publish(message)? {
            let dropped = self.dropped_frames.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::trace!(run_id = %self.run_id, dropped, "Frame dropped at room ingress");
        }
        Ok(())
    }

    pub(crate) fn next_frame_seq(&self) -> u64 {
        self.frame_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Idempotent: joining twice with the same subscriber keeps the first
    /// registration. Returns true when newly added.
    pub(crate) fn join(&self, subscriber: &Subscriber, policy: OverflowPolicy) -> bool {
        let mut members = lock(&self.members);
        if members.contains_key(subscriber.id()) {
            return false;
        }

        let joined_after = self.publish_no.load(Ordering::SeqCst);
        if let Some(status) = lock(&self.last_status).clone() {
            subscriber.queue.push(status, policy);
        }
        members.insert(
            subscriber.id().clone(),
            Member {
                subscriber: subscriber.clone(),
                joined_after,
            },
        );

        tracing::info!(
            run_id = %self.run_id,
            subscriber_id = %subscriber.id(),
            joined_after,
            subscribers = members.len(),
            "Subscriber joined room"
        );
        true
    }

    pub(crate) fn leave(&self, subscriber_id: &SubscriberId) -> bool {
        let removed = lock(&self.members).remove(subscriber_id);
        match removed {
            Some(member) => {
                member.subscriber.queue.close(CloseReason::Left);
                tracing::info!(
                    run_id = %self.run_id,
                    subscriber_id = %subscriber_id,
                    "Subscriber left room"
                );
                true
            }
            None => false,
        }
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        lock(&self.members).len()
    }

    pub(crate) fn last_status(&self) -> Option<LiveMessage> {
        lock(&self.last_status).clone()
    }

    pub(crate) fn terminal_for(&self) -> Option<Duration> {
        lock(&self.terminal_at).map(|at| at.elapsed())
    }

    pub(crate) fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    pub(crate) fn close(&self) {
        self.fanout.abort();
        let members: Vec<Member> = lock(&self.members).drain().map(|(_, m)| m).collect();
        for member in &members {
            member.subscriber.queue.close(CloseReason::Left);
        }
        tracing::info!(
            run_id = %self.run_id,
            subscribers = members.len(),
            "Room closed"
        );
    }
}

impl Drop for Room {
    fn drop(&mut self) {
        self.fanout.abort();
    }
}

async fn run_fanout(
    run_id: RunId,
    mut rx: mpsc::Receiver<Stamped>,
    members: Members,
    policy: OverflowPolicy,
) {
    while let Some(stamped) = rx.recv().await {
        let mut gone = Vec::new();
        {
            let members = lock(&members);
            for (id, member) in members.iter() {
                if stamped.publish_no <= member.joined_after {
                    continue;
                }
                match member.subscriber.queue.push(stamped.message.clone(), policy) {
                    PushOutcome::Disconnected => {
                        tracing::warn!(
                            run_id = %run_id,
                            subscriber_id = %id,
                            "Subscriber lagging; disconnecting"
                        );
                        gone.push(id.clone());
                    }
                    PushOutcome::Closed(reason) => {
                        tracing::info!(
                            run_id = %run_id,
                            subscriber_id = %id,
                            ?reason,
                            "Removing closed subscriber"
                        );
                        gone.push(id.clone());
                    }
                    PushOutcome::Queued | PushOutcome::Evicted | PushOutcome::DroppedIncoming => {}
                }
            }
        }

        if !gone.is_empty() {
            let mut members = lock(&members);
            for id in gone {
                members.remove(&id);
            }
        }
    }

    tracing::debug!(run_id = %run_id, "Room fan-out finished");
}
