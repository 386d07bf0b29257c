//! Per-observer bounded delivery queue.
//!
//! Each subscriber has its own queue so a slow observer only ever affects
//! itself. When the queue is full, screencast frames are sacrificed first
//! (oldest frame evicted, or the incoming frame dropped); ordered messages
//! then fall back to the room's [`OverflowPolicy`].

use serde::{Deserialize, Serialize};
use shared_types::LiveMessage;
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriberId(pub String);

impl SubscriberId {
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What to do when an ordered message (anything but a screencast frame)
/// reaches a full queue that holds no frames to evict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued message
    DropOldest,
    /// Close the subscription; the observer reconnects and rejoins
    Disconnect,
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drop_oldest" | "drop-oldest" => Ok(OverflowPolicy::DropOldest),
            "disconnect" => Ok(OverflowPolicy::Disconnect),
            other => Err(format!("unknown overflow policy: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Left the room or the room was closed
    Left,
    /// Queue overflowed under [`OverflowPolicy::Disconnect`]
    Lagging,
    /// The observer dropped its [`Subscription`]
    ReceiverDropped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting an older message
    Evicted,
    /// The incoming frame was dropped
    DroppedIncoming,
    /// The queue was closed as a result of this push
    Disconnected,
    /// The queue was already closed
    Closed(CloseReason),
}

#[derive(Debug)]
struct QueueInner {
    buf: VecDeque<LiveMessage>,
    closed: Option<CloseReason>,
    dropped: u64,
}

#[derive(Debug)]
pub(crate) struct SubscriberQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
}

impl SubscriberQueue {
    fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                buf: VecDeque::with_capacity(capacity.min(256)),
                closed: None,
                dropped: 0,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn push(&self, message: LiveMessage, policy: OverflowPolicy) -> PushOutcome {
        let outcome = {
            let mut inner = self.lock();
            if let Some(reason) = inner.closed {
                return PushOutcome::Closed(reason);
            }

            if inner.buf.len() < self.capacity {
                inner.buf.push_back(message);
                PushOutcome::Queued
            } else if let Some(pos) = inner.buf.iter().position(LiveMessage::is_screencast) {
                inner.buf.remove(pos);
                inner.buf.push_back(message);
                inner.dropped += 1;
                PushOutcome::Evicted
            } else if message.is_screencast() {
                inner.dropped += 1;
                PushOutcome::DroppedIncoming
            } else {
                match policy {
                    OverflowPolicy::DropOldest => {
                        inner.buf.pop_front();
                        inner.buf.push_back(message);
                        inner.dropped += 1;
                        PushOutcome::Evicted
                    }
                    OverflowPolicy::Disconnect => {
                        inner.closed = Some(CloseReason::Lagging);
                        PushOutcome::Disconnected
                    }
                }
            }
        };
        self.notify.notify_one();
        outcome
    }

    pub(crate) fn close(&self, reason: CloseReason) {
        {
            let mut inner = self.lock();
            if inner.closed.is_none() {
                inner.closed = Some(reason);
            }
        }
        self.notify.notify_one();
    }

    fn closed(&self) -> Option<CloseReason> {
        self.lock().closed
    }
}

/// Hub-side half of a subscription; what [`Hub::join`](super::Hub::join)
/// registers in a room
#[derive(Debug, Clone)]
pub struct Subscriber {
    id: SubscriberId,
    pub(crate) queue: Arc<SubscriberQueue>,
}

impl Subscriber {
    /// Create a subscriber and the receiving half the observer reads from.
    pub fn new(capacity: usize) -> (Self, Subscription) {
        let id = SubscriberId::new();
        let queue = Arc::new(SubscriberQueue::new(capacity));
        (
            Self {
                id: id.clone(),
                queue: queue.clone(),
            },
            Subscription { id, queue },
        )
    }

    pub fn id(&self) -> &SubscriberId {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        self.queue.closed().is_some()
    }
}

/// Observer-side half: yields live messages in delivery order
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    queue: Arc<SubscriberQueue>,
}

impl Subscription {
    pub fn id(&self) -> &SubscriberId {
        &self.id
    }

    /// Next message, or `None` once the subscription is closed and drained.
    pub async fn recv(&mut self) -> Option<LiveMessage> {
        loop {
            {
                let mut inner = self.queue.lock();
                if let Some(message) = inner.buf.pop_front() {
                    return Some(message);
                }
                if inner.closed.is_some() {
                    return None;
                }
            }
            self.queue.notify.notified().await;
        }
    }

    pub fn try_recv(&mut self) -> Option<LiveMessage> {
        self.queue.lock().buf.pop_front()
    }

    /// Drain everything currently queued without waiting
    pub fn drain(&mut self) -> Vec<LiveMessage> {
        self.queue.lock().buf.drain(..).collect()
    }

    /// Messages lost to overflow so far
    pub fn dropped(&self) -> u64 {
        self.queue.lock().dropped
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.queue.closed()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.queue.close(CloseReason::ReceiverDropped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_types::{Level, RunState};

    fn frame(seq: u64) -> LiveMessage {
        LiveMessage::ScreencastFrame {
            seq,
            frame: format!("frame-{seq}"),
        }
    }

    fn log(message: &str) -> LiveMessage {
        LiveMessage::ConsoleLog {
            level: Level::Info,
            message: message.to_string(),
        }
    }

    #[test]
    fn test_full_queue_evicts_oldest_frame_first() {
        let (subscriber, mut subscription) = Subscriber::new(3);
        let policy = OverflowPolicy::Disconnect;
        subscriber.queue.push(log("a"), policy);
        subscriber.queue.push(frame(1), policy);
        subscriber.queue.push(log("b"), policy);

        assert_eq!(subscriber.queue.push(log("c"), policy), PushOutcome::Evicted);
        assert_eq!(subscription.drain(), vec![log("a"), log("b"), log("c")]);
        assert_eq!(subscription.dropped(), 1);
    }

    #[test]
    fn test_incoming_frame_dropped_when_no_frame_to_evict() {
        let (subscriber, mut subscription) = Subscriber::new(2);
        let policy = OverflowPolicy::Disconnect;
        subscriber.queue.push(log("a"), policy);
        subscriber.queue.push(log("b"), policy);

        assert_eq!(
            subscriber.queue.push(frame(1), policy),
            PushOutcome::DroppedIncoming
        );
        assert!(!subscriber.is_closed());
        assert_eq!(subscription.drain(), vec![log("a"), log("b")]);
    }

    #[test]
    fn test_ordered_overflow_policies() {
        let (subscriber, mut subscription) = Subscriber::new(1);
        subscriber.queue.push(log("a"), OverflowPolicy::DropOldest);
        assert_eq!(
            subscriber.queue.push(log("b"), OverflowPolicy::DropOldest),
            PushOutcome::Evicted
        );
        assert_eq!(subscription.drain(), vec![log("b")]);

        let (subscriber, subscription) = Subscriber::new(1);
        subscriber.queue.push(log("a"), OverflowPolicy::Disconnect);
        let status = LiveMessage::RunStatus {
            status: RunState::Paused,
            message: None,
        };
        assert_eq!(
            subscriber.queue.push(status, OverflowPolicy::Disconnect),
            PushOutcome::Disconnected
        );
        assert_eq!(subscription.close_reason(), Some(CloseReason::Lagging));
    }

    #[tokio::test]
    async fn test_recv_drains_then_ends_after_close() {
        let (subscriber, mut subscription) = Subscriber::new(4);
        subscriber.queue.push(log("a"), OverflowPolicy::DropOldest);
        subscriber.queue.close(CloseReason::Left);

        assert_eq!(subscription.recv().await, Some(log("a")));
        assert_eq!(subscription.recv().await, None);
    }

    #[tokio::test]
    async fn test_recv_wakes_on_push() {
        let (subscriber, mut subscription) = Subscriber::new(4);
        let pusher = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            subscriber.queue.push(log("late"), OverflowPolicy::DropOldest);
        });

        let received = tokio::time::timeout(std::time::Duration::from_secs(2), subscription.recv())
            .await
            .unwrap();
        assert_eq!(received, Some(log("late")));
        pusher.await.unwrap();
    }

    #[test]
    fn test_dropping_subscription_closes_queue() {
        let (subscriber, subscription) = Subscriber::new(4);
        drop(subscription);
        assert_eq!(
            subscriber.queue.push(log("a"), OverflowPolicy::DropOldest),
            PushOutcome::Closed(CloseReason::ReceiverDropped)
        );
    }
}
