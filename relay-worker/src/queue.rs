//! # DeliveryQueue
//!
//! In-memory FIFO of records waiting to be delivered. The worker peeks at the head, and an item
//! only leaves the queue once it was delivered or given up on, so records keep their order
//! across retries.
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use relay_common::record::Record;
use thiserror::Error;
use tokio::sync::{watch, Notify};

use crate::error::EnqueueError;

/// What to do with a new record when the queue is at capacity.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Refuse the new record.
    #[default]
    Reject,
    /// Discard the oldest waiting record to make room.
    DropOldest,
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("unknown overflow policy {0:?}, expected reject or drop_oldest")]
pub struct ParseOverflowPolicyError(String);

impl FromStr for OverflowPolicy {
    type Err = ParseOverflowPolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(OverflowPolicy::Reject),
            "drop_oldest" | "drop-oldest" => Ok(OverflowPolicy::DropOldest),
            invalid => Err(ParseOverflowPolicyError(invalid.to_owned())),
        }
    }
}

/// A record waiting in the queue.
#[derive(Debug, Clone)]
pub struct PendingItem {
    pub id: u64,
    pub record: Arc<Record>,
    pub enqueued_at: Instant,
    /// Delivery attempts made so far.
    pub attempts: u32,
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<PendingItem>,
    next_id: u64,
    closed: bool,
}

pub struct DeliveryQueue {
    state: Mutex<QueueState>,
    capacity: Option<usize>,
    overflow_policy: OverflowPolicy,
    pushed: Notify,
    length: watch::Sender<usize>,
}

impl DeliveryQueue {
    /// A capacity of zero leaves the queue unbounded.
    pub fn new(capacity: usize, overflow_policy: OverflowPolicy) -> Self {
        let (length, _) = watch::channel(0);

        Self {
            state: Mutex::new(QueueState::default()),
            capacity: (capacity > 0).then_some(capacity),
            overflow_policy,
            pushed: Notify::new(),
            length,
        }
    }

    /// Append a record to the tail of the queue.
    pub fn push(&self, record: Record) -> Result<(), EnqueueError> {
        let mut state = self.lock();

        if state.closed {
            return Err(EnqueueError::Stopped(record));
        }

        if let Some(capacity) = self.capacity {
            if state.items.len() >= capacity {
                match self.overflow_policy {
                    OverflowPolicy::Reject => {
                        metrics::counter!("webhook_relay_records_rejected_total").increment(1);
                        return Err(EnqueueError::QueueFull { capacity, record });
                    }
                    OverflowPolicy::DropOldest => {
                        // Dropping the head while it is in flight is fine: the worker looks up
                        // items by id and ignores ones that are gone.
                        if let Some(dropped) = state.items.pop_front() {
                            tracing::warn!(
                                item_id = dropped.id,
                                attempts = dropped.attempts,
                                "queue full, dropping oldest record"
                            );
                            metrics::counter!("webhook_relay_items_dropped_total", "reason" => "overflow")
                                .increment(1);
                        }
                    }
                }
            }
        }

        let id = state.next_id;
        state.next_id += 1;
        state.items.push_back(PendingItem {
            id,
            record: Arc::new(record),
            enqueued_at: Instant::now(),
            attempts: 0,
        });
        metrics::counter!("webhook_relay_records_enqueued_total").increment(1);
        self.publish_len(&state);
        drop(state);

        self.pushed.notify_one();
        Ok(())
    }

    /// A copy of the item at the head of the queue, without removing it.
    pub fn head(&self) -> Option<PendingItem> {
        self.lock().items.front().cloned()
    }

    /// Wait until the queue has a head item and return a copy of it.
    pub async fn wait_for_head(&self) -> PendingItem {
        loop {
            let pushed = self.pushed.notified();
            if let Some(item) = self.head() {
                return item;
            }
            pushed.await;
        }
    }

    /// Count a delivery attempt for the item `id`. Returns the attempts made including this one,
    /// or `None` if the item is no longer queued.
    pub fn record_attempt(&self, id: u64) -> Option<u32> {
        let mut state = self.lock();
        let item = state.items.iter_mut().find(|item| item.id == id)?;
        item.attempts += 1;
        Some(item.attempts)
    }

    /// Remove the item `id`, returning it if it was still queued.
    pub fn remove(&self, id: u64) -> Option<PendingItem> {
        let mut state = self.lock();
        let position = state.items.iter().position(|item| item.id == id)?;
        let item = state.items.remove(position);
        self.publish_len(&state);
        item
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until every queued record has been removed.
    pub async fn wait_until_empty(&self) {
        let mut length = self.length.subscribe();
        if length.wait_for(|len| *len == 0).await.is_err() {
            tracing::error!("queue length channel closed while waiting for queue to drain");
        }
    }

    /// Refuse any further records and hand back the ones still queued, oldest first.
    pub fn close_and_drain(&self) -> Vec<Record> {
        let mut state = self.lock();
        state.closed = true;
        let drained = state
            .items
            .drain(..)
            .map(|item| Arc::try_unwrap(item.record).unwrap_or_else(|record| (*record).clone()))
            .collect();
        self.publish_len(&state);
        drained
    }

    fn publish_len(&self, state: &QueueState) {
        let len = state.items.len();
        metrics::gauge!("webhook_relay_queue_depth").set(len as f64);
        self.length.send_replace(len);
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn record(text: &str) -> Record {
        Record::new().with("message", text)
    }

    fn text(item: &PendingItem) -> &str {
        item.record.get_str("message").unwrap()
    }

    #[test]
    fn test_parse_overflow_policy() {
        assert_eq!("reject".parse(), Ok(OverflowPolicy::Reject));
        assert_eq!("DROP_OLDEST".parse(), Ok(OverflowPolicy::DropOldest));
        assert_eq!("drop-oldest".parse(), Ok(OverflowPolicy::DropOldest));
        assert!("block".parse::<OverflowPolicy>().is_err());
    }

    #[test]
    fn test_head_is_not_removed_until_delivered() {
        let queue = DeliveryQueue::new(0, OverflowPolicy::Reject);
        queue.push(record("a")).unwrap();
        queue.push(record("b")).unwrap();

        let head = queue.head().unwrap();
        assert_eq!(text(&head), "a");
        assert_eq!(queue.record_attempt(head.id), Some(1));
        assert_eq!(queue.record_attempt(head.id), Some(2));
        assert_eq!(text(&queue.head().unwrap()), "a");
        assert_eq!(queue.len(), 2);

        let removed = queue.remove(head.id).unwrap();
        assert_eq!(removed.attempts, 2);
        assert_eq!(text(&queue.head().unwrap()), "b");
        assert_eq!(queue.remove(head.id).map(|item| item.id), None);
        assert_eq!(queue.record_attempt(head.id), None);
    }

    #[test]
    fn test_reject_when_full() {
        let queue = DeliveryQueue::new(2, OverflowPolicy::Reject);
        queue.push(record("a")).unwrap();
        queue.push(record("b")).unwrap();

        let err = queue.push(record("c")).unwrap_err();

        assert!(matches!(err, EnqueueError::QueueFull { capacity: 2, .. }));
        assert_eq!(err.into_record().get_str("message"), Some("c"));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_drop_oldest_when_full() {
        let queue = DeliveryQueue::new(2, OverflowPolicy::DropOldest);
        for name in ["a", "b", "c"] {
            queue.push(record(name)).unwrap();
        }

        let drained: Vec<_> = queue
            .close_and_drain()
            .into_iter()
            .map(|record| record.get_str("message").unwrap().to_owned())
            .collect();

        assert_eq!(drained, vec!["b", "c"]);
    }

    #[test]
    fn test_closed_queue_refuses_records() {
        let queue = DeliveryQueue::new(0, OverflowPolicy::Reject);
        queue.push(record("a")).unwrap();

        assert_eq!(queue.close_and_drain().len(), 1);
        assert!(queue.is_empty());
        assert!(matches!(
            queue.push(record("b")),
            Err(EnqueueError::Stopped(_))
        ));
    }

    #[tokio::test]
    async fn test_wait_for_head_wakes_on_push() {
        let queue = Arc::new(DeliveryQueue::new(0, OverflowPolicy::Reject));

        let waiter = tokio::spawn({
            let queue = queue.clone();
            async move { queue.wait_for_head().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(record("a")).unwrap();

        let head = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter was not woken")
            .unwrap();
        assert_eq!(text(&head), "a");
    }

    #[tokio::test]
    async fn test_wait_until_empty() {
        let queue = Arc::new(DeliveryQueue::new(0, OverflowPolicy::Reject));
        queue.wait_until_empty().await;

        queue.push(record("a")).unwrap();
        let id = queue.head().unwrap().id;

        let waiter = tokio::spawn({
            let queue = queue.clone();
            async move { queue.wait_until_empty().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        queue.remove(id);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter was not woken")
            .unwrap();
    }
}
