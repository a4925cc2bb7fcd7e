//! Bounded per-node inboxes and the dead-letter queue.
//!
//! Each inbox is a strict-FIFO bounded queue coordinated by a pair of
//! semaphores (free slots / available messages) around a mutex-guarded
//! deque. No lock is held across an await: waiting happens on the
//! semaphores, the deque mutex only covers the push/pop itself.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::message::{DeadLetter, DeadLetterReason, NodeMessage};

/// Default inbox capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Inbox enqueue/dequeue failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("inbox '{0}' is full")]
    Full(String),
    #[error("inbox '{0}' is closed")]
    Closed(String),
    #[error("enqueue into inbox '{0}' timed out")]
    Timeout(String),
}

/// A bounded FIFO inbox for one node.
///
/// Shared by the router (enqueue) and the engine (dequeue).
#[derive(Debug)]
pub struct NodeQueue {
    node_id: String,
    capacity: usize,
    inner: Mutex<VecDeque<NodeMessage>>,
    /// Free capacity; producers acquire one permit per message.
    slots: Semaphore,
    /// Available messages; consumers acquire one permit per message.
    items: Semaphore,
}

impl NodeQueue {
    pub fn new(node_id: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            node_id: node_id.into(),
            capacity,
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            slots: Semaphore::new(capacity),
            items: Semaphore::new(0),
        }
    }

    pub fn with_default_capacity(node_id: impl Into<String>) -> Self {
        Self::new(node_id, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Non-blocking enqueue.
    pub fn try_enqueue(&self, message: NodeMessage) -> Result<(), QueueError> {
        match self.slots.try_acquire() {
            Ok(permit) => {
                permit.forget();
                self.push(message);
                Ok(())
            }
            Err(tokio::sync::TryAcquireError::NoPermits) => {
                Err(QueueError::Full(self.node_id.clone()))
            }
            Err(tokio::sync::TryAcquireError::Closed) => {
                Err(QueueError::Closed(self.node_id.clone()))
            }
        }
    }

    /// Blocking enqueue with an optional timeout.
    pub async fn enqueue(
        &self,
        message: NodeMessage,
        timeout: Option<Duration>,
    ) -> Result<(), QueueError> {
        let acquire = self.slots.acquire();
        let permit = match timeout {
            Some(limit) => match tokio::time::timeout(limit, acquire).await {
                Ok(result) => result.map_err(|_| QueueError::Closed(self.node_id.clone()))?,
                Err(_) => return Err(QueueError::Timeout(self.node_id.clone())),
            },
            None => acquire
                .await
                .map_err(|_| QueueError::Closed(self.node_id.clone()))?,
        };
        permit.forget();
        self.push(message);
        Ok(())
    }

    /// Await the next message. Errors once the queue is closed.
    pub async fn dequeue(&self) -> Result<NodeMessage, QueueError> {
        let permit = self
            .items
            .acquire()
            .await
            .map_err(|_| QueueError::Closed(self.node_id.clone()))?;
        permit.forget();
        self.slots.add_permits(1);
        let mut inner = self.inner.lock().unwrap();
        Ok(inner.pop_front().expect("items permit implies a message"))
    }

    /// Non-blocking dequeue. `None` when empty or closed.
    pub fn try_dequeue(&self) -> Option<NodeMessage> {
        let permit = self.items.try_acquire().ok()?;
        permit.forget();
        self.slots.add_permits(1);
        let mut inner = self.inner.lock().unwrap();
        Some(inner.pop_front().expect("items permit implies a message"))
    }

    /// Copy of the queued messages in FIFO order, for checkpoints.
    pub fn snapshot(&self) -> Vec<NodeMessage> {
        self.inner.lock().unwrap().iter().cloned().collect()
    }

    /// Remove and return everything queued, bypassing the semaphores.
    /// Used when draining a terminated workflow.
    pub fn drain(&self) -> Vec<NodeMessage> {
        self.inner.lock().unwrap().drain(..).collect()
    }

    /// Close the inbox: waiters on enqueue/dequeue error out immediately.
    pub fn close(&self) {
        self.slots.close();
        self.items.close();
        debug!(node_id = %self.node_id, "inbox closed");
    }

    pub fn is_closed(&self) -> bool {
        self.items.is_closed()
    }

    fn push(&self, message: NodeMessage) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.push_back(message);
        }
        self.items.add_permits(1);
    }
}

// ---------------------------------------------------------------------------
// Dead-letter queue
// ---------------------------------------------------------------------------

/// Append-only log of undeliverable messages.
///
/// Queryable for diagnostics; the engine never drains it.
#[derive(Debug, Default)]
pub struct DeadLetterQueue {
    entries: Mutex<Vec<DeadLetter>>,
}

impl DeadLetterQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &self,
        message: NodeMessage,
        target_node_id: impl Into<String>,
        reason: DeadLetterReason,
        detail: Option<String>,
    ) {
        let target_node_id = target_node_id.into();
        debug!(
            target = %target_node_id,
            ?reason,
            "message dead-lettered"
        );
        let mut entries = self.entries.lock().unwrap();
        entries.push(DeadLetter {
            message,
            target_node_id,
            reason,
            detail,
            dead_lettered_at: Utc::now(),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<DeadLetter> {
        self.entries.lock().unwrap().clone()
    }

    pub fn by_reason(&self, reason: DeadLetterReason) -> Vec<DeadLetter> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|d| d.reason == reason)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessagePayload;
    use serde_json::Value;
    use uuid::Uuid;

    fn msg(n: usize) -> NodeMessage {
        NodeMessage::new(
            format!("src-{n}"),
            Uuid::nil(),
            MessagePayload::Next {
                item: Value::from(n as u64),
                item_index: n,
            },
        )
    }

    #[tokio::test]
    async fn fifo_order_is_preserved() {
        let q = NodeQueue::new("n", 16);
        for i in 0..5 {
            q.try_enqueue(msg(i)).unwrap();
        }
        for i in 0..5 {
            let m = q.dequeue().await.unwrap();
            assert_eq!(m.source_node_id, format!("src-{i}"));
        }
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn try_enqueue_reports_full() {
        let q = NodeQueue::new("n", 2);
        q.try_enqueue(msg(0)).unwrap();
        q.try_enqueue(msg(1)).unwrap();
        assert_eq!(q.try_enqueue(msg(2)), Err(QueueError::Full("n".into())));
        assert_eq!(q.len(), 2);
    }

    #[tokio::test]
    async fn blocking_enqueue_waits_for_capacity() {
        let q = std::sync::Arc::new(NodeQueue::new("n", 1));
        q.try_enqueue(msg(0)).unwrap();

        let q2 = q.clone();
        let producer = tokio::spawn(async move { q2.enqueue(msg(1), None).await });

        // Give the producer a moment to park on the slots semaphore.
        tokio::task::yield_now().await;
        let first = q.dequeue().await.unwrap();
        assert_eq!(first.source_node_id, "src-0");

        producer.await.unwrap().unwrap();
        assert_eq!(q.dequeue().await.unwrap().source_node_id, "src-1");
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_timeout_elapses() {
        let q = NodeQueue::new("n", 1);
        q.try_enqueue(msg(0)).unwrap();

        let result = q.enqueue(msg(1), Some(Duration::from_millis(50))).await;
        assert_eq!(result, Err(QueueError::Timeout("n".into())));
    }

    #[tokio::test]
    async fn close_aborts_waiting_dequeue() {
        let q = std::sync::Arc::new(NodeQueue::new("n", 4));
        let q2 = q.clone();
        let consumer = tokio::spawn(async move { q2.dequeue().await });

        tokio::task::yield_now().await;
        q.close();

        let result = consumer.await.unwrap();
        assert_eq!(result, Err(QueueError::Closed("n".into())));
    }

    #[tokio::test]
    async fn drain_returns_remaining_messages_after_close() {
        let q = NodeQueue::new("n", 8);
        for i in 0..3 {
            q.try_enqueue(msg(i)).unwrap();
        }
        q.close();
        let drained = q.drain();
        assert_eq!(drained.len(), 3);
        assert!(q.is_empty());
    }

    #[test]
    fn snapshot_does_not_consume() {
        let q = NodeQueue::new("n", 8);
        q.try_enqueue(msg(0)).unwrap();
        q.try_enqueue(msg(1)).unwrap();

        let snap = q.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn dead_letter_queue_appends_and_filters() {
        let dlq = DeadLetterQueue::new();
        dlq.add(msg(0), "ghost", DeadLetterReason::TargetQueueNotFound, None);
        dlq.add(
            msg(1),
            "busy",
            DeadLetterReason::TargetQueueFull,
            Some("capacity 1".into()),
        );

        assert_eq!(dlq.len(), 2);
        let full = dlq.by_reason(DeadLetterReason::TargetQueueFull);
        assert_eq!(full.len(), 1);
        assert_eq!(full[0].target_node_id, "busy");
    }
}
