//! Reactive event and progress streams.
//!
//! Events are published on a multi-subscriber broadcast topic; progress
//! is a watch channel holding the latest snapshot. Both complete when
//! the workflow context is disposed at terminal status.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

/// Default broadcast buffer per workflow instance.
const EVENT_BUFFER: usize = 256;

/// Everything observable about a running workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkflowEvent {
    WorkflowStarted {
        workflow_instance_id: Uuid,
        workflow_id: String,
        timestamp: DateTime<Utc>,
    },
    WorkflowCompleted {
        workflow_instance_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    WorkflowFailed {
        workflow_instance_id: Uuid,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    WorkflowCancelled {
        workflow_instance_id: Uuid,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    NodeStarted {
        node_instance_id: Uuid,
        node_id: String,
        workflow_instance_id: Uuid,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },
    NodeCompleted {
        node_instance_id: Uuid,
        node_id: String,
        workflow_instance_id: Uuid,
        duration_ms: u64,
        #[serde(default)]
        output: HashMap<String, Value>,
        timestamp: DateTime<Utc>,
    },
    NodeFailed {
        node_instance_id: Uuid,
        node_id: String,
        workflow_instance_id: Uuid,
        error: String,
        /// Failure classification (`circuit_open`, `retries_exhausted`, ...).
        reason: String,
        timestamp: DateTime<Utc>,
    },
    NodeCancelled {
        node_instance_id: Uuid,
        node_id: String,
        workflow_instance_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    ProgressUpdated(ProgressUpdate),
}

impl WorkflowEvent {
    /// Node id the event concerns, if any.
    pub fn node_id(&self) -> Option<&str> {
        match self {
            WorkflowEvent::NodeStarted { node_id, .. }
            | WorkflowEvent::NodeCompleted { node_id, .. }
            | WorkflowEvent::NodeFailed { node_id, .. }
            | WorkflowEvent::NodeCancelled { node_id, .. } => Some(node_id),
            _ => None,
        }
    }
}

/// Point-in-time completion snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub workflow_instance_id: Uuid,
    /// Percentage in `[0, 100]`.
    pub percent_complete: f64,
    pub nodes_completed: usize,
    pub nodes_running: usize,
    pub nodes_pending: usize,
    pub nodes_failed: usize,
    pub nodes_cancelled: usize,
    pub total_nodes: usize,
    /// Linear estimate; absent until at least one node completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_remaining_ms: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressUpdate {
    pub fn empty(workflow_instance_id: Uuid, total_nodes: usize) -> Self {
        Self {
            workflow_instance_id,
            percent_complete: 0.0,
            nodes_completed: 0,
            nodes_running: 0,
            nodes_pending: total_nodes,
            nodes_failed: 0,
            nodes_cancelled: 0,
            total_nodes,
            estimated_remaining_ms: None,
            timestamp: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Streams
// ---------------------------------------------------------------------------

/// Multi-subscriber event topic for one workflow instance.
///
/// Publishing after `close` is a no-op; subscribing after `close` yields
/// an already-completed receiver.
pub struct EventBus {
    tx: Mutex<Option<broadcast::Sender<WorkflowEvent>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            tx: Mutex::new(Some(tx)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        let guard = self.tx.lock().unwrap();
        match guard.as_ref() {
            Some(tx) => tx.subscribe(),
            None => {
                // Stream already completed: hand back a closed receiver.
                let (tx, rx) = broadcast::channel(1);
                drop(tx);
                rx
            }
        }
    }

    pub fn publish(&self, event: WorkflowEvent) {
        let guard = self.tx.lock().unwrap();
        if let Some(tx) = guard.as_ref() {
            // No subscribers is fine; the topic is fire-and-forget.
            let _ = tx.send(event);
        }
    }

    /// Complete the stream. Subscribers observe channel closure after
    /// draining buffered events.
    pub fn close(&self) {
        self.tx.lock().unwrap().take();
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().unwrap().is_none()
    }
}

/// Latest-value progress stream for one workflow instance.
pub struct ProgressStream {
    tx: Mutex<Option<watch::Sender<ProgressUpdate>>>,
    rx: watch::Receiver<ProgressUpdate>,
}

impl ProgressStream {
    pub fn new(initial: ProgressUpdate) -> Self {
        let (tx, rx) = watch::channel(initial);
        Self {
            tx: Mutex::new(Some(tx)),
            rx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ProgressUpdate> {
        self.rx.clone()
    }

    pub fn latest(&self) -> ProgressUpdate {
        self.rx.borrow().clone()
    }

    pub fn publish(&self, update: ProgressUpdate) {
        let guard = self.tx.lock().unwrap();
        if let Some(tx) = guard.as_ref() {
            tx.send_replace(update);
        }
    }

    /// Complete the stream; receivers observe closure.
    pub fn close(&self) {
        self.tx.lock().unwrap().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(instance: Uuid) -> WorkflowEvent {
        WorkflowEvent::WorkflowStarted {
            workflow_instance_id: instance,
            workflow_id: "wf".into(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn multiple_subscribers_see_the_same_events() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        let instance = Uuid::new_v4();
        bus.publish(started(instance));

        for rx in [&mut rx1, &mut rx2] {
            match rx.recv().await.unwrap() {
                WorkflowEvent::WorkflowStarted {
                    workflow_instance_id,
                    ..
                } => assert_eq!(workflow_instance_id, instance),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn close_completes_the_stream() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(started(Uuid::new_v4()));
        bus.close();

        // Buffered event still arrives, then the channel closes.
        assert!(rx.recv().await.is_ok());
        assert!(rx.recv().await.is_err());

        // Late subscription is already complete.
        let mut late = bus.subscribe();
        assert!(late.recv().await.is_err());
    }

    #[test]
    fn publish_after_close_is_ignored() {
        let bus = EventBus::new();
        bus.close();
        bus.publish(started(Uuid::new_v4()));
        assert!(bus.is_closed());
    }

    #[tokio::test]
    async fn progress_stream_holds_latest_snapshot() {
        let instance = Uuid::new_v4();
        let stream = ProgressStream::new(ProgressUpdate::empty(instance, 4));
        let mut rx = stream.subscribe();

        let mut update = ProgressUpdate::empty(instance, 4);
        update.nodes_completed = 2;
        update.percent_complete = 50.0;
        stream.publish(update);

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().percent_complete, 50.0);
        assert_eq!(stream.latest().nodes_completed, 2);

        stream.close();
        assert!(rx.changed().await.is_err());
    }
}
