//! Per-instance execution state: workflow context, shared variables, and
//! the per-invocation node context.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::queue::NodeQueue;

/// Aggregate status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
    Paused,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

// ---------------------------------------------------------------------------
// Shared variable map
// ---------------------------------------------------------------------------

/// Workflow-scope shared state.
///
/// Concurrently readable and writable with per-key atomicity and no
/// cross-key transactions. Node bodies needing compound updates must
/// serialize themselves.
#[derive(Debug, Default)]
pub struct WorkflowVariables {
    map: DashMap<String, Value>,
}

impl WorkflowVariables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(initial: HashMap<String, Value>) -> Self {
        let vars = Self::new();
        for (k, v) in initial {
            vars.map.insert(k, v);
        }
        vars
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.map.get(key).map(|v| v.value().clone())
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.map.insert(key.into(), value);
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.map.remove(key).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Consistent-per-key copy of the map, used for checkpoints and
    /// subflow boundaries.
    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.map
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Workflow execution context
// ---------------------------------------------------------------------------

/// Live state of one workflow instance.
///
/// Created by the engine on start, shared with executors and the router,
/// and disposed at terminal status (which completes the event and progress
/// streams).
pub struct WorkflowExecutionContext {
    pub instance_id: Uuid,
    pub workflow_id: String,
    pub started_at: DateTime<Utc>,
    pub variables: Arc<WorkflowVariables>,
    /// One bounded inbox per node, shared by the engine (dequeue) and the
    /// router (enqueue).
    pub inboxes: HashMap<String, Arc<NodeQueue>>,
    /// Cancelling this token aborts every in-flight executor.
    pub cancellation: CancellationToken,
    status_tx: watch::Sender<WorkflowStatus>,
    ended_at: std::sync::Mutex<Option<DateTime<Utc>>>,
}

impl WorkflowExecutionContext {
    pub fn new(
        workflow_id: impl Into<String>,
        variables: Arc<WorkflowVariables>,
        inboxes: HashMap<String, Arc<NodeQueue>>,
    ) -> Self {
        let (status_tx, _) = watch::channel(WorkflowStatus::Running);
        Self {
            instance_id: Uuid::new_v4(),
            workflow_id: workflow_id.into(),
            started_at: Utc::now(),
            variables,
            inboxes,
            cancellation: CancellationToken::new(),
            status_tx,
            ended_at: std::sync::Mutex::new(None),
        }
    }

    pub fn status(&self) -> WorkflowStatus {
        *self.status_tx.borrow()
    }

    /// Subscribe to status changes; used by `wait` and tests.
    pub fn watch_status(&self) -> watch::Receiver<WorkflowStatus> {
        self.status_tx.subscribe()
    }

    pub fn set_status(&self, status: WorkflowStatus) {
        if status.is_terminal() {
            let mut ended = self.ended_at.lock().unwrap();
            ended.get_or_insert_with(Utc::now);
        }
        // send_replace never fails even with no receivers.
        self.status_tx.send_replace(status);
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        *self.ended_at.lock().unwrap()
    }

    pub fn inbox(&self, node_id: &str) -> Option<Arc<NodeQueue>> {
        self.inboxes.get(node_id).cloned()
    }
}

// ---------------------------------------------------------------------------
// Node execution context
// ---------------------------------------------------------------------------

/// Per-invocation scratch state handed to a node body.
///
/// `input_data` is merged from the inbound message(s); `output_data` is
/// populated by the body and propagated downstream; `local_variables` are
/// invocation-private and never persisted across iterations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeExecutionContext {
    #[serde(default)]
    pub input_data: HashMap<String, Value>,
    #[serde(default)]
    pub output_data: HashMap<String, Value>,
    #[serde(default)]
    pub local_variables: HashMap<String, Value>,
}

impl NodeExecutionContext {
    pub fn from_input(input_data: HashMap<String, Value>) -> Self {
        Self {
            input_data,
            ..Default::default()
        }
    }
}
