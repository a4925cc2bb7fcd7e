//! Inter-node messages and the dead-letter record.
//!
//! Every edge traversal carries a `NodeMessage`. The payload union mirrors
//! the trigger types an edge can subscribe to; `message_type()` is what the
//! router matches against `NodeConnection::trigger`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Pseudo source id used for the synthetic message that seeds entry nodes.
pub const START_SOURCE: &str = "__start__";

/// Trigger classification of a message, matched against edge subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Complete,
    Fail,
    Progress,
    Next,
    Custom,
}

/// Payload union for inter-node messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePayload {
    /// Node finished successfully.
    Complete {
        duration_ms: u64,
        #[serde(default)]
        output: HashMap<String, Value>,
    },
    /// Node failed terminally (retries exhausted or not retryable).
    Fail {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_kind: Option<String>,
    },
    /// In-flight status report.
    Progress { status: String, percent: f64 },
    /// Loop iteration feed (also the synthetic start message).
    Next { item: Value, item_index: usize },
    /// Application-defined message.
    Custom {
        name: String,
        #[serde(default)]
        data: Value,
    },
}

impl MessagePayload {
    pub fn message_type(&self) -> MessageType {
        match self {
            MessagePayload::Complete { .. } => MessageType::Complete,
            MessagePayload::Fail { .. } => MessageType::Fail,
            MessagePayload::Progress { .. } => MessageType::Progress,
            MessagePayload::Next { .. } => MessageType::Next,
            MessagePayload::Custom { .. } => MessageType::Custom,
        }
    }

    /// Output data carried by the payload, used to build downstream input.
    pub fn output_data(&self) -> HashMap<String, Value> {
        match self {
            MessagePayload::Complete { output, .. } => output.clone(),
            MessagePayload::Next { item, item_index } => {
                let mut map = HashMap::new();
                map.insert("item".to_string(), item.clone());
                map.insert("item_index".to_string(), Value::from(*item_index as u64));
                map
            }
            MessagePayload::Fail { error, error_kind } => {
                let mut map = HashMap::new();
                map.insert("error".to_string(), Value::String(error.clone()));
                if let Some(kind) = error_kind {
                    map.insert("error_kind".to_string(), Value::String(kind.clone()));
                }
                map
            }
            MessagePayload::Progress { status, percent } => {
                let mut map = HashMap::new();
                map.insert("status".to_string(), Value::String(status.clone()));
                map.insert("percent".to_string(), Value::from(*percent));
                map
            }
            MessagePayload::Custom { data, .. } => {
                let mut map = HashMap::new();
                map.insert("data".to_string(), data.clone());
                map
            }
        }
    }
}

/// A message travelling between nodes of one workflow instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMessage {
    pub message_id: Uuid,
    pub source_node_id: String,
    pub workflow_instance_id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Named outgoing channel on the source node, if any (`TrueBranch`,
    /// `LoopBody`, ...). Edges with a `source_port` only match messages
    /// emitted on that port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_port: Option<String>,
    pub payload: MessagePayload,
}

impl NodeMessage {
    pub fn new(
        source_node_id: impl Into<String>,
        workflow_instance_id: Uuid,
        payload: MessagePayload,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            source_node_id: source_node_id.into(),
            workflow_instance_id,
            timestamp: Utc::now(),
            source_port: None,
            payload,
        }
    }

    pub fn with_port(mut self, port: impl Into<String>) -> Self {
        self.source_port = Some(port.into());
        self
    }

    /// The synthetic message that seeds an entry node.
    pub fn start(workflow_instance_id: Uuid) -> Self {
        Self::new(
            START_SOURCE,
            workflow_instance_id,
            MessagePayload::Next {
                item: Value::Null,
                item_index: 0,
            },
        )
    }

    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }
}

/// Why a message could not be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    TargetQueueNotFound,
    TargetQueueFull,
    ConditionEvaluationError,
    WorkflowTerminated,
}

/// An undeliverable message, parked on the dead-letter queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub message: NodeMessage,
    pub target_node_id: String,
    pub reason: DeadLetterReason,
    /// Human-readable detail (condition parse error text, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub dead_lettered_at: DateTime<Utc>,
}
