//! Node invocation records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::NodeExecutionContext;
use crate::message::NodeMessage;

/// Status of one node invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeInstanceStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Skipped,
}

/// One record per node invocation.
///
/// The triggering message is retained so a checkpoint taken while the
/// node was running can re-queue it on resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInstance {
    pub instance_id: Uuid,
    pub node_id: String,
    pub workflow_instance_id: Uuid,
    pub status: NodeInstanceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub context: NodeExecutionContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_message: Option<NodeMessage>,
}

impl NodeInstance {
    pub fn new(node_id: impl Into<String>, workflow_instance_id: Uuid) -> Self {
        Self {
            instance_id: Uuid::new_v4(),
            node_id: node_id.into(),
            workflow_instance_id,
            status: NodeInstanceStatus::Pending,
            started_at: None,
            ended_at: None,
            context: NodeExecutionContext::default(),
            error: None,
            error_kind: None,
            trigger_message: None,
        }
    }

    /// `end - start`, or `None` if either timestamp is unset.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    pub fn mark_running(&mut self) {
        self.status = NodeInstanceStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_completed(&mut self) {
        self.status = NodeInstanceStatus::Completed;
        self.ended_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: impl Into<String>, kind: Option<String>) {
        self.status = NodeInstanceStatus::Failed;
        self.ended_at = Some(Utc::now());
        self.error = Some(error.into());
        self.error_kind = kind;
    }

    pub fn mark_cancelled(&mut self) {
        self.status = NodeInstanceStatus::Cancelled;
        self.ended_at = Some(Utc::now());
    }
}
