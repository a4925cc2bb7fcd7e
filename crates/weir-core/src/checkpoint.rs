//! Checkpoint save/load for workflow resume.
//!
//! A checkpoint is a single JSON artifact: metadata, the serialized
//! workflow context (variables plus remaining inbox contents per node),
//! and every node-instance record. The file store names artifacts
//! `<sanitizedId>.checkpoint.json`, creates its directory on demand, and
//! ignores corrupted artifacts when listing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::WorkflowStatus;
use crate::instance::{NodeInstance, NodeInstanceStatus};
use crate::message::NodeMessage;
use crate::{Result, WeirError};

const CHECKPOINT_SUFFIX: &str = ".checkpoint.json";

/// Summary entry returned by `list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub checkpoint_id: String,
    pub workflow_instance_id: Uuid,
    pub workflow_id: String,
    pub created_at: DateTime<Utc>,
    pub total_nodes: usize,
    pub completed_nodes: usize,
    pub pending_messages: usize,
    pub size_bytes: u64,
}

/// Serialized form of a workflow execution context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializedContext {
    pub status: WorkflowStatus,
    pub variables: HashMap<String, Value>,
    /// Remaining inbox contents per node, FIFO order preserved.
    pub inboxes: HashMap<String, Vec<NodeMessage>>,
}

/// Full persisted state of one workflow instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointState {
    pub metadata: CheckpointMetadata,
    pub context: SerializedContext,
    /// Superset of every node invocation under this instance.
    pub node_instances: Vec<NodeInstance>,
}

impl CheckpointState {
    /// Recompute derived metadata counts from the payload.
    pub fn finalize(mut self) -> Self {
        self.metadata.completed_nodes = self
            .node_instances
            .iter()
            .filter(|i| i.status == NodeInstanceStatus::Completed)
            .count();
        self.metadata.pending_messages = self.context.inboxes.values().map(Vec::len).sum();
        self.metadata.size_bytes = serde_json::to_vec(&self.context)
            .map(|v| v.len() as u64)
            .unwrap_or(0)
            + serde_json::to_vec(&self.node_instances)
                .map(|v| v.len() as u64)
                .unwrap_or(0);
        self
    }
}

/// Storage backend for checkpoints.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, state: &CheckpointState) -> Result<()>;
    async fn load(&self, checkpoint_id: &str) -> Result<CheckpointState>;
    /// Metadata entries for one workflow instance, newest first.
    async fn list(&self, workflow_instance_id: Uuid) -> Result<Vec<CheckpointMetadata>>;
    async fn delete(&self, checkpoint_id: &str) -> Result<()>;
    /// Remove every checkpoint of the instance; returns how many.
    async fn delete_all(&self, workflow_instance_id: Uuid) -> Result<usize>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Checkpoint store backed by a map, for tests and embedders.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    states: Mutex<HashMap<String, CheckpointState>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, state: &CheckpointState) -> Result<()> {
        let mut states = self.states.lock().unwrap();
        states.insert(state.metadata.checkpoint_id.clone(), state.clone());
        Ok(())
    }

    async fn load(&self, checkpoint_id: &str) -> Result<CheckpointState> {
        let states = self.states.lock().unwrap();
        states
            .get(checkpoint_id)
            .cloned()
            .ok_or_else(|| WeirError::Checkpoint(format!("checkpoint '{checkpoint_id}' not found")))
    }

    async fn list(&self, workflow_instance_id: Uuid) -> Result<Vec<CheckpointMetadata>> {
        let states = self.states.lock().unwrap();
        let mut entries: Vec<CheckpointMetadata> = states
            .values()
            .filter(|s| s.metadata.workflow_instance_id == workflow_instance_id)
            .map(|s| s.metadata.clone())
            .collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(entries)
    }

    async fn delete(&self, checkpoint_id: &str) -> Result<()> {
        self.states.lock().unwrap().remove(checkpoint_id);
        Ok(())
    }

    async fn delete_all(&self, workflow_instance_id: Uuid) -> Result<usize> {
        let mut states = self.states.lock().unwrap();
        let before = states.len();
        states.retain(|_, s| s.metadata.workflow_instance_id != workflow_instance_id);
        Ok(before - states.len())
    }
}

// ---------------------------------------------------------------------------
// File-backed store
// ---------------------------------------------------------------------------

/// One JSON artifact per checkpoint id under a configurable directory.
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn artifact_path(&self, checkpoint_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}{CHECKPOINT_SUFFIX}", sanitize_id(checkpoint_id)))
    }

    async fn ensure_dir(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            WeirError::Checkpoint(format!(
                "failed to create checkpoint directory {}: {e}",
                self.dir.display()
            ))
        })
    }
}

/// Restrict checkpoint ids to filesystem-safe characters.
fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, state: &CheckpointState) -> Result<()> {
        self.ensure_dir().await?;

        let path = self.artifact_path(&state.metadata.checkpoint_id);
        let json = serde_json::to_string_pretty(state)
            .map_err(|e| WeirError::Checkpoint(format!("failed to serialize checkpoint: {e}")))?;

        // Write-then-rename keeps the artifact atomic: a crash mid-write
        // leaves only a temp file, which `list` ignores.
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &json)
            .await
            .map_err(|e| WeirError::Checkpoint(format!("failed to write checkpoint: {e}")))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| WeirError::Checkpoint(format!("failed to finalize checkpoint: {e}")))?;

        info!(
            checkpoint_id = %state.metadata.checkpoint_id,
            path = %path.display(),
            size_bytes = state.metadata.size_bytes,
            "checkpoint saved"
        );
        Ok(())
    }

    async fn load(&self, checkpoint_id: &str) -> Result<CheckpointState> {
        let path = self.artifact_path(checkpoint_id);
        let data = tokio::fs::read_to_string(&path).await.map_err(|e| {
            WeirError::Checkpoint(format!(
                "failed to read checkpoint '{checkpoint_id}': {e}"
            ))
        })?;
        serde_json::from_str(&data).map_err(|e| {
            WeirError::Checkpoint(format!(
                "failed to parse checkpoint '{checkpoint_id}': {e}"
            ))
        })
    }

    async fn list(&self, workflow_instance_id: Uuid) -> Result<Vec<CheckpointMetadata>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| WeirError::Checkpoint(format!("failed to read checkpoint dir: {e}")))?;

        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| WeirError::Checkpoint(format!("failed to read dir entry: {e}")))?
        {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with(CHECKPOINT_SUFFIX) {
                continue;
            }

            let Ok(data) = tokio::fs::read_to_string(&path).await else {
                continue;
            };
            match serde_json::from_str::<CheckpointState>(&data) {
                Ok(state) if state.metadata.workflow_instance_id == workflow_instance_id => {
                    entries.push(state.metadata);
                }
                Ok(_) => {}
                Err(e) => {
                    // Partially written or corrupted artifact: skip it.
                    warn!(path = %path.display(), error = %e, "ignoring unreadable checkpoint");
                }
            }
        }

        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(entries)
    }

    async fn delete(&self, checkpoint_id: &str) -> Result<()> {
        let path = self.artifact_path(checkpoint_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(checkpoint_id, "checkpoint deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(WeirError::Checkpoint(format!(
                "failed to delete checkpoint '{checkpoint_id}': {e}"
            ))),
        }
    }

    async fn delete_all(&self, workflow_instance_id: Uuid) -> Result<usize> {
        let entries = self.list(workflow_instance_id).await?;
        let mut deleted = 0;
        for meta in entries {
            self.delete(&meta.checkpoint_id).await?;
            deleted += 1;
        }
        Ok(deleted)
    }
}
