use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use uuid::Uuid;

use weir_core::checkpoint::{CheckpointStore, FileCheckpointStore};

#[derive(Args)]
pub struct StoreArgs {
    /// Directory holding checkpoint artifacts.
    #[arg(long, default_value = ".weir/checkpoints")]
    pub checkpoint_dir: PathBuf,
}

#[derive(Subcommand)]
pub enum CheckpointCommand {
    /// List checkpoints for a workflow instance, newest first.
    List {
        /// Workflow instance id.
        instance_id: Uuid,
        #[command(flatten)]
        store: StoreArgs,
    },
    /// Show full details of one checkpoint.
    Show {
        checkpoint_id: String,
        #[command(flatten)]
        store: StoreArgs,
    },
    /// Delete one checkpoint.
    Delete {
        checkpoint_id: String,
        #[command(flatten)]
        store: StoreArgs,
    },
    /// Delete every checkpoint of a workflow instance.
    DeleteAll {
        instance_id: Uuid,
        #[command(flatten)]
        store: StoreArgs,
    },
}

pub async fn checkpoints(command: CheckpointCommand) -> Result<()> {
    match command {
        CheckpointCommand::List { instance_id, store } => {
            let store = FileCheckpointStore::new(&store.checkpoint_dir);
            let entries = store.list(instance_id).await?;
            if entries.is_empty() {
                println!("no checkpoints for instance {instance_id}");
                return Ok(());
            }
            for meta in entries {
                println!(
                    "{}  {}  {}/{} nodes done, {} pending messages, {} bytes",
                    meta.created_at.to_rfc3339(),
                    meta.checkpoint_id,
                    meta.completed_nodes,
                    meta.total_nodes,
                    meta.pending_messages,
                    meta.size_bytes
                );
            }
            Ok(())
        }
        CheckpointCommand::Show {
            checkpoint_id,
            store,
        } => {
            let store = FileCheckpointStore::new(&store.checkpoint_dir);
            let state = store
                .load(&checkpoint_id)
                .await
                .with_context(|| format!("failed to load checkpoint '{checkpoint_id}'"))?;
            println!("{}", serde_json::to_string_pretty(&state)?);
            Ok(())
        }
        CheckpointCommand::Delete {
            checkpoint_id,
            store,
        } => {
            let store = FileCheckpointStore::new(&store.checkpoint_dir);
            store.delete(&checkpoint_id).await?;
            println!("deleted '{checkpoint_id}'");
            Ok(())
        }
        CheckpointCommand::DeleteAll { instance_id, store } => {
            let store = FileCheckpointStore::new(&store.checkpoint_dir);
            let removed = store.delete_all(instance_id).await?;
            println!("deleted {removed} checkpoint(s) for instance {instance_id}");
            Ok(())
        }
    }
}
