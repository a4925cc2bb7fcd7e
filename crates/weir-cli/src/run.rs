use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Args;
use serde_json::Value;

use weir_core::checkpoint::{CheckpointStore, FileCheckpointStore};
use weir_core::loader::load_definition;
use weir_core::{WorkflowEngine, WorkflowEvent, WorkflowStatus};

const DEFAULT_CHECKPOINT_DIR: &str = ".weir/checkpoints";

#[derive(Args)]
pub struct RunArgs {
    /// Workflow definition file (.json, .yaml, or .yml).
    pub definition: PathBuf,

    /// Override a workflow variable (repeatable). Values parse as JSON,
    /// falling back to plain strings.
    #[arg(long = "var", value_name = "KEY=VALUE")]
    pub vars: Vec<String>,

    /// Directory for checkpoint artifacts.
    #[arg(long, default_value = DEFAULT_CHECKPOINT_DIR)]
    pub checkpoint_dir: PathBuf,

    /// Write a checkpoint under this id after the run finishes.
    #[arg(long)]
    pub checkpoint: Option<String>,

    /// Print events as JSON lines instead of human-readable text.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct ResumeArgs {
    /// Workflow definition file the checkpoint was taken from.
    pub definition: PathBuf,

    /// Checkpoint id to resume from.
    pub checkpoint_id: String,

    /// Directory for checkpoint artifacts.
    #[arg(long, default_value = DEFAULT_CHECKPOINT_DIR)]
    pub checkpoint_dir: PathBuf,

    /// Print events as JSON lines instead of human-readable text.
    #[arg(long)]
    pub json: bool,
}

pub async fn run(args: RunArgs) -> Result<()> {
    let mut definition = load_definition(&args.definition)
        .await
        .with_context(|| format!("failed to load {}", args.definition.display()))?;

    for var in &args.vars {
        let Some((key, raw)) = var.split_once('=') else {
            bail!("--var '{var}' is not in KEY=VALUE form");
        };
        let value = serde_json::from_str::<Value>(raw)
            .unwrap_or_else(|_| Value::String(raw.to_string()));
        definition.default_variables.insert(key.to_string(), value);
    }

    let store = Arc::new(FileCheckpointStore::new(&args.checkpoint_dir));
    let engine = WorkflowEngine::builder().checkpoint_store(store).build();

    let (ctx, events) = engine.start_with_events(definition).await?;
    println!("workflow instance {}", ctx.instance_id);

    let printer = tokio::spawn(print_events(events, args.json));
    let status = engine.wait(ctx.instance_id).await?;
    let _ = printer.await;

    if let Some(checkpoint_id) = &args.checkpoint {
        let meta = engine.checkpoint(ctx.instance_id, checkpoint_id.clone()).await?;
        println!(
            "checkpoint '{}' saved ({} nodes completed, {} pending messages)",
            meta.checkpoint_id, meta.completed_nodes, meta.pending_messages
        );
    }

    report_outcome(&engine, ctx.instance_id, status)
}

pub async fn resume(args: ResumeArgs) -> Result<()> {
    let definition = load_definition(&args.definition)
        .await
        .with_context(|| format!("failed to load {}", args.definition.display()))?;

    let store = Arc::new(FileCheckpointStore::new(&args.checkpoint_dir));
    let state = store
        .load(&args.checkpoint_id)
        .await
        .with_context(|| format!("failed to load checkpoint '{}'", args.checkpoint_id))?;

    let engine = WorkflowEngine::builder().checkpoint_store(store).build();
    let ctx = engine.resume_from_checkpoint(definition, state).await?;
    println!("resumed workflow instance {}", ctx.instance_id);

    let events = engine.subscribe_events(ctx.instance_id)?;
    let printer = tokio::spawn(print_events(events, args.json));
    let status = engine.wait(ctx.instance_id).await?;
    let _ = printer.await;

    report_outcome(&engine, ctx.instance_id, status)
}

fn report_outcome(
    engine: &WorkflowEngine,
    instance_id: uuid::Uuid,
    status: WorkflowStatus,
) -> Result<()> {
    let dead_letters = engine.dead_letters(instance_id).unwrap_or_default();
    if !dead_letters.is_empty() {
        println!("{} message(s) dead-lettered", dead_letters.len());
    }

    match status {
        WorkflowStatus::Completed => {
            println!("workflow completed");
            Ok(())
        }
        other => bail!("workflow finished with status {other:?}"),
    }
}

async fn print_events(
    mut events: tokio::sync::broadcast::Receiver<WorkflowEvent>,
    json: bool,
) {
    while let Ok(event) = events.recv().await {
        if json {
            if let Ok(line) = serde_json::to_string(&event) {
                println!("{line}");
            }
            continue;
        }
        match event {
            WorkflowEvent::NodeStarted { node_id, .. } => println!("  > {node_id} started"),
            WorkflowEvent::NodeCompleted {
                node_id,
                duration_ms,
                ..
            } => println!("  + {node_id} completed in {duration_ms}ms"),
            WorkflowEvent::NodeFailed {
                node_id,
                error,
                reason,
                ..
            } => println!("  ! {node_id} failed ({reason}): {error}"),
            WorkflowEvent::NodeCancelled { node_id, .. } => {
                println!("  x {node_id} cancelled")
            }
            WorkflowEvent::ProgressUpdated(update) => {
                tracing::debug!(
                    percent = update.percent_complete,
                    completed = update.nodes_completed,
                    "progress"
                );
            }
            WorkflowEvent::WorkflowStarted { workflow_id, .. } => {
                println!("workflow '{workflow_id}' started")
            }
            WorkflowEvent::WorkflowCompleted { .. }
            | WorkflowEvent::WorkflowFailed { .. }
            | WorkflowEvent::WorkflowCancelled { .. } => {}
        }
    }
}
