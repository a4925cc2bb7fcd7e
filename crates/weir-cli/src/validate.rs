use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use weir_core::loader::load_definition;

#[derive(Args)]
pub struct ValidateArgs {
    /// Workflow definition file (.json, .yaml, or .yml).
    pub definition: PathBuf,
}

pub async fn validate(args: ValidateArgs) -> Result<()> {
    let definition = load_definition(&args.definition)
        .await
        .with_context(|| format!("validation failed for {}", args.definition.display()))?;

    let entry_ids: Vec<&str> = definition
        .entry_nodes()
        .iter()
        .map(|n| n.id.as_str())
        .collect();
    let feedback_edges = definition
        .connections
        .iter()
        .filter(|c| c.loop_feedback)
        .count();

    println!("workflow '{}' is valid", definition.workflow_id);
    println!("  nodes:       {}", definition.nodes.len());
    println!("  connections: {}", definition.connections.len());
    println!("  entry nodes: {}", entry_ids.join(", "));
    if feedback_edges > 0 {
        println!("  loop feedback edges: {feedback_edges}");
    }
    if definition.max_concurrency > 0 {
        println!("  max concurrency: {}", definition.max_concurrency);
    }
    if definition.timeout_seconds > 0 {
        println!("  timeout: {}s", definition.timeout_seconds);
    }
    Ok(())
}
