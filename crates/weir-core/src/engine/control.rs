//! Built-in bodies for control-flow node kinds.
//!
//! These run through the same executor pipeline as user bodies, so they
//! get the breaker/limiter/throttle/retry treatment for free. Each one
//! returns explicit emissions; the router does the rest.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::condition::{EvalScope, ExpressionEvaluator};
use crate::context::{NodeExecutionContext, WorkflowExecutionContext};
use crate::definition::{NodeConnection, NodeDefinition, SwitchCase, WorkflowDefinition};
use crate::engine::WorkflowEngine;
use crate::error::NodeError;
use crate::executor::{Emission, NodeInvocation};
use crate::instance::NodeInstanceStatus;

/// Port names used by the control-flow kinds.
pub const TRUE_BRANCH: &str = "TrueBranch";
pub const FALSE_BRANCH: &str = "FalseBranch";
pub const LOOP_BODY: &str = "LoopBody";

/// Invocation that fails immediately; used when a body reference cannot
/// be resolved.
pub struct FailingInvocation(pub NodeError);

#[async_trait]
impl NodeInvocation for FailingInvocation {
    async fn invoke(
        &self,
        _workflow: Arc<WorkflowExecutionContext>,
        _node: &mut NodeExecutionContext,
        _cancel: CancellationToken,
    ) -> std::result::Result<Vec<Emission>, NodeError> {
        Err(self.0.clone())
    }
}

// ---------------------------------------------------------------------------
// IfElse
// ---------------------------------------------------------------------------

pub struct IfElseInvocation {
    pub condition: String,
    pub evaluator: Arc<dyn ExpressionEvaluator>,
}

#[async_trait]
impl NodeInvocation for IfElseInvocation {
    async fn invoke(
        &self,
        workflow: Arc<WorkflowExecutionContext>,
        node: &mut NodeExecutionContext,
        _cancel: CancellationToken,
    ) -> std::result::Result<Vec<Emission>, NodeError> {
        let scope = EvalScope::new(&node.input_data, &workflow.variables);
        let verdict = self
            .evaluator
            .evaluate_bool(&self.condition, &scope)
            .map_err(|e| NodeError::new("condition", e.to_string()))?;

        node.output_data = node.input_data.clone();
        node.output_data
            .insert("condition_result".into(), Value::Bool(verdict));

        let port = if verdict { TRUE_BRANCH } else { FALSE_BRANCH };
        Ok(vec![Emission::complete_on(port, node.output_data.clone())])
    }
}

// ---------------------------------------------------------------------------
// ForEach
// ---------------------------------------------------------------------------

pub struct ForEachInvocation {
    pub collection: String,
    pub item_variable: String,
    pub evaluator: Arc<dyn ExpressionEvaluator>,
}

#[async_trait]
impl NodeInvocation for ForEachInvocation {
    async fn invoke(
        &self,
        workflow: Arc<WorkflowExecutionContext>,
        node: &mut NodeExecutionContext,
        _cancel: CancellationToken,
    ) -> std::result::Result<Vec<Emission>, NodeError> {
        let scope = EvalScope::new(&node.input_data, &workflow.variables);
        let items = self
            .evaluator
            .evaluate_items(&self.collection, &scope)
            .map_err(|e| NodeError::new("condition", e.to_string()))?;

        let mut emissions: Vec<Emission> = items
            .iter()
            .enumerate()
            .map(|(index, item)| Emission::next_on(LOOP_BODY, item.clone(), index))
            .collect();

        node.output_data
            .insert("item_count".into(), Value::from(items.len() as u64));
        // Empty collections skip the body and complete immediately.
        emissions.push(Emission::complete(node.output_data.clone()));
        Ok(emissions)
    }
}

// ---------------------------------------------------------------------------
// While
// ---------------------------------------------------------------------------

pub struct WhileInvocation {
    pub node_id: String,
    pub condition: String,
    pub max_iterations: u32,
    pub evaluator: Arc<dyn ExpressionEvaluator>,
    /// Shared per-run iteration counters, keyed by node id.
    pub iterations: Arc<Mutex<HashMap<String, u32>>>,
}

#[async_trait]
impl NodeInvocation for WhileInvocation {
    async fn invoke(
        &self,
        workflow: Arc<WorkflowExecutionContext>,
        node: &mut NodeExecutionContext,
        _cancel: CancellationToken,
    ) -> std::result::Result<Vec<Emission>, NodeError> {
        let scope = EvalScope::new(&node.input_data, &workflow.variables);
        let verdict = self
            .evaluator
            .evaluate_bool(&self.condition, &scope)
            .map_err(|e| NodeError::new("condition", e.to_string()))?;

        if !verdict {
            let completed = {
                let mut iterations = self.iterations.lock().unwrap();
                iterations.remove(&self.node_id).unwrap_or(0)
            };
            node.output_data
                .insert("iterations".into(), Value::from(completed));
            return Ok(vec![Emission::complete(node.output_data.clone())]);
        }

        let iteration = {
            let mut iterations = self.iterations.lock().unwrap();
            let count = iterations.entry(self.node_id.clone()).or_insert(0);
            *count += 1;
            *count
        };

        if iteration > self.max_iterations {
            return Err(NodeError::new(
                "infinite_loop",
                format!(
                    "exceeded {} iterations without the condition turning false",
                    self.max_iterations
                ),
            ));
        }

        debug!(node_id = %self.node_id, iteration, "while loop iterating");
        Ok(vec![Emission::next_on(
            LOOP_BODY,
            Value::Null,
            (iteration - 1) as usize,
        )])
    }
}

// ---------------------------------------------------------------------------
// Switch
// ---------------------------------------------------------------------------

pub struct SwitchInvocation {
    pub expression: String,
    pub cases: Vec<SwitchCase>,
    pub default_port: String,
    pub evaluator: Arc<dyn ExpressionEvaluator>,
}

impl SwitchInvocation {
    fn values_match(case_value: &Value, actual: &Value) -> bool {
        if case_value == actual {
            return true;
        }
        // Scalar forms compare by text, case-insensitively, so a numeric
        // case value matches a stringly-typed output and vice versa.
        match (case_value, actual) {
            (Value::Array(_) | Value::Object(_), _) | (_, Value::Array(_) | Value::Object(_)) => {
                false
            }
            _ => scalar_text(case_value).eq_ignore_ascii_case(&scalar_text(actual)),
        }
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl NodeInvocation for SwitchInvocation {
    async fn invoke(
        &self,
        workflow: Arc<WorkflowExecutionContext>,
        node: &mut NodeExecutionContext,
        _cancel: CancellationToken,
    ) -> std::result::Result<Vec<Emission>, NodeError> {
        let scope = EvalScope::new(&node.input_data, &workflow.variables);
        let actual = self
            .evaluator
            .evaluate_value(&self.expression, &scope)
            .map_err(|e| NodeError::new("condition", e.to_string()))?;

        // First matching case wins.
        let port = self
            .cases
            .iter()
            .find(|case| Self::values_match(&case.case_value, &actual))
            .map(|case| case.port.as_str())
            .unwrap_or(self.default_port.as_str());

        node.output_data = node.input_data.clone();
        node.output_data.insert("matched_value".into(), actual);
        Ok(vec![Emission::complete_on(port, node.output_data.clone())])
    }
}

// ---------------------------------------------------------------------------
// Timer
// ---------------------------------------------------------------------------

pub struct TimerInvocation {
    pub trigger_on_start: bool,
    pub delay_seconds: Option<u64>,
}

#[async_trait]
impl NodeInvocation for TimerInvocation {
    async fn invoke(
        &self,
        _workflow: Arc<WorkflowExecutionContext>,
        node: &mut NodeExecutionContext,
        _cancel: CancellationToken,
    ) -> std::result::Result<Vec<Emission>, NodeError> {
        if !self.trigger_on_start {
            if let Some(seconds) = self.delay_seconds {
                // The executor's outer select handles cancellation.
                tokio::time::sleep(Duration::from_secs(seconds)).await;
            }
        }
        node.output_data.insert("triggered".into(), Value::Bool(true));
        Ok(Vec::new())
    }
}

// ---------------------------------------------------------------------------
// Subflow
// ---------------------------------------------------------------------------

pub struct SubflowInvocation {
    pub engine: WorkflowEngine,
    pub definition: Arc<WorkflowDefinition>,
    /// Parent variable name -> child variable name.
    pub input_mapping: HashMap<String, String>,
    /// Child variable name -> parent variable name.
    pub output_mapping: HashMap<String, String>,
}

#[async_trait]
impl NodeInvocation for SubflowInvocation {
    async fn invoke(
        &self,
        workflow: Arc<WorkflowExecutionContext>,
        node: &mut NodeExecutionContext,
        cancel: CancellationToken,
    ) -> std::result::Result<Vec<Emission>, NodeError> {
        let mut child = (*self.definition).clone();
        // Deep copy on the boundary: values are cloned, never shared.
        for (parent_key, child_key) in &self.input_mapping {
            if let Some(value) = workflow.variables.get(parent_key) {
                child.default_variables.insert(child_key.clone(), value);
            }
        }

        let child_ctx = self
            .engine
            .start(child)
            .await
            .map_err(|e| NodeError::new("subflow", e.to_string()))?;

        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.engine.cancel(child_ctx.instance_id, "parent workflow cancelled");
                let _ = self.engine.wait(child_ctx.instance_id).await;
                return Err(NodeError::new("cancelled", "subflow cancelled"));
            }
            status = self.engine.wait(child_ctx.instance_id) => {
                status.map_err(|e| NodeError::new("subflow", e.to_string()))?
            }
        };

        match status {
            crate::context::WorkflowStatus::Completed => {
                for (child_key, parent_key) in &self.output_mapping {
                    if let Some(value) = child_ctx.variables.get(child_key) {
                        workflow.variables.set(parent_key.clone(), value.clone());
                        node.output_data.insert(parent_key.clone(), value);
                    }
                }
                Ok(Vec::new())
            }
            crate::context::WorkflowStatus::Cancelled => {
                Err(NodeError::new("cancelled", "subflow cancelled"))
            }
            other => Err(NodeError::new(
                "subflow_failed",
                format!("subflow finished with status {other:?}"),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Container
// ---------------------------------------------------------------------------

pub struct ContainerInvocation {
    pub engine: WorkflowEngine,
    pub parent_workflow_id: String,
    pub node_id: String,
    pub node_name: String,
    pub nodes: Vec<NodeDefinition>,
    pub connections: Vec<NodeConnection>,
}

#[async_trait]
impl NodeInvocation for ContainerInvocation {
    async fn invoke(
        &self,
        _workflow: Arc<WorkflowExecutionContext>,
        node: &mut NodeExecutionContext,
        cancel: CancellationToken,
    ) -> std::result::Result<Vec<Emission>, NodeError> {
        let mut child = WorkflowDefinition::new(
            format!("{}::{}", self.parent_workflow_id, self.node_id),
            &self.node_name,
        );
        child.nodes = self.nodes.clone();
        child.connections = self.connections.clone();
        // The only state crossing the boundary is the container's input.
        child.default_variables = node.input_data.clone();

        let child_ctx = self
            .engine
            .start(child)
            .await
            .map_err(|e| NodeError::new("container", e.to_string()))?;

        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.engine.cancel(child_ctx.instance_id, "parent workflow cancelled");
                let _ = self.engine.wait(child_ctx.instance_id).await;
                return Err(NodeError::new("cancelled", "container cancelled"));
            }
            status = self.engine.wait(child_ctx.instance_id) => {
                status.map_err(|e| NodeError::new("container", e.to_string()))?
            }
        };

        // Aggregate child outputs regardless of status so diagnostics
        // survive a failure.
        let child_instances = self
            .engine
            .instances(child_ctx.instance_id)
            .unwrap_or_default();
        for instance in &child_instances {
            if instance.status == NodeInstanceStatus::Completed {
                node.output_data.insert(
                    instance.node_id.clone(),
                    Value::Object(
                        instance
                            .context
                            .output_data
                            .iter()
                            .map(|(k, v)| (k.clone(), v.clone()))
                            .collect(),
                    ),
                );
            }
        }

        match status {
            crate::context::WorkflowStatus::Completed => Ok(Vec::new()),
            crate::context::WorkflowStatus::Cancelled => {
                Err(NodeError::new("cancelled", "container cancelled"))
            }
            other => Err(NodeError::new(
                "container_failed",
                format!("container subgraph finished with status {other:?}"),
            )),
        }
    }
}
