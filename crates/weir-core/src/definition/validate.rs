//! Definition validation.
//!
//! Checks structural invariants, per-kind required fields, and graph
//! acyclicity. The one permitted cycle is a `Complete` edge feeding back
//! into a `While` node; validation marks such edges `loop_feedback` and
//! excludes them from the cycle check.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::definition::{NodeDefinition, NodeKind, WorkflowDefinition};
use crate::message::MessageType;
use crate::{Result, WeirError};

/// Validate `def` in place, collapsing duplicate edges and annotating
/// `While` feedback edges.
pub fn validate_definition(def: &mut WorkflowDefinition) -> Result<()> {
    if def.workflow_id.is_empty() {
        return Err(WeirError::Validation("workflow_id must not be empty".into()));
    }
    if def.nodes.is_empty() {
        return Err(WeirError::Validation(format!(
            "workflow '{}' has no nodes",
            def.workflow_id
        )));
    }

    let mut seen = HashSet::new();
    for node in &def.nodes {
        if node.id.is_empty() {
            return Err(WeirError::Validation("node id must not be empty".into()));
        }
        if !seen.insert(node.id.as_str()) {
            return Err(WeirError::Validation(format!(
                "duplicate node id '{}'",
                node.id
            )));
        }
        validate_node(node)?;
    }

    if let Some(entry) = &def.entry_point_node_id {
        if !seen.contains(entry.as_str()) {
            return Err(WeirError::Validation(format!(
                "entry point node '{entry}' does not exist"
            )));
        }
    }

    // Collapse duplicate (source, target, port, trigger) tuples.
    let mut deduped: Vec<crate::definition::NodeConnection> = Vec::new();
    for conn in def.connections.drain(..) {
        if !deduped.iter().any(|c| c.same_edge(&conn)) {
            deduped.push(conn);
        }
    }
    def.connections = deduped;

    let while_ids: HashSet<&str> = def
        .nodes
        .iter()
        .filter(|n| matches!(n.kind, NodeKind::While { .. }))
        .map(|n| n.id.as_str())
        .collect();

    for conn in &mut def.connections {
        if !seen.contains(conn.source_node_id.as_str()) {
            return Err(WeirError::Validation(format!(
                "connection references unknown source node '{}'",
                conn.source_node_id
            )));
        }
        if !seen.contains(conn.target_node_id.as_str()) {
            return Err(WeirError::Validation(format!(
                "connection references unknown target node '{}'",
                conn.target_node_id
            )));
        }
        conn.loop_feedback = conn.trigger == MessageType::Complete
            && while_ids.contains(conn.target_node_id.as_str());
    }

    check_acyclic(def)?;
    Ok(())
}

fn validate_node(node: &NodeDefinition) -> Result<()> {
    let invalid = |what: &str| {
        Err(WeirError::Validation(format!(
            "node '{}' ({}): {what}",
            node.id,
            node.kind.tag()
        )))
    };

    match &node.kind {
        NodeKind::Noop => {}
        NodeKind::Task { body } => {
            if body.is_empty() {
                return invalid("requires a body reference");
            }
        }
        NodeKind::Script { script } => {
            if script.is_empty() {
                return invalid("requires a script reference");
            }
        }
        NodeKind::IfElse { condition } => {
            if condition.is_empty() {
                return invalid("requires a condition expression");
            }
        }
        NodeKind::ForEach {
            collection,
            item_variable,
        } => {
            if collection.is_empty() {
                return invalid("requires a collection expression");
            }
            if item_variable.is_empty() {
                return invalid("requires an item variable name");
            }
        }
        NodeKind::While {
            condition,
            max_iterations,
        } => {
            if condition.is_empty() {
                return invalid("requires a condition expression");
            }
            if *max_iterations == 0 {
                return invalid("max_iterations must be at least 1");
            }
        }
        NodeKind::Switch {
            expression,
            cases,
            default_port,
        } => {
            if expression.is_empty() {
                return invalid("requires a switch expression");
            }
            if default_port.is_empty() {
                return invalid("requires a default port");
            }
            for case in cases {
                if case.port.is_empty() {
                    return invalid("every case requires a port name");
                }
            }
        }
        NodeKind::Subflow { definition, .. } => {
            let mut nested = (**definition).clone();
            nested
                .validate()
                .map_err(|e| WeirError::Validation(format!("node '{}' subflow: {e}", node.id)))?;
        }
        NodeKind::Timer {
            trigger_on_start,
            delay_seconds,
        } => {
            if !trigger_on_start && delay_seconds.is_none() {
                return invalid("requires trigger_on_start or delay_seconds");
            }
        }
        NodeKind::Container { nodes, connections } => {
            let mut nested = WorkflowDefinition::new(format!("{}::container", node.id), &node.name);
            nested.nodes = nodes.clone();
            nested.connections = connections.clone();
            nested
                .validate()
                .map_err(|e| WeirError::Validation(format!("node '{}' container: {e}", node.id)))?;
        }
    }

    if let Some(retry) = &node.retry {
        retry
            .validate()
            .map_err(|e| WeirError::Validation(format!("node '{}' retry policy: {e}", node.id)))?;
    }
    if let Some(breaker) = &node.circuit_breaker {
        breaker
            .validate()
            .map_err(|e| WeirError::Validation(format!("node '{}' breaker policy: {e}", node.id)))?;
    }
    Ok(())
}

/// Kahn's algorithm over enabled, non-feedback edges.
fn check_acyclic(def: &WorkflowDefinition) -> Result<()> {
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for node in &def.nodes {
        in_degree.insert(node.id.as_str(), 0);
        dependents.insert(node.id.as_str(), Vec::new());
    }

    for conn in &def.connections {
        if !conn.is_enabled || conn.loop_feedback {
            continue;
        }
        *in_degree.get_mut(conn.target_node_id.as_str()).unwrap() += 1;
        dependents
            .get_mut(conn.source_node_id.as_str())
            .unwrap()
            .push(conn.target_node_id.as_str());
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, &deg)| deg == 0)
        .map(|(&id, _)| id)
        .collect();

    let mut processed = 0;
    while let Some(id) = queue.pop_front() {
        processed += 1;
        for dep in &dependents[id] {
            let deg = in_degree.get_mut(dep).unwrap();
            *deg -= 1;
            if *deg == 0 {
                queue.push_back(dep);
            }
        }
    }

    if processed != def.nodes.len() {
        return Err(WeirError::Validation(format!(
            "workflow '{}' contains a dependency cycle",
            def.workflow_id
        )));
    }
    Ok(())
}
