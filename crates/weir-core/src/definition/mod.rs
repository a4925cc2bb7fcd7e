//! Workflow definition model: the immutable input to the engine.
//!
//! A definition is a directed graph of [`NodeDefinition`]s joined by
//! [`NodeConnection`]s. Node kinds are a tagged union (`kind` + `config`
//! in the wire form) rather than a class hierarchy; the engine dispatches
//! on the tag.

mod validate;

pub use validate::validate_definition;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::breaker::CircuitBreakerPolicy;
use crate::message::MessageType;
use crate::retry::RetryPolicy;

/// Default bound for `While` iteration counts.
pub const DEFAULT_MAX_ITERATIONS: u32 = 1000;

fn default_max_iterations() -> u32 {
    DEFAULT_MAX_ITERATIONS
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Workflow definition
// ---------------------------------------------------------------------------

/// Immutable description of a workflow graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowDefinition {
    pub workflow_id: String,
    pub name: String,
    pub description: String,
    pub version: String,
    /// Explicit entry node. When unset, every node without an enabled
    /// incoming edge is an entry node.
    pub entry_point_node_id: Option<String>,
    /// Workflow-wide concurrent execution cap. 0 means unlimited.
    pub max_concurrency: usize,
    pub allow_pause: bool,
    /// Wall-clock deadline in seconds. 0 means no deadline.
    pub timeout_seconds: u64,
    pub nodes: Vec<NodeDefinition>,
    pub connections: Vec<NodeConnection>,
    pub default_variables: HashMap<String, Value>,
    pub metadata: HashMap<String, Value>,
}

impl WorkflowDefinition {
    pub fn new(workflow_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            name: name.into(),
            version: "1.0.0".to_string(),
            ..Default::default()
        }
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeDefinition> {
        self.nodes.iter().find(|n| n.id == node_id)
    }

    pub fn add_node(&mut self, node: NodeDefinition) -> &mut Self {
        self.nodes.push(node);
        self
    }

    /// Add a connection. Duplicate `(source, target, port, trigger)` tuples
    /// collapse to a single edge.
    pub fn add_connection(&mut self, connection: NodeConnection) -> &mut Self {
        let exists = self.connections.iter().any(|c| c.same_edge(&connection));
        if !exists {
            self.connections.push(connection);
        }
        self
    }

    /// Validate the graph and annotate `While` feedback edges.
    ///
    /// See [`validate_definition`] for the rules applied.
    pub fn validate(&mut self) -> crate::Result<()> {
        validate_definition(self)
    }

    /// Entry nodes: the explicit entry point when set, otherwise every node
    /// with no enabled incoming edge (loop-feedback edges excluded).
    pub fn entry_nodes(&self) -> Vec<&NodeDefinition> {
        if let Some(entry) = &self.entry_point_node_id {
            return self.nodes.iter().filter(|n| &n.id == entry).collect();
        }
        self.nodes
            .iter()
            .filter(|n| {
                !self
                    .connections
                    .iter()
                    .any(|c| c.is_enabled && !c.loop_feedback && c.target_node_id == n.id)
            })
            .collect()
    }

    /// Distinct enabled upstream source ids feeding `node_id`.
    /// Used by the `All` join policy.
    pub fn upstream_sources(&self, node_id: &str) -> Vec<&str> {
        let mut sources: Vec<&str> = self
            .connections
            .iter()
            .filter(|c| c.is_enabled && c.target_node_id == node_id)
            .map(|c| c.source_node_id.as_str())
            .collect();
        sources.sort_unstable();
        sources.dedup();
        sources
    }
}

// ---------------------------------------------------------------------------
// Node definition
// ---------------------------------------------------------------------------

/// Scheduling priority of a node, consumed by the concurrency limiter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodePriority {
    High,
    #[default]
    Normal,
    Low,
}

impl NodePriority {
    /// Bucket index used by the limiter's round-robin cursor.
    pub fn index(self) -> usize {
        match self {
            NodePriority::High => 0,
            NodePriority::Normal => 1,
            NodePriority::Low => 2,
        }
    }
}

/// How a node with several inbound edges decides it is ready.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinType {
    /// Any single inbound message triggers execution.
    #[default]
    Any,
    /// Wait for one message from every enabled upstream source.
    All,
}

/// One `{caseValue, port}` pair of a `Switch` node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchCase {
    pub case_value: Value,
    pub port: String,
}

/// Kind tag plus kind-specific configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "config", rename_all = "snake_case")]
pub enum NodeKind {
    /// Pass-through: completes immediately, echoing its input as output.
    #[default]
    Noop,
    /// Invokes a body registered under `body` in the body registry.
    Task { body: String },
    /// Invokes a script body; `script` is the script reference resolved by
    /// the host's script runtime (an external collaborator).
    Script { script: String },
    IfElse { condition: String },
    ForEach {
        collection: String,
        item_variable: String,
    },
    While {
        condition: String,
        #[serde(default = "default_max_iterations")]
        max_iterations: u32,
    },
    Switch {
        expression: String,
        cases: Vec<SwitchCase>,
        default_port: String,
    },
    /// Runs a nested workflow, mapping parent variables in and child
    /// outputs back (deep copy on both boundaries).
    Subflow {
        definition: Box<WorkflowDefinition>,
        #[serde(default)]
        input_mapping: HashMap<String, String>,
        #[serde(default)]
        output_mapping: HashMap<String, String>,
    },
    Timer {
        #[serde(default)]
        trigger_on_start: bool,
        #[serde(default)]
        delay_seconds: Option<u64>,
    },
    /// A self-contained subgraph executed by a nested engine instance.
    Container {
        nodes: Vec<NodeDefinition>,
        connections: Vec<NodeConnection>,
    },
}

impl NodeKind {
    /// Stable tag name for logs and events.
    pub fn tag(&self) -> &'static str {
        match self {
            NodeKind::Noop => "noop",
            NodeKind::Task { .. } => "task",
            NodeKind::Script { .. } => "script",
            NodeKind::IfElse { .. } => "if_else",
            NodeKind::ForEach { .. } => "for_each",
            NodeKind::While { .. } => "while",
            NodeKind::Switch { .. } => "switch",
            NodeKind::Subflow { .. } => "subflow",
            NodeKind::Timer { .. } => "timer",
            NodeKind::Container { .. } => "container",
        }
    }
}

/// A unit of work in the graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub id: String,
    pub name: String,
    #[serde(flatten)]
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerPolicy>,
    #[serde(default)]
    pub priority: NodePriority,
    /// Per-node concurrent execution cap. 0 means unthrottled.
    #[serde(default)]
    pub max_concurrent_executions: u32,
    #[serde(default)]
    pub join: JoinType,
    /// Routed a synthetic `Complete` when this node fails terminally.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_node_id: Option<String>,
    /// Carried for compensation orchestration by callers; the engine does
    /// not run compensations itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation_node_id: Option<String>,
    /// Free-form configuration surfaced to node bodies.
    #[serde(default)]
    pub configuration: HashMap<String, Value>,
}

impl NodeDefinition {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            kind,
            retry: None,
            circuit_breaker: None,
            priority: NodePriority::default(),
            max_concurrent_executions: 0,
            join: JoinType::default(),
            fallback_node_id: None,
            compensation_node_id: None,
            configuration: HashMap::new(),
        }
    }

    pub fn noop(id: impl Into<String>) -> Self {
        Self::new(id, NodeKind::Noop)
    }
}

// ---------------------------------------------------------------------------
// Connections
// ---------------------------------------------------------------------------

/// A directed edge carrying messages from source to target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConnection {
    pub source_node_id: String,
    pub target_node_id: String,
    #[serde(default = "NodeConnection::default_trigger")]
    pub trigger: MessageType,
    /// Only match messages emitted on this named port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_port: Option<String>,
    /// Optional condition in the router's boolean mini-grammar.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default = "default_true")]
    pub is_enabled: bool,
    #[serde(default)]
    pub priority: i32,
    /// Set during validation: this edge is the permitted `Complete` feedback
    /// into a `While` node and is excluded from cycle detection.
    #[serde(default)]
    pub loop_feedback: bool,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl NodeConnection {
    fn default_trigger() -> MessageType {
        MessageType::Complete
    }

    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source_node_id: source.into(),
            target_node_id: target.into(),
            trigger: MessageType::Complete,
            source_port: None,
            condition: None,
            is_enabled: true,
            priority: 0,
            loop_feedback: false,
            metadata: HashMap::new(),
        }
    }

    pub fn on(mut self, trigger: MessageType) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn from_port(mut self, port: impl Into<String>) -> Self {
        self.source_port = Some(port.into());
        self
    }

    pub fn when(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.is_enabled = false;
        self
    }

    /// Identity for duplicate collapse: `(source, target, port, trigger)`.
    pub fn same_edge(&self, other: &NodeConnection) -> bool {
        self.source_node_id == other.source_node_id
            && self.target_node_id == other.target_node_id
            && self.source_port == other.source_port
            && self.trigger == other.trigger
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_connections_collapse() {
        let mut def = WorkflowDefinition::new("wf", "Test");
        def.add_node(NodeDefinition::noop("a"))
            .add_node(NodeDefinition::noop("b"));
        def.add_connection(NodeConnection::new("a", "b"));
        def.add_connection(NodeConnection::new("a", "b"));
        assert_eq!(def.connections.len(), 1);

        // Different port is a different edge.
        def.add_connection(NodeConnection::new("a", "b").from_port("TrueBranch"));
        assert_eq!(def.connections.len(), 2);
    }

    #[test]
    fn entry_nodes_default_to_unfed_nodes() {
        let mut def = WorkflowDefinition::new("wf", "Test");
        def.add_node(NodeDefinition::noop("a"))
            .add_node(NodeDefinition::noop("b"))
            .add_node(NodeDefinition::noop("c"));
        def.add_connection(NodeConnection::new("a", "b"));

        let entries: Vec<&str> = def.entry_nodes().iter().map(|n| n.id.as_str()).collect();
        assert_eq!(entries, vec!["a", "c"]);
    }

    #[test]
    fn explicit_entry_point_wins() {
        let mut def = WorkflowDefinition::new("wf", "Test");
        def.add_node(NodeDefinition::noop("a"))
            .add_node(NodeDefinition::noop("b"));
        def.entry_point_node_id = Some("b".to_string());

        let entries: Vec<&str> = def.entry_nodes().iter().map(|n| n.id.as_str()).collect();
        assert_eq!(entries, vec!["b"]);
    }

    #[test]
    fn upstream_sources_are_distinct_and_sorted() {
        let mut def = WorkflowDefinition::new("wf", "Test");
        for id in ["a", "b", "j"] {
            def.add_node(NodeDefinition::noop(id));
        }
        def.add_connection(NodeConnection::new("b", "j"));
        def.add_connection(NodeConnection::new("a", "j"));
        def.add_connection(NodeConnection::new("a", "j").on(MessageType::Fail));

        assert_eq!(def.upstream_sources("j"), vec!["a", "b"]);
    }

    #[test]
    fn node_kind_serde_round_trip() {
        let node = NodeDefinition::new(
            "loop",
            NodeKind::ForEach {
                collection: "variables.items".into(),
                item_variable: "item".into(),
            },
        );
        let json = serde_json::to_string(&node).unwrap();
        assert!(json.contains("\"kind\":\"for_each\""));

        let back: NodeDefinition = serde_json::from_str(&json).unwrap();
        match back.kind {
            NodeKind::ForEach { item_variable, .. } => assert_eq!(item_variable, "item"),
            other => panic!("expected ForEach, got {:?}", other),
        }
    }

    #[test]
    fn while_default_max_iterations_applies() {
        let json = r#"{"id":"w","name":"w","kind":"while","config":{"condition":"true"}}"#;
        let node: NodeDefinition = serde_json::from_str(json).unwrap();
        match node.kind {
            NodeKind::While { max_iterations, .. } => {
                assert_eq!(max_iterations, DEFAULT_MAX_ITERATIONS)
            }
            other => panic!("expected While, got {:?}", other),
        }
    }
}
