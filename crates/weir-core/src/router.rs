//! Edge-based message routing.
//!
//! The router owns a table keyed by source-node id. Delivery filters
//! edges by enablement, trigger type, and source port, evaluates edge
//! conditions against the emitted output, and enqueues into target
//! inboxes. Undeliverable messages go to the dead-letter queue; partial
//! fan-out failure is normal and only successes are counted.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::condition::{evaluate_condition, EvalScope};
use crate::context::WorkflowExecutionContext;
use crate::definition::NodeConnection;
use crate::message::{DeadLetterReason, NodeMessage};
use crate::queue::{DeadLetterQueue, QueueError};
use crate::{Result, WeirError};

/// What to do when a target inbox is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FullQueuePolicy {
    /// Wait for capacity (back-pressure), optionally bounded by
    /// [`MessageRouter::enqueue_timeout`].
    #[default]
    Block,
    /// Dead-letter immediately with `TargetQueueFull`.
    DeadLetter,
}

/// Routes messages along graph edges to node inboxes.
pub struct MessageRouter {
    routes: RwLock<HashMap<String, Vec<NodeConnection>>>,
    full_queue_policy: FullQueuePolicy,
    /// Upper bound on a blocking enqueue. `None` waits indefinitely.
    enqueue_timeout: Option<Duration>,
}

impl Default for MessageRouter {
    fn default() -> Self {
        Self::new(FullQueuePolicy::default(), None)
    }
}

impl MessageRouter {
    pub fn new(full_queue_policy: FullQueuePolicy, enqueue_timeout: Option<Duration>) -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
            full_queue_policy,
            enqueue_timeout,
        }
    }

    /// Register an edge. Duplicate `(source, target, port, trigger)` tuples
    /// collapse to a single route.
    pub fn add_route(&self, connection: NodeConnection) {
        let mut routes = self.routes.write().unwrap();
        let edges = routes
            .entry(connection.source_node_id.clone())
            .or_default();
        if !edges.iter().any(|e| e.same_edge(&connection)) {
            edges.push(connection);
        }
    }

    /// Remove every route from `source` to `target`.
    pub fn remove_route(&self, source: &str, target: &str) {
        let mut routes = self.routes.write().unwrap();
        if let Some(edges) = routes.get_mut(source) {
            edges.retain(|e| e.target_node_id != target);
            if edges.is_empty() {
                routes.remove(source);
            }
        }
    }

    /// Distinct target ids reachable from `source`.
    pub fn targets(&self, source: &str) -> Vec<String> {
        let routes = self.routes.read().unwrap();
        let mut targets: Vec<String> = routes
            .get(source)
            .map(|edges| edges.iter().map(|e| e.target_node_id.clone()).collect())
            .unwrap_or_default();
        targets.sort_unstable();
        targets.dedup();
        targets
    }

    pub fn clear(&self) {
        self.routes.write().unwrap().clear();
    }

    /// Total number of registered edges.
    pub fn route_count(&self) -> usize {
        self.routes.read().unwrap().values().map(Vec::len).sum()
    }

    /// Route `message` along matching edges. Returns the number of
    /// successful deliveries.
    pub async fn route(
        &self,
        message: &NodeMessage,
        context: &WorkflowExecutionContext,
        dlq: &DeadLetterQueue,
    ) -> usize {
        // Copy the matching edges out before any await.
        let mut edges: Vec<NodeConnection> = {
            let routes = self.routes.read().unwrap();
            match routes.get(&message.source_node_id) {
                Some(edges) => edges
                    .iter()
                    .filter(|e| Self::edge_matches(e, message))
                    .cloned()
                    .collect(),
                None => Vec::new(),
            }
        };
        edges.sort_by_key(|e| std::cmp::Reverse(e.priority));

        let output = message.payload.output_data();
        let mut delivered = 0;

        for edge in edges {
            if let Some(condition) = &edge.condition {
                let scope = EvalScope::new(&output, &context.variables);
                match evaluate_condition(condition, &scope) {
                    Ok(true) => {}
                    Ok(false) => {
                        trace!(
                            source = %edge.source_node_id,
                            target = %edge.target_node_id,
                            condition,
                            "edge condition false, skipping"
                        );
                        continue;
                    }
                    Err(err) => {
                        warn!(
                            source = %edge.source_node_id,
                            target = %edge.target_node_id,
                            condition,
                            error = %err,
                            "edge condition failed to evaluate"
                        );
                        dlq.add(
                            message.clone(),
                            edge.target_node_id.clone(),
                            DeadLetterReason::ConditionEvaluationError,
                            Some(err.to_string()),
                        );
                        continue;
                    }
                }
            }

            if self
                .deliver(message, &edge.target_node_id, context, dlq)
                .await
            {
                delivered += 1;
            }
        }

        debug!(
            source = %message.source_node_id,
            kind = ?message.message_type(),
            delivered,
            "routed message"
        );
        delivered
    }

    /// Deliver `message` to explicit targets, bypassing the routing table.
    pub async fn route_to(
        &self,
        message: &NodeMessage,
        targets: &[String],
        context: &WorkflowExecutionContext,
        dlq: &DeadLetterQueue,
    ) -> Result<usize> {
        if targets.is_empty() {
            return Err(WeirError::Routing(
                "route_to requires at least one target".into(),
            ));
        }

        let mut delivered = 0;
        for target in targets {
            if self.deliver(message, target, context, dlq).await {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    fn edge_matches(edge: &NodeConnection, message: &NodeMessage) -> bool {
        if !edge.is_enabled {
            return false;
        }
        if edge.trigger != message.message_type() {
            return false;
        }
        match &edge.source_port {
            Some(port) => message.source_port.as_deref() == Some(port.as_str()),
            None => true,
        }
    }

    async fn deliver(
        &self,
        message: &NodeMessage,
        target: &str,
        context: &WorkflowExecutionContext,
        dlq: &DeadLetterQueue,
    ) -> bool {
        let Some(inbox) = context.inbox(target) else {
            dlq.add(
                message.clone(),
                target,
                DeadLetterReason::TargetQueueNotFound,
                None,
            );
            return false;
        };

        let result = match self.full_queue_policy {
            FullQueuePolicy::Block => inbox.enqueue(message.clone(), self.enqueue_timeout).await,
            FullQueuePolicy::DeadLetter => inbox.try_enqueue(message.clone()),
        };

        match result {
            Ok(()) => true,
            Err(QueueError::Full(_)) | Err(QueueError::Timeout(_)) => {
                dlq.add(
                    message.clone(),
                    target,
                    DeadLetterReason::TargetQueueFull,
                    Some(format!("capacity {}", inbox.capacity())),
                );
                false
            }
            Err(QueueError::Closed(_)) => {
                dlq.add(
                    message.clone(),
                    target,
                    DeadLetterReason::WorkflowTerminated,
                    None,
                );
                false
            }
        }
    }
}
