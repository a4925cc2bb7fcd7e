//! Node execution pipeline.
//!
//! One executor invocation drives one node run end to end: circuit
//! breaker gate, concurrency slot at node priority, throttle slot, then
//! the retry loop around the body. Terminal messages are returned to the
//! dispatcher for routing; slots release throttle-first, idempotently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::breaker::CircuitBreakerManager;
use crate::context::{NodeExecutionContext, WorkflowExecutionContext};
use crate::definition::NodeDefinition;
use crate::error::NodeError;
use crate::events::{EventBus, WorkflowEvent};
use crate::instance::{NodeInstance, NodeInstanceStatus};
use crate::limiter::ConcurrencyLimiter;
use crate::message::{MessagePayload, NodeMessage};
use crate::throttle::NodeThrottler;

/// A pluggable node body: the single operation a Task/Script node runs.
///
/// Bodies read `node.input_data`, write `node.output_data`, and must be
/// cancellation-aware for long work.
#[async_trait]
pub trait NodeBody: Send + Sync {
    async fn execute(
        &self,
        workflow: Arc<WorkflowExecutionContext>,
        node: &mut NodeExecutionContext,
        cancel: CancellationToken,
    ) -> std::result::Result<(), NodeError>;
}

/// Pass-through body: echoes input to output.
pub struct NoopBody;

#[async_trait]
impl NodeBody for NoopBody {
    async fn execute(
        &self,
        _workflow: Arc<WorkflowExecutionContext>,
        node: &mut NodeExecutionContext,
        _cancel: CancellationToken,
    ) -> std::result::Result<(), NodeError> {
        node.output_data = node.input_data.clone();
        Ok(())
    }
}

/// Maps body references (Task `body`, Script `script`) to implementations.
#[derive(Default)]
pub struct BodyRegistry {
    bodies: HashMap<String, Arc<dyn NodeBody>>,
}

impl BodyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, body: Arc<dyn NodeBody>) {
        self.bodies.insert(name.into(), body);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn NodeBody>> {
        self.bodies.get(name).cloned()
    }
}

// ---------------------------------------------------------------------------
// Invocation seam
// ---------------------------------------------------------------------------

/// An outbound message produced by a node run, before routing.
#[derive(Debug, Clone)]
pub struct Emission {
    pub port: Option<String>,
    pub payload: MessagePayload,
}

impl Emission {
    pub fn complete(output: HashMap<String, Value>) -> Self {
        Self {
            port: None,
            payload: MessagePayload::Complete {
                duration_ms: 0,
                output,
            },
        }
    }

    pub fn complete_on(port: impl Into<String>, output: HashMap<String, Value>) -> Self {
        Self {
            port: Some(port.into()),
            ..Self::complete(output)
        }
    }

    pub fn next_on(port: impl Into<String>, item: Value, item_index: usize) -> Self {
        Self {
            port: Some(port.into()),
            payload: MessagePayload::Next { item, item_index },
        }
    }
}

/// What the executor actually runs: either a registry body or a built-in
/// control-flow evaluation supplied by the engine.
///
/// An empty emission list means "default `Complete` carrying the node's
/// output data"; control-flow bodies return explicit ported emissions.
#[async_trait]
pub trait NodeInvocation: Send + Sync {
    async fn invoke(
        &self,
        workflow: Arc<WorkflowExecutionContext>,
        node: &mut NodeExecutionContext,
        cancel: CancellationToken,
    ) -> std::result::Result<Vec<Emission>, NodeError>;
}

/// Adapts a [`NodeBody`] to the invocation seam.
pub struct BodyInvocation(pub Arc<dyn NodeBody>);

#[async_trait]
impl NodeInvocation for BodyInvocation {
    async fn invoke(
        &self,
        workflow: Arc<WorkflowExecutionContext>,
        node: &mut NodeExecutionContext,
        cancel: CancellationToken,
    ) -> std::result::Result<Vec<Emission>, NodeError> {
        self.0.execute(workflow, node, cancel).await?;
        Ok(Vec::new())
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Inbound trigger for one node run.
#[derive(Debug, Clone)]
pub struct TriggerInput {
    /// The primary message (retained on the instance for resume).
    pub message: NodeMessage,
    /// Merged input data (one message for `Any`, one per upstream for `All`).
    pub input_data: HashMap<String, Value>,
}

impl TriggerInput {
    pub fn from_message(message: NodeMessage) -> Self {
        let input_data = message.payload.output_data();
        Self {
            message,
            input_data,
        }
    }
}

/// Result of one node run, handed back to the dispatcher.
pub struct ExecutionOutcome {
    pub instance_id: Uuid,
    pub node_id: String,
    pub status: NodeInstanceStatus,
    pub emissions: Vec<Emission>,
    /// Deliver a synthesized `Complete` to this node on terminal failure.
    pub fallback_to: Option<String>,
}

/// Drives single node runs for one workflow instance.
pub struct NodeExecutor {
    pub context: Arc<WorkflowExecutionContext>,
    pub limiter: Arc<ConcurrencyLimiter>,
    pub throttler: Arc<NodeThrottler>,
    pub breakers: Arc<CircuitBreakerManager>,
    pub events: Arc<EventBus>,
    pub instances: Arc<Mutex<Vec<NodeInstance>>>,
}

impl NodeExecutor {
    /// Run `node` once (including retries) and return its terminal outcome.
    pub async fn execute(
        &self,
        node: &NodeDefinition,
        trigger: TriggerInput,
        invocation: Arc<dyn NodeInvocation>,
    ) -> ExecutionOutcome {
        let workflow_instance = self.context.instance_id;
        let mut instance = NodeInstance::new(&node.id, workflow_instance);
        instance.trigger_message = Some(trigger.message.clone());
        let instance_id = instance.instance_id;

        // Breaker gate comes before any slot acquisition.
        if !self.breakers.allow_request(&node.id) {
            warn!(node_id = %node.id, "request rejected: circuit open");
            instance.mark_failed("circuit breaker open", Some("circuit_open".into()));
            self.record(instance);
            self.events.publish(WorkflowEvent::NodeFailed {
                node_instance_id: instance_id,
                node_id: node.id.clone(),
                workflow_instance_id: workflow_instance,
                error: "circuit breaker open".into(),
                reason: "circuit_open".into(),
                timestamp: Utc::now(),
            });
            return ExecutionOutcome {
                instance_id,
                node_id: node.id.clone(),
                status: NodeInstanceStatus::Failed,
                emissions: vec![Emission {
                    port: None,
                    payload: MessagePayload::Fail {
                        error: "circuit breaker open".into(),
                        error_kind: Some("circuit_open".into()),
                    },
                }],
                fallback_to: node.fallback_node_id.clone(),
            };
        }

        // Cancellation must reach queued waiters, not only running bodies.
        let cancel = self.context.cancellation.child_token();

        let mut concurrency_slot = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return self.cancelled_outcome(instance, "workflow cancelled".into());
            }
            slot = self.limiter.acquire(node.priority) => match slot {
                Ok(slot) => slot,
                Err(err) => return self.cancelled_outcome(instance, err.to_string()),
            },
        };

        let mut throttle_slot = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                concurrency_slot.release();
                return self.cancelled_outcome(instance, "workflow cancelled".into());
            }
            slot = self.throttler.acquire(&node.id) => match slot {
                Ok(slot) => slot,
                Err(err) => {
                    concurrency_slot.release();
                    return self.cancelled_outcome(instance, err.to_string());
                }
            },
        };

        instance.mark_running();
        instance.context = NodeExecutionContext::from_input(trigger.input_data.clone());
        self.record(instance.clone());
        self.events.publish(WorkflowEvent::NodeStarted {
            node_instance_id: instance_id,
            node_id: node.id.clone(),
            workflow_instance_id: workflow_instance,
            attempt: 0,
            timestamp: Utc::now(),
        });

        let started = tokio::time::Instant::now();
        let mut attempt: u32 = 0;

        let outcome = loop {
            let mut node_ctx = NodeExecutionContext::from_input(trigger.input_data.clone());

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = invocation.invoke(
                    Arc::clone(&self.context),
                    &mut node_ctx,
                    cancel.clone(),
                ) => Some(result),
            };

            match result {
                None => {
                    instance.mark_cancelled();
                    instance.context = node_ctx;
                    self.update(&instance);
                    self.events.publish(WorkflowEvent::NodeCancelled {
                        node_instance_id: instance_id,
                        node_id: node.id.clone(),
                        workflow_instance_id: workflow_instance,
                        timestamp: Utc::now(),
                    });
                    break ExecutionOutcome {
                        instance_id,
                        node_id: node.id.clone(),
                        status: NodeInstanceStatus::Cancelled,
                        emissions: Vec::new(),
                        fallback_to: None,
                    };
                }
                Some(Ok(emissions)) => {
                    self.breakers.record_success(&node.id);
                    instance.mark_completed();
                    instance.context = node_ctx.clone();
                    self.update(&instance);

                    let duration_ms = started.elapsed().as_millis() as u64;
                    self.events.publish(WorkflowEvent::NodeCompleted {
                        node_instance_id: instance_id,
                        node_id: node.id.clone(),
                        workflow_instance_id: workflow_instance,
                        duration_ms,
                        output: node_ctx.output_data.clone(),
                        timestamp: Utc::now(),
                    });

                    let emissions = if emissions.is_empty() {
                        vec![Emission::complete(node_ctx.output_data.clone())]
                    } else {
                        emissions
                    };
                    // Stamp the measured duration on Complete payloads.
                    let emissions = emissions
                        .into_iter()
                        .map(|mut e| {
                            if let MessagePayload::Complete {
                                duration_ms: d, ..
                            } = &mut e.payload
                            {
                                *d = duration_ms;
                            }
                            e
                        })
                        .collect();

                    break ExecutionOutcome {
                        instance_id,
                        node_id: node.id.clone(),
                        status: NodeInstanceStatus::Completed,
                        emissions,
                        fallback_to: None,
                    };
                }
                Some(Err(err)) => {
                    self.breakers.record_failure(&node.id);

                    let retry = node.retry.as_ref();
                    let attempts_left =
                        retry.map(|p| attempt < p.max_attempts).unwrap_or(false);
                    let retryable =
                        retry.map(|p| p.should_retry(&err)).unwrap_or(false);

                    if attempts_left && retryable {
                        let delay = retry.unwrap().calculate_delay(attempt);
                        debug!(
                            node_id = %node.id,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "node failed, retrying"
                        );
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => {
                                instance.mark_cancelled();
                                self.update(&instance);
                                self.events.publish(WorkflowEvent::NodeCancelled {
                                    node_instance_id: instance_id,
                                    node_id: node.id.clone(),
                                    workflow_instance_id: workflow_instance,
                                    timestamp: Utc::now(),
                                });
                                break ExecutionOutcome {
                                    instance_id,
                                    node_id: node.id.clone(),
                                    status: NodeInstanceStatus::Cancelled,
                                    emissions: Vec::new(),
                                    fallback_to: None,
                                };
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                        attempt += 1;
                        continue;
                    }

                    warn!(node_id = %node.id, attempt, error = %err, "node failed");
                    instance.mark_failed(err.message.clone(), Some(err.kind.clone()));
                    instance.context = node_ctx;
                    self.update(&instance);
                    self.events.publish(WorkflowEvent::NodeFailed {
                        node_instance_id: instance_id,
                        node_id: node.id.clone(),
                        workflow_instance_id: workflow_instance,
                        error: err.message.clone(),
                        reason: err.kind.clone(),
                        timestamp: Utc::now(),
                    });

                    break ExecutionOutcome {
                        instance_id,
                        node_id: node.id.clone(),
                        status: NodeInstanceStatus::Failed,
                        emissions: vec![Emission {
                            port: None,
                            payload: MessagePayload::Fail {
                                error: err.message,
                                error_kind: Some(err.kind),
                            },
                        }],
                        fallback_to: node.fallback_node_id.clone(),
                    };
                }
            }
        };

        // Throttle before limiter; both are idempotent.
        if let Some(slot) = throttle_slot.as_mut() {
            slot.release();
        }
        concurrency_slot.release();
        outcome
    }

    fn cancelled_outcome(&self, mut instance: NodeInstance, reason: String) -> ExecutionOutcome {
        debug!(node_id = %instance.node_id, reason, "node resource wait cancelled");
        let instance_id = instance.instance_id;
        let node_id = instance.node_id.clone();
        instance.mark_cancelled();
        self.record(instance);
        self.events.publish(WorkflowEvent::NodeCancelled {
            node_instance_id: instance_id,
            node_id: node_id.clone(),
            workflow_instance_id: self.context.instance_id,
            timestamp: Utc::now(),
        });
        ExecutionOutcome {
            instance_id,
            node_id,
            status: NodeInstanceStatus::Cancelled,
            emissions: Vec::new(),
            fallback_to: None,
        }
    }

    fn record(&self, instance: NodeInstance) {
        self.instances.lock().unwrap().push(instance);
    }

    fn update(&self, instance: &NodeInstance) {
        let mut instances = self.instances.lock().unwrap();
        if let Some(slot) = instances
            .iter_mut()
            .find(|i| i.instance_id == instance.instance_id)
        {
            *slot = instance.clone();
        } else {
            instances.push(instance.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitBreakerPolicy;
    use crate::context::WorkflowVariables;
    use crate::definition::{NodeKind, NodePriority};
    use crate::retry::{BackoffStrategy, RetryPolicy};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyBody {
        failures: AtomicU32,
    }

    #[async_trait]
    impl NodeBody for FlakyBody {
        async fn execute(
            &self,
            _workflow: Arc<WorkflowExecutionContext>,
            node: &mut NodeExecutionContext,
            _cancel: CancellationToken,
        ) -> std::result::Result<(), NodeError> {
            if self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n > 0).then(|| n - 1)
            }).is_ok()
            {
                return Err(NodeError::new("transient", "flaky failure"));
            }
            node.output_data
                .insert("ok".into(), serde_json::Value::Bool(true));
            Ok(())
        }
    }

    fn executor() -> NodeExecutor {
        let context = Arc::new(WorkflowExecutionContext::new(
            "wf",
            Arc::new(WorkflowVariables::new()),
            HashMap::new(),
        ));
        NodeExecutor {
            context,
            limiter: Arc::new(ConcurrencyLimiter::new(0)),
            throttler: Arc::new(NodeThrottler::new()),
            breakers: Arc::new(CircuitBreakerManager::new()),
            events: Arc::new(EventBus::new()),
            instances: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn trigger(executor: &NodeExecutor) -> TriggerInput {
        TriggerInput::from_message(NodeMessage::start(executor.context.instance_id))
    }

    fn task_node(id: &str) -> NodeDefinition {
        NodeDefinition::new(id, NodeKind::Task { body: id.into() })
    }

    #[tokio::test]
    async fn successful_run_emits_started_then_completed() {
        let exec = executor();
        let mut rx = exec.events.subscribe();
        let node = task_node("a");
        let input = trigger(&exec);

        let outcome = exec
            .execute(
                &node,
                input,
                Arc::new(BodyInvocation(Arc::new(NoopBody))),
            )
            .await;

        assert_eq!(outcome.status, NodeInstanceStatus::Completed);
        assert_eq!(outcome.emissions.len(), 1);

        let started = rx.recv().await.unwrap();
        assert!(matches!(started, WorkflowEvent::NodeStarted { .. }));
        let completed = rx.recv().await.unwrap();
        match completed {
            WorkflowEvent::NodeCompleted {
                node_instance_id, ..
            } => assert_eq!(node_instance_id, outcome.instance_id),
            other => panic!("expected NodeCompleted, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success_within_budget() {
        let exec = executor();
        let mut node = task_node("flaky");
        node.retry = Some(RetryPolicy {
            strategy: BackoffStrategy::Fixed,
            max_attempts: 3,
            initial_delay_ms: 10,
            max_delay_ms: 50,
            ..Default::default()
        });

        let body = Arc::new(FlakyBody {
            failures: AtomicU32::new(2),
        });
        let input = trigger(&exec);
        let outcome = exec
            .execute(&node, input, Arc::new(BodyInvocation(body)))
            .await;

        assert_eq!(outcome.status, NodeInstanceStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_emit_fail() {
        let exec = executor();
        let mut node = task_node("flaky");
        node.retry = Some(RetryPolicy {
            strategy: BackoffStrategy::Fixed,
            max_attempts: 2,
            initial_delay_ms: 1,
            max_delay_ms: 10,
            ..Default::default()
        });

        let body = Arc::new(FlakyBody {
            failures: AtomicU32::new(10),
        });
        let input = trigger(&exec);
        let outcome = exec
            .execute(&node, input, Arc::new(BodyInvocation(body)))
            .await;

        assert_eq!(outcome.status, NodeInstanceStatus::Failed);
        assert!(matches!(
            outcome.emissions[0].payload,
            MessagePayload::Fail { .. }
        ));
    }

    #[tokio::test]
    async fn no_retry_policy_means_single_attempt() {
        let exec = executor();
        let node = task_node("flaky");
        let body = Arc::new(FlakyBody {
            failures: AtomicU32::new(1),
        });
        let input = trigger(&exec);
        let outcome = exec
            .execute(&node, input, Arc::new(BodyInvocation(body)))
            .await;
        assert_eq!(outcome.status, NodeInstanceStatus::Failed);
    }

    #[tokio::test]
    async fn open_breaker_rejects_without_running() {
        let exec = executor();
        let mut node = task_node("gated");
        node.circuit_breaker = Some(CircuitBreakerPolicy {
            failure_threshold: 50.0,
            minimum_throughput: 1,
            open_duration_ms: 60_000,
            half_open_successes: 1,
        });
        exec.breakers
            .register("gated", node.circuit_breaker.clone().unwrap());
        exec.breakers.record_failure("gated");

        let input = trigger(&exec);
        let outcome = exec
            .execute(
                &node,
                input,
                Arc::new(BodyInvocation(Arc::new(NoopBody))),
            )
            .await;

        assert_eq!(outcome.status, NodeInstanceStatus::Failed);
        match &outcome.emissions[0].payload {
            MessagePayload::Fail { error_kind, .. } => {
                assert_eq!(error_kind.as_deref(), Some("circuit_open"))
            }
            other => panic!("expected Fail, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_suppresses_routing() {
        let exec = executor();
        let node = task_node("slow");

        struct SleepBody;
        #[async_trait]
        impl NodeBody for SleepBody {
            async fn execute(
                &self,
                _workflow: Arc<WorkflowExecutionContext>,
                _node: &mut NodeExecutionContext,
                cancel: CancellationToken,
            ) -> std::result::Result<(), NodeError> {
                cancel.cancelled().await;
                Err(NodeError::new("cancelled", "interrupted"))
            }
        }

        let ctx = Arc::clone(&exec.context);
        let input = trigger(&exec);
        let run = tokio::spawn(async move {
            exec.execute(&node, input, Arc::new(BodyInvocation(Arc::new(SleepBody))))
                .await
        });
        tokio::task::yield_now().await;
        ctx.cancellation.cancel();

        let outcome = run.await.unwrap();
        assert_eq!(outcome.status, NodeInstanceStatus::Cancelled);
        assert!(outcome.emissions.is_empty());
    }

    #[tokio::test]
    async fn failed_node_reports_fallback_target() {
        let exec = executor();
        let mut node = task_node("primary");
        node.fallback_node_id = Some("backup".into());

        let body = Arc::new(FlakyBody {
            failures: AtomicU32::new(1),
        });
        let input = trigger(&exec);
        let outcome = exec
            .execute(&node, input, Arc::new(BodyInvocation(body)))
            .await;

        assert_eq!(outcome.fallback_to.as_deref(), Some("backup"));
    }

    #[tokio::test]
    async fn limiter_slot_is_returned_after_the_run() {
        let mut exec = executor();
        exec.limiter = Arc::new(ConcurrencyLimiter::new(1));
        let node = NodeDefinition {
            priority: NodePriority::High,
            ..task_node("n")
        };
        let input = trigger(&exec);
        let outcome = exec
            .execute(
                &node,
                input,
                Arc::new(BodyInvocation(Arc::new(NoopBody))),
            )
            .await;
        assert_eq!(outcome.status, NodeInstanceStatus::Completed);
        assert_eq!(exec.limiter.available(), 1);
    }
}
