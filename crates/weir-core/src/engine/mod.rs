//! Workflow engine: message-driven execution of a node graph.
//!
//! The dispatch loop is the single producer of "go execute" decisions:
//! it pulls triggering messages from node inboxes, spawns one executor
//! task per run, feeds terminal messages to the router, and settles when
//! every inbox is drained and nothing is in flight.

pub mod control;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::breaker::CircuitBreakerManager;
use crate::checkpoint::{
    CheckpointMetadata, CheckpointState, CheckpointStore, SerializedContext,
};
use crate::condition::{BasicEvaluator, ExpressionEvaluator};
use crate::context::{WorkflowExecutionContext, WorkflowStatus, WorkflowVariables};
use crate::definition::{JoinType, NodeDefinition, NodeKind, WorkflowDefinition};
use crate::events::{EventBus, ProgressStream, ProgressUpdate, WorkflowEvent};
use crate::executor::{
    BodyInvocation, BodyRegistry, Emission, ExecutionOutcome, NodeBody, NodeExecutor,
    NodeInvocation, NoopBody, TriggerInput,
};
use crate::instance::{NodeInstance, NodeInstanceStatus};
use crate::limiter::ConcurrencyLimiter;
use crate::message::{DeadLetter, DeadLetterReason, MessagePayload, NodeMessage};
use crate::queue::{DeadLetterQueue, NodeQueue, DEFAULT_QUEUE_CAPACITY};
use crate::router::{FullQueuePolicy, MessageRouter};
use crate::throttle::NodeThrottler;
use crate::{Result, WeirError};

use control::{
    ContainerInvocation, FailingInvocation, ForEachInvocation, IfElseInvocation,
    SubflowInvocation, SwitchInvocation, TimerInvocation, WhileInvocation,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tuning knobs for the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Inbox capacity per node.
    pub queue_capacity: usize,
    /// What the router does when a target inbox is full.
    pub full_queue_policy: FullQueuePolicy,
    /// Upper bound on a blocking enqueue. `None` waits indefinitely.
    pub enqueue_timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            full_queue_policy: FullQueuePolicy::default(),
            enqueue_timeout: None,
        }
    }
}

/// Builder for a configured engine.
pub struct EngineBuilder {
    config: EngineConfig,
    bodies: BodyRegistry,
    evaluator: Arc<dyn ExpressionEvaluator>,
    store: Option<Arc<dyn CheckpointStore>>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            config: EngineConfig::default(),
            bodies: BodyRegistry::new(),
            evaluator: Arc::new(BasicEvaluator),
            store: None,
        }
    }
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a body under the name Task/Script nodes reference.
    pub fn body(mut self, name: impl Into<String>, body: Arc<dyn NodeBody>) -> Self {
        self.bodies.register(name, body);
        self
    }

    /// Replace the expression evaluator used by control-flow nodes.
    pub fn evaluator(mut self, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> WorkflowEngine {
        WorkflowEngine {
            inner: Arc::new(EngineInner {
                config: self.config,
                bodies: self.bodies,
                evaluator: self.evaluator,
                store: self.store,
                runs: Mutex::new(HashMap::new()),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct EngineInner {
    config: EngineConfig,
    bodies: BodyRegistry,
    evaluator: Arc<dyn ExpressionEvaluator>,
    store: Option<Arc<dyn CheckpointStore>>,
    runs: Mutex<HashMap<Uuid, Arc<RunState>>>,
}

/// Live state of one workflow run.
pub(crate) struct RunState {
    definition: Arc<WorkflowDefinition>,
    context: Arc<WorkflowExecutionContext>,
    router: Arc<MessageRouter>,
    dlq: Arc<DeadLetterQueue>,
    events: Arc<EventBus>,
    progress: Arc<ProgressStream>,
    executor: Arc<NodeExecutor>,
    limiter: Arc<ConcurrencyLimiter>,
    instances: Arc<Mutex<Vec<NodeInstance>>>,
    while_iterations: Arc<Mutex<HashMap<String, u32>>>,
    failure: Mutex<Option<String>>,
    cancel_reason: Mutex<Option<String>>,
    paused: watch::Sender<bool>,
    started: tokio::time::Instant,
}

impl RunState {
    fn record_failure(&self, reason: String) {
        let mut failure = self.failure.lock().unwrap();
        failure.get_or_insert(reason);
    }
}

/// Executes workflow definitions. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

impl Default for WorkflowEngine {
    fn default() -> Self {
        Self::new()
    }
}

enum TaskEvent {
    Executed(ExecutionOutcome),
    Routed,
}

impl WorkflowEngine {
    pub fn new() -> Self {
        EngineBuilder::default().build()
    }

    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// Validate `definition` and start executing it. Returns the live
    /// execution context; the dispatch loop runs in its own task.
    pub async fn start(
        &self,
        definition: WorkflowDefinition,
    ) -> Result<Arc<WorkflowExecutionContext>> {
        let (context, _events) = self.start_with_events(definition).await?;
        Ok(context)
    }

    /// Like [`start`](Self::start), but also returns an event subscription
    /// opened before the first event fires, so the caller observes the
    /// complete stream from `WorkflowStarted` on.
    pub async fn start_with_events(
        &self,
        definition: WorkflowDefinition,
    ) -> Result<(
        Arc<WorkflowExecutionContext>,
        tokio::sync::broadcast::Receiver<WorkflowEvent>,
    )> {
        let mut definition = definition;
        definition.validate()?;

        let run = self.build_run(definition, None)?;

        // Seed every entry node with the synthetic start message.
        for entry in run.definition.entry_nodes() {
            let inbox = run
                .context
                .inbox(&entry.id)
                .expect("inbox exists for every node");
            inbox
                .try_enqueue(NodeMessage::start(run.context.instance_id))
                .map_err(|e| WeirError::Queue(e.to_string()))?;
        }

        let events = run.events.subscribe();
        self.launch(run.clone());
        Ok((Arc::clone(&run.context), events))
    }

    /// Rebuild a run from a checkpoint and continue it.
    ///
    /// Completed nodes are not re-executed; instances that were `Running`
    /// at checkpoint time are re-queued with their original trigger.
    pub async fn resume_from_checkpoint(
        &self,
        definition: WorkflowDefinition,
        state: CheckpointState,
    ) -> Result<Arc<WorkflowExecutionContext>> {
        let mut definition = definition;
        definition.validate()?;

        if definition.workflow_id != state.metadata.workflow_id {
            return Err(WeirError::Checkpoint(format!(
                "checkpoint belongs to workflow '{}', not '{}'",
                state.metadata.workflow_id, definition.workflow_id
            )));
        }

        let run = self.build_run(definition, Some(&state))?;
        info!(
            workflow_instance_id = %run.context.instance_id,
            checkpoint_id = %state.metadata.checkpoint_id,
            "resuming workflow from checkpoint"
        );

        self.launch(run.clone());
        Ok(Arc::clone(&run.context))
    }

    /// Request cancellation of a running workflow.
    pub fn cancel(&self, instance_id: Uuid, reason: impl Into<String>) {
        if let Ok(run) = self.run(instance_id) {
            let reason = reason.into();
            info!(%instance_id, reason, "cancelling workflow");
            run.cancel_reason.lock().unwrap().get_or_insert(reason);
            run.context.cancellation.cancel();
        }
    }

    /// Pause dispatching. In-flight nodes finish; nothing new starts.
    pub fn pause(&self, instance_id: Uuid) -> Result<()> {
        let run = self.run(instance_id)?;
        if !run.definition.allow_pause {
            return Err(WeirError::Engine(format!(
                "workflow '{}' does not allow pausing",
                run.definition.workflow_id
            )));
        }
        run.paused.send_replace(true);
        run.context.set_status(WorkflowStatus::Paused);
        Ok(())
    }

    /// Resume a paused workflow.
    pub fn resume(&self, instance_id: Uuid) -> Result<()> {
        let run = self.run(instance_id)?;
        run.paused.send_replace(false);
        if !run.context.status().is_terminal() {
            run.context.set_status(WorkflowStatus::Running);
        }
        Ok(())
    }

    /// Await the terminal status of a workflow instance.
    pub async fn wait(&self, instance_id: Uuid) -> Result<WorkflowStatus> {
        let mut rx = {
            let run = self.run(instance_id)?;
            run.context.watch_status()
        };
        loop {
            let status = *rx.borrow();
            if status.is_terminal() {
                return Ok(status);
            }
            rx.changed()
                .await
                .map_err(|_| WeirError::Engine("status stream closed".into()))?;
        }
    }

    pub fn subscribe_events(
        &self,
        instance_id: Uuid,
    ) -> Result<tokio::sync::broadcast::Receiver<WorkflowEvent>> {
        Ok(self.run(instance_id)?.events.subscribe())
    }

    pub fn subscribe_progress(
        &self,
        instance_id: Uuid,
    ) -> Result<watch::Receiver<ProgressUpdate>> {
        Ok(self.run(instance_id)?.progress.subscribe())
    }

    /// All node-instance records of a run so far.
    pub fn instances(&self, instance_id: Uuid) -> Result<Vec<NodeInstance>> {
        Ok(self.run(instance_id)?.instances.lock().unwrap().clone())
    }

    /// The run's dead-letter entries.
    pub fn dead_letters(&self, instance_id: Uuid) -> Result<Vec<DeadLetter>> {
        Ok(self.run(instance_id)?.dlq.snapshot())
    }

    /// Snapshot the run and persist it under `checkpoint_id`.
    pub async fn checkpoint(
        &self,
        instance_id: Uuid,
        checkpoint_id: impl Into<String>,
    ) -> Result<CheckpointMetadata> {
        let store = self
            .inner
            .store
            .clone()
            .ok_or_else(|| WeirError::Checkpoint("no checkpoint store configured".into()))?;
        let run = self.run(instance_id)?;

        let inboxes = run
            .context
            .inboxes
            .iter()
            .map(|(id, q)| (id.clone(), q.snapshot()))
            .collect();

        let state = CheckpointState {
            metadata: CheckpointMetadata {
                checkpoint_id: checkpoint_id.into(),
                workflow_instance_id: instance_id,
                workflow_id: run.definition.workflow_id.clone(),
                created_at: Utc::now(),
                total_nodes: run.definition.nodes.len(),
                completed_nodes: 0,
                pending_messages: 0,
                size_bytes: 0,
            },
            context: SerializedContext {
                status: run.context.status(),
                variables: run.context.variables.snapshot(),
                inboxes,
            },
            node_instances: run.instances.lock().unwrap().clone(),
        }
        .finalize();

        store.save(&state).await?;
        Ok(state.metadata)
    }

    fn run(&self, instance_id: Uuid) -> Result<Arc<RunState>> {
        self.inner
            .runs
            .lock()
            .unwrap()
            .get(&instance_id)
            .cloned()
            .ok_or_else(|| WeirError::Engine(format!("unknown workflow instance {instance_id}")))
    }

    fn launch(&self, run: Arc<RunState>) {
        self.inner
            .runs
            .lock()
            .unwrap()
            .insert(run.context.instance_id, Arc::clone(&run));
        let engine = self.clone();
        tokio::spawn(async move { engine.dispatch(run).await });
    }

    // -----------------------------------------------------------------------
    // Run construction
    // -----------------------------------------------------------------------

    fn build_run(
        &self,
        definition: WorkflowDefinition,
        restore: Option<&CheckpointState>,
    ) -> Result<Arc<RunState>> {
        let definition = Arc::new(definition);

        let variables = match restore {
            Some(state) => state.context.variables.clone(),
            None => definition.default_variables.clone(),
        };
        let variables = Arc::new(WorkflowVariables::from_map(variables));

        let mut inboxes = HashMap::new();
        for node in &definition.nodes {
            inboxes.insert(
                node.id.clone(),
                Arc::new(NodeQueue::new(&node.id, self.inner.config.queue_capacity)),
            );
        }

        let mut context =
            WorkflowExecutionContext::new(&definition.workflow_id, variables, inboxes);
        if let Some(state) = restore {
            context.instance_id = state.metadata.workflow_instance_id;
        }
        let context = Arc::new(context);

        let mut initial_instances = Vec::new();
        if let Some(state) = restore {
            for (node_id, messages) in &state.context.inboxes {
                if let Some(inbox) = context.inbox(node_id) {
                    for message in messages {
                        inbox
                            .try_enqueue(message.clone())
                            .map_err(|e| WeirError::Checkpoint(e.to_string()))?;
                    }
                }
            }
            for saved in &state.node_instances {
                let mut instance = saved.clone();
                if instance.status == NodeInstanceStatus::Running {
                    // Re-queue the original trigger so the node runs again.
                    if let (Some(inbox), Some(message)) =
                        (context.inbox(&instance.node_id), instance.trigger_message.clone())
                    {
                        inbox
                            .try_enqueue(message)
                            .map_err(|e| WeirError::Checkpoint(e.to_string()))?;
                    }
                    instance.status = NodeInstanceStatus::Pending;
                    instance.started_at = None;
                }
                initial_instances.push(instance);
            }
        }

        let router = Arc::new(MessageRouter::new(
            self.inner.config.full_queue_policy,
            self.inner.config.enqueue_timeout,
        ));
        for connection in &definition.connections {
            router.add_route(connection.clone());
        }

        let limiter = Arc::new(ConcurrencyLimiter::new(definition.max_concurrency));
        let throttler = Arc::new(NodeThrottler::new());
        let breakers = Arc::new(CircuitBreakerManager::new());
        for node in &definition.nodes {
            if node.max_concurrent_executions > 0 {
                throttler.register(&node.id, node.max_concurrent_executions);
            }
            if let Some(policy) = &node.circuit_breaker {
                breakers.register(&node.id, policy.clone());
            }
        }

        let events = Arc::new(EventBus::new());
        let progress = Arc::new(ProgressStream::new(ProgressUpdate::empty(
            context.instance_id,
            definition.nodes.len(),
        )));
        let instances = Arc::new(Mutex::new(initial_instances));

        let executor = Arc::new(NodeExecutor {
            context: Arc::clone(&context),
            limiter: Arc::clone(&limiter),
            throttler: Arc::clone(&throttler),
            breakers: Arc::clone(&breakers),
            events: Arc::clone(&events),
            instances: Arc::clone(&instances),
        });

        let (paused, _) = watch::channel(false);

        Ok(Arc::new(RunState {
            definition,
            context,
            router,
            dlq: Arc::new(DeadLetterQueue::new()),
            events,
            progress,
            executor,
            limiter,
            instances,
            while_iterations: Arc::new(Mutex::new(HashMap::new())),
            failure: Mutex::new(None),
            cancel_reason: Mutex::new(None),
            paused,
            started: tokio::time::Instant::now(),
        }))
    }

    // -----------------------------------------------------------------------
    // Dispatch loop
    // -----------------------------------------------------------------------

    async fn dispatch(self, run: Arc<RunState>) {
        let cancel = run.context.cancellation.clone();
        let instance_id = run.context.instance_id;

        info!(
            %instance_id,
            workflow_id = %run.definition.workflow_id,
            node_count = run.definition.nodes.len(),
            "workflow started"
        );
        run.events.publish(WorkflowEvent::WorkflowStarted {
            workflow_instance_id: instance_id,
            workflow_id: run.definition.workflow_id.clone(),
            timestamp: Utc::now(),
        });
        self.publish_progress(&run);

        let deadline = (run.definition.timeout_seconds > 0).then(|| {
            tokio::time::Instant::now() + Duration::from_secs(run.definition.timeout_seconds)
        });

        let mut tasks: JoinSet<TaskEvent> = JoinSet::new();
        let mut join_buffers: HashMap<String, HashMap<String, VecDeque<NodeMessage>>> =
            HashMap::new();
        let mut paused_rx = run.paused.subscribe();

        loop {
            if cancel.is_cancelled() {
                break;
            }

            if !*paused_rx.borrow() {
                self.schedule_ready(&run, &mut tasks, &mut join_buffers);
            }

            let inboxes_empty = run.context.inboxes.values().all(|q| q.is_empty());
            if tasks.is_empty() && inboxes_empty && !*paused_rx.borrow() {
                break;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = deadline_wait(deadline) => {
                    warn!(%instance_id, "workflow deadline exceeded");
                    run.cancel_reason
                        .lock()
                        .unwrap()
                        .get_or_insert("timeout".to_string());
                    cancel.cancel();
                }
                _ = paused_rx.changed() => {}
                joined = tasks.join_next(), if !tasks.is_empty() => {
                    match joined {
                        Some(Ok(TaskEvent::Executed(outcome))) => {
                            self.publish_progress(&run);
                            let run_for_routing = Arc::clone(&run);
                            tasks.spawn(async move {
                                route_outcome(&run_for_routing, outcome).await;
                                TaskEvent::Routed
                            });
                        }
                        Some(Ok(TaskEvent::Routed)) => {}
                        Some(Err(e)) => {
                            warn!(%instance_id, error = %e, "node task panicked");
                            run.record_failure(format!("node task panicked: {e}"));
                        }
                        None => {}
                    }
                }
            }
        }

        self.finish(run, tasks).await;
    }

    /// Spawn an executor for every node whose inbox and join policy make
    /// it ready.
    fn schedule_ready(
        &self,
        run: &Arc<RunState>,
        tasks: &mut JoinSet<TaskEvent>,
        join_buffers: &mut HashMap<String, HashMap<String, VecDeque<NodeMessage>>>,
    ) {
        for node in &run.definition.nodes {
            let Some(inbox) = run.context.inbox(&node.id) else {
                continue;
            };

            match node.join {
                JoinType::Any => {
                    while let Some(message) = inbox.try_dequeue() {
                        let trigger = self.build_trigger(run, message);
                        self.spawn_node(run, node, trigger, tasks);
                    }
                }
                JoinType::All => {
                    let sources: Vec<String> = run
                        .definition
                        .upstream_sources(&node.id)
                        .into_iter()
                        .map(str::to_string)
                        .collect();

                    let buffer = join_buffers.entry(node.id.clone()).or_default();
                    while let Some(message) = inbox.try_dequeue() {
                        if sources.iter().any(|s| *s == message.source_node_id) {
                            buffer
                                .entry(message.source_node_id.clone())
                                .or_default()
                                .push_back(message);
                        } else {
                            // Seeds and explicit deliveries are not part of
                            // the join set; they trigger on their own.
                            let trigger = self.build_trigger(run, message);
                            self.spawn_node(run, node, trigger, tasks);
                        }
                    }

                    if sources.is_empty() {
                        continue;
                    }

                    // Fire while one message per upstream is buffered.
                    while sources
                        .iter()
                        .all(|s| buffer.get(s).is_some_and(|q| !q.is_empty()))
                    {
                        let mut input_data: HashMap<String, Value> = HashMap::new();
                        let mut primary = None;
                        for source in &sources {
                            let message = buffer
                                .get_mut(source)
                                .and_then(VecDeque::pop_front)
                                .expect("buffer checked non-empty");
                            for (key, value) in message.payload.output_data() {
                                input_data.insert(key, value);
                            }
                            primary.get_or_insert(message);
                        }
                        let trigger = TriggerInput {
                            message: primary.expect("at least one source"),
                            input_data,
                        };
                        self.spawn_node(run, node, trigger, tasks);
                    }
                }
            }
        }
    }

    /// Build a trigger from a single message, aliasing `ForEach` items
    /// under the configured item variable name.
    fn build_trigger(&self, run: &Arc<RunState>, message: NodeMessage) -> TriggerInput {
        let mut trigger = TriggerInput::from_message(message);
        if let Some(source) = run.definition.node(&trigger.message.source_node_id) {
            if let NodeKind::ForEach { item_variable, .. } = &source.kind {
                if let Some(item) = trigger.input_data.get("item").cloned() {
                    trigger.input_data.insert(item_variable.clone(), item);
                }
            }
        }
        trigger
    }

    fn spawn_node(
        &self,
        run: &Arc<RunState>,
        node: &NodeDefinition,
        trigger: TriggerInput,
        tasks: &mut JoinSet<TaskEvent>,
    ) {
        let invocation = self.resolve_invocation(run, node);
        let executor = Arc::clone(&run.executor);
        let node = node.clone();
        debug!(node_id = %node.id, "dispatching node");
        tasks.spawn(async move {
            TaskEvent::Executed(executor.execute(&node, trigger, invocation).await)
        });
    }

    fn resolve_invocation(
        &self,
        run: &Arc<RunState>,
        node: &NodeDefinition,
    ) -> Arc<dyn NodeInvocation> {
        let evaluator = Arc::clone(&self.inner.evaluator);
        match &node.kind {
            NodeKind::Noop => Arc::new(BodyInvocation(Arc::new(NoopBody))),
            NodeKind::Task { body } => match self.inner.bodies.get(body) {
                Some(body) => Arc::new(BodyInvocation(body)),
                None => Arc::new(FailingInvocation(crate::error::NodeError::new(
                    "body_not_found",
                    format!("no body registered under '{body}'"),
                ))),
            },
            NodeKind::Script { script } => match self.inner.bodies.get(script) {
                Some(body) => Arc::new(BodyInvocation(body)),
                None => Arc::new(FailingInvocation(crate::error::NodeError::new(
                    "body_not_found",
                    format!("no script host registered under '{script}'"),
                ))),
            },
            NodeKind::IfElse { condition } => Arc::new(IfElseInvocation {
                condition: condition.clone(),
                evaluator,
            }),
            NodeKind::ForEach {
                collection,
                item_variable,
            } => Arc::new(ForEachInvocation {
                collection: collection.clone(),
                item_variable: item_variable.clone(),
                evaluator,
            }),
            NodeKind::While {
                condition,
                max_iterations,
            } => Arc::new(WhileInvocation {
                node_id: node.id.clone(),
                condition: condition.clone(),
                max_iterations: *max_iterations,
                evaluator,
                iterations: Arc::clone(&run.while_iterations),
            }),
            NodeKind::Switch {
                expression,
                cases,
                default_port,
            } => Arc::new(SwitchInvocation {
                expression: expression.clone(),
                cases: cases.clone(),
                default_port: default_port.clone(),
                evaluator,
            }),
            NodeKind::Timer {
                trigger_on_start,
                delay_seconds,
            } => Arc::new(TimerInvocation {
                trigger_on_start: *trigger_on_start,
                delay_seconds: *delay_seconds,
            }),
            NodeKind::Subflow {
                definition,
                input_mapping,
                output_mapping,
            } => Arc::new(SubflowInvocation {
                engine: self.clone(),
                definition: Arc::new((**definition).clone()),
                input_mapping: input_mapping.clone(),
                output_mapping: output_mapping.clone(),
            }),
            NodeKind::Container { nodes, connections } => Arc::new(ContainerInvocation {
                engine: self.clone(),
                parent_workflow_id: run.definition.workflow_id.clone(),
                node_id: node.id.clone(),
                node_name: node.name.clone(),
                nodes: nodes.clone(),
                connections: connections.clone(),
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Termination
    // -----------------------------------------------------------------------

    async fn finish(&self, run: Arc<RunState>, mut tasks: JoinSet<TaskEvent>) {
        let instance_id = run.context.instance_id;
        let cancelled = run.context.cancellation.is_cancelled();

        if cancelled {
            // Stop accepting deliveries, then let in-flight tasks settle;
            // their late emissions dead-letter as WorkflowTerminated.
            for inbox in run.context.inboxes.values() {
                inbox.close();
            }
            while let Some(joined) = tasks.join_next().await {
                if let Ok(TaskEvent::Executed(outcome)) = joined {
                    route_outcome(&run, outcome).await;
                }
            }
            for inbox in run.context.inboxes.values() {
                for message in inbox.drain() {
                    let target = inbox.node_id().to_string();
                    run.dlq.add(
                        message,
                        target,
                        DeadLetterReason::WorkflowTerminated,
                        None,
                    );
                }
            }
        } else {
            for inbox in run.context.inboxes.values() {
                inbox.close();
            }
        }

        run.limiter.dispose();

        let failure = run.failure.lock().unwrap().clone();
        let (status, event) = if cancelled {
            let reason = run
                .cancel_reason
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| "cancelled".to_string());
            (
                WorkflowStatus::Cancelled,
                WorkflowEvent::WorkflowCancelled {
                    workflow_instance_id: instance_id,
                    reason,
                    timestamp: Utc::now(),
                },
            )
        } else if let Some(reason) = failure {
            (
                WorkflowStatus::Failed,
                WorkflowEvent::WorkflowFailed {
                    workflow_instance_id: instance_id,
                    reason,
                    timestamp: Utc::now(),
                },
            )
        } else {
            (
                WorkflowStatus::Completed,
                WorkflowEvent::WorkflowCompleted {
                    workflow_instance_id: instance_id,
                    timestamp: Utc::now(),
                },
            )
        };

        self.publish_progress(&run);
        run.events.publish(event);
        run.context.set_status(status);

        info!(%instance_id, ?status, "workflow finished");

        // Disposal completes the reactive streams.
        run.events.close();
        run.progress.close();
    }

    fn publish_progress(&self, run: &Arc<RunState>) {
        let update = compute_progress(run);
        run.events
            .publish(WorkflowEvent::ProgressUpdated(update.clone()));
        run.progress.publish(update);
    }
}

// ---------------------------------------------------------------------------
// Routing of executor outcomes
// ---------------------------------------------------------------------------

async fn route_outcome(run: &Arc<RunState>, outcome: ExecutionOutcome) {
    let instance_id = run.context.instance_id;

    for emission in &outcome.emissions {
        let Emission { port, payload } = emission.clone();
        let is_fail = matches!(payload, MessagePayload::Fail { .. });

        let mut message = NodeMessage::new(&outcome.node_id, instance_id, payload);
        message.source_port = port;

        let delivered = run.router.route(&message, &run.context, &run.dlq).await;

        if is_fail {
            if let Some(fallback) = &outcome.fallback_to {
                let error_text = match &message.payload {
                    MessagePayload::Fail { error, .. } => error.clone(),
                    _ => String::new(),
                };
                let mut output = HashMap::new();
                output.insert("fallback_for".to_string(), Value::from(outcome.node_id.clone()));
                output.insert("error".to_string(), Value::from(error_text));
                let fallback_message = NodeMessage::new(
                    &outcome.node_id,
                    instance_id,
                    MessagePayload::Complete {
                        duration_ms: 0,
                        output,
                    },
                );
                match run
                    .router
                    .route_to(&fallback_message, &[fallback.clone()], &run.context, &run.dlq)
                    .await
                {
                    Ok(n) if n > 0 => {}
                    _ => run.record_failure(format!(
                        "node '{}' failed and its fallback '{fallback}' was unreachable",
                        outcome.node_id
                    )),
                }
            } else if delivered == 0 {
                run.record_failure(format!(
                    "node '{}' failed with no failure handler",
                    outcome.node_id
                ));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

fn compute_progress(run: &Arc<RunState>) -> ProgressUpdate {
    let instances = run.instances.lock().unwrap();
    let total = run.definition.nodes.len();

    let mut completed = 0;
    let mut running = 0;
    let mut failed = 0;
    let mut cancelled = 0;
    let mut pending = 0;

    for node in &run.definition.nodes {
        let latest = instances
            .iter()
            .rev()
            .find(|i| i.node_id == node.id)
            .map(|i| i.status);
        match latest {
            Some(NodeInstanceStatus::Completed) => completed += 1,
            Some(NodeInstanceStatus::Running) => running += 1,
            Some(NodeInstanceStatus::Failed) => failed += 1,
            Some(NodeInstanceStatus::Cancelled) => cancelled += 1,
            Some(NodeInstanceStatus::Pending) | Some(NodeInstanceStatus::Skipped) | None => {
                pending += 1
            }
        }
    }

    let percent = if total > 0 {
        (completed as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
    } else {
        0.0
    };

    let estimated_remaining_ms = (completed > 0 && completed < total).then(|| {
        let elapsed = run.started.elapsed().as_millis() as u64;
        let per_node = elapsed / completed as u64;
        per_node * (total - completed) as u64
    });

    ProgressUpdate {
        workflow_instance_id: run.context.instance_id,
        percent_complete: percent,
        nodes_completed: completed,
        nodes_running: running,
        nodes_pending: pending,
        nodes_failed: failed,
        nodes_cancelled: cancelled,
        total_nodes: total,
        estimated_remaining_ms,
        timestamp: Utc::now(),
    }
}

async fn deadline_wait(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::NodeConnection;

    fn chain(ids: &[&str]) -> WorkflowDefinition {
        let mut def = WorkflowDefinition::new("chain", "Chain");
        for id in ids {
            def.add_node(NodeDefinition::noop(*id));
        }
        for pair in ids.windows(2) {
            def.add_connection(NodeConnection::new(pair[0], pair[1]));
        }
        def
    }

    #[tokio::test]
    async fn noop_chain_completes() {
        let engine = WorkflowEngine::new();
        let ctx = engine.start(chain(&["a", "b", "c"])).await.unwrap();
        let status = engine.wait(ctx.instance_id).await.unwrap();
        assert_eq!(status, WorkflowStatus::Completed);

        let instances = engine.instances(ctx.instance_id).unwrap();
        assert_eq!(instances.len(), 3);
        assert!(instances
            .iter()
            .all(|i| i.status == NodeInstanceStatus::Completed));
    }

    #[tokio::test]
    async fn invalid_definition_is_rejected_before_running() {
        let engine = WorkflowEngine::new();
        let empty = WorkflowDefinition::new("wf", "Empty");
        assert!(matches!(
            engine.start(empty).await,
            Err(WeirError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn unknown_instance_is_an_engine_error() {
        let engine = WorkflowEngine::new();
        assert!(matches!(
            engine.wait(Uuid::new_v4()).await,
            Err(WeirError::Engine(_))
        ));
    }

    #[tokio::test]
    async fn pause_requires_permission() {
        let engine = WorkflowEngine::new();
        let ctx = engine.start(chain(&["a"])).await.unwrap();
        // allow_pause defaults to false.
        assert!(engine.pause(ctx.instance_id).is_err());
        engine.wait(ctx.instance_id).await.unwrap();
    }

    #[tokio::test]
    async fn missing_task_body_fails_the_workflow() {
        let engine = WorkflowEngine::new();
        let mut def = WorkflowDefinition::new("wf", "MissingBody");
        def.add_node(NodeDefinition::new(
            "t",
            NodeKind::Task {
                body: "ghost".into(),
            },
        ));
        let ctx = engine.start(def).await.unwrap();
        let status = engine.wait(ctx.instance_id).await.unwrap();
        assert_eq!(status, WorkflowStatus::Failed);
    }
}
