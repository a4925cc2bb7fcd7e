//! End-to-end engine scenarios.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use weir_core::breaker::{CircuitBreakerManager, CircuitBreakerPolicy, CircuitState};
use weir_core::checkpoint::{CheckpointStore, MemoryCheckpointStore};
use weir_core::context::{NodeExecutionContext, WorkflowExecutionContext};
use weir_core::definition::{NodeConnection, NodeDefinition, NodeKind, NodePriority, JoinType};
use weir_core::error::NodeError;
use weir_core::executor::NodeBody;
use weir_core::instance::NodeInstanceStatus;
use weir_core::{WorkflowEngine, WorkflowEvent, WorkflowStatus};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

type Log = Arc<Mutex<Vec<String>>>;
type Spans = Arc<Mutex<Vec<(String, tokio::time::Instant, tokio::time::Instant)>>>;

/// Records its label, optionally sleeping first.
struct SleepBody {
    label: String,
    sleep: Duration,
    log: Log,
    spans: Spans,
}

impl SleepBody {
    fn new(label: &str, sleep: Duration, log: Log, spans: Spans) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            sleep,
            log,
            spans,
        })
    }
}

#[async_trait]
impl NodeBody for SleepBody {
    async fn execute(
        &self,
        _workflow: Arc<WorkflowExecutionContext>,
        node: &mut NodeExecutionContext,
        _cancel: CancellationToken,
    ) -> Result<(), NodeError> {
        let start = tokio::time::Instant::now();
        if !self.sleep.is_zero() {
            tokio::time::sleep(self.sleep).await;
        }
        self.log.lock().unwrap().push(self.label.clone());
        self.spans
            .lock()
            .unwrap()
            .push((self.label.clone(), start, tokio::time::Instant::now()));
        node.output_data.insert("label".into(), json!(self.label));
        Ok(())
    }
}

/// Copies a workflow variable into its output.
struct EmitVariableBody {
    variable: String,
    output_key: String,
}

#[async_trait]
impl NodeBody for EmitVariableBody {
    async fn execute(
        &self,
        workflow: Arc<WorkflowExecutionContext>,
        node: &mut NodeExecutionContext,
        _cancel: CancellationToken,
    ) -> Result<(), NodeError> {
        let value = workflow.variables.get(&self.variable).unwrap_or(Value::Null);
        node.output_data.insert(self.output_key.clone(), value);
        Ok(())
    }
}

fn new_log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

fn new_spans() -> Spans {
    Arc::new(Mutex::new(Vec::new()))
}

fn task(id: &str) -> NodeDefinition {
    NodeDefinition::new(id, NodeKind::Task { body: id.into() })
}

/// Node-level events only, in emission order.
fn node_events(events: &[WorkflowEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            WorkflowEvent::WorkflowStarted { .. } => Some("WorkflowStarted".to_string()),
            WorkflowEvent::WorkflowCompleted { .. } => Some("WorkflowCompleted".to_string()),
            WorkflowEvent::WorkflowFailed { .. } => Some("WorkflowFailed".to_string()),
            WorkflowEvent::WorkflowCancelled { .. } => Some("WorkflowCancelled".to_string()),
            WorkflowEvent::NodeStarted { node_id, .. } => Some(format!("NodeStarted({node_id})")),
            WorkflowEvent::NodeCompleted { node_id, .. } => {
                Some(format!("NodeCompleted({node_id})"))
            }
            WorkflowEvent::NodeFailed { node_id, .. } => Some(format!("NodeFailed({node_id})")),
            WorkflowEvent::NodeCancelled { node_id, .. } => {
                Some(format!("NodeCancelled({node_id})"))
            }
            WorkflowEvent::ProgressUpdated(_) => None,
        })
        .collect()
}

async fn drain_events(
    mut rx: tokio::sync::broadcast::Receiver<WorkflowEvent>,
) -> Vec<WorkflowEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.recv().await {
        events.push(event);
    }
    events
}

// ---------------------------------------------------------------------------
// Scenario 1: sequential chain
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sequential_chain_emits_ordered_events() {
    let engine = WorkflowEngine::new();

    let mut def = weir_core::WorkflowDefinition::new("chain", "Sequential chain");
    for id in ["A", "B", "C"] {
        def.add_node(NodeDefinition::noop(id));
    }
    def.add_connection(NodeConnection::new("A", "B"));
    def.add_connection(NodeConnection::new("B", "C"));

    let (ctx, rx) = engine.start_with_events(def).await.unwrap();
    let status = engine.wait(ctx.instance_id).await.unwrap();
    assert_eq!(status, WorkflowStatus::Completed);

    let events = node_events(&drain_events(rx).await);
    assert_eq!(
        events,
        vec![
            "WorkflowStarted",
            "NodeStarted(A)",
            "NodeCompleted(A)",
            "NodeStarted(B)",
            "NodeCompleted(B)",
            "NodeStarted(C)",
            "NodeCompleted(C)",
            "WorkflowCompleted",
        ]
    );
}

// ---------------------------------------------------------------------------
// Scenario 2: parallel fan-out / fan-in
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn parallel_branches_overlap_and_join_once() {
    let log = new_log();
    let spans = new_spans();
    let engine = WorkflowEngine::builder()
        .body("P1", SleepBody::new("P1", Duration::from_millis(200), log.clone(), spans.clone()))
        .body("P2", SleepBody::new("P2", Duration::from_millis(200), log.clone(), spans.clone()))
        .build();

    let mut def = weir_core::WorkflowDefinition::new("fan", "Fan out and in");
    def.add_node(NodeDefinition::noop("S"));
    def.add_node(task("P1"));
    def.add_node(task("P2"));
    let mut join = NodeDefinition::noop("J");
    join.join = JoinType::All;
    def.add_node(join);
    def.add_connection(NodeConnection::new("S", "P1"));
    def.add_connection(NodeConnection::new("S", "P2"));
    def.add_connection(NodeConnection::new("P1", "J"));
    def.add_connection(NodeConnection::new("P2", "J"));

    let wall_start = tokio::time::Instant::now();
    let ctx = engine.start(def).await.unwrap();
    let status = engine.wait(ctx.instance_id).await.unwrap();
    assert_eq!(status, WorkflowStatus::Completed);
    let wall = wall_start.elapsed();

    // Both branches ran, overlapping in time.
    let spans = spans.lock().unwrap();
    assert_eq!(spans.len(), 2);
    let (s1, e1) = (spans[0].1, spans[0].2);
    let (s2, e2) = (spans[1].1, spans[1].2);
    assert!(s1 < e2 && s2 < e1, "P1 and P2 intervals must overlap");

    // J ran exactly once, after both inputs arrived.
    let instances = engine.instances(ctx.instance_id).unwrap();
    let j_runs: Vec<_> = instances.iter().filter(|i| i.node_id == "J").collect();
    assert_eq!(j_runs.len(), 1);
    assert_eq!(j_runs[0].status, NodeInstanceStatus::Completed);

    assert!(wall < Duration::from_millis(500), "wall time was {wall:?}");
}

// ---------------------------------------------------------------------------
// Scenario 3: priority scheduling
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn limiter_prefers_high_priority_on_release() {
    let log = new_log();
    let spans = new_spans();
    let engine = WorkflowEngine::builder()
        .body("N", SleepBody::new("N", Duration::from_millis(500), log.clone(), spans.clone()))
        .body("L", SleepBody::new("L", Duration::from_millis(1), log.clone(), spans.clone()))
        .body("H", SleepBody::new("H", Duration::from_millis(1), log.clone(), spans.clone()))
        .build();

    let mut def = weir_core::WorkflowDefinition::new("prio", "Priority scheduling");
    def.max_concurrency = 1;

    let mut normal = task("N");
    normal.priority = NodePriority::Normal;
    def.add_node(normal);

    let mut low = task("L");
    low.priority = NodePriority::Low;
    def.add_node(low);

    let mut high = task("H");
    high.priority = NodePriority::High;
    def.add_node(high);

    let ctx = engine.start(def).await.unwrap();
    let status = engine.wait(ctx.instance_id).await.unwrap();
    assert_eq!(status, WorkflowStatus::Completed);

    let order = log.lock().unwrap().clone();
    assert_eq!(order, vec!["N", "H", "L"]);
}

// ---------------------------------------------------------------------------
// Scenario 4: circuit breaker opens, probes, and recovers
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn breaker_rejects_after_threshold_then_recovers() {
    let breakers = CircuitBreakerManager::new();
    breakers.register(
        "X",
        CircuitBreakerPolicy {
            failure_threshold: 50.0,
            minimum_throughput: 10,
            open_duration_ms: 100,
            half_open_successes: 3,
        },
    );

    for _ in 0..4 {
        assert!(breakers.allow_request("X"));
        breakers.record_success("X");
    }
    for _ in 0..6 {
        assert!(breakers.allow_request("X"));
        breakers.record_failure("X");
    }

    // The 11th request is rejected immediately.
    assert!(!breakers.allow_request("X"));
    assert_eq!(breakers.state("X"), Some(CircuitState::Open));

    tokio::time::advance(Duration::from_millis(150)).await;

    // Admitted again; three consecutive successes close the breaker.
    assert!(breakers.allow_request("X"));
    for _ in 0..3 {
        breakers.record_success("X");
    }
    assert_eq!(breakers.state("X"), Some(CircuitState::Closed));
}

#[tokio::test]
async fn node_failure_with_breaker_routes_fail_edges() {
    struct AlwaysFail;
    #[async_trait]
    impl NodeBody for AlwaysFail {
        async fn execute(
            &self,
            _workflow: Arc<WorkflowExecutionContext>,
            _node: &mut NodeExecutionContext,
            _cancel: CancellationToken,
        ) -> Result<(), NodeError> {
            Err(NodeError::new("io", "downstream unavailable"))
        }
    }

    let engine = WorkflowEngine::builder()
        .body("X", Arc::new(AlwaysFail))
        .build();

    let mut def = weir_core::WorkflowDefinition::new("breaker", "Breaker workflow");
    let mut x = task("X");
    x.circuit_breaker = Some(CircuitBreakerPolicy {
        failure_threshold: 50.0,
        minimum_throughput: 1,
        open_duration_ms: 60_000,
        half_open_successes: 1,
    });
    def.add_node(x);
    def.add_node(NodeDefinition::noop("handler"));
    def.add_connection(
        NodeConnection::new("X", "handler").on(weir_core::message::MessageType::Fail),
    );

    let ctx = engine.start(def).await.unwrap();
    let status = engine.wait(ctx.instance_id).await.unwrap();

    // The failure was handled by the Fail edge, so the workflow completes.
    assert_eq!(status, WorkflowStatus::Completed);
    let instances = engine.instances(ctx.instance_id).unwrap();
    assert!(instances
        .iter()
        .any(|i| i.node_id == "handler" && i.status == NodeInstanceStatus::Completed));
}

// ---------------------------------------------------------------------------
// Scenario 5: conditional routing
// ---------------------------------------------------------------------------

async fn run_conditional(value: i64) -> Vec<String> {
    let engine = WorkflowEngine::builder()
        .body(
            "Source",
            Arc::new(EmitVariableBody {
                variable: "value".into(),
                output_key: "value".into(),
            }),
        )
        .build();

    let mut def = weir_core::WorkflowDefinition::new("cond", "Conditional routing");
    def.default_variables.insert("value".into(), json!(value));
    def.add_node(task("Source"));
    def.add_node(NodeDefinition::noop("T1"));
    def.add_node(NodeDefinition::noop("T2"));
    def.add_connection(NodeConnection::new("Source", "T1").when("output.value > 10"));
    def.add_connection(NodeConnection::new("Source", "T2").when("output.value <= 10"));

    let ctx = engine.start(def).await.unwrap();
    let status = engine.wait(ctx.instance_id).await.unwrap();
    assert_eq!(status, WorkflowStatus::Completed);

    engine
        .instances(ctx.instance_id)
        .unwrap()
        .iter()
        .filter(|i| i.status == NodeInstanceStatus::Completed && i.node_id != "Source")
        .map(|i| i.node_id.clone())
        .collect()
}

#[tokio::test]
async fn conditional_routing_picks_one_branch() {
    assert_eq!(run_conditional(15).await, vec!["T1"]);
    assert_eq!(run_conditional(5).await, vec!["T2"]);
    assert_eq!(run_conditional(10).await, vec!["T2"]);
}

// ---------------------------------------------------------------------------
// Scenario 6: checkpoint and resume
// ---------------------------------------------------------------------------

/// Blocks until the notify is released; used to hold a node mid-run.
struct GateBody {
    label: String,
    release: Arc<tokio::sync::Notify>,
    open: bool,
    log: Log,
}

#[async_trait]
impl NodeBody for GateBody {
    async fn execute(
        &self,
        _workflow: Arc<WorkflowExecutionContext>,
        _node: &mut NodeExecutionContext,
        _cancel: CancellationToken,
    ) -> Result<(), NodeError> {
        if !self.open {
            self.release.notified().await;
        }
        self.log.lock().unwrap().push(self.label.clone());
        Ok(())
    }
}

/// Sets a workflow variable, then records itself.
struct SetVariableBody {
    label: String,
    key: String,
    value: Value,
    log: Log,
}

#[async_trait]
impl NodeBody for SetVariableBody {
    async fn execute(
        &self,
        workflow: Arc<WorkflowExecutionContext>,
        _node: &mut NodeExecutionContext,
        _cancel: CancellationToken,
    ) -> Result<(), NodeError> {
        workflow.variables.set(self.key.clone(), self.value.clone());
        self.log.lock().unwrap().push(self.label.clone());
        Ok(())
    }
}

fn ten_node_chain() -> weir_core::WorkflowDefinition {
    let mut def = weir_core::WorkflowDefinition::new("resumable", "Ten node chain");
    def.default_variables.insert("seed".into(), json!(1));
    for i in 1..=10 {
        def.add_node(task(&format!("n{i}")));
    }
    for i in 1..10 {
        def.add_connection(NodeConnection::new(format!("n{i}"), format!("n{}", i + 1)));
    }
    def
}

fn build_chain_engine(log: Log, gate_open: bool, release: Arc<tokio::sync::Notify>) -> WorkflowEngine {
    let mut builder = WorkflowEngine::builder().checkpoint_store(Arc::new(MemoryCheckpointStore::new()));
    for i in 1..=10 {
        let label = format!("n{i}");
        if i == 2 {
            builder = builder.body(
                label.clone(),
                Arc::new(SetVariableBody {
                    label,
                    key: "checkpoint_var".into(),
                    value: json!(42),
                    log: log.clone(),
                }),
            );
        } else if i == 6 {
            builder = builder.body(
                label.clone(),
                Arc::new(GateBody {
                    label,
                    release: release.clone(),
                    open: gate_open,
                    log: log.clone(),
                }),
            );
        } else {
            builder = builder.body(
                label.clone(),
                SleepBody::new(&label, Duration::ZERO, log.clone(), new_spans()),
            );
        }
    }
    builder.build()
}

#[tokio::test]
async fn checkpoint_resume_skips_completed_nodes() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let release = Arc::new(tokio::sync::Notify::new());

    // First run: node 6 blocks, nodes 1-5 complete.
    let first_log = new_log();
    let mut builder = WorkflowEngine::builder().checkpoint_store(store.clone());
    for i in 1..=10 {
        let label = format!("n{i}");
        if i == 2 {
            builder = builder.body(
                label.clone(),
                Arc::new(SetVariableBody {
                    label,
                    key: "checkpoint_var".into(),
                    value: json!(42),
                    log: first_log.clone(),
                }),
            );
        } else if i == 6 {
            builder = builder.body(
                label.clone(),
                Arc::new(GateBody {
                    label,
                    release: release.clone(),
                    open: false,
                    log: first_log.clone(),
                }),
            );
        } else {
            builder = builder.body(
                label.clone(),
                SleepBody::new(&label, Duration::ZERO, first_log.clone(), new_spans()),
            );
        }
    }
    let engine = builder.build();

    let ctx = engine.start(ten_node_chain()).await.unwrap();

    // Wait until node 6 is running (nodes 1-5 completed).
    loop {
        let instances = engine.instances(ctx.instance_id).unwrap();
        if instances
            .iter()
            .any(|i| i.node_id == "n6" && i.status == NodeInstanceStatus::Running)
        {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(first_log.lock().unwrap().len(), 5);

    let meta = engine.checkpoint(ctx.instance_id, "before-crash").await.unwrap();
    assert_eq!(meta.completed_nodes, 5);

    // Simulated crash.
    engine.cancel(ctx.instance_id, "simulated crash");
    engine.wait(ctx.instance_id).await.unwrap();

    // Second process: gate open, fresh engine, same store.
    let second_log = new_log();
    let resumed_engine = build_chain_engine(second_log.clone(), true, release);
    let state = store.load("before-crash").await.unwrap();
    let original_completed: Vec<_> = state
        .node_instances
        .iter()
        .filter(|i| i.status == NodeInstanceStatus::Completed)
        .map(|i| i.instance_id)
        .collect();
    assert_eq!(original_completed.len(), 5);

    let resumed = resumed_engine
        .resume_from_checkpoint(ten_node_chain(), state)
        .await
        .unwrap();
    let status = resumed_engine.wait(resumed.instance_id).await.unwrap();
    assert_eq!(status, WorkflowStatus::Completed);

    // Nodes 1-5 did not re-execute; 6-10 ran in the second process.
    assert_eq!(
        second_log.lock().unwrap().clone(),
        vec!["n6", "n7", "n8", "n9", "n10"]
    );

    // Hydrated records survive with their original ids.
    let instances = resumed_engine.instances(resumed.instance_id).unwrap();
    for id in original_completed {
        assert!(instances.iter().any(|i| i.instance_id == id));
    }

    // Variables equal the pre-crash values.
    assert_eq!(resumed.variables.get("seed"), Some(json!(1)));
    assert_eq!(resumed.variables.get("checkpoint_var"), Some(json!(42)));
}
