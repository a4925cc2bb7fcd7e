//! Weir: a graph-based, message-driven workflow execution engine.
//!
//! Workflows are directed graphs of nodes joined by message-carrying
//! edges. The engine drives nodes from per-node inboxes, routes their
//! terminal messages along conditional edges, and layers on priority-aware
//! concurrency limits, per-node throttling, retries, circuit breaking,
//! checkpoint/resume, and reactive event/progress streams.

pub mod breaker;
pub mod checkpoint;
pub mod condition;
pub mod context;
pub mod definition;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod instance;
pub mod limiter;
pub mod loader;
pub mod message;
pub mod queue;
pub mod retry;
pub mod router;
pub mod throttle;

pub use context::{WorkflowExecutionContext, WorkflowStatus};
pub use definition::{NodeConnection, NodeDefinition, NodeKind, WorkflowDefinition};
pub use engine::{EngineBuilder, EngineConfig, WorkflowEngine};
pub use error::{NodeError, Result, WeirError};
pub use events::{ProgressUpdate, WorkflowEvent};

use tracing::info;

/// Initialise a default tracing subscriber for the library consumer.
///
/// Call this once at program start. Uses `RUST_LOG` env var for filtering,
/// defaulting to `info` level.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt().with_env_filter(filter).init();

    info!("weir tracing initialised");
}
