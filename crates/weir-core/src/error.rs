use thiserror::Error;

/// Top-level error type for the weir-core library.
#[derive(Debug, Error)]
pub enum WeirError {
    /// Malformed workflow definition. Fatal at start, never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// Expression could not be parsed or evaluated.
    #[error("invalid condition: {0}")]
    Condition(String),

    /// Message could not be routed (bad target list, cleared table).
    #[error("routing error: {0}")]
    Routing(String),

    /// Inbox enqueue/dequeue failure.
    #[error("queue error: {0}")]
    Queue(String),

    /// A limiter or throttler waiter was cancelled before a slot arrived.
    #[error("resource error: {0}")]
    Resource(String),

    /// Node rejected because its circuit breaker is open.
    #[error("circuit open for node '{0}'")]
    CircuitOpen(String),

    /// Checkpoint serialization or storage failure.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Workflow or node deadline exceeded.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Engine lifecycle misuse (unknown instance, pause not permitted).
    #[error("engine error: {0}")]
    Engine(String),

    /// Wraps `std::io::Error`.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Wraps `serde_json::Error`.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, WeirError>;

/// Error raised by a node body, subject to the node's retry policy.
///
/// The `kind` tag is the unit of retry classification: `RetryOn` and
/// `DoNotRetryOn` lists match against it case-insensitively.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct NodeError {
    pub kind: String,
    pub message: String,
}

impl NodeError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// A body error with no meaningful classification.
    pub fn unclassified(message: impl Into<String>) -> Self {
        Self::new("unclassified", message)
    }
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for NodeError {}

impl From<WeirError> for NodeError {
    fn from(err: WeirError) -> Self {
        match &err {
            WeirError::Condition(msg) => NodeError::new("condition", msg.clone()),
            WeirError::Timeout(msg) => NodeError::new("timeout", msg.clone()),
            WeirError::Io(e) => NodeError::new("io", e.to_string()),
            _ => NodeError::new("engine", err.to_string()),
        }
    }
}
