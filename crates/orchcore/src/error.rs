use crate::{TaskId, WorkflowId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrchError {
    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Invocation error: {0}")]
    Invoke(#[from] InvokeError),

    #[error("No eligible worker for {0}")]
    WorkerUnavailable(String),

    #[error("Task {task} timed out after {timeout_ms}ms")]
    InvocationTimeout { task: TaskId, timeout_ms: u64 },

    #[error("Task {task} failed: {reason}")]
    InvocationFailed { task: TaskId, reason: String },

    #[error("Consensus not reached on '{topic}': {approvals}/{total} approvals, threshold {threshold}")]
    ConsensusNotReached {
        topic: String,
        approvals: usize,
        total: usize,
        threshold: f64,
    },

    #[error("Resources exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Cancellation requested for workflow {0}")]
    CancellationRequested(WorkflowId),

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Error raised by a single worker invocation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InvokeError {
    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Invocation failed: {0}")]
    Failed(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Worker unavailable: {0}")]
    WorkerUnavailable(String),

    #[error("Cancelled")]
    Cancelled,
}

/// Errors detected while validating a workflow, before anything is dispatched.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkflowError {
    #[error("Workflow not found: {0}")]
    NotFound(WorkflowId),

    #[error("Invalid workflow: {0}")]
    Invalid(String),

    #[error("Workflow {0} is still running")]
    StillRunning(WorkflowId),

    #[error("Cyclic dependency detected among [{}]", .0.join(", "))]
    CycleDetected(Vec<TaskId>),

    #[error("Task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: TaskId, dependency: TaskId },

    #[error("Duplicate task id: {0}")]
    DuplicateTask(TaskId),

    #[error("Workflow has no tasks")]
    EmptyWorkflow,
}
