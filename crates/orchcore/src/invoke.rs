use crate::{events::EventEmitter, InvokeError, Task, TaskId, Worker, WorkflowId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Boundary between the scheduler and whatever actually performs a task
///
/// Production code routes to a real backend, tests substitute a deterministic fake.
#[async_trait]
pub trait WorkerInvoker: Send + Sync {
    /// Backend identifier (e.g. "process", "http")
    fn backend(&self) -> &str;

    /// Run `ctx.task` on `ctx.worker`
    async fn invoke(&self, ctx: InvocationContext) -> Result<TaskOutput, InvokeError>;

    /// Whether an in-flight invocation aborts when its cancellation token fires.
    ///
    /// When false the scheduler lets the invocation finish and discards the result.
    fn supports_cancellation(&self) -> bool {
        true
    }

    /// Optional: Validate a worker's backend configuration at discovery time
    fn validate_worker(&self, _worker: &Worker) -> Result<(), InvokeError> {
        Ok(())
    }
}

/// Everything an invoker gets to know about one attempt
#[derive(Clone)]
pub struct InvocationContext {
    pub workflow_id: WorkflowId,

    /// Snapshot of the worker taken at acquisition time
    pub worker: Worker,

    pub task: Task,

    /// Outputs of the task's completed dependencies
    pub inputs: HashMap<TaskId, serde_json::Value>,

    /// 1-based attempt number
    pub attempt: u32,

    /// Time budget for this attempt; the scheduler gives up afterwards
    pub timeout: Duration,

    /// Event emitter for progress updates
    pub events: EventEmitter,

    /// Fires on workflow cancellation or attempt timeout
    pub cancellation: CancellationToken,
}

impl InvocationContext {
    /// Get a config value of the worker or return error
    pub fn require_config(&self, name: &str) -> Result<&serde_json::Value, InvokeError> {
        self.worker
            .config
            .get(name)
            .ok_or_else(|| InvokeError::Configuration(format!("Missing config: {}", name)))
    }

    /// Get a string field from the task payload, falling back to worker config
    pub fn setting_str(&self, name: &str) -> Option<&str> {
        self.task
            .payload
            .get(name)
            .and_then(|v| v.as_str())
            .or_else(|| self.worker.config.get(name).and_then(|v| v.as_str()))
    }
}

/// Output of a successful invocation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskOutput {
    pub output: serde_json::Value,
    pub metadata: InvocationMetadata,
}

impl TaskOutput {
    pub fn new(output: serde_json::Value) -> Self {
        Self {
            output,
            metadata: InvocationMetadata::default(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.custom.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct InvocationMetadata {
    pub execution_time_ms: u64,
    pub custom: HashMap<String, serde_json::Value>,
}
