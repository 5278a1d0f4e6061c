use crate::{TaskId, WorkerId, WorkflowId, WorkflowStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

pub type ExecutionId = Uuid;

/// Events emitted while a workflow executes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    WorkflowStarted {
        workflow_id: WorkflowId,
        execution_id: ExecutionId,
        total_phases: usize,
        timestamp: DateTime<Utc>,
    },
    WorkflowCompleted {
        workflow_id: WorkflowId,
        status: WorkflowStatus,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    PhaseStarted {
        workflow_id: WorkflowId,
        phase: usize,
        task_ids: Vec<TaskId>,
        timestamp: DateTime<Utc>,
    },
    PhaseCompleted {
        workflow_id: WorkflowId,
        phase: usize,
        success: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    TaskQueued {
        workflow_id: WorkflowId,
        task_id: TaskId,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    TaskStarted {
        workflow_id: WorkflowId,
        task_id: TaskId,
        worker_id: WorkerId,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },
    TaskProgress {
        workflow_id: WorkflowId,
        task_id: TaskId,
        update: TaskUpdate,
        timestamp: DateTime<Utc>,
    },
    TaskCompleted {
        workflow_id: WorkflowId,
        task_id: TaskId,
        cached: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    TaskFailed {
        workflow_id: WorkflowId,
        task_id: TaskId,
        error: String,
        attempt: u32,
        will_retry: bool,
        timestamp: DateTime<Utc>,
    },
    TaskTimeout {
        workflow_id: WorkflowId,
        task_id: TaskId,
        attempt: u32,
        will_retry: bool,
        timestamp: DateTime<Utc>,
    },
    TaskCancelled {
        workflow_id: WorkflowId,
        task_id: TaskId,
        timestamp: DateTime<Utc>,
    },
}

impl ProgressEvent {
    /// Wire name matching the `area:action` naming used by progress consumers
    pub fn name(&self) -> &'static str {
        match self {
            ProgressEvent::WorkflowStarted { .. } => "workflow:start",
            ProgressEvent::WorkflowCompleted { .. } => "workflow:complete",
            ProgressEvent::PhaseStarted { .. } => "phase:start",
            ProgressEvent::PhaseCompleted { .. } => "phase:complete",
            ProgressEvent::TaskQueued { .. } => "task:queued",
            ProgressEvent::TaskStarted { .. } => "task:start",
            ProgressEvent::TaskProgress { .. } => "task:progress",
            ProgressEvent::TaskCompleted { .. } => "task:complete",
            ProgressEvent::TaskFailed { .. } => "task:failed",
            ProgressEvent::TaskTimeout { .. } => "task:timeout",
            ProgressEvent::TaskCancelled { .. } => "task:cancelled",
        }
    }

    pub fn workflow_id(&self) -> WorkflowId {
        match self {
            ProgressEvent::WorkflowStarted { workflow_id, .. }
            | ProgressEvent::WorkflowCompleted { workflow_id, .. }
            | ProgressEvent::PhaseStarted { workflow_id, .. }
            | ProgressEvent::PhaseCompleted { workflow_id, .. }
            | ProgressEvent::TaskQueued { workflow_id, .. }
            | ProgressEvent::TaskStarted { workflow_id, .. }
            | ProgressEvent::TaskProgress { workflow_id, .. }
            | ProgressEvent::TaskCompleted { workflow_id, .. }
            | ProgressEvent::TaskFailed { workflow_id, .. }
            | ProgressEvent::TaskTimeout { workflow_id, .. }
            | ProgressEvent::TaskCancelled { workflow_id, .. } => *workflow_id,
        }
    }
}

/// Updates a worker reports while a task is running
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "update_type", rename_all = "snake_case")]
pub enum TaskUpdate {
    Info { message: String },
    Warning { message: String },
    Progress { percent: f64, message: Option<String> },
}

/// Event emitter handed to invokers for real-time updates
#[derive(Clone)]
pub struct EventEmitter {
    workflow_id: WorkflowId,
    task_id: TaskId,
    sender: broadcast::Sender<ProgressEvent>,
}

impl EventEmitter {
    pub fn new(
        workflow_id: WorkflowId,
        task_id: TaskId,
        sender: broadcast::Sender<ProgressEvent>,
    ) -> Self {
        Self {
            workflow_id,
            task_id,
            sender,
        }
    }

    /// Emit a task-specific update
    pub fn emit(&self, update: TaskUpdate) {
        let _ = self.sender.send(ProgressEvent::TaskProgress {
            workflow_id: self.workflow_id,
            task_id: self.task_id.clone(),
            update,
            timestamp: Utc::now(),
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(TaskUpdate::Info {
            message: message.into(),
        });
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.emit(TaskUpdate::Warning {
            message: message.into(),
        });
    }

    pub fn progress(&self, percent: f64, message: Option<String>) {
        self.emit(TaskUpdate::Progress { percent, message });
    }
}

/// Fan-out channel for progress events
///
/// Sending never blocks; slow subscribers lag and drop events instead of
/// holding back the scheduler.
pub struct EventBus {
    sender: broadcast::Sender<ProgressEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ProgressEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("progress event dropped, no subscribers");
        }
    }

    pub fn create_emitter(&self, workflow_id: WorkflowId, task_id: TaskId) -> EventEmitter {
        EventEmitter::new(workflow_id, task_id, self.sender.clone())
    }
}
