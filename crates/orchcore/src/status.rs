use crate::TaskId;
use serde::{Deserialize, Serialize};

/// Per-task state machine
///
/// `pending -> ready -> (queued) -> dispatched -> completed | failed | timeout`,
/// with `timeout -> ready` while attempts remain. `blocked` marks tasks whose
/// dependencies failed and `cancelled` tasks interrupted by a cancel signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Ready,
    Queued,
    Dispatched,
    Completed,
    Failed,
    Timeout,
    Cancelled,
    Blocked,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Blocked
        )
    }

    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Ready) | (Pending, Blocked) | (Pending, Cancelled) => true,
            (Ready, Queued) | (Ready, Dispatched) | (Ready, Completed) => true,
            (Ready, Failed) | (Ready, Cancelled) => true,
            (Queued, Dispatched) | (Queued, Completed) | (Queued, Failed) => true,
            (Queued, Cancelled) => true,
            (Dispatched, Completed) | (Dispatched, Failed) | (Dispatched, Timeout) => true,
            (Dispatched, Cancelled) | (Dispatched, Ready) => true,
            (Timeout, Ready) | (Timeout, Failed) | (Timeout, Cancelled) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, WorkflowStatus::Running)
    }
}

/// Why a workflow stopped before running every phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltReason {
    TaskFailure,
    ConsensusNotReached,
    Cancelled,
    TimedOut,
}

/// A set of tasks whose dependencies are all resolved by earlier phases
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
    pub index: usize,
    pub task_ids: Vec<TaskId>,
    pub concurrent: bool,
}

impl Phase {
    pub fn new(index: usize, task_ids: Vec<TaskId>) -> Self {
        let concurrent = task_ids.len() > 1;
        Self {
            index,
            task_ids,
            concurrent,
        }
    }
}
