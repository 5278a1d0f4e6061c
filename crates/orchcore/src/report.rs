use crate::{
    events::ExecutionId, HaltReason, TaskId, TaskStatus, WorkerId, WorkerMetrics, WorkflowId,
    WorkflowStatus,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    NotStarted,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Outcome of one phase
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseOutcome {
    pub index: usize,
    pub task_ids: Vec<TaskId>,
    pub concurrent: bool,
    pub status: PhaseStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub failed_tasks: Vec<TaskId>,
}

/// Final record of one task
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskOutcome {
    pub id: TaskId,
    pub phase: usize,
    pub status: TaskStatus,
    pub attempts: u32,
    pub worker: Option<WorkerId>,
    pub duration_ms: u64,
    pub cached: bool,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vote {
    Approve,
    Reject,
    Abstain,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VoteRecord {
    pub worker_id: WorkerId,
    pub vote: Vote,
    pub reason: Option<String>,
}

/// Result of a consensus round
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsensusOutcome {
    pub topic: String,
    pub reached: bool,
    pub threshold: f64,
    pub approvals: usize,
    pub rejections: usize,
    pub abstentions: usize,
    pub details: Vec<VoteRecord>,
}

impl ConsensusOutcome {
    pub fn total(&self) -> usize {
        self.approvals + self.rejections + self.abstentions
    }
}

/// Structured record handed to reporting collaborators once a workflow ends
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionReport {
    pub workflow_id: WorkflowId,
    pub execution_id: ExecutionId,
    pub name: String,
    pub status: WorkflowStatus,
    pub halt_reason: Option<HaltReason>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub phases: Vec<PhaseOutcome>,
    pub tasks: Vec<TaskOutcome>,
    pub failed_tasks: Vec<TaskId>,
    /// Failures that stopped the workflow from progressing
    pub blocking_failures: Vec<TaskId>,
    /// Where a caller should resume from
    pub first_failed_phase: Option<usize>,
    pub worker_metrics: Vec<WorkerMetrics>,
    pub consensus: Vec<ConsensusOutcome>,
}

impl ExecutionReport {
    pub fn is_success(&self) -> bool {
        self.status == WorkflowStatus::Completed
    }

    pub fn task(&self, id: &str) -> Option<&TaskOutcome> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn completed_tasks(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .count()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskProgress {
    pub id: TaskId,
    pub phase: usize,
    pub status: TaskStatus,
    pub attempt: u32,
    pub worker: Option<WorkerId>,
}

/// Point-in-time view of a workflow execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressSnapshot {
    pub workflow_id: WorkflowId,
    pub status: WorkflowStatus,
    /// Index of the phase currently executing (or last executed)
    pub phase_index: usize,
    pub total_phases: usize,
    pub tasks: Vec<TaskProgress>,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub total_tasks: usize,
}

impl ProgressSnapshot {
    /// Fraction of tasks in a terminal state
    pub fn percent_complete(&self) -> f64 {
        if self.total_tasks == 0 {
            return 100.0;
        }
        let done = self.tasks.iter().filter(|t| t.status.is_terminal()).count();
        done as f64 * 100.0 / self.total_tasks as f64
    }
}
