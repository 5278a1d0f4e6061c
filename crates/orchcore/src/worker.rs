use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub type WorkerId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Busy,
}

/// Rolling performance statistics maintained by the registry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerPerformance {
    pub avg_response_time_ms: f64,
    pub success_rate: f64,
    pub completed_invocations: u64,
}

impl Default for WorkerPerformance {
    fn default() -> Self {
        Self {
            avg_response_time_ms: 0.0,
            success_rate: 1.0,
            completed_invocations: 0,
        }
    }
}

/// A unit capable of executing tasks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    pub name: String,
    pub capabilities: BTreeSet<String>,
    pub team: String,
    pub status: WorkerStatus,
    /// Number of invocations handed to this worker so far.
    pub workload: u64,
    pub performance: WorkerPerformance,
    /// Backend used to reach the worker (e.g. "process", "http").
    #[serde(default)]
    pub backend: Option<String>,
    #[serde(default)]
    pub config: serde_json::Value,
}

impl Worker {
    pub fn is_idle(&self) -> bool {
        self.status == WorkerStatus::Idle
    }

    pub fn has_capabilities<'a, I>(&self, required: I) -> bool
    where
        I: IntoIterator<Item = &'a String>,
    {
        required
            .into_iter()
            .all(|c| self.capabilities.contains(c))
    }
}

/// Outcome metrics reported when a worker is released
#[derive(Debug, Clone, Copy)]
pub struct ReleaseMetrics {
    pub duration_ms: u64,
    pub success: bool,
}

/// Per-worker summary included in execution reports
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerMetrics {
    pub worker_id: WorkerId,
    pub team: String,
    pub invocations: u64,
    pub avg_response_time_ms: f64,
    pub success_rate: f64,
}

impl From<&Worker> for WorkerMetrics {
    fn from(worker: &Worker) -> Self {
        Self {
            worker_id: worker.id.clone(),
            team: worker.team.clone(),
            invocations: worker.workload,
            avg_response_time_ms: worker.performance.avg_response_time_ms,
            success_rate: worker.performance.success_rate,
        }
    }
}
