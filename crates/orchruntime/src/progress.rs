use chrono::Utc;
use orchcore::{
    EventBus, ExecutionId, Phase, ProgressEvent, ProgressSnapshot, TaskId, TaskProgress,
    TaskStatus, WorkerId, WorkflowId, WorkflowStatus,
};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

struct TrackerState {
    status: WorkflowStatus,
    phase_index: usize,
    tasks: Vec<TaskProgress>,
    index: HashMap<TaskId, usize>,
}

/// Observes a workflow execution and fans events out to subscribers
///
/// Purely observational: the scheduler owns every decision and only reports
/// here. Recording never waits on subscribers.
pub struct ProgressTracker {
    workflow_id: WorkflowId,
    total_phases: usize,
    state: RwLock<TrackerState>,
    events: Arc<EventBus>,
}

impl ProgressTracker {
    pub fn new(workflow_id: WorkflowId, phases: &[Phase], events: Arc<EventBus>) -> Self {
        let mut tasks = Vec::new();
        let mut index = HashMap::new();
        for phase in phases {
            for id in &phase.task_ids {
                index.insert(id.clone(), tasks.len());
                tasks.push(TaskProgress {
                    id: id.clone(),
                    phase: phase.index,
                    status: TaskStatus::Pending,
                    attempt: 0,
                    worker: None,
                });
            }
        }

        Self {
            workflow_id,
            total_phases: phases.len(),
            state: RwLock::new(TrackerState {
                status: WorkflowStatus::Running,
                phase_index: 0,
                tasks,
                index,
            }),
            events,
        }
    }

    pub fn workflow_id(&self) -> WorkflowId {
        self.workflow_id
    }

    fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut TrackerState),
    {
        let mut state = self.state.write().unwrap_or_else(|p| p.into_inner());
        f(&mut state);
    }

    fn update_task<F>(&self, id: &str, f: F)
    where
        F: FnOnce(&mut TaskProgress),
    {
        self.update(|state| {
            if let Some(pos) = state.index.get(id).copied() {
                f(&mut state.tasks[pos]);
            }
        });
    }

    fn set_status(&self, id: &str, status: TaskStatus) {
        self.update_task(id, |t| t.status = status);
    }

    pub fn workflow_started(&self, execution_id: ExecutionId) {
        self.events.emit(ProgressEvent::WorkflowStarted {
            workflow_id: self.workflow_id,
            execution_id,
            total_phases: self.total_phases,
            timestamp: Utc::now(),
        });
    }

    pub fn workflow_completed(&self, status: WorkflowStatus, duration_ms: u64) {
        self.update(|state| state.status = status);
        self.events.emit(ProgressEvent::WorkflowCompleted {
            workflow_id: self.workflow_id,
            status,
            duration_ms,
            timestamp: Utc::now(),
        });
    }

    pub fn phase_started(&self, phase: &Phase) {
        self.update(|state| state.phase_index = phase.index);
        self.events.emit(ProgressEvent::PhaseStarted {
            workflow_id: self.workflow_id,
            phase: phase.index,
            task_ids: phase.task_ids.clone(),
            timestamp: Utc::now(),
        });
    }

    pub fn phase_completed(&self, phase: usize, success: bool, duration_ms: u64) {
        self.events.emit(ProgressEvent::PhaseCompleted {
            workflow_id: self.workflow_id,
            phase,
            success,
            duration_ms,
            timestamp: Utc::now(),
        });
    }

    pub fn task_ready(&self, id: &str) {
        self.set_status(id, TaskStatus::Ready);
    }

    pub fn task_blocked(&self, id: &str) {
        self.set_status(id, TaskStatus::Blocked);
    }

    pub fn task_queued(&self, id: &str, reason: &str) {
        self.set_status(id, TaskStatus::Queued);
        self.events.emit(ProgressEvent::TaskQueued {
            workflow_id: self.workflow_id,
            task_id: id.to_string(),
            reason: reason.to_string(),
            timestamp: Utc::now(),
        });
    }

    pub fn task_started(&self, id: &str, worker: &WorkerId, attempt: u32) {
        self.update_task(id, |t| {
            t.status = TaskStatus::Dispatched;
            t.attempt = attempt;
            t.worker = Some(worker.clone());
        });
        self.events.emit(ProgressEvent::TaskStarted {
            workflow_id: self.workflow_id,
            task_id: id.to_string(),
            worker_id: worker.clone(),
            attempt,
            timestamp: Utc::now(),
        });
    }

    pub fn task_completed(&self, id: &str, cached: bool, duration_ms: u64) {
        self.set_status(id, TaskStatus::Completed);
        self.events.emit(ProgressEvent::TaskCompleted {
            workflow_id: self.workflow_id,
            task_id: id.to_string(),
            cached,
            duration_ms,
            timestamp: Utc::now(),
        });
    }

    pub fn task_failed(&self, id: &str, error: &str, attempt: u32, will_retry: bool) {
        let status = if will_retry {
            TaskStatus::Ready
        } else {
            TaskStatus::Failed
        };
        self.set_status(id, status);
        self.events.emit(ProgressEvent::TaskFailed {
            workflow_id: self.workflow_id,
            task_id: id.to_string(),
            error: error.to_string(),
            attempt,
            will_retry,
            timestamp: Utc::now(),
        });
    }

    pub fn task_timeout(&self, id: &str, attempt: u32, will_retry: bool) {
        let status = if will_retry {
            TaskStatus::Ready
        } else {
            TaskStatus::Failed
        };
        self.set_status(id, status);
        self.events.emit(ProgressEvent::TaskTimeout {
            workflow_id: self.workflow_id,
            task_id: id.to_string(),
            attempt,
            will_retry,
            timestamp: Utc::now(),
        });
    }

    pub fn task_cancelled(&self, id: &str) {
        self.set_status(id, TaskStatus::Cancelled);
        self.events.emit(ProgressEvent::TaskCancelled {
            workflow_id: self.workflow_id,
            task_id: id.to_string(),
            timestamp: Utc::now(),
        });
    }

    /// Current view; identical across calls when nothing changed in between
    pub fn snapshot(&self) -> ProgressSnapshot {
        let state = self.state.read().unwrap_or_else(|p| p.into_inner());
        let completed_tasks = state
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .count();
        let failed_tasks = state
            .tasks
            .iter()
            .filter(|t| matches!(t.status, TaskStatus::Failed | TaskStatus::Blocked))
            .count();

        ProgressSnapshot {
            workflow_id: self.workflow_id,
            status: state.status,
            phase_index: state.phase_index,
            total_phases: self.total_phases,
            tasks: state.tasks.clone(),
            completed_tasks,
            failed_tasks,
            total_tasks: state.tasks.len(),
        }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }
}
