use crate::graph::DependencyGraph;
use crate::runtime::Orchestrator;
use futures::future::join_all;
use orchcore::{
    ExecutionReport, OrchError, WorkflowError, WorkflowId, WorkflowSpec, WorkflowStatus,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// A group of workflows run together
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    #[serde(default)]
    pub name: Option<String>,
    /// Run member workflows concurrently instead of one after another
    #[serde(default)]
    pub parallel: bool,
    pub workflows: Vec<WorkflowId>,
    /// Execution limit applied to members that set none themselves
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl Stage {
    pub fn sequential(workflows: Vec<WorkflowId>) -> Self {
        Self {
            name: None,
            parallel: false,
            workflows,
            timeout_ms: None,
        }
    }

    pub fn parallel(workflows: Vec<WorkflowId>) -> Self {
        Self {
            parallel: true,
            ..Self::sequential(workflows)
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageReport {
    pub index: usize,
    pub name: Option<String>,
    pub parallel: bool,
    pub status: StageStatus,
    pub workflows: Vec<ExecutionReport>,
    /// Workflows that could not be run at all
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiWorkflowReport {
    pub status: WorkflowStatus,
    pub stages: Vec<StageReport>,
    pub duration_ms: u64,
}

impl MultiWorkflowReport {
    pub fn stage(&self, index: usize) -> Option<&StageReport> {
        self.stages.get(index)
    }
}

/// Progress of one workflow as seen by the poller
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowProgress {
    pub workflow_id: WorkflowId,
    pub name: String,
    /// `None` until the workflow has started
    pub status: Option<WorkflowStatus>,
    pub phase_index: usize,
    pub total_phases: usize,
    pub percent_complete: f64,
}

/// Aggregated view over every workflow of a run
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CombinedProgress {
    pub workflows: Vec<WorkflowProgress>,
    pub overall_percent: f64,
}

/// Runs several workflows in declared sequential and parallel stages
///
/// A failed stage stops the run: every later stage is reported as skipped.
pub struct MultiWorkflowCoordinator {
    orchestrator: Arc<Orchestrator>,
    workflows: HashMap<WorkflowId, WorkflowSpec>,
    allow_partial_success: bool,
    poll_interval: Duration,
    progress: Arc<watch::Sender<CombinedProgress>>,
    cancel: CancellationToken,
}

impl MultiWorkflowCoordinator {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        let poll_interval = Duration::from_millis(orchestrator.config().progress_poll_interval_ms);
        let (progress, _) = watch::channel(CombinedProgress::default());
        Self {
            orchestrator,
            workflows: HashMap::new(),
            allow_partial_success: false,
            poll_interval,
            progress: Arc::new(progress),
            cancel: CancellationToken::new(),
        }
    }

    /// Treat a stage as successful when at least one member succeeds
    pub fn allow_partial_success(mut self, allow: bool) -> Self {
        self.allow_partial_success = allow;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Register a workflow so stages can refer to it by ID
    pub fn add_workflow(&mut self, spec: WorkflowSpec) -> WorkflowId {
        let id = spec.id;
        self.workflows.insert(id, spec);
        id
    }

    pub fn progress(&self) -> watch::Receiver<CombinedProgress> {
        self.progress.subscribe()
    }

    /// Stop the run: in-flight workflows are cancelled, later stages skipped
    pub async fn cancel(&self) {
        self.cancel.cancel();
        for id in self.workflows.keys() {
            if let Err(e) = self.orchestrator.cancel(*id).await {
                tracing::debug!("Workflow {} not cancelled: {}", id, e);
            }
        }
    }

    /// Check that every referenced workflow exists and is schedulable
    fn validate(&self, stages: &[Stage]) -> Result<(), OrchError> {
        for stage in stages {
            for id in &stage.workflows {
                let spec = self
                    .workflows
                    .get(id)
                    .ok_or(WorkflowError::NotFound(*id))?;
                DependencyGraph::build(&spec.tasks, spec.settings.dependency_mode)?;
            }
        }
        Ok(())
    }

    fn spec_for(&self, id: &WorkflowId, stage: &Stage) -> Result<WorkflowSpec, OrchError> {
        let mut spec = self
            .workflows
            .get(id)
            .cloned()
            .ok_or(WorkflowError::NotFound(*id))?;
        if spec.settings.max_execution_time_ms.is_none() {
            spec.settings.max_execution_time_ms = stage.timeout_ms;
        }
        Ok(spec)
    }

    /// Execute `stages` in order
    ///
    /// Every referenced workflow is validated before the first stage starts.
    pub async fn run(&self, stages: &[Stage]) -> Result<MultiWorkflowReport, OrchError> {
        self.validate(stages)?;
        let start = Instant::now();

        let stop = CancellationToken::new();
        let poller = tokio::spawn(poll_progress(
            self.orchestrator.clone(),
            self.tracked(stages),
            self.poll_interval,
            self.progress.clone(),
            stop.clone(),
        ));

        let mut reports = Vec::with_capacity(stages.len());
        let mut halted = false;

        for (index, stage) in stages.iter().enumerate() {
            if halted || self.cancel.is_cancelled() {
                tracing::info!("Skipping stage {}", index);
                reports.push(StageReport {
                    index,
                    name: stage.name.clone(),
                    parallel: stage.parallel,
                    status: StageStatus::Skipped,
                    workflows: Vec::new(),
                    errors: Vec::new(),
                    duration_ms: 0,
                });
                continue;
            }

            let report = self.run_stage(index, stage).await;
            if report.status == StageStatus::Failed {
                tracing::warn!("Stage {} failed, skipping remaining stages", index);
                halted = true;
            }
            reports.push(report);
        }

        stop.cancel();
        if let Err(e) = poller.await {
            tracing::warn!("Progress poller ended abnormally: {}", e);
        }

        let status = if self.cancel.is_cancelled() {
            WorkflowStatus::Cancelled
        } else if reports.iter().all(|r| r.status == StageStatus::Completed) {
            WorkflowStatus::Completed
        } else {
            WorkflowStatus::Failed
        };

        Ok(MultiWorkflowReport {
            status,
            stages: reports,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    async fn run_stage(&self, index: usize, stage: &Stage) -> StageReport {
        let start = Instant::now();
        tracing::info!(
            "Stage {} started: {} workflow(s), {}",
            index,
            stage.workflows.len(),
            if stage.parallel { "parallel" } else { "sequential" }
        );

        let results: Vec<Result<ExecutionReport, OrchError>> = if stage.parallel {
            let runs = stage.workflows.iter().map(|id| async move {
                let spec = self.spec_for(id, stage)?;
                self.orchestrator.orchestrate(spec).await
            });
            join_all(runs).await
        } else {
            let mut results = Vec::with_capacity(stage.workflows.len());
            for id in &stage.workflows {
                if self.cancel.is_cancelled() {
                    break;
                }
                let result = match self.spec_for(id, stage) {
                    Ok(spec) => self.orchestrator.orchestrate(spec).await,
                    Err(e) => Err(e),
                };
                let succeeded = matches!(&result, Ok(report) if report.is_success());
                results.push(result);
                if !succeeded && !self.allow_partial_success {
                    break;
                }
            }
            results
        };

        let mut workflows = Vec::new();
        let mut errors = Vec::new();
        for result in results {
            match result {
                Ok(report) => workflows.push(report),
                Err(e) => errors.push(e.to_string()),
            }
        }

        let succeeded = workflows.iter().filter(|r| r.is_success()).count();
        let all_ran = workflows.len() == stage.workflows.len();
        let status = if all_ran && succeeded == workflows.len() && !self.cancel.is_cancelled() {
            StageStatus::Completed
        } else if self.allow_partial_success && succeeded > 0 && !self.cancel.is_cancelled() {
            StageStatus::Completed
        } else {
            StageStatus::Failed
        };

        tracing::info!(
            "Stage {} finished: {:?} ({}/{} workflows succeeded)",
            index,
            status,
            succeeded,
            stage.workflows.len()
        );

        StageReport {
            index,
            name: stage.name.clone(),
            parallel: stage.parallel,
            status,
            workflows,
            errors,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    fn tracked(&self, stages: &[Stage]) -> Vec<(WorkflowId, String)> {
        let mut tracked = Vec::new();
        for stage in stages {
            for id in &stage.workflows {
                if tracked.iter().any(|(known, _)| known == id) {
                    continue;
                }
                let name = self
                    .workflows
                    .get(id)
                    .map(|s| s.name.clone())
                    .unwrap_or_default();
                tracked.push((*id, name));
            }
        }
        tracked
    }
}

async fn poll_progress(
    orchestrator: Arc<Orchestrator>,
    tracked: Vec<(WorkflowId, String)>,
    interval: Duration,
    progress: Arc<watch::Sender<CombinedProgress>>,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    loop {
        let stopping = tokio::select! {
            _ = ticker.tick() => false,
            _ = stop.cancelled() => true,
        };

        let combined = collect_progress(&orchestrator, &tracked).await;
        let finished = combined
            .workflows
            .iter()
            .filter(|w| w.status.map_or(false, |s| s.is_terminal()))
            .count();
        tracing::info!(
            "Progress: {}/{} workflows finished ({:.0}% overall)",
            finished,
            combined.workflows.len(),
            combined.overall_percent
        );
        progress.send_replace(combined);

        if stopping {
            break;
        }
    }
}

async fn collect_progress(
    orchestrator: &Orchestrator,
    tracked: &[(WorkflowId, String)],
) -> CombinedProgress {
    let mut workflows = Vec::with_capacity(tracked.len());
    for (id, name) in tracked {
        let entry = match orchestrator.status(*id).await {
            Ok(snapshot) => WorkflowProgress {
                workflow_id: *id,
                name: name.clone(),
                status: Some(snapshot.status),
                phase_index: snapshot.phase_index,
                total_phases: snapshot.total_phases,
                percent_complete: snapshot.percent_complete(),
            },
            Err(_) => WorkflowProgress {
                workflow_id: *id,
                name: name.clone(),
                status: None,
                phase_index: 0,
                total_phases: 0,
                percent_complete: 0.0,
            },
        };
        workflows.push(entry);
    }

    let overall_percent = if workflows.is_empty() {
        100.0
    } else {
        workflows.iter().map(|w| w.percent_complete).sum::<f64>() / workflows.len() as f64
    };

    CombinedProgress {
        workflows,
        overall_percent,
    }
}
