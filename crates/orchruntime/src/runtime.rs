use crate::admission::{AdmissionConfig, AdmissionControl};
use crate::cache::{CacheConfig, ResultCache};
use crate::graph::DependencyGraph;
use crate::progress::ProgressTracker;
use crate::registry::WorkerRegistry;
use crate::scheduler::PhaseScheduler;
use orchcore::{
    EventBus, ExecutionReport, OrchError, ProgressEvent, ProgressSnapshot, WorkerId,
    WorkerInvoker, WorkflowError, WorkflowId, WorkflowSpec, WorkflowStatus,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;

struct Execution {
    name: String,
    submitted_at: Instant,
    tracker: Arc<ProgressTracker>,
    cancel: CancellationToken,
    done: watch::Receiver<Option<ExecutionReport>>,
}

/// Short listing entry for a known execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionSummary {
    pub workflow_id: WorkflowId,
    pub name: String,
    pub status: WorkflowStatus,
    pub percent_complete: f64,
}

/// Main entry point for running workflows
///
/// Owns the worker registry, the invoker, the shared concurrency limit and
/// the table of executions. Every workflow started here competes for the
/// same workers and the same permits.
pub struct Orchestrator {
    registry: Arc<WorkerRegistry>,
    invoker: Arc<dyn WorkerInvoker>,
    cache: Option<Arc<ResultCache>>,
    admission: Arc<AdmissionControl>,
    permits: Arc<Semaphore>,
    event_bus: Arc<EventBus>,
    executions: Arc<RwLock<HashMap<WorkflowId, Execution>>>,
    config: OrchestratorConfig,
}

impl Execution {
    fn is_finished(&self) -> bool {
        self.done.borrow().is_some()
    }
}

impl Orchestrator {
    /// Create an orchestrator with default settings
    pub fn new(invoker: Arc<dyn WorkerInvoker>) -> Self {
        Self::with_config(invoker, OrchestratorConfig::default())
    }

    /// Create an orchestrator with custom configuration
    pub fn with_config(invoker: Arc<dyn WorkerInvoker>, config: OrchestratorConfig) -> Self {
        Self::with_registry(Arc::new(WorkerRegistry::new()), invoker, config)
    }

    /// Create an orchestrator around a pre-populated registry
    pub fn with_registry(
        registry: Arc<WorkerRegistry>,
        invoker: Arc<dyn WorkerInvoker>,
        config: OrchestratorConfig,
    ) -> Self {
        let cache = config
            .cache
            .enabled
            .then(|| Arc::new(ResultCache::from_config(&config.cache)));
        let admission = Arc::new(AdmissionControl::new(config.admission.clone()));
        let permits = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));

        Self {
            registry,
            invoker,
            cache,
            admission,
            permits,
            event_bus,
            executions: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    /// Replace the admission control, e.g. to attach a custom resource probe
    pub fn with_admission(mut self, admission: AdmissionControl) -> Self {
        self.admission = Arc::new(admission);
        self
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    pub fn admission(&self) -> &Arc<AdmissionControl> {
        &self.admission
    }

    pub fn cache(&self) -> Option<&Arc<ResultCache>> {
        self.cache.as_ref()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Subscribe to progress events of every execution
    pub fn subscribe_events(&self) -> broadcast::Receiver<ProgressEvent> {
        self.event_bus.subscribe()
    }

    /// Get the event bus for direct access
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Check every registered worker against its backend
    pub async fn validate_workers(&self) -> Vec<(WorkerId, String)> {
        self.registry
            .workers()
            .await
            .iter()
            .filter_map(|w| {
                self.invoker
                    .validate_worker(w)
                    .err()
                    .map(|e| (w.id.clone(), e.to_string()))
            })
            .collect()
    }

    fn scheduler(&self) -> PhaseScheduler {
        let mut scheduler = PhaseScheduler::new(
            self.registry.clone(),
            self.invoker.clone(),
            self.permits.clone(),
            self.event_bus.clone(),
        )
        .with_admission(self.admission.clone())
        .with_cancel_grace(Duration::from_millis(self.config.cancel_grace_ms));
        if let Some(cache) = &self.cache {
            scheduler = scheduler.with_cache(cache.clone());
        }
        scheduler
    }

    /// Validate and partition a workflow and register its execution
    async fn prepare(
        &self,
        spec: &WorkflowSpec,
    ) -> Result<
        (
            DependencyGraph,
            Arc<ProgressTracker>,
            CancellationToken,
            watch::Sender<Option<ExecutionReport>>,
        ),
        OrchError,
    > {
        let graph = DependencyGraph::build(&spec.tasks, spec.settings.dependency_mode)?;

        let mut executions = self.executions.write().await;
        if let Some(existing) = executions.get(&spec.id) {
            if !existing.is_finished() {
                return Err(WorkflowError::StillRunning(spec.id).into());
            }
        }

        let tracker = Arc::new(ProgressTracker::new(
            spec.id,
            graph.phases(),
            self.event_bus.clone(),
        ));
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(None);
        executions.insert(
            spec.id,
            Execution {
                name: spec.name.clone(),
                submitted_at: Instant::now(),
                tracker: tracker.clone(),
                cancel: cancel.clone(),
                done: done_rx,
            },
        );

        Ok((graph, tracker, cancel, done_tx))
    }

    async fn run(
        &self,
        spec: WorkflowSpec,
        graph: DependencyGraph,
        tracker: Arc<ProgressTracker>,
        cancel: CancellationToken,
        done: watch::Sender<Option<ExecutionReport>>,
    ) -> ExecutionReport {
        let report = self
            .scheduler()
            .execute(&spec, &graph, &tracker, &cancel)
            .await;
        done.send_replace(Some(report.clone()));
        evict_finished(
            &mut *self.executions.write().await,
            self.config.max_retained_executions,
        );
        report
    }

    /// Validate, partition and execute a workflow to completion
    ///
    /// A cyclic or otherwise invalid workflow is rejected before anything is
    /// dispatched.
    pub async fn orchestrate(&self, spec: WorkflowSpec) -> Result<ExecutionReport, OrchError> {
        let (graph, tracker, cancel, done) = self.prepare(&spec).await?;
        Ok(self.run(spec, graph, tracker, cancel, done).await)
    }

    /// Validate a workflow and execute it in the background
    pub async fn submit(self: &Arc<Self>, spec: WorkflowSpec) -> Result<WorkflowId, OrchError> {
        let (graph, tracker, cancel, done) = self.prepare(&spec).await?;
        let id = spec.id;
        let this = self.clone();
        tokio::spawn(async move {
            this.run(spec, graph, tracker, cancel, done).await;
        });
        tracing::info!("Submitted workflow {}", id);
        Ok(id)
    }

    /// Request cancellation; a no-op for executions that already finished
    pub async fn cancel(&self, id: WorkflowId) -> Result<(), OrchError> {
        let executions = self.executions.read().await;
        let execution = executions
            .get(&id)
            .ok_or(WorkflowError::NotFound(id))?;
        if !execution.is_finished() {
            tracing::info!("Cancellation requested for workflow {} ({})", execution.name, id);
            execution.cancel.cancel();
        }
        Ok(())
    }

    /// Current progress; repeated calls without intervening events agree
    pub async fn status(&self, id: WorkflowId) -> Result<ProgressSnapshot, OrchError> {
        let executions = self.executions.read().await;
        let execution = executions
            .get(&id)
            .ok_or(WorkflowError::NotFound(id))?;
        Ok(execution.tracker.snapshot())
    }

    /// Final report, once the execution has finished
    pub async fn report(&self, id: WorkflowId) -> Option<ExecutionReport> {
        let executions = self.executions.read().await;
        let execution = executions.get(&id)?;
        let report = execution.done.borrow().clone();
        report
    }

    /// Wait for a submitted execution to finish
    pub async fn wait(&self, id: WorkflowId) -> Result<ExecutionReport, OrchError> {
        let mut done = {
            let executions = self.executions.read().await;
            executions
                .get(&id)
                .ok_or(WorkflowError::NotFound(id))?
                .done
                .clone()
        };
        let report = done
            .wait_for(|r| r.is_some())
            .await
            .map_err(|_| OrchError::Execution(format!("Execution {} was dropped", id)))?
            .clone();
        report.ok_or_else(|| OrchError::Execution(format!("Execution {} has no report", id)))
    }

    /// Drop a finished execution together with its report
    pub async fn forget(&self, id: WorkflowId) -> Result<(), OrchError> {
        let mut executions = self.executions.write().await;
        let execution = executions.get(&id).ok_or(WorkflowError::NotFound(id))?;
        if !execution.is_finished() {
            return Err(WorkflowError::StillRunning(id).into());
        }
        executions.remove(&id);
        tracing::debug!("Forgot workflow {}", id);
        Ok(())
    }

    /// All known executions, sorted by name
    pub async fn executions(&self) -> Vec<ExecutionSummary> {
        let executions = self.executions.read().await;
        let mut summaries: Vec<ExecutionSummary> = executions
            .iter()
            .map(|(id, e)| {
                let snapshot = e.tracker.snapshot();
                ExecutionSummary {
                    workflow_id: *id,
                    name: e.name.clone(),
                    status: snapshot.status,
                    percent_complete: snapshot.percent_complete(),
                }
            })
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }
}

/// Drop the oldest finished executions beyond `keep`
fn evict_finished(executions: &mut HashMap<WorkflowId, Execution>, keep: usize) {
    let mut finished: Vec<(WorkflowId, Instant)> = executions
        .iter()
        .filter(|(_, e)| e.is_finished())
        .map(|(id, e)| (*id, e.submitted_at))
        .collect();
    if finished.len() <= keep {
        return;
    }
    finished.sort_by_key(|(_, at)| *at);
    let excess = finished.len() - keep;
    for (id, _) in finished.into_iter().take(excess) {
        executions.remove(&id);
        tracing::debug!("Evicted finished workflow {}", id);
    }
}

/// Configuration for the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Global cap on in-flight invocations across all workflows
    pub max_concurrency: usize,
    pub event_buffer_size: usize,
    pub cache: CacheConfig,
    pub admission: AdmissionConfig,
    /// Poll period of the multi-workflow progress reporter
    pub progress_poll_interval_ms: u64,
    /// Wind-down period granted to cancelled invocations
    pub cancel_grace_ms: u64,
    /// Backend used for workers that do not name one
    pub default_backend: String,
    /// Finished executions kept for status and report queries; the oldest
    /// are dropped beyond this count
    pub max_retained_executions: usize,
}

impl OrchestratorConfig {
    pub fn load(path: &Path) -> Result<Self, OrchError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            event_buffer_size: 1000,
            cache: CacheConfig::default(),
            admission: AdmissionConfig::default(),
            progress_poll_interval_ms: 2000,
            cancel_grace_ms: 5000,
            default_backend: "process".to_string(),
            max_retained_executions: 1000,
        }
    }
}
