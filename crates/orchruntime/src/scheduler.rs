use crate::admission::{Admission, AdmissionControl};
use crate::cache::ResultCache;
use crate::consensus::ConsensusCoordinator;
use crate::graph::DependencyGraph;
use crate::progress::ProgressTracker;
use crate::queue::{QueueReason, TaskQueue};
use crate::registry::WorkerRegistry;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use orchcore::{
    ConsensusOutcome, EventBus, ExecutionId, ExecutionReport, HaltReason, InvocationContext,
    InvokeError, OrchError, Phase, PhaseOutcome, PhaseStatus, ReleaseMetrics, Task, TaskId,
    TaskOutcome, TaskOutput, TaskStatus, WorkerId, WorkerInvoker, WorkflowSpec, WorkflowStatus,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// Default wind-down period for cooperative cancellation
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Runs a validated workflow phase by phase
///
/// Tasks inside a phase are dispatched concurrently, bounded by a shared
/// semaphore; a phase only starts once every task of the previous one is
/// terminal. Tasks that cannot be dispatched right away wait in a
/// priority queue until a worker, a permit or resource headroom frees up.
pub struct PhaseScheduler {
    registry: Arc<WorkerRegistry>,
    invoker: Arc<dyn WorkerInvoker>,
    permits: Arc<Semaphore>,
    events: Arc<EventBus>,
    admission: Arc<AdmissionControl>,
    cache: Option<Arc<ResultCache>>,
    consensus: ConsensusCoordinator,
    cancel_grace: Duration,
}

impl PhaseScheduler {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        invoker: Arc<dyn WorkerInvoker>,
        permits: Arc<Semaphore>,
        events: Arc<EventBus>,
    ) -> Self {
        let consensus = ConsensusCoordinator::new(registry.clone(), invoker.clone(), events.clone());
        Self {
            registry,
            invoker,
            permits,
            events,
            admission: Arc::new(AdmissionControl::default()),
            cache: None,
            consensus,
            cancel_grace: DEFAULT_CANCEL_GRACE,
        }
    }

    pub fn with_admission(mut self, admission: Arc<AdmissionControl>) -> Self {
        self.admission = admission;
        self
    }

    pub fn with_cache(mut self, cache: Arc<ResultCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    /// Execute `spec` to completion, failure or cancellation
    ///
    /// Never returns an error: every outcome, including cancellation and
    /// timeout, is described by the report.
    pub async fn execute(
        &self,
        spec: &WorkflowSpec,
        graph: &DependencyGraph,
        tracker: &ProgressTracker,
        cancel: &CancellationToken,
    ) -> ExecutionReport {
        let execution_id = ExecutionId::new_v4();
        let started_at = Utc::now();
        let start = Instant::now();

        tracing::info!(
            "Starting workflow {} ({}) with {} tasks in {} phases",
            spec.name,
            spec.id,
            graph.len(),
            graph.phases().len()
        );
        tracker.workflow_started(execution_id);

        // Workflow deadline cancels through a child token
        let token = cancel.child_token();
        let timed_out = Arc::new(AtomicBool::new(false));
        let watchdog = spec.settings.max_execution_time_ms.map(|ms| {
            let token = token.clone();
            let flag = timed_out.clone();
            let name = spec.name.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(ms)) => {
                        tracing::warn!("Workflow {} exceeded its {}ms execution limit", name, ms);
                        flag.store(true, Ordering::SeqCst);
                        token.cancel();
                    }
                    _ = token.cancelled() => {}
                }
            })
        });

        let mut run = Run::new(self, spec, graph, tracker, &token);
        let mut phases: Vec<PhaseOutcome> = graph
            .phases()
            .iter()
            .map(|p| PhaseOutcome {
                index: p.index,
                task_ids: p.task_ids.clone(),
                concurrent: p.concurrent,
                status: PhaseStatus::NotStarted,
                started_at: None,
                duration_ms: 0,
                failed_tasks: Vec::new(),
            })
            .collect();
        let mut consensus: Vec<ConsensusOutcome> = Vec::new();
        let mut halt: Option<HaltReason> = None;
        let mut halted_at: Option<usize> = None;

        'phases: for phase in graph.phases() {
            if token.is_cancelled() {
                halt = Some(HaltReason::Cancelled);
                break;
            }

            let phase_start = Instant::now();
            phases[phase.index].status = PhaseStatus::Running;
            phases[phase.index].started_at = Some(Utc::now());
            tracker.phase_started(phase);
            tracing::info!(
                "Phase {} started with {} task(s)",
                phase.index,
                phase.task_ids.len()
            );

            run.run_phase(phase).await;

            let failed = run.failed_in(phase);
            let duration_ms = phase_start.elapsed().as_millis() as u64;
            let status = if run.cancelling {
                PhaseStatus::Cancelled
            } else if failed.is_empty() {
                PhaseStatus::Completed
            } else {
                PhaseStatus::Failed
            };
            let outcome = &mut phases[phase.index];
            outcome.status = status;
            outcome.duration_ms = duration_ms;
            outcome.failed_tasks = failed.clone();
            tracker.phase_completed(phase.index, status == PhaseStatus::Completed, duration_ms);
            tracing::info!("Phase {} finished: {:?} in {}ms", phase.index, status, duration_ms);

            if run.cancelling {
                halt = Some(HaltReason::Cancelled);
                break;
            }
            if !failed.is_empty() && spec.settings.block_on_failure {
                tracing::warn!(
                    "Phase {} had {} failed task(s), halting workflow {}",
                    phase.index,
                    failed.len(),
                    spec.name
                );
                halt = Some(HaltReason::TaskFailure);
                halted_at = Some(phase.index);
                break;
            }

            let gates: Vec<_> = spec
                .settings
                .gates
                .iter()
                .filter(|g| g.after_phase == phase.index)
                .collect();
            if !failed.is_empty() && !gates.is_empty() {
                tracing::warn!(
                    "Skipping {} consensus gate(s) after unsuccessful phase {}",
                    gates.len(),
                    phase.index
                );
                continue;
            }

            for gate in gates {
                let outcome = self.consensus.evaluate_gate(spec.id, gate, &token).await;
                let reached = outcome.reached;
                consensus.push(outcome);
                if token.is_cancelled() {
                    halt = Some(HaltReason::Cancelled);
                    break 'phases;
                }
                if !reached {
                    tracing::warn!(
                        "Consensus gate '{}' after phase {} not reached",
                        gate.topic,
                        phase.index
                    );
                    halt = Some(HaltReason::ConsensusNotReached);
                    halted_at = Some(phase.index);
                    break 'phases;
                }
            }
        }

        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }

        if halt == Some(HaltReason::Cancelled) && timed_out.load(Ordering::SeqCst) {
            halt = Some(HaltReason::TimedOut);
        }

        let tasks = run.outcomes();
        let failed_tasks: Vec<TaskId> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .map(|t| t.id.clone())
            .collect();
        let any_unsuccessful = tasks
            .iter()
            .any(|t| matches!(t.status, TaskStatus::Failed | TaskStatus::Blocked));

        let status = match halt {
            Some(HaltReason::Cancelled) => WorkflowStatus::Cancelled,
            Some(_) => WorkflowStatus::Failed,
            None if any_unsuccessful => WorkflowStatus::Failed,
            None => WorkflowStatus::Completed,
        };

        let blocking_failures: Vec<TaskId> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .filter(|t| {
                (halt == Some(HaltReason::TaskFailure) && halted_at == Some(t.phase))
                    || !graph.transitive_dependents(&t.id).is_empty()
            })
            .map(|t| t.id.clone())
            .collect();

        let first_failed_phase = tasks
            .iter()
            .filter(|t| matches!(t.status, TaskStatus::Failed | TaskStatus::Blocked))
            .map(|t| t.phase)
            .min()
            .or(match halt {
                Some(HaltReason::ConsensusNotReached) => halted_at,
                _ => None,
            });

        let used: HashSet<&WorkerId> = tasks.iter().filter_map(|t| t.worker.as_ref()).collect();
        let worker_metrics = self
            .registry
            .metrics()
            .await
            .into_iter()
            .filter(|m| used.contains(&m.worker_id))
            .collect();

        let duration_ms = start.elapsed().as_millis() as u64;
        tracker.workflow_completed(status, duration_ms);
        tracing::info!(
            "Workflow {} finished: {:?} in {}ms ({} failed task(s))",
            spec.name,
            status,
            duration_ms,
            failed_tasks.len()
        );

        ExecutionReport {
            workflow_id: spec.id,
            execution_id,
            name: spec.name.clone(),
            status,
            halt_reason: halt,
            started_at,
            ended_at: Utc::now(),
            duration_ms,
            phases,
            tasks,
            failed_tasks,
            blocking_failures,
            first_failed_phase,
            worker_metrics,
            consensus,
        }
    }
}

enum AttemptResult {
    Completed(TaskOutput),
    Failed(InvokeError),
    TimedOut,
    Cancelled,
}

struct AttemptOutcome {
    task_id: TaskId,
    duration_ms: u64,
    result: AttemptResult,
}

/// One invocation of one task on one reserved worker
struct Attempt {
    invoker: Arc<dyn WorkerInvoker>,
    registry: Arc<WorkerRegistry>,
    ctx: InvocationContext,
    permit: OwnedSemaphorePermit,
    workflow_cancel: CancellationToken,
    grace: Duration,
}

impl Attempt {
    async fn run(self) -> AttemptOutcome {
        let Attempt {
            invoker,
            registry,
            ctx,
            permit,
            workflow_cancel,
            grace,
        } = self;

        let task_id = ctx.task.id.clone();
        let worker_id = ctx.worker.id.clone();
        let timeout = ctx.timeout;
        let attempt_token = ctx.cancellation.clone();
        let cooperative = invoker.supports_cancellation();
        let start = Instant::now();

        let invocation = invoker.invoke(ctx);
        tokio::pin!(invocation);

        let result = tokio::select! {
            res = &mut invocation => match res {
                Ok(output) => AttemptResult::Completed(output),
                Err(InvokeError::Timeout { .. }) => AttemptResult::TimedOut,
                Err(InvokeError::Cancelled) if workflow_cancel.is_cancelled() => AttemptResult::Cancelled,
                Err(e) => AttemptResult::Failed(e),
            },
            _ = tokio::time::sleep(timeout) => {
                attempt_token.cancel();
                // Cooperative invokers get to clean up, e.g. signal a child process
                if cooperative && tokio::time::timeout(grace, &mut invocation).await.is_err() {
                    tracing::warn!("Task {} did not stop after timing out, abandoning it", task_id);
                }
                AttemptResult::TimedOut
            }
            _ = workflow_cancel.cancelled() => {
                // Cooperative invokers get a grace period, others run out their deadline
                let wind_down = if cooperative {
                    grace
                } else {
                    timeout.saturating_sub(start.elapsed())
                };
                if tokio::time::timeout(wind_down, &mut invocation).await.is_err() {
                    tracing::warn!("Task {} did not stop after cancellation, abandoning it", task_id);
                }
                AttemptResult::Cancelled
            }
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        let metrics = ReleaseMetrics {
            duration_ms,
            success: matches!(result, AttemptResult::Completed(_)),
        };
        if let Err(e) = registry.release(&worker_id, metrics).await {
            tracing::error!("Failed to release worker {}: {}", worker_id, e);
        }
        drop(permit);

        AttemptOutcome {
            task_id,
            duration_ms,
            result,
        }
    }
}

enum Dispatch {
    Started,
    Finished,
    Deferred(QueueReason),
}

enum Wake {
    Cancel,
    Finished(AttemptOutcome),
    RetryDue(TaskId),
    Tick,
    Released,
}

struct TaskRecord {
    task: Task,
    phase: usize,
    status: TaskStatus,
    attempts: u32,
    worker: Option<WorkerId>,
    duration_ms: u64,
    cached: bool,
    output: Option<serde_json::Value>,
    error: Option<String>,
}

/// Mutable state of one execution
struct Run<'a> {
    scheduler: &'a PhaseScheduler,
    spec: &'a WorkflowSpec,
    graph: &'a DependencyGraph,
    tracker: &'a ProgressTracker,
    cancel: &'a CancellationToken,
    records: HashMap<TaskId, TaskRecord>,
    queue: TaskQueue,
    running: FuturesUnordered<BoxFuture<'static, AttemptOutcome>>,
    backoff: FuturesUnordered<BoxFuture<'static, TaskId>>,
    cancelling: bool,
}

impl<'a> Run<'a> {
    fn new(
        scheduler: &'a PhaseScheduler,
        spec: &'a WorkflowSpec,
        graph: &'a DependencyGraph,
        tracker: &'a ProgressTracker,
        cancel: &'a CancellationToken,
    ) -> Self {
        let records = spec
            .tasks
            .iter()
            .map(|task| {
                let record = TaskRecord {
                    task: task.clone(),
                    phase: graph.phase_of(&task.id).unwrap_or(0),
                    status: TaskStatus::Pending,
                    attempts: 0,
                    worker: None,
                    duration_ms: 0,
                    cached: false,
                    output: None,
                    error: None,
                };
                (task.id.clone(), record)
            })
            .collect();

        Self {
            scheduler,
            spec,
            graph,
            tracker,
            cancel,
            records,
            queue: TaskQueue::new(),
            running: FuturesUnordered::new(),
            backoff: FuturesUnordered::new(),
            cancelling: false,
        }
    }

    fn status(&self, id: &str) -> TaskStatus {
        self.records
            .get(id)
            .map(|r| r.status)
            .unwrap_or(TaskStatus::Pending)
    }

    fn transition(&mut self, id: &str, next: TaskStatus) {
        if let Some(record) = self.records.get_mut(id) {
            if !record.status.can_transition_to(next) {
                tracing::warn!(
                    "Unexpected transition for task {}: {:?} -> {:?}",
                    id,
                    record.status,
                    next
                );
            }
            record.status = next;
        }
    }

    async fn run_phase(&mut self, phase: &Phase) {
        let mut ready = Vec::new();
        for id in &phase.task_ids {
            let blocker = self
                .graph
                .dependencies(id)
                .iter()
                .find(|dep| self.status(dep) != TaskStatus::Completed)
                .cloned();
            match blocker {
                Some(dep) => self.block(id, &dep),
                None => {
                    self.transition(id, TaskStatus::Ready);
                    self.tracker.task_ready(id);
                    ready.push(id.clone());
                }
            }
        }

        if self.cancel.is_cancelled() {
            self.cancelling = true;
        }

        // Initial dispatch in submission order
        for id in &ready {
            self.dispatch(id).await;
        }

        let mut tick = tokio::time::interval(self.scheduler.admission.poll_interval());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        while !self.settled(phase) {
            let wake = {
                let registry = &self.scheduler.registry;
                tokio::select! {
                    _ = self.cancel.cancelled(), if !self.cancelling => Wake::Cancel,
                    Some(outcome) = self.running.next(), if !self.running.is_empty() => Wake::Finished(outcome),
                    Some(id) = self.backoff.next(), if !self.backoff.is_empty() => Wake::RetryDue(id),
                    _ = tick.tick() => Wake::Tick,
                    _ = registry.wait_for_release() => Wake::Released,
                }
            };

            match wake {
                Wake::Cancel => self.begin_cancel(phase),
                Wake::Finished(outcome) => self.finish(outcome),
                Wake::RetryDue(id) => self.dispatch(&id).await,
                Wake::Tick => {
                    self.scheduler.admission.monitor().refresh();
                    self.expire_queue_waits();
                }
                Wake::Released => {}
            }

            if !self.cancelling {
                self.drain_queue().await;
            }
        }
    }

    fn settled(&self, phase: &Phase) -> bool {
        phase
            .task_ids
            .iter()
            .all(|id| self.status(id).is_terminal())
    }

    fn failed_in(&self, phase: &Phase) -> Vec<TaskId> {
        phase
            .task_ids
            .iter()
            .filter(|id| matches!(self.status(id), TaskStatus::Failed | TaskStatus::Blocked))
            .cloned()
            .collect()
    }

    /// Dispatch a ready task or park it in the queue
    async fn dispatch(&mut self, id: &str) {
        if self.cancelling {
            self.cancel_task(id);
            return;
        }
        if let Dispatch::Deferred(reason) = self.try_dispatch(id).await {
            let priority = match self.records.get(id) {
                Some(record) => record.task.priority,
                None => return,
            };
            self.transition(id, TaskStatus::Queued);
            self.queue.enqueue(id, priority, reason);
            self.tracker.task_queued(id, reason.as_str());
            tracing::debug!("Task {} queued: {}", id, reason.as_str());
        }
    }

    async fn try_dispatch(&mut self, id: &str) -> Dispatch {
        let task = match self.records.get(id) {
            Some(record) => record.task.clone(),
            None => return Dispatch::Finished,
        };
        let registry = self.scheduler.registry.clone();

        if let Some(output) = self.scheduler.cache.as_ref().and_then(|c| c.get(&task)) {
            tracing::info!("Task {} served from cache", id);
            self.complete(id, output.output, true, 0);
            return Dispatch::Finished;
        }

        if !registry.has_capable_worker(&task.required_capabilities).await {
            let capabilities: Vec<&str> = task.required_capabilities.iter().map(String::as_str).collect();
            let error = OrchError::WorkerUnavailable(format!(
                "no registered worker provides [{}] for task {}",
                capabilities.join(", "),
                id
            ));
            self.fail(id, error.to_string());
            return Dispatch::Finished;
        }

        if self.scheduler.admission.admit(&task) == Admission::Defer {
            return Dispatch::Deferred(QueueReason::ResourcePressure);
        }

        let Ok(permit) = self.scheduler.permits.clone().try_acquire_owned() else {
            return Dispatch::Deferred(QueueReason::ConcurrencyLimit);
        };

        let Some(worker_id) = registry
            .acquire(task.preferred_worker.as_deref(), &task.required_capabilities)
            .await
        else {
            return Dispatch::Deferred(QueueReason::NoWorker);
        };

        let Some(worker) = registry.get(&worker_id).await else {
            return Dispatch::Deferred(QueueReason::NoWorker);
        };

        let inputs = self.inputs_for(id);
        let attempt = match self.records.get_mut(id) {
            Some(record) => {
                record.attempts += 1;
                record.worker = Some(worker_id.clone());
                record.attempts
            }
            None => return Dispatch::Finished,
        };
        self.transition(id, TaskStatus::Dispatched);
        self.tracker.task_started(id, &worker_id, attempt);
        tracing::info!(
            "Dispatching task {} to worker {} (attempt {}/{})",
            id,
            worker_id,
            attempt,
            task.max_attempts
        );

        let ctx = InvocationContext {
            workflow_id: self.spec.id,
            worker,
            inputs,
            attempt,
            timeout: Duration::from_millis(task.timeout_ms),
            events: self
                .scheduler
                .events
                .create_emitter(self.spec.id, task.id.clone()),
            cancellation: self.cancel.child_token(),
            task,
        };
        self.spawn_attempt(ctx, permit, worker_id);
        Dispatch::Started
    }

    fn spawn_attempt(&mut self, ctx: InvocationContext, permit: OwnedSemaphorePermit, worker_id: WorkerId) {
        let task_id = ctx.task.id.clone();
        let registry = self.scheduler.registry.clone();
        let attempt = Attempt {
            invoker: self.scheduler.invoker.clone(),
            registry: registry.clone(),
            ctx,
            permit,
            workflow_cancel: self.cancel.clone(),
            grace: self.scheduler.cancel_grace,
        };
        let handle = tokio::spawn(attempt.run());

        self.running.push(
            async move {
                match handle.await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        tracing::error!("Invocation of task {} panicked: {}", task_id, e);
                        let metrics = ReleaseMetrics {
                            duration_ms: 0,
                            success: false,
                        };
                        if let Err(e) = registry.release(&worker_id, metrics).await {
                            tracing::error!("Failed to release worker {}: {}", worker_id, e);
                        }
                        AttemptOutcome {
                            task_id,
                            duration_ms: 0,
                            result: AttemptResult::Failed(InvokeError::Failed(format!(
                                "invocation panicked: {}",
                                e
                            ))),
                        }
                    }
                }
            }
            .boxed(),
        );
    }

    /// Outputs of completed dependencies, keyed by task id
    fn inputs_for(&self, id: &str) -> HashMap<TaskId, serde_json::Value> {
        self.graph
            .dependencies(id)
            .iter()
            .filter_map(|dep| {
                let output = self.records.get(dep)?.output.clone()?;
                Some((dep.clone(), output))
            })
            .collect()
    }

    /// Retry queued tasks in priority order until nothing more can start
    async fn drain_queue(&mut self) {
        let mut parked = Vec::new();
        while let Some(entry) = self.queue.dequeue() {
            match self.try_dispatch(&entry.task_id).await {
                Dispatch::Started | Dispatch::Finished => {}
                Dispatch::Deferred(QueueReason::ConcurrencyLimit) => {
                    self.queue
                        .requeue_front(entry.with_reason(QueueReason::ConcurrencyLimit));
                    break;
                }
                Dispatch::Deferred(reason) => parked.push(entry.with_reason(reason)),
            }
        }
        for entry in parked.into_iter().rev() {
            self.queue.requeue_front(entry);
        }
    }

    /// Fail tasks deferred for resource pressure longer than the queue-wait limit
    ///
    /// Tasks waiting for a worker or a permit stay queued however long it takes.
    fn expire_queue_waits(&mut self) {
        let max_wait = self.scheduler.admission.max_queue_wait();
        let mut keep = Vec::new();
        for entry in self.queue.drain() {
            if entry.reason != QueueReason::ResourcePressure || entry.waited() < max_wait {
                keep.push(entry);
                continue;
            }
            let exhausted = OrchError::ResourceExhausted(format!(
                "queued for {}ms ({})",
                entry.waited().as_millis(),
                entry.reason.as_str()
            ));
            let error = OrchError::InvocationFailed {
                task: entry.task_id.clone(),
                reason: exhausted.to_string(),
            };
            self.fail(&entry.task_id, error.to_string());
        }
        for entry in keep.into_iter().rev() {
            self.queue.requeue_front(entry);
        }
    }

    fn finish(&mut self, outcome: AttemptOutcome) {
        let AttemptOutcome {
            task_id,
            duration_ms,
            result,
        } = outcome;

        if let Some(record) = self.records.get_mut(&task_id) {
            record.duration_ms += duration_ms;
        }

        if self.cancelling {
            self.cancel_task(&task_id);
            return;
        }

        let (task, attempts) = match self.records.get(&task_id) {
            Some(record) => (record.task.clone(), record.attempts),
            None => return,
        };

        match result {
            AttemptResult::Completed(output) => {
                if let Some(cache) = &self.scheduler.cache {
                    cache.put(&task, output.clone());
                }
                self.complete(&task_id, output.output, false, duration_ms);
            }
            AttemptResult::Cancelled => self.cancel_task(&task_id),
            AttemptResult::TimedOut => {
                self.transition(&task_id, TaskStatus::Timeout);
                let will_retry = attempts < task.max_attempts;
                let error = OrchError::InvocationTimeout {
                    task: task_id.clone(),
                    timeout_ms: task.timeout_ms,
                };
                tracing::warn!("{} (attempt {}/{})", error, attempts, task.max_attempts);
                self.tracker.task_timeout(&task_id, attempts, will_retry);
                self.set_error(&task_id, error.to_string());
                if will_retry {
                    self.transition(&task_id, TaskStatus::Ready);
                    self.schedule_retry(&task_id, attempts + 1);
                } else {
                    self.transition(&task_id, TaskStatus::Failed);
                }
            }
            AttemptResult::Failed(e) => {
                // Configuration errors do not go away on retry
                let retryable = !matches!(e, InvokeError::Configuration(_));
                let will_retry = retryable && attempts < task.max_attempts;
                let error = OrchError::InvocationFailed {
                    task: task_id.clone(),
                    reason: e.to_string(),
                };
                tracing::warn!("{} (attempt {}/{})", error, attempts, task.max_attempts);
                self.tracker
                    .task_failed(&task_id, &error.to_string(), attempts, will_retry);
                self.set_error(&task_id, error.to_string());
                if will_retry {
                    self.transition(&task_id, TaskStatus::Ready);
                    self.schedule_retry(&task_id, attempts + 1);
                } else {
                    self.transition(&task_id, TaskStatus::Failed);
                }
            }
        }
    }

    fn schedule_retry(&mut self, id: &str, next_attempt: u32) {
        let delay = self.spec.settings.retry.delay_for(next_attempt);
        tracing::info!(
            "Retrying task {} in {}ms (attempt {})",
            id,
            delay.as_millis(),
            next_attempt
        );
        let id = id.to_string();
        self.backoff.push(
            async move {
                tokio::time::sleep(delay).await;
                id
            }
            .boxed(),
        );
    }

    fn begin_cancel(&mut self, phase: &Phase) {
        tracing::info!(
            "Cancelling workflow {} ({} in flight)",
            self.spec.name,
            self.running.len()
        );
        self.cancelling = true;

        for entry in self.queue.drain() {
            self.cancel_task(&entry.task_id);
        }
        self.backoff = FuturesUnordered::new();
        for id in &phase.task_ids {
            if self.status(id) == TaskStatus::Ready {
                self.cancel_task(id);
            }
        }
    }

    fn set_error(&mut self, id: &str, error: String) {
        if let Some(record) = self.records.get_mut(id) {
            record.error = Some(error);
        }
    }

    fn complete(&mut self, id: &str, output: serde_json::Value, cached: bool, duration_ms: u64) {
        if let Some(record) = self.records.get_mut(id) {
            record.output = Some(output);
            record.cached = cached;
            record.error = None;
        }
        self.transition(id, TaskStatus::Completed);
        self.tracker.task_completed(id, cached, duration_ms);
        tracing::info!("Task {} completed in {}ms", id, duration_ms);
    }

    /// Terminal failure outside of an invocation
    fn fail(&mut self, id: &str, error: String) {
        let attempts = self.records.get(id).map(|r| r.attempts).unwrap_or(0);
        tracing::error!("{}", error);
        self.tracker.task_failed(id, &error, attempts, false);
        self.set_error(id, error);
        self.transition(id, TaskStatus::Failed);
    }

    fn cancel_task(&mut self, id: &str) {
        if self.status(id).is_terminal() {
            return;
        }
        self.transition(id, TaskStatus::Cancelled);
        self.tracker.task_cancelled(id);
        tracing::debug!("Task {} cancelled", id);
    }

    fn block(&mut self, id: &str, dependency: &str) {
        tracing::warn!("Task {} blocked by unsuccessful dependency {}", id, dependency);
        self.set_error(id, format!("blocked by unsuccessful dependency {}", dependency));
        self.transition(id, TaskStatus::Blocked);
        self.tracker.task_blocked(id);
    }

    /// Final task records in submission order
    fn outcomes(&self) -> Vec<TaskOutcome> {
        self.spec
            .tasks
            .iter()
            .filter_map(|task| {
                let record = self.records.get(&task.id)?;
                Some(TaskOutcome {
                    id: task.id.clone(),
                    phase: record.phase,
                    status: record.status,
                    attempts: record.attempts,
                    worker: record.worker.clone(),
                    duration_ms: record.duration_ms,
                    cached: record.cached,
                    output: record.output.clone(),
                    error: record.error.clone(),
                })
            })
            .collect()
    }
}
