#![allow(dead_code)]

use async_trait::async_trait;
use orchcore::{
    InvocationContext, InvokeError, TaskId, TaskOutput, Worker, WorkerId, WorkerInvoker,
};
use orchruntime::{
    Orchestrator, OrchestratorConfig, WorkerDefinition, WorkerManifest, WorkerRegistry,
    VOTE_TASK_KIND,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// How the fake answers a given task
#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed { delay_ms: u64 },
    Fail,
    /// Fail the first `n` attempts, then succeed
    FailTimes(u32),
    /// Never return unless cancelled
    Hang,
}

#[derive(Debug, Clone)]
pub struct Call {
    pub task_id: TaskId,
    pub worker_id: WorkerId,
    pub attempt: u32,
    pub started: Instant,
    pub finished: Option<Instant>,
    pub inputs: HashMap<TaskId, serde_json::Value>,
}

/// Deterministic stand-in for real workers
pub struct FakeInvoker {
    default: Behavior,
    behaviors: Mutex<HashMap<TaskId, Behavior>>,
    votes: Mutex<HashMap<WorkerId, serde_json::Value>>,
    calls: Mutex<Vec<Call>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    cooperative: bool,
}

impl FakeInvoker {
    pub fn new() -> Self {
        Self::with_default(Behavior::Succeed { delay_ms: 20 })
    }

    pub fn with_default(default: Behavior) -> Self {
        Self {
            default,
            behaviors: Mutex::new(HashMap::new()),
            votes: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            cooperative: true,
        }
    }

    /// Ignore cancellation tokens, like a backend that cannot abort
    pub fn uncooperative(mut self) -> Self {
        self.cooperative = false;
        self
    }

    pub fn set(&self, task_id: &str, behavior: Behavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(task_id.to_string(), behavior);
    }

    pub fn vote(&self, worker_id: &str, reply: serde_json::Value) {
        self.votes
            .lock()
            .unwrap()
            .insert(worker_id.to_string(), reply);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, task_id: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.task_id == task_id)
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn record_start(&self, ctx: &InvocationContext) -> usize {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let mut calls = self.calls.lock().unwrap();
        calls.push(Call {
            task_id: ctx.task.id.clone(),
            worker_id: ctx.worker.id.clone(),
            attempt: ctx.attempt,
            started: Instant::now(),
            finished: None,
            inputs: ctx.inputs.clone(),
        });
        calls.len() - 1
    }

    fn record_end(&self, index: usize) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if let Some(call) = self.calls.lock().unwrap().get_mut(index) {
            call.finished = Some(Instant::now());
        }
    }

    async fn behave(&self, ctx: &InvocationContext) -> Result<TaskOutput, InvokeError> {
        if ctx.task.kind == VOTE_TASK_KIND {
            let reply = self.votes.lock().unwrap().get(&ctx.worker.id).cloned();
            return match reply {
                Some(serde_json::Value::Null) => std::future::pending().await,
                Some(reply) => Ok(TaskOutput::new(reply)),
                None => Ok(TaskOutput::new(json!({"vote": "abstain"}))),
            };
        }

        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(&ctx.task.id)
            .cloned()
            .unwrap_or_else(|| self.default.clone());

        match behavior {
            Behavior::Succeed { delay_ms } => {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                Ok(TaskOutput::new(json!({
                    "task": ctx.task.id,
                    "worker": ctx.worker.id,
                })))
            }
            Behavior::Fail => Err(InvokeError::Failed(format!("{} exploded", ctx.task.id))),
            Behavior::FailTimes(n) if ctx.attempt <= n => {
                Err(InvokeError::Failed(format!("{} flaked", ctx.task.id)))
            }
            Behavior::FailTimes(_) => Ok(TaskOutput::new(json!({"task": ctx.task.id}))),
            Behavior::Hang => std::future::pending().await,
        }
    }
}

#[async_trait]
impl WorkerInvoker for FakeInvoker {
    fn backend(&self) -> &str {
        "fake"
    }

    async fn invoke(&self, ctx: InvocationContext) -> Result<TaskOutput, InvokeError> {
        let index = self.record_start(&ctx);
        let result = if self.cooperative {
            tokio::select! {
                res = self.behave(&ctx) => res,
                _ = ctx.cancellation.cancelled() => Err(InvokeError::Cancelled),
            }
        } else {
            self.behave(&ctx).await
        };
        self.record_end(index);
        result
    }

    fn supports_cancellation(&self) -> bool {
        self.cooperative
    }

    fn validate_worker(&self, worker: &Worker) -> Result<(), InvokeError> {
        if worker.id.is_empty() {
            return Err(InvokeError::Configuration("empty worker id".to_string()));
        }
        Ok(())
    }
}

/// Manifest with `count` workers named `worker-1..` sharing `capabilities`
pub fn manifest(count: usize, capabilities: &[&str]) -> WorkerManifest {
    let mut manifest = WorkerManifest::default();
    for i in 1..=count {
        let mut def = WorkerDefinition::new(format!("worker-{}", i));
        for capability in capabilities {
            def = def.with_capability(*capability);
        }
        manifest = manifest.with_worker(def);
    }
    manifest
}

/// Route scheduler logs to the test harness, `RUST_LOG` picks the level
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub async fn registry(count: usize, capabilities: &[&str]) -> Arc<WorkerRegistry> {
    init_tracing();
    let registry = Arc::new(WorkerRegistry::new());
    registry.discover(&manifest(count, capabilities)).await;
    registry
}

pub fn fast_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.admission.poll_interval_ms = 10;
    // Host load must not defer test tasks
    config.admission.sample_system = false;
    config.cancel_grace_ms = 200;
    config
}

pub async fn orchestrator(
    workers: usize,
    invoker: Arc<FakeInvoker>,
    config: OrchestratorConfig,
) -> Arc<Orchestrator> {
    let registry = registry(workers, &[]).await;
    Arc::new(Orchestrator::with_registry(registry, invoker, config))
}
