use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

pub type WorkflowId = Uuid;
pub type TaskId = String;

/// Complete workflow definition submitted to the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSpec {
    #[serde(default = "Uuid::new_v4")]
    pub id: WorkflowId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub settings: WorkflowSettings,
}

impl WorkflowSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            tasks: Vec::new(),
            settings: WorkflowSettings::default(),
        }
    }

    pub fn add_task(&mut self, task: Task) -> TaskId {
        let id = task.id.clone();
        self.tasks.push(task);
        id
    }

    pub fn with_task(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn with_settings(mut self, settings: WorkflowSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn find_task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }
}

/// Scheduling priority; only affects queueing under contention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
}

impl Priority {
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    /// Lane index, 0 being drained first.
    pub fn lane(self) -> usize {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// A unit of work with declared dependencies
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub required_capabilities: BTreeSet<String>,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Worker to try first, if it is idle.
    #[serde(default)]
    pub preferred_worker: Option<String>,
    /// Tasks with side effects must leave this off.
    #[serde(default)]
    pub cacheable: bool,
    /// Whether the task may be deferred when resources are unhealthy.
    #[serde(default = "default_true")]
    pub queueable: bool,
}

fn default_kind() -> String {
    "generic".to_string()
}

fn default_timeout_ms() -> u64 {
    60_000
}

fn default_max_attempts() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

impl Task {
    pub fn new(id: impl Into<TaskId>) -> Self {
        Self {
            id: id.into(),
            kind: default_kind(),
            required_capabilities: BTreeSet::new(),
            dependencies: Vec::new(),
            priority: Priority::Normal,
            payload: serde_json::Value::Null,
            timeout_ms: default_timeout_ms(),
            max_attempts: default_max_attempts(),
            preferred_worker: None,
            cacheable: false,
            queueable: true,
        }
    }

    pub fn depends_on(mut self, dependency: impl Into<TaskId>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.required_capabilities.insert(capability.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_preferred_worker(mut self, worker: impl Into<String>) -> Self {
        self.preferred_worker = Some(worker.into());
        self
    }

    pub fn cacheable(mut self, cacheable: bool) -> Self {
        self.cacheable = cacheable;
        self
    }

    pub fn queueable(mut self, queueable: bool) -> Self {
        self.queueable = queueable;
        self
    }
}

/// Backoff applied between attempts of the same task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    /// Delay before attempt `next_attempt` (the first retry is attempt 2).
    pub fn delay_for(&self, next_attempt: u32) -> std::time::Duration {
        let exponent = next_attempt.saturating_sub(2) as i32;
        let delay = self.base_delay_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        let capped = delay.min(self.max_delay_ms as f64).max(0.0);
        std::time::Duration::from_millis(capped as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            multiplier: 2.0,
            max_delay_ms: 30_000,
        }
    }
}

/// How references to unknown tasks are treated while building the graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DependencyMode {
    #[default]
    Strict,
    Lenient,
}

/// Consensus checkpoint evaluated once a phase has completed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusGate {
    pub after_phase: usize,
    pub topic: String,
    pub participants: Vec<String>,
    pub threshold: f64,
    #[serde(default = "default_gate_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_gate_timeout_ms() -> u64 {
    30_000
}

/// Per-workflow settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSettings {
    #[serde(default = "default_true")]
    pub block_on_failure: bool,
    #[serde(default)]
    pub dependency_mode: DependencyMode,
    #[serde(default)]
    pub max_execution_time_ms: Option<u64>,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub gates: Vec<ConsensusGate>,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            block_on_failure: true,
            dependency_mode: DependencyMode::Strict,
            max_execution_time_ms: None,
            retry: RetryPolicy::default(),
            gates: Vec::new(),
        }
    }
}
