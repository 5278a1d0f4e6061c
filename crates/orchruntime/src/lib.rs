//! Workflow orchestration runtime
//!
//! This crate provides the engine that validates workflows into phases,
//! schedules their tasks onto workers, and reports on the outcome.

mod admission;
mod backend;
mod cache;
mod consensus;
mod coordinator;
mod graph;
mod loader;
mod progress;
mod queue;
mod registry;
mod runtime;
mod scheduler;

pub use admission::{
    Admission, AdmissionConfig, AdmissionControl, ResourceMonitor, ResourceProbe, ResourceSample,
    SystemProbe,
};
pub use backend::{BackendMetadata, BackendRegistry, InvokerFactory, RoutingInvoker};
pub use cache::{CacheConfig, CacheStats, Fingerprint, ResultCache};
pub use consensus::{not_reached, ConsensusCoordinator, VOTE_TASK_KIND};
pub use coordinator::{
    CombinedProgress, MultiWorkflowCoordinator, MultiWorkflowReport, Stage, StageReport,
    StageStatus, WorkflowProgress,
};
pub use graph::DependencyGraph;
pub use loader::{
    InvalidDefinition, ManifestLoader, WorkerDefinition, WorkerManifest, EXCLUDED_PATTERNS,
};
pub use progress::ProgressTracker;
pub use queue::{QueueReason, QueuedTask, TaskQueue};
pub use registry::{TeamRules, WorkerRegistry};
pub use runtime::{ExecutionSummary, Orchestrator, OrchestratorConfig};
pub use scheduler::{PhaseScheduler, DEFAULT_CANCEL_GRACE};
