//! Core abstractions for the orchestrator
//!
//! This crate provides the data model, error taxonomy, progress events and
//! the worker invocation seam that every other crate depends on. It contains
//! no scheduling logic.

mod error;
pub mod events;
mod invoke;
mod report;
mod status;
mod worker;
mod workflow;

pub use error::{InvokeError, OrchError, WorkflowError};
pub use events::*;
pub use invoke::{InvocationContext, InvocationMetadata, TaskOutput, WorkerInvoker};
pub use report::{
    ConsensusOutcome, ExecutionReport, PhaseOutcome, PhaseStatus, ProgressSnapshot, TaskOutcome,
    TaskProgress, Vote, VoteRecord,
};
pub use status::{HaltReason, Phase, TaskStatus, WorkflowStatus};
pub use worker::{ReleaseMetrics, Worker, WorkerId, WorkerMetrics, WorkerPerformance, WorkerStatus};
pub use workflow::{
    ConsensusGate, DependencyMode, Priority, RetryPolicy, Task, TaskId, WorkflowId,
    WorkflowSettings, WorkflowSpec,
};

/// Result type for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchError>;
