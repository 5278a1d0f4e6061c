mod base;

pub use base::{EventBus, EventEmitter, ExecutionId, ProgressEvent, TaskUpdate};
