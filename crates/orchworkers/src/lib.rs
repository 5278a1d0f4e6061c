//! Standard worker backends
//!
//! Built-in [`orchcore::WorkerInvoker`] implementations, selected per worker
//! through its `backend` field.

mod delay;
mod echo;
mod http;
mod process;

pub use delay::{DelayInvoker, DelayInvokerFactory};
pub use echo::{EchoInvoker, EchoInvokerFactory};
pub use http::{HttpInvoker, HttpInvokerFactory};
pub use process::{ProcessInvoker, ProcessInvokerFactory};
use orchruntime::BackendRegistry;

use std::sync::Arc;

/// Register all standard backends with a registry
pub fn register_all(registry: &mut BackendRegistry) {
    registry.register(Arc::new(echo::EchoInvokerFactory));
    registry.register(Arc::new(delay::DelayInvokerFactory));
    registry.register(Arc::new(process::ProcessInvokerFactory));
    registry.register(Arc::new(http::HttpInvokerFactory));
}
