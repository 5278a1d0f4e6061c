use async_trait::async_trait;
use orchcore::{InvocationContext, InvokeError, TaskOutput, WorkerInvoker};
use orchruntime::{BackendMetadata, InvokerFactory};
use serde_json::json;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

const DEFAULT_DELAY_MS: u64 = 1000;

/// Sleeps for `delay_ms` (task payload first, then worker config)
pub struct DelayInvoker {
    default_delay_ms: u64,
}

impl DelayInvoker {
    pub fn new(default_delay_ms: u64) -> Self {
        Self { default_delay_ms }
    }

    fn delay_ms(&self, ctx: &InvocationContext) -> u64 {
        ctx.task
            .payload
            .get("delay_ms")
            .or_else(|| ctx.worker.config.get("delay_ms"))
            .and_then(|v| v.as_u64())
            .unwrap_or(self.default_delay_ms)
    }
}

impl Default for DelayInvoker {
    fn default() -> Self {
        Self::new(DEFAULT_DELAY_MS)
    }
}

#[async_trait]
impl WorkerInvoker for DelayInvoker {
    fn backend(&self) -> &str {
        "delay"
    }

    async fn invoke(&self, ctx: InvocationContext) -> Result<TaskOutput, InvokeError> {
        let delay_ms = self.delay_ms(&ctx);
        ctx.events.info(format!("Delaying for {}ms", delay_ms));

        tokio::select! {
            _ = sleep(Duration::from_millis(delay_ms)) => {}
            _ = ctx.cancellation.cancelled() => return Err(InvokeError::Cancelled),
        }

        // Pass through the dependency outputs
        Ok(TaskOutput::new(json!({
            "task": ctx.task.id,
            "delayed_ms": delay_ms,
            "inputs": ctx.inputs,
        })))
    }
}

pub struct DelayInvokerFactory;

impl InvokerFactory for DelayInvokerFactory {
    fn create(&self, options: &serde_json::Value) -> Result<Arc<dyn WorkerInvoker>, InvokeError> {
        let default_delay_ms = options
            .get("default_delay_ms")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_DELAY_MS);
        Ok(Arc::new(DelayInvoker::new(default_delay_ms)))
    }

    fn backend(&self) -> &str {
        "delay"
    }

    fn metadata(&self) -> BackendMetadata {
        BackendMetadata {
            description: "Delay execution for specified milliseconds".to_string(),
            category: "time".to_string(),
            config_keys: vec!["delay_ms".to_string()],
        }
    }
}
