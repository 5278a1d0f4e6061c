use async_trait::async_trait;
use orchcore::{InvocationContext, InvokeError, TaskOutput, WorkerInvoker};
use orchruntime::{BackendMetadata, InvokerFactory, VOTE_TASK_KIND};
use serde_json::json;
use std::sync::Arc;

/// Answers immediately with what it was given
///
/// Vote requests are answered with the worker's configured `vote`
/// (default `approve`), which makes it usable for dry runs of gated workflows.
pub struct EchoInvoker;

#[async_trait]
impl WorkerInvoker for EchoInvoker {
    fn backend(&self) -> &str {
        "echo"
    }

    async fn invoke(&self, ctx: InvocationContext) -> Result<TaskOutput, InvokeError> {
        if ctx.task.kind == VOTE_TASK_KIND {
            let vote = ctx
                .worker
                .config
                .get("vote")
                .and_then(|v| v.as_str())
                .unwrap_or("approve");
            ctx.events.info(format!("{} votes {}", ctx.worker.id, vote));
            return Ok(TaskOutput::new(json!({ "vote": vote })));
        }

        let message = ctx.setting_str("message").unwrap_or("(no message)");
        ctx.events.info(format!("ECHO: {}", message));

        for (dependency, value) in &ctx.inputs {
            ctx.events.info(format!("  {}: {}", dependency, value));
        }

        Ok(TaskOutput::new(json!({
            "task": ctx.task.id,
            "worker": ctx.worker.id,
            "message": message,
            "payload": ctx.task.payload,
            "inputs": ctx.inputs,
        })))
    }
}

pub struct EchoInvokerFactory;

impl InvokerFactory for EchoInvokerFactory {
    fn create(&self, _options: &serde_json::Value) -> Result<Arc<dyn WorkerInvoker>, InvokeError> {
        Ok(Arc::new(EchoInvoker))
    }

    fn backend(&self) -> &str {
        "echo"
    }

    fn metadata(&self) -> BackendMetadata {
        BackendMetadata {
            description: "Echoes task payload and dependency outputs".to_string(),
            category: "debug".to_string(),
            config_keys: vec!["message".to_string(), "vote".to_string()],
        }
    }
}
