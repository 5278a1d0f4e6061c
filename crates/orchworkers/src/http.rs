use async_trait::async_trait;
use orchcore::{InvocationContext, InvokeError, TaskOutput, Worker, WorkerInvoker};
use orchruntime::{BackendMetadata, InvokerFactory};
use serde_json::json;
use std::sync::Arc;

/// Sends each task to a remote worker over HTTP
///
/// The worker's `url` receives the invocation as a JSON body; the response
/// body becomes the task output.
pub struct HttpInvoker {
    client: reqwest::Client,
}

impl HttpInvoker {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn url(worker: &Worker) -> Result<&str, InvokeError> {
        worker
            .config
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                InvokeError::Configuration(format!("Worker {} has no url", worker.id))
            })
    }
}

impl Default for HttpInvoker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkerInvoker for HttpInvoker {
    fn backend(&self) -> &str {
        "http"
    }

    async fn invoke(&self, ctx: InvocationContext) -> Result<TaskOutput, InvokeError> {
        let url = Self::url(&ctx.worker)?;
        let method = ctx
            .worker
            .config
            .get("method")
            .and_then(|v| v.as_str())
            .unwrap_or("POST");

        ctx.events.info(format!("{} {}", method, url));

        let body = json!({
            "workflow_id": ctx.workflow_id,
            "task": ctx.task,
            "inputs": ctx.inputs,
            "attempt": ctx.attempt,
        });

        let request = match method.to_uppercase().as_str() {
            "POST" => self.client.post(url).json(&body),
            "PUT" => self.client.put(url).json(&body),
            _ => {
                return Err(InvokeError::Configuration(format!(
                    "Unsupported method: {}",
                    method
                )))
            }
        };

        // Add headers if provided
        let mut request = request.timeout(ctx.timeout);
        if let Some(serde_json::Value::Object(headers)) = ctx.worker.config.get("headers") {
            for (key, value) in headers {
                if let Some(val_str) = value.as_str() {
                    request = request.header(key, val_str);
                }
            }
        }

        let response = tokio::select! {
            res = request.send() => res.map_err(|e| {
                if e.is_timeout() {
                    InvokeError::Timeout { timeout_ms: ctx.timeout.as_millis() as u64 }
                } else {
                    InvokeError::Failed(format!("HTTP request failed: {}", e))
                }
            })?,
            _ = ctx.cancellation.cancelled() => return Err(InvokeError::Cancelled),
        };

        let status = response.status();
        let body_text = response
            .text()
            .await
            .map_err(|e| InvokeError::Failed(format!("Failed to read response: {}", e)))?;

        ctx.events.info(format!("Response status: {}", status.as_u16()));

        if !status.is_success() {
            return Err(InvokeError::Failed(format!(
                "Worker responded with {}: {}",
                status.as_u16(),
                body_text
            )));
        }

        let output = serde_json::from_str::<serde_json::Value>(&body_text)
            .unwrap_or(serde_json::Value::String(body_text));
        Ok(TaskOutput::new(output).with_metadata("status", json!(status.as_u16())))
    }

    fn validate_worker(&self, worker: &Worker) -> Result<(), InvokeError> {
        let url = Self::url(worker)?;
        reqwest::Url::parse(url)
            .map(|_| ())
            .map_err(|e| InvokeError::Configuration(format!("Invalid url {}: {}", url, e)))
    }
}

pub struct HttpInvokerFactory;

impl InvokerFactory for HttpInvokerFactory {
    fn create(&self, options: &serde_json::Value) -> Result<Arc<dyn WorkerInvoker>, InvokeError> {
        let mut builder = reqwest::Client::builder();
        if let Some(ms) = options.get("connect_timeout_ms").and_then(|v| v.as_u64()) {
            builder = builder.connect_timeout(std::time::Duration::from_millis(ms));
        }
        let client = builder
            .build()
            .map_err(|e| InvokeError::Configuration(format!("HTTP client: {}", e)))?;
        Ok(Arc::new(HttpInvoker::with_client(client)))
    }

    fn backend(&self) -> &str {
        "http"
    }

    fn metadata(&self) -> BackendMetadata {
        BackendMetadata {
            description: "POST tasks to a remote worker".to_string(),
            category: "http".to_string(),
            config_keys: vec![
                "url".to_string(),
                "method".to_string(),
                "headers".to_string(),
            ],
        }
    }
}
