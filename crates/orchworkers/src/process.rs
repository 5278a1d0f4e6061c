use async_trait::async_trait;
use orchcore::{InvocationContext, InvokeError, TaskOutput, Worker, WorkerInvoker};
use orchruntime::{BackendMetadata, InvokerFactory};
use serde_json::json;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

const DEFAULT_GRACE_MS: u64 = 5000;

/// Runs each task in a child process
///
/// The invocation is written to stdin as JSON; stdout is parsed as JSON when
/// possible and returned as a string otherwise. A non-zero exit fails the
/// attempt. On cancellation the child gets SIGTERM, then SIGKILL once the
/// grace period is over.
pub struct ProcessInvoker {
    grace: Duration,
}

#[derive(Debug, Clone)]
struct ProcessConfig {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    working_dir: Option<String>,
}

impl ProcessConfig {
    fn from_worker(worker: &Worker) -> Result<Self, InvokeError> {
        let config = &worker.config;
        let command = config.get("command").ok_or_else(|| {
            InvokeError::Configuration(format!("Worker {} has no command", worker.id))
        })?;

        let mut parts: Vec<String> = match command {
            serde_json::Value::String(s) => s.split_whitespace().map(String::from).collect(),
            serde_json::Value::Array(items) => items
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect(),
            _ => {
                return Err(InvokeError::Configuration(
                    "command must be a string or an array".to_string(),
                ))
            }
        };
        if parts.is_empty() {
            return Err(InvokeError::Configuration(format!(
                "Worker {} has an empty command",
                worker.id
            )));
        }
        let program = parts.remove(0);

        if let Some(serde_json::Value::Array(extra)) = config.get("args") {
            parts.extend(extra.iter().filter_map(|v| v.as_str().map(String::from)));
        }

        let mut env = Vec::new();
        if let Some(serde_json::Value::Object(vars)) = config.get("env") {
            for (key, value) in vars {
                let value = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                env.push((key.clone(), value));
            }
        }

        let working_dir = config
            .get("workdir")
            .and_then(|v| v.as_str())
            .map(String::from);

        Ok(Self {
            program,
            args: parts,
            env,
            working_dir,
        })
    }
}

impl ProcessInvoker {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }

    fn command(config: &ProcessConfig) -> Command {
        let mut cmd = Command::new(&config.program);
        cmd.args(&config.args)
            .envs(config.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &config.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

impl Default for ProcessInvoker {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_GRACE_MS))
    }
}

fn collect<R>(stream: Option<R>) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut stream) = stream {
            if let Err(e) = stream.read_to_end(&mut buf).await {
                tracing::debug!("Failed to read child output: {}", e);
            }
        }
        buf
    })
}

/// SIGTERM, then SIGKILL once `grace` is over
async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            #[allow(unsafe_code, clippy::cast_possible_wrap)]
            let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
            if ret != 0 {
                let err = std::io::Error::last_os_error();
                tracing::warn!(pid, error = %err, "Failed to send SIGTERM");
            }
        }
    }

    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        tracing::warn!("Grace period expired, sending SIGKILL");
        if let Err(e) = child.kill().await {
            tracing::warn!("Failed to kill child process: {}", e);
        }
    }
}

#[async_trait]
impl WorkerInvoker for ProcessInvoker {
    fn backend(&self) -> &str {
        "process"
    }

    async fn invoke(&self, ctx: InvocationContext) -> Result<TaskOutput, InvokeError> {
        let config = ProcessConfig::from_worker(&ctx.worker)?;
        let request = json!({
            "workflow_id": ctx.workflow_id,
            "task": ctx.task,
            "inputs": ctx.inputs,
            "attempt": ctx.attempt,
        });
        let input = serde_json::to_vec(&request)
            .map_err(|e| InvokeError::Failed(format!("Failed to encode request: {}", e)))?;

        ctx.events.info(format!("Running {}", config.program));
        let start = Instant::now();

        let mut child = Self::command(&config).spawn().map_err(|e| {
            InvokeError::Failed(format!("Failed to spawn {}: {}", config.program, e))
        })?;

        let stdout = collect(child.stdout.take());
        let stderr = collect(child.stderr.take());

        if let Some(mut stdin) = child.stdin.take() {
            // A child that does not read stdin closes the pipe early
            if let Err(e) = stdin.write_all(&input).await {
                tracing::debug!("Child closed stdin: {}", e);
            }
            drop(stdin);
        }

        let status = tokio::select! {
            status = child.wait() => status
                .map_err(|e| InvokeError::Failed(format!("Failed to wait for process: {}", e)))?,
            _ = ctx.cancellation.cancelled() => {
                tracing::info!(task = %ctx.task.id, "Cancelling child process");
                terminate(&mut child, self.grace).await;
                return Err(InvokeError::Cancelled);
            }
        };

        let stdout = String::from_utf8_lossy(&stdout.await.unwrap_or_default()).into_owned();
        let stderr = String::from_utf8_lossy(&stderr.await.unwrap_or_default()).into_owned();

        if !stderr.is_empty() {
            ctx.events.warn(format!("stderr: {}", stderr.trim_end()));
        }

        if !status.success() {
            return Err(InvokeError::Failed(format!(
                "Process exited with {}. stderr: {}",
                status,
                stderr.trim_end()
            )));
        }

        let output = serde_json::from_str::<serde_json::Value>(&stdout)
            .unwrap_or_else(|_| serde_json::Value::String(stdout.trim_end().to_string()));

        let mut result = TaskOutput::new(output)
            .with_metadata("exit_code", json!(status.code().unwrap_or(0)));
        result.metadata.execution_time_ms = start.elapsed().as_millis() as u64;
        Ok(result)
    }

    fn validate_worker(&self, worker: &Worker) -> Result<(), InvokeError> {
        ProcessConfig::from_worker(worker).map(|_| ())
    }
}

pub struct ProcessInvokerFactory;

impl InvokerFactory for ProcessInvokerFactory {
    fn create(&self, options: &serde_json::Value) -> Result<Arc<dyn WorkerInvoker>, InvokeError> {
        let grace_ms = options
            .get("grace_ms")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_GRACE_MS);
        Ok(Arc::new(ProcessInvoker::new(Duration::from_millis(grace_ms))))
    }

    fn backend(&self) -> &str {
        "process"
    }

    fn metadata(&self) -> BackendMetadata {
        BackendMetadata {
            description: "Run a task in a child process (JSON over stdin/stdout)".to_string(),
            category: "process".to_string(),
            config_keys: vec![
                "command".to_string(),
                "args".to_string(),
                "env".to_string(),
                "workdir".to_string(),
            ],
        }
    }
}
