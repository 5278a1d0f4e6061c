use async_trait::async_trait;
use orchcore::{InvocationContext, InvokeError, TaskOutput, Worker, WorkerInvoker};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Factory trait for creating invoker backends
pub trait InvokerFactory: Send + Sync {
    /// Create the backend with the given options
    fn create(&self, options: &serde_json::Value) -> Result<Arc<dyn WorkerInvoker>, InvokeError>;

    /// Backend identifier, matched against `Worker::backend`
    fn backend(&self) -> &str;

    /// Optional: Get backend metadata
    fn metadata(&self) -> BackendMetadata {
        BackendMetadata::default()
    }
}

/// Metadata about a backend
#[derive(Debug, Clone)]
pub struct BackendMetadata {
    pub description: String,
    pub category: String,
    /// Worker config keys the backend reads
    pub config_keys: Vec<String>,
}

impl Default for BackendMetadata {
    fn default() -> Self {
        Self {
            description: String::new(),
            category: "general".to_string(),
            config_keys: Vec::new(),
        }
    }
}

/// Registry of available invoker backends
pub struct BackendRegistry {
    factories: HashMap<String, Arc<dyn InvokerFactory>>,
    options: HashMap<String, serde_json::Value>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            options: HashMap::new(),
        }
    }

    /// Register a backend factory
    pub fn register(&mut self, factory: Arc<dyn InvokerFactory>) {
        let backend = factory.backend().to_string();
        tracing::info!("Registering backend: {}", backend);
        self.factories.insert(backend, factory);
    }

    /// Options passed to a backend's factory when the router is built
    pub fn configure(&mut self, backend: impl Into<String>, options: serde_json::Value) {
        self.options.insert(backend.into(), options);
    }

    /// Create a single backend
    pub fn create(&self, backend: &str) -> Result<Arc<dyn WorkerInvoker>, InvokeError> {
        let factory = self
            .factories
            .get(backend)
            .ok_or_else(|| InvokeError::Configuration(format!("Unknown backend: {}", backend)))?;
        let options = self
            .options
            .get(backend)
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        factory.create(&options)
    }

    /// Instantiate every backend behind one routing invoker
    pub fn build_router(&self, default_backend: &str) -> Result<RoutingInvoker, InvokeError> {
        let mut backends = BTreeMap::new();
        for name in self.factories.keys() {
            backends.insert(name.clone(), self.create(name)?);
        }
        if !backends.contains_key(default_backend) {
            return Err(InvokeError::Configuration(format!(
                "Default backend {} is not registered",
                default_backend
            )));
        }
        Ok(RoutingInvoker {
            backends,
            default_backend: default_backend.to_string(),
        })
    }

    /// Get all registered backends, sorted
    pub fn list_backends(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn get_metadata(&self, backend: &str) -> Option<BackendMetadata> {
        self.factories.get(backend).map(|f| f.metadata())
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Dispatches each invocation to the backend named by the worker
pub struct RoutingInvoker {
    backends: BTreeMap<String, Arc<dyn WorkerInvoker>>,
    default_backend: String,
}

impl RoutingInvoker {
    fn route(&self, worker: &Worker) -> Result<&Arc<dyn WorkerInvoker>, InvokeError> {
        let name = worker.backend.as_deref().unwrap_or(&self.default_backend);
        self.backends.get(name).ok_or_else(|| {
            InvokeError::Configuration(format!(
                "Worker {} uses unknown backend {}",
                worker.id, name
            ))
        })
    }

    pub fn backends(&self) -> impl Iterator<Item = &str> {
        self.backends.keys().map(String::as_str)
    }
}

#[async_trait]
impl WorkerInvoker for RoutingInvoker {
    fn backend(&self) -> &str {
        "router"
    }

    async fn invoke(&self, ctx: InvocationContext) -> Result<TaskOutput, InvokeError> {
        let backend = self.route(&ctx.worker)?.clone();
        backend.invoke(ctx).await
    }

    fn supports_cancellation(&self) -> bool {
        self.backends.values().all(|b| b.supports_cancellation())
    }

    fn validate_worker(&self, worker: &Worker) -> Result<(), InvokeError> {
        self.route(worker)?.validate_worker(worker)
    }
}
