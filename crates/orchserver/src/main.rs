use actix_cors::Cors;
use actix_web::{delete, get, post, web, App, HttpResponse, HttpServer, Responder, Result as ActixResult};
use actix_ws::Message;
use orchcore::{OrchError, WorkflowError, WorkflowId, WorkflowSpec};
use orchruntime::{BackendRegistry, ManifestLoader, Orchestrator, OrchestratorConfig, WorkerRegistry};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Application state shared across handlers
struct AppState {
    orchestrator: Arc<Orchestrator>,
    backends: Arc<BackendRegistry>,
}

/// Response for workflow submission
#[derive(Debug, Serialize)]
struct WorkflowResponse {
    id: WorkflowId,
    message: String,
}

/// Error response
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

/// Optional filter for the event stream
#[derive(Debug, Deserialize)]
struct EventFilter {
    workflow: Option<WorkflowId>,
}

fn error_response(e: &OrchError) -> HttpResponse {
    let body = ErrorResponse {
        error: e.to_string(),
    };
    match e {
        OrchError::Workflow(WorkflowError::NotFound(_)) => HttpResponse::NotFound().json(body),
        OrchError::Workflow(WorkflowError::StillRunning(_)) => HttpResponse::Conflict().json(body),
        OrchError::Workflow(_) | OrchError::Serialization(_) => {
            HttpResponse::BadRequest().json(body)
        }
        _ => HttpResponse::InternalServerError().json(body),
    }
}

/// Health check endpoint
#[get("/health")]
async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "orchestrator"
    }))
}

/// List known executions
#[get("/api/workflows")]
async fn list_workflows(data: web::Data<AppState>) -> ActixResult<impl Responder> {
    Ok(HttpResponse::Ok().json(data.orchestrator.executions().await))
}

/// Submit a workflow; it runs in the background
#[post("/api/workflows")]
async fn submit_workflow(
    data: web::Data<AppState>,
    spec: web::Json<WorkflowSpec>,
) -> ActixResult<impl Responder> {
    let spec = spec.into_inner();
    info!("Submitting workflow: {} ({})", spec.name, spec.id);

    match data.orchestrator.submit(spec).await {
        Ok(id) => Ok(HttpResponse::Accepted().json(WorkflowResponse {
            id,
            message: "Workflow submitted".to_string(),
        })),
        Err(e) => {
            warn!("Workflow rejected: {}", e);
            Ok(error_response(&e))
        }
    }
}

/// Run a workflow to completion and return its report
#[post("/api/workflows/execute")]
async fn execute_workflow(
    data: web::Data<AppState>,
    spec: web::Json<WorkflowSpec>,
) -> ActixResult<impl Responder> {
    let spec = spec.into_inner();
    info!("Executing workflow: {} ({})", spec.name, spec.id);

    match data.orchestrator.orchestrate(spec).await {
        Ok(report) => {
            info!(
                "Workflow {} finished: {:?}, {}/{} tasks",
                report.workflow_id,
                report.status,
                report.completed_tasks(),
                report.tasks.len()
            );
            Ok(HttpResponse::Ok().json(report))
        }
        Err(e) => {
            error!("Workflow execution failed: {}", e);
            Ok(error_response(&e))
        }
    }
}

#[get("/api/workflows/{id}/status")]
async fn workflow_status(
    data: web::Data<AppState>,
    path: web::Path<WorkflowId>,
) -> ActixResult<impl Responder> {
    match data.orchestrator.status(path.into_inner()).await {
        Ok(snapshot) => Ok(HttpResponse::Ok().json(snapshot)),
        Err(e) => Ok(error_response(&e)),
    }
}

#[get("/api/workflows/{id}/report")]
async fn workflow_report(
    data: web::Data<AppState>,
    path: web::Path<WorkflowId>,
) -> ActixResult<impl Responder> {
    let id = path.into_inner();
    if let Some(report) = data.orchestrator.report(id).await {
        return Ok(HttpResponse::Ok().json(report));
    }
    match data.orchestrator.status(id).await {
        Ok(_) => Ok(HttpResponse::Conflict().json(ErrorResponse {
            error: format!("Workflow {} is still running", id),
        })),
        Err(e) => Ok(error_response(&e)),
    }
}

#[post("/api/workflows/{id}/cancel")]
async fn cancel_workflow(
    data: web::Data<AppState>,
    path: web::Path<WorkflowId>,
) -> ActixResult<impl Responder> {
    let id = path.into_inner();
    match data.orchestrator.cancel(id).await {
        Ok(()) => {
            info!("Cancellation requested for {}", id);
            Ok(HttpResponse::Accepted().json(WorkflowResponse {
                id,
                message: "Cancellation requested".to_string(),
            }))
        }
        Err(e) => Ok(error_response(&e)),
    }
}

/// Drop a finished execution and its report
#[delete("/api/workflows/{id}")]
async fn forget_workflow(
    data: web::Data<AppState>,
    path: web::Path<WorkflowId>,
) -> ActixResult<impl Responder> {
    match data.orchestrator.forget(path.into_inner()).await {
        Ok(()) => Ok(HttpResponse::NoContent().finish()),
        Err(e) => Ok(error_response(&e)),
    }
}

/// List registered workers with live status
#[get("/api/workers")]
async fn list_workers(data: web::Data<AppState>) -> ActixResult<impl Responder> {
    Ok(HttpResponse::Ok().json(data.orchestrator.registry().workers().await))
}

/// List available worker backends
#[get("/api/backends")]
async fn list_backends(data: web::Data<AppState>) -> ActixResult<impl Responder> {
    let backends: Vec<_> = data
        .backends
        .list_backends()
        .iter()
        .map(|backend| {
            let metadata = data.backends.get_metadata(backend);
            serde_json::json!({
                "backend": backend,
                "description": metadata.as_ref().map(|m| m.description.clone()).unwrap_or_default(),
                "category": metadata.as_ref().map(|m| m.category.clone()).unwrap_or_default(),
                "config_keys": metadata.map(|m| m.config_keys).unwrap_or_default(),
            })
        })
        .collect();

    Ok(HttpResponse::Ok().json(backends))
}

/// WebSocket endpoint for real-time progress events
#[get("/api/events")]
async fn websocket_events(
    req: actix_web::HttpRequest,
    stream: web::Payload,
    data: web::Data<AppState>,
    filter: web::Query<EventFilter>,
) -> ActixResult<HttpResponse> {
    let (res, mut session, mut msg_stream) = actix_ws::handle(&req, stream)?;
    let only = filter.into_inner().workflow;

    info!("WebSocket client connected");

    let mut events = data.orchestrator.subscribe_events();

    actix_web::rt::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Ok(event) => {
                            if only.map_or(false, |id| id != event.workflow_id()) {
                                continue;
                            }
                            let mut value = match serde_json::to_value(&event) {
                                Ok(value) => value,
                                Err(_) => continue,
                            };
                            value["event"] = serde_json::json!(event.name());
                            if session.text(value.to_string()).await.is_err() {
                                break;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("WebSocket client lagging, {} events dropped", skipped);
                        }
                        Err(_) => break,
                    }
                }

                // Handle incoming WebSocket messages (ping/pong)
                Some(Ok(msg)) = msg_stream.recv() => {
                    match msg {
                        Message::Ping(bytes) => {
                            if session.pong(&bytes).await.is_err() {
                                break;
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }

                else => break,
            }
        }

        info!("WebSocket client disconnected");
        let _ = session.close(None).await;
    });

    Ok(res)
}

fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(health_check)
        .service(list_workflows)
        .service(execute_workflow)
        .service(submit_workflow)
        .service(workflow_status)
        .service(workflow_report)
        .service(cancel_workflow)
        .service(forget_workflow)
        .service(list_workers)
        .service(list_backends)
        .service(websocket_events);
}

async fn build_state(config: OrchestratorConfig) -> anyhow::Result<AppState> {
    let mut backends = BackendRegistry::new();
    orchworkers::register_all(&mut backends);
    let router = backends.build_router(&config.default_backend)?;

    let registry = Arc::new(WorkerRegistry::new());
    match std::env::var("ORCH_MANIFEST") {
        Ok(path) => {
            let manifest = ManifestLoader::load(&path)?;
            for issue in manifest.validate_completeness(None) {
                warn!("Manifest: {}", issue);
            }
            let count = registry.discover(&manifest).await;
            info!("Registered {} workers from {}", count, path);
        }
        Err(_) => warn!("ORCH_MANIFEST not set, starting without workers"),
    }

    let orchestrator = Orchestrator::with_registry(registry, Arc::new(router), config);
    for (worker, problem) in orchestrator.validate_workers().await {
        warn!("Worker {} is misconfigured: {}", worker, problem);
    }

    Ok(AppState {
        orchestrator: Arc::new(orchestrator),
        backends: Arc::new(backends),
    })
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("🚀 Starting Orchestrator Server");

    let config = match std::env::var("ORCH_CONFIG") {
        Ok(path) => OrchestratorConfig::load(path.as_ref())?,
        Err(_) => OrchestratorConfig::default(),
    };

    let app_state = web::Data::new(build_state(config).await?);
    info!("✅ Orchestrator initialized with standard backends");

    let bind_address =
        std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());

    info!("🌐 Server starting on http://{}", bind_address);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(app_state.clone())
            .wrap(cors)
            .wrap(actix_web::middleware::Logger::default())
            .configure(configure)
    })
    .bind(&bind_address)?
    .run()
    .await?;

    Ok(())
}
