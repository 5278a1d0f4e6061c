use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use orchcore::{ConsensusGate, ProgressEvent, Task, TaskUpdate, WorkflowSettings, WorkflowSpec};
use orchruntime::{
    BackendRegistry, DependencyGraph, ManifestLoader, MultiWorkflowCoordinator, Orchestrator,
    OrchestratorConfig, Stage, StageStatus, WorkerDefinition, WorkerManifest, WorkerRegistry,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "orch")]
#[command(about = "Dependency-aware workflow orchestrator", long_about = None)]
struct Cli {
    /// Orchestrator config (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Worker manifest file or directory of worker definitions
    #[arg(short, long, global = true)]
    manifest: Option<PathBuf>,

    /// Show verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow file
    Run {
        /// Path to workflow JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Write the execution report to this file
        #[arg(short, long)]
        report: Option<PathBuf>,
    },

    /// Validate a workflow file and print its phases
    Validate {
        /// Path to workflow JSON file
        file: PathBuf,
    },

    /// List workers from the manifest and check it for completeness
    Workers {
        /// Expected number of workers
        #[arg(long)]
        expect: Option<usize>,
    },

    /// List available worker backends
    Backends,

    /// Run several workflows in sequential and parallel stages
    Stages {
        /// Path to a stage plan JSON file
        file: PathBuf,
    },

    /// Create an example workflow and worker manifest
    Init {
        /// Output directory
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
    },
}

/// Stage plan consumed by `orch stages`
#[derive(Debug, Deserialize)]
struct StagePlan {
    #[serde(default)]
    allow_partial_success: bool,
    stages: Vec<PlannedStage>,
}

#[derive(Debug, Deserialize)]
struct PlannedStage {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    parallel: bool,
    #[serde(default)]
    timeout_ms: Option<u64>,
    /// Workflow files, relative to the plan
    workflows: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = match &cli.config {
        Some(path) => OrchestratorConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => OrchestratorConfig::default(),
    };

    match cli.command {
        Commands::Run { file, report } => {
            run_workflow(&file, report, config, cli.manifest.as_deref()).await?;
        }

        Commands::Validate { file } => {
            validate_workflow(&file)?;
        }

        Commands::Workers { expect } => {
            list_workers(cli.manifest.as_deref(), expect, config).await?;
        }

        Commands::Backends => {
            list_backends();
        }

        Commands::Stages { file } => {
            run_stages(&file, config, cli.manifest.as_deref()).await?;
        }

        Commands::Init { output } => {
            create_example(&output)?;
        }
    }

    Ok(())
}

fn load_manifest(path: Option<&Path>) -> Result<WorkerManifest> {
    match path {
        Some(path) => Ok(ManifestLoader::load(path)?),
        None => {
            // Three echo workers when no manifest is given
            let mut manifest = WorkerManifest::default();
            for i in 1..=3 {
                manifest = manifest
                    .with_worker(WorkerDefinition::new(format!("echo-{}", i)).with_backend("echo"));
            }
            Ok(manifest)
        }
    }
}

async fn build_orchestrator(
    config: OrchestratorConfig,
    manifest: Option<&Path>,
) -> Result<Arc<Orchestrator>> {
    let manifest = load_manifest(manifest)?;

    let mut backends = BackendRegistry::new();
    orchworkers::register_all(&mut backends);
    let router = backends.build_router(&config.default_backend)?;

    let registry = Arc::new(WorkerRegistry::new());
    let discovered = registry.discover(&manifest).await;
    tracing::info!("Registered {} workers", discovered);

    let orchestrator = Orchestrator::with_registry(registry, Arc::new(router), config);
    for (worker, problem) in orchestrator.validate_workers().await {
        println!("⚠️  Worker {} is misconfigured: {}", worker, problem);
    }
    Ok(Arc::new(orchestrator))
}

fn read_workflow(file: &Path) -> Result<WorkflowSpec> {
    let workflow_json = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let spec: WorkflowSpec = serde_json::from_str(&workflow_json)
        .with_context(|| format!("Failed to parse {}", file.display()))?;
    Ok(spec)
}

fn print_event(event: ProgressEvent) {
    match event {
        ProgressEvent::WorkflowStarted { total_phases, .. } => {
            println!("▶️  Workflow started ({} phases)", total_phases);
        }
        ProgressEvent::PhaseStarted { phase, task_ids, .. } => {
            println!("  📦 Phase {}: {}", phase, task_ids.join(", "));
        }
        ProgressEvent::TaskQueued { task_id, reason, .. } => {
            println!("  ⏳ Task {} queued: {}", task_id, reason);
        }
        ProgressEvent::TaskStarted {
            task_id,
            worker_id,
            attempt,
            ..
        } => {
            println!("  ⚡ Starting task: {} on {} (attempt {})", task_id, worker_id, attempt);
        }
        ProgressEvent::TaskCompleted {
            task_id,
            duration_ms,
            cached,
            ..
        } => {
            let note = if cached { " (cached)" } else { "" };
            println!("  ✅ Task {} completed in {}ms{}", task_id, duration_ms, note);
        }
        ProgressEvent::TaskFailed {
            task_id,
            error,
            will_retry,
            ..
        } => {
            let note = if will_retry { ", retrying" } else { "" };
            println!("  ❌ Task {} failed: {}{}", task_id, error, note);
        }
        ProgressEvent::TaskTimeout {
            task_id, attempt, ..
        } => {
            println!("  ⏰ Task {} timed out (attempt {})", task_id, attempt);
        }
        ProgressEvent::TaskCancelled { task_id, .. } => {
            println!("  🛑 Task {} cancelled", task_id);
        }
        ProgressEvent::TaskProgress {
            task_id, update, ..
        } => match update {
            TaskUpdate::Info { message } => println!("     ℹ️  [{}] {}", task_id, message),
            TaskUpdate::Warning { message } => println!("     ⚠️  [{}] {}", task_id, message),
            TaskUpdate::Progress { percent, message } => match message {
                Some(msg) => println!("     📊 [{}] {}% - {}", task_id, percent, msg),
                None => println!("     📊 [{}] {}%", task_id, percent),
            },
        },
        ProgressEvent::PhaseCompleted {
            phase,
            success,
            duration_ms,
            ..
        } => {
            let mark = if success { "✔" } else { "✖" };
            println!("  {} Phase {} finished in {}ms", mark, phase, duration_ms);
        }
        ProgressEvent::WorkflowCompleted {
            status,
            duration_ms,
            ..
        } => {
            println!("🏁 Workflow {:?} after {}ms", status, duration_ms);
        }
    }
}

async fn run_workflow(
    file: &Path,
    report_path: Option<PathBuf>,
    config: OrchestratorConfig,
    manifest: Option<&Path>,
) -> Result<()> {
    println!("🚀 Loading workflow from: {}", file.display());
    let spec = read_workflow(file)?;

    println!("📋 Workflow: {}", spec.name);
    println!("   Tasks: {}", spec.tasks.len());
    println!();

    let orchestrator = build_orchestrator(config, manifest).await?;

    // Subscribe to events for real-time output
    let mut events = orchestrator.subscribe_events();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            print_event(event);
        }
    });

    let report = orchestrator.orchestrate(spec).await?;

    // Wait for events to finish printing
    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    event_task.abort();

    println!();
    println!("📊 Execution Summary:");
    println!("   Execution ID: {}", report.execution_id);
    println!("   Status: {:?}", report.status);
    if let Some(reason) = report.halt_reason {
        println!("   Halted: {:?}", reason);
    }
    println!(
        "   Completed: {}/{} tasks in {}ms",
        report.completed_tasks(),
        report.tasks.len(),
        report.duration_ms
    );
    if !report.failed_tasks.is_empty() {
        println!("   Failed: {}", report.failed_tasks.join(", "));
    }
    for outcome in &report.consensus {
        println!(
            "   Consensus '{}': {}/{} approvals (reached: {})",
            outcome.topic,
            outcome.approvals,
            outcome.total(),
            outcome.reached
        );
    }

    if let Some(path) = report_path {
        std::fs::write(&path, serde_json::to_string_pretty(&report)?)?;
        println!("📝 Report written to {}", path.display());
    }

    if !report.is_success() {
        anyhow::bail!("Workflow {} did not complete", report.name);
    }
    Ok(())
}

fn validate_workflow(file: &Path) -> Result<()> {
    println!("🔍 Validating workflow: {}", file.display());
    let spec = read_workflow(file)?;

    let graph = DependencyGraph::build(&spec.tasks, spec.settings.dependency_mode)?;

    println!("✅ Workflow is valid:");
    println!("   Name: {}", spec.name);
    println!("   Tasks: {}", spec.tasks.len());
    println!("   Phases: {}", graph.phases().len());
    for phase in graph.phases() {
        let mode = if phase.concurrent { "parallel" } else { "single" };
        println!("     {}. [{}] {}", phase.index, mode, phase.task_ids.join(", "));
    }

    for gate in &spec.settings.gates {
        if gate.after_phase >= graph.phases().len() {
            println!(
                "⚠️  Gate '{}' refers to phase {} which does not exist",
                gate.topic, gate.after_phase
            );
        }
    }

    Ok(())
}

async fn list_workers(
    manifest_path: Option<&Path>,
    expect: Option<usize>,
    config: OrchestratorConfig,
) -> Result<()> {
    let manifest = load_manifest(manifest_path)?;
    let orchestrator = build_orchestrator(config, manifest_path).await?;

    println!("👥 Workers:");
    println!();
    for worker in orchestrator.registry().workers().await {
        let caps: Vec<&str> = worker.capabilities.iter().map(String::as_str).collect();
        println!(
            "  • {} ({}) team={} backend={}",
            worker.id,
            worker.name,
            worker.team,
            worker
                .backend
                .as_deref()
                .unwrap_or(&orchestrator.config().default_backend)
        );
        if !caps.is_empty() {
            println!("    capabilities: {}", caps.join(", "));
        }
    }

    let issues = manifest.validate_completeness(expect);
    println!();
    if issues.is_empty() {
        println!("✅ Manifest is complete");
    } else {
        for issue in &issues {
            println!("❌ {}", issue);
        }
        anyhow::bail!("{} manifest issue(s)", issues.len());
    }
    Ok(())
}

fn list_backends() {
    println!("📦 Available Backends:");
    println!();

    let mut registry = BackendRegistry::new();
    orchworkers::register_all(&mut registry);

    for backend in registry.list_backends() {
        if let Some(metadata) = registry.get_metadata(&backend) {
            println!("  • {} ({})", backend, metadata.category);
            println!("    {}", metadata.description);
            if !metadata.config_keys.is_empty() {
                println!("    config: {}", metadata.config_keys.join(", "));
            }
        } else {
            println!("  • {}", backend);
        }
    }
}

async fn run_stages(
    file: &Path,
    config: OrchestratorConfig,
    manifest: Option<&Path>,
) -> Result<()> {
    println!("🚀 Loading stage plan from: {}", file.display());
    let content = std::fs::read_to_string(file)?;
    let plan: StagePlan = serde_json::from_str(&content)?;
    let base = file.parent().unwrap_or_else(|| Path::new("."));

    let orchestrator = build_orchestrator(config, manifest).await?;
    let mut coordinator =
        MultiWorkflowCoordinator::new(orchestrator).allow_partial_success(plan.allow_partial_success);

    let mut stages = Vec::with_capacity(plan.stages.len());
    for planned in &plan.stages {
        let mut ids = Vec::with_capacity(planned.workflows.len());
        for path in &planned.workflows {
            let spec = read_workflow(&base.join(path))?;
            ids.push(coordinator.add_workflow(spec));
        }
        let mut stage = if planned.parallel {
            Stage::parallel(ids)
        } else {
            Stage::sequential(ids)
        };
        stage.name = planned.name.clone();
        stage.timeout_ms = planned.timeout_ms;
        stages.push(stage);
    }

    let report = coordinator.run(&stages).await?;

    println!();
    println!("📊 Stage Summary ({}ms):", report.duration_ms);
    for stage in &report.stages {
        let icon = match stage.status {
            StageStatus::Completed => "✅",
            StageStatus::Failed => "❌",
            StageStatus::Skipped => "⏭️ ",
        };
        let name = stage
            .name
            .clone()
            .unwrap_or_else(|| format!("stage {}", stage.index));
        println!("  {} {} ({:?})", icon, name, stage.status);
        for workflow in &stage.workflows {
            println!("     - {}: {:?}", workflow.name, workflow.status);
        }
        for error in &stage.errors {
            println!("     ! {}", error);
        }
    }

    if !matches!(report.status, orchcore::WorkflowStatus::Completed) {
        anyhow::bail!("Stage run finished with status {:?}", report.status);
    }
    Ok(())
}

fn create_example(output: &Path) -> Result<()> {
    std::fs::create_dir_all(output)?;

    let spec = WorkflowSpec::new("Example Release Workflow")
        .with_task(
            Task::new("design")
                .with_capability("design")
                .with_payload(serde_json::json!({"message": "draft the API"})),
        )
        .with_task(
            Task::new("backend")
                .depends_on("design")
                .with_payload(serde_json::json!({"delay_ms": 500})),
        )
        .with_task(
            Task::new("frontend")
                .depends_on("design")
                .with_payload(serde_json::json!({"delay_ms": 300})),
        )
        .with_task(
            Task::new("review")
                .depends_on("backend")
                .depends_on("frontend")
                .with_max_attempts(2),
        )
        .with_settings(WorkflowSettings {
            gates: vec![ConsensusGate {
                after_phase: 1,
                topic: "ready-for-review".to_string(),
                participants: vec!["architect".to_string(), "reviewer".to_string()],
                threshold: 0.5,
                timeout_ms: 10_000,
            }],
            ..WorkflowSettings::default()
        });

    let mut manifest = WorkerManifest::default()
        .with_worker(
            WorkerDefinition::new("architect")
                .with_capability("design")
                .with_capability("architecture")
                .with_backend("echo"),
        )
        .with_worker(WorkerDefinition::new("builder-1").with_backend("delay"))
        .with_worker(WorkerDefinition::new("builder-2").with_backend("delay"))
        .with_worker(
            WorkerDefinition::new("reviewer")
                .with_capability("review")
                .with_backend("echo"),
        );
    manifest
        .teams
        .insert("architecture".to_string(), vec!["design".to_string()]);
    manifest.critical_workers = vec!["architect".to_string()];

    let workflow_path = output.join("workflow.json");
    let manifest_path = output.join("workers.json");
    std::fs::write(&workflow_path, serde_json::to_string_pretty(&spec)?)?;
    std::fs::write(&manifest_path, serde_json::to_string_pretty(&manifest)?)?;

    println!("✨ Created example workflow: {}", workflow_path.display());
    println!("✨ Created worker manifest: {}", manifest_path.display());
    println!();
    println!("Run it with:");
    println!(
        "  orch run --manifest {} --file {}",
        manifest_path.display(),
        workflow_path.display()
    );

    Ok(())
}
