mod common;

use common::{fast_config, orchestrator, Behavior, FakeInvoker};
use orchcore::{
    ConsensusGate, HaltReason, OrchError, PhaseStatus, Priority, ProgressEvent, RetryPolicy, Task,
    TaskStatus, WorkflowError, WorkflowSettings, WorkflowSpec, WorkflowStatus,
};
use orchruntime::{
    AdmissionConfig, AdmissionControl, Orchestrator, OrchestratorConfig, ResourceMonitor,
    ResourceProbe, ResourceSample,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        base_delay_ms: 10,
        multiplier: 2.0,
        max_delay_ms: 100,
    }
}

#[tokio::test]
async fn test_diamond_runs_middle_phase_concurrently() {
    let invoker = Arc::new(FakeInvoker::with_default(Behavior::Succeed { delay_ms: 100 }));
    let orch = orchestrator(4, invoker.clone(), fast_config()).await;

    let spec = WorkflowSpec::new("diamond")
        .with_task(Task::new("A"))
        .with_task(Task::new("B").depends_on("A"))
        .with_task(Task::new("C").depends_on("A"))
        .with_task(Task::new("D").depends_on("B").depends_on("C"));

    let report = orch.orchestrate(spec).await.unwrap();

    assert_eq!(report.status, WorkflowStatus::Completed);
    assert!(report.halt_reason.is_none());
    assert_eq!(report.phases.len(), 3);
    assert!(report.phases.iter().all(|p| p.status == PhaseStatus::Completed));
    assert_eq!(report.completed_tasks(), 4);

    // B and C overlap in time
    let b = &invoker.calls_for("B")[0];
    let c = &invoker.calls_for("C")[0];
    assert!(b.started < c.finished.unwrap() && c.started < b.finished.unwrap());
    assert_eq!(invoker.max_in_flight(), 2);

    // D starts only after both B and C finished (phase barrier)
    let d = &invoker.calls_for("D")[0];
    assert!(d.started >= b.finished.unwrap());
    assert!(d.started >= c.finished.unwrap());

    // Dependency outputs are handed to dependents
    assert_eq!(d.inputs.len(), 2);
    assert_eq!(d.inputs["B"]["task"], json!("B"));
}

#[tokio::test]
async fn test_cycle_is_rejected_without_dispatch() {
    let invoker = Arc::new(FakeInvoker::new());
    let orch = orchestrator(2, invoker.clone(), fast_config()).await;

    let spec = WorkflowSpec::new("cyclic")
        .with_task(Task::new("X").depends_on("Y"))
        .with_task(Task::new("Y").depends_on("X"));
    let id = spec.id;

    let err = orch.orchestrate(spec).await.unwrap_err();
    match err {
        OrchError::Workflow(WorkflowError::CycleDetected(members)) => {
            assert_eq!(members, vec!["X", "Y"]);
        }
        other => panic!("expected CycleDetected, got {}", other),
    }
    assert_eq!(invoker.call_count(), 0);
    assert!(orch.status(id).await.is_err(), "rejected workflows are not tracked");
}

#[tokio::test]
async fn test_concurrency_limit_holds_back_third_task() {
    let invoker = Arc::new(FakeInvoker::with_default(Behavior::Succeed { delay_ms: 150 }));
    let mut config = fast_config();
    config.max_concurrency = 2;
    let orch = orchestrator(3, invoker.clone(), config).await;

    let spec = WorkflowSpec::new("limited")
        .with_task(Task::new("T1"))
        .with_task(Task::new("T2"))
        .with_task(Task::new("T3"));

    let mut events = orch.subscribe_events();
    let report = orch.orchestrate(spec).await.unwrap();
    assert_eq!(report.status, WorkflowStatus::Completed);
    assert_eq!(invoker.max_in_flight(), 2);

    let t1 = &invoker.calls_for("T1")[0];
    let t2 = &invoker.calls_for("T2")[0];
    let t3 = &invoker.calls_for("T3")[0];
    let first_release = t1.finished.unwrap().min(t2.finished.unwrap());
    assert!(t3.started >= first_release, "T3 waits for a release");

    let mut queued = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ProgressEvent::TaskQueued { task_id, reason, .. } = event {
            queued.push((task_id, reason));
        }
    }
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].0, "T3");
    assert_eq!(queued[0].1, "concurrency limit reached");
}

#[tokio::test]
async fn test_hanging_task_times_out_retries_then_fails() {
    let invoker = Arc::new(FakeInvoker::with_default(Behavior::Hang));
    let orch = orchestrator(1, invoker.clone(), fast_config()).await;

    let spec = WorkflowSpec::new("stuck")
        .with_task(Task::new("slow").with_timeout_ms(1000).with_max_attempts(2))
        .with_settings(WorkflowSettings {
            retry: fast_retry(),
            ..WorkflowSettings::default()
        });

    let mut events = orch.subscribe_events();
    let report = orch.orchestrate(spec).await.unwrap();

    let task = report.task("slow").unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.attempts, 2);
    assert!(task.error.as_deref().unwrap().contains("timed out"));
    assert_eq!(report.status, WorkflowStatus::Failed);
    assert_eq!(report.halt_reason, Some(HaltReason::TaskFailure));
    assert_eq!(report.failed_tasks, vec!["slow"]);
    assert_eq!(report.blocking_failures, vec!["slow"]);
    assert_eq!(report.first_failed_phase, Some(0));

    let calls = invoker.calls_for("slow");
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].attempt, 2);

    let mut timeouts = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ProgressEvent::TaskTimeout { attempt, will_retry, .. } = event {
            timeouts.push((attempt, will_retry));
        }
    }
    assert_eq!(timeouts, vec![(1, true), (2, false)]);

    // The worker is idle again after giving up
    assert_eq!(orch.registry().idle_count().await, 1);
}

#[tokio::test]
async fn test_flaky_task_succeeds_on_retry() {
    let invoker = Arc::new(FakeInvoker::new());
    invoker.set("flaky", Behavior::FailTimes(1));
    let orch = orchestrator(2, invoker.clone(), fast_config()).await;

    let spec = WorkflowSpec::new("flaky")
        .with_task(Task::new("flaky").with_max_attempts(3))
        .with_settings(WorkflowSettings {
            retry: fast_retry(),
            ..WorkflowSettings::default()
        });

    let report = orch.orchestrate(spec).await.unwrap();
    let task = report.task("flaky").unwrap();
    assert_eq!(report.status, WorkflowStatus::Completed);
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.attempts, 2);
    assert!(task.error.is_none());
}

#[tokio::test]
async fn test_block_on_failure_stops_later_phases() {
    let invoker = Arc::new(FakeInvoker::new());
    invoker.set("build", Behavior::Fail);
    let orch = orchestrator(2, invoker.clone(), fast_config()).await;

    let spec = WorkflowSpec::new("pipeline")
        .with_task(Task::new("build"))
        .with_task(Task::new("lint"))
        .with_task(Task::new("deploy").depends_on("build"));

    let report = orch.orchestrate(spec).await.unwrap();

    assert_eq!(report.status, WorkflowStatus::Failed);
    assert_eq!(report.halt_reason, Some(HaltReason::TaskFailure));
    assert_eq!(report.phases[0].status, PhaseStatus::Failed);
    assert_eq!(report.phases[0].failed_tasks, vec!["build"]);
    assert_eq!(report.phases[1].status, PhaseStatus::NotStarted);
    assert_eq!(report.task("lint").unwrap().status, TaskStatus::Completed);
    assert_eq!(report.task("deploy").unwrap().status, TaskStatus::Pending);
    assert!(invoker.calls_for("deploy").is_empty());
    assert_eq!(report.first_failed_phase, Some(0));
}

#[tokio::test]
async fn test_failures_block_dependents_when_not_halting() {
    let invoker = Arc::new(FakeInvoker::new());
    invoker.set("fetch", Behavior::Fail);
    let orch = orchestrator(2, invoker.clone(), fast_config()).await;

    let spec = WorkflowSpec::new("lenient")
        .with_task(Task::new("fetch"))
        .with_task(Task::new("other"))
        .with_task(Task::new("parse").depends_on("fetch"))
        .with_task(Task::new("index").depends_on("parse"))
        .with_task(Task::new("summary").depends_on("other"))
        .with_settings(WorkflowSettings {
            block_on_failure: false,
            ..WorkflowSettings::default()
        });

    let report = orch.orchestrate(spec).await.unwrap();

    assert_eq!(report.status, WorkflowStatus::Failed);
    assert!(report.halt_reason.is_none(), "execution ran to the end");
    assert_eq!(report.task("parse").unwrap().status, TaskStatus::Blocked);
    assert_eq!(report.task("index").unwrap().status, TaskStatus::Blocked);
    assert_eq!(report.task("summary").unwrap().status, TaskStatus::Completed);
    assert_eq!(report.failed_tasks, vec!["fetch"]);
    assert_eq!(report.blocking_failures, vec!["fetch"]);
    assert!(invoker.calls_for("parse").is_empty());
}

#[tokio::test]
async fn test_cancel_stops_in_flight_and_queued_work() {
    let invoker = Arc::new(FakeInvoker::with_default(Behavior::Hang));
    let orch = orchestrator(1, invoker.clone(), fast_config()).await;

    let spec = WorkflowSpec::new("cancel-me")
        .with_task(Task::new("running"))
        .with_task(Task::new("waiting"))
        .with_task(Task::new("later").depends_on("running"));
    let id = orch.submit(spec).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let snapshot = orch.status(id).await.unwrap();
    assert_eq!(snapshot.status, WorkflowStatus::Running);
    assert_eq!(snapshot.tasks[0].status, TaskStatus::Dispatched);
    assert_eq!(snapshot.tasks[1].status, TaskStatus::Queued);

    orch.cancel(id).await.unwrap();
    let report = tokio::time::timeout(Duration::from_secs(5), orch.wait(id))
        .await
        .expect("cancellation should finish promptly")
        .unwrap();

    assert_eq!(report.status, WorkflowStatus::Cancelled);
    assert_eq!(report.halt_reason, Some(HaltReason::Cancelled));
    assert_eq!(report.task("running").unwrap().status, TaskStatus::Cancelled);
    assert_eq!(report.task("waiting").unwrap().status, TaskStatus::Cancelled);
    assert_eq!(report.task("later").unwrap().status, TaskStatus::Pending);
    assert_eq!(report.phases[0].status, PhaseStatus::Cancelled);
    assert_eq!(orch.registry().idle_count().await, 1);

    // Cancelling a finished workflow is a no-op
    orch.cancel(id).await.unwrap();
    assert!(orch.cancel(uuid::Uuid::new_v4()).await.is_err());
}

#[tokio::test]
async fn test_cancel_discards_result_of_uncooperative_invocation() {
    let invoker = Arc::new(
        FakeInvoker::with_default(Behavior::Succeed { delay_ms: 200 }).uncooperative(),
    );
    let orch = orchestrator(1, invoker.clone(), fast_config()).await;

    let spec = WorkflowSpec::new("uncooperative").with_task(Task::new("work"));
    let id = orch.submit(spec).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    orch.cancel(id).await.unwrap();
    let report = orch.wait(id).await.unwrap();

    let task = report.task("work").unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert!(task.output.is_none(), "late result is discarded");
    // The invocation was allowed to run to completion
    assert!(invoker.calls_for("work")[0].finished.is_some());
}

#[tokio::test]
async fn test_workflow_timeout_reports_failure() {
    let invoker = Arc::new(FakeInvoker::with_default(Behavior::Hang));
    let orch = orchestrator(1, invoker.clone(), fast_config()).await;

    let spec = WorkflowSpec::new("deadline")
        .with_task(Task::new("forever"))
        .with_settings(WorkflowSettings {
            max_execution_time_ms: Some(150),
            ..WorkflowSettings::default()
        });

    let report = orch.orchestrate(spec).await.unwrap();
    assert_eq!(report.status, WorkflowStatus::Failed);
    assert_eq!(report.halt_reason, Some(HaltReason::TimedOut));
    assert_eq!(report.task("forever").unwrap().status, TaskStatus::Cancelled);
}

#[tokio::test]
async fn test_missing_capability_fails_with_worker_unavailable() {
    let invoker = Arc::new(FakeInvoker::new());
    let orch = orchestrator(1, invoker.clone(), fast_config()).await;

    let spec = WorkflowSpec::new("gpu").with_task(Task::new("train").with_capability("gpu"));
    let report = orch.orchestrate(spec).await.unwrap();

    let task = report.task("train").unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.as_deref().unwrap().contains("No eligible worker"));
    assert_eq!(invoker.call_count(), 0);
}

#[tokio::test]
async fn test_queue_dispatches_by_priority() {
    let invoker = Arc::new(FakeInvoker::with_default(Behavior::Succeed { delay_ms: 30 }));
    let orch = orchestrator(1, invoker.clone(), fast_config()).await;

    let spec = WorkflowSpec::new("priorities")
        .with_task(Task::new("first"))
        .with_task(Task::new("low").with_priority(Priority::Low))
        .with_task(Task::new("normal"))
        .with_task(Task::new("critical").with_priority(Priority::Critical));

    let report = orch.orchestrate(spec).await.unwrap();
    assert_eq!(report.status, WorkflowStatus::Completed);

    let mut calls = invoker.calls();
    calls.sort_by_key(|c| c.started);
    let order: Vec<&str> = calls.iter().map(|c| c.task_id.as_str()).collect();
    assert_eq!(order, vec!["first", "critical", "normal", "low"]);
}

#[tokio::test]
async fn test_cached_result_skips_invocation() {
    let invoker = Arc::new(FakeInvoker::new());
    let orch = orchestrator(1, invoker.clone(), fast_config()).await;

    let task = || {
        Task::new("summarize")
            .with_kind("summary")
            .with_payload(json!({"doc": "readme"}))
            .cacheable(true)
    };

    let first = orch
        .orchestrate(WorkflowSpec::new("one").with_task(task()))
        .await
        .unwrap();
    let second = orch
        .orchestrate(WorkflowSpec::new("two").with_task(task()))
        .await
        .unwrap();

    assert!(!first.task("summarize").unwrap().cached);
    let cached = second.task("summarize").unwrap();
    assert!(cached.cached);
    assert_eq!(cached.status, TaskStatus::Completed);
    assert_eq!(cached.output, first.task("summarize").unwrap().output);
    assert_eq!(invoker.call_count(), 1);
    assert_eq!(orch.cache().unwrap().stats().hits, 1);
}

#[tokio::test]
async fn test_resource_pressure_defers_until_queue_wait_expires() {
    let invoker = Arc::new(FakeInvoker::new());
    let mut config = fast_config();
    config.admission.max_queue_wait_ms = 150;
    let registry = common::registry(2, &[]).await;

    let admission_config = AdmissionConfig {
        poll_interval_ms: 10,
        max_queue_wait_ms: 150,
        ..AdmissionConfig::default()
    };
    let monitor = ResourceMonitor::new(&admission_config);
    monitor.record(ResourceSample {
        memory_percent: 97.0,
        cpu_percent: 50.0,
    });
    let orch = Orchestrator::with_registry(registry, invoker.clone(), config)
        .with_admission(AdmissionControl::with_monitor(admission_config, monitor));

    let spec = WorkflowSpec::new("pressure")
        .with_task(Task::new("bulk"))
        .with_task(Task::new("urgent").queueable(false))
        .with_settings(WorkflowSettings {
            block_on_failure: false,
            ..WorkflowSettings::default()
        });

    let report = orch.orchestrate(spec).await.unwrap();

    assert_eq!(report.task("urgent").unwrap().status, TaskStatus::Completed);
    let bulk = report.task("bulk").unwrap();
    assert_eq!(bulk.status, TaskStatus::Failed);
    let error = bulk.error.as_deref().unwrap();
    assert!(error.contains("Task bulk failed"), "{}", error);
    assert!(error.contains("Resources exhausted"), "{}", error);
    assert!(invoker.calls_for("bulk").is_empty());
}

struct CountingProbe {
    samples: AtomicUsize,
}

impl ResourceProbe for CountingProbe {
    fn sample(&self) -> Option<ResourceSample> {
        self.samples.fetch_add(1, Ordering::SeqCst);
        Some(ResourceSample {
            memory_percent: 20.0,
            cpu_percent: 20.0,
        })
    }
}

#[tokio::test]
async fn test_default_config_samples_the_host() {
    let config = OrchestratorConfig::default();
    assert!(config.admission.sample_system);

    let orch = Orchestrator::with_config(Arc::new(FakeInvoker::new()), config);
    assert!(orch.admission().monitor().has_probe());
}

#[tokio::test]
async fn test_poll_tick_records_resource_samples() {
    let invoker = Arc::new(FakeInvoker::with_default(Behavior::Succeed { delay_ms: 200 }));
    let probe = Arc::new(CountingProbe {
        samples: AtomicUsize::new(0),
    });
    let admission_config = AdmissionConfig {
        poll_interval_ms: 10,
        ..AdmissionConfig::default()
    };
    let monitor = ResourceMonitor::new(&admission_config).with_probe(probe.clone());
    let orch = Orchestrator::with_registry(common::registry(1, &[]).await, invoker, fast_config())
        .with_admission(AdmissionControl::with_monitor(admission_config, monitor));

    let report = orch
        .orchestrate(WorkflowSpec::new("sampled").with_task(Task::new("work")))
        .await
        .unwrap();

    assert_eq!(report.status, WorkflowStatus::Completed);
    assert!(probe.samples.load(Ordering::SeqCst) >= 5);
    assert!(orch.admission().monitor().average().is_some());
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_default_orchestrator_fills_resource_window() {
    let invoker = Arc::new(FakeInvoker::with_default(Behavior::Succeed { delay_ms: 300 }));
    let mut config = OrchestratorConfig::default();
    // Busy CI hosts must not defer the task
    config.admission.max_memory_percent = f64::INFINITY;
    config.admission.max_cpu_percent = f64::INFINITY;
    let orch = Orchestrator::with_registry(common::registry(1, &[]).await, invoker, config);
    assert!(orch.admission().monitor().average().is_none());

    orch.orchestrate(WorkflowSpec::new("host").with_task(Task::new("work")))
        .await
        .unwrap();

    let sample = orch.admission().monitor().average().unwrap();
    assert!(sample.memory_percent > 0.0 && sample.memory_percent <= 100.0);
}

#[tokio::test]
async fn test_waiting_for_busy_worker_outlasts_queue_wait_limit() {
    let invoker = Arc::new(FakeInvoker::with_default(Behavior::Succeed { delay_ms: 400 }));
    let mut config = fast_config();
    config.admission.max_queue_wait_ms = 200;
    let orch = orchestrator(1, invoker.clone(), config).await;

    let spec = WorkflowSpec::new("single worker")
        .with_task(Task::new("a"))
        .with_task(Task::new("b"));

    let report = orch.orchestrate(spec).await.unwrap();

    assert_eq!(report.status, WorkflowStatus::Completed);
    assert_eq!(report.task("a").unwrap().status, TaskStatus::Completed);
    assert_eq!(report.task("b").unwrap().status, TaskStatus::Completed);
    assert_eq!(invoker.calls_for("b").len(), 1);
}

#[tokio::test]
async fn test_waiting_for_permit_outlasts_queue_wait_limit() {
    let invoker = Arc::new(FakeInvoker::with_default(Behavior::Succeed { delay_ms: 300 }));
    let mut config = fast_config();
    config.max_concurrency = 1;
    config.admission.max_queue_wait_ms = 100;
    let orch = orchestrator(2, invoker.clone(), config).await;

    let spec = WorkflowSpec::new("one permit")
        .with_task(Task::new("first"))
        .with_task(Task::new("second"));

    let report = orch.orchestrate(spec).await.unwrap();

    assert_eq!(report.status, WorkflowStatus::Completed);
    assert_eq!(report.task("second").unwrap().status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_status_snapshots_are_idempotent() {
    let invoker = Arc::new(FakeInvoker::with_default(Behavior::Hang));
    let orch = orchestrator(1, invoker.clone(), fast_config()).await;

    let spec = WorkflowSpec::new("observe")
        .with_task(Task::new("a"))
        .with_task(Task::new("b").depends_on("a"));
    let id = orch.submit(spec).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let first = orch.status(id).await.unwrap();
    let second = orch.status(id).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.total_phases, 2);
    assert_eq!(first.total_tasks, 2);
    assert_eq!(first.phase_index, 0);

    orch.cancel(id).await.unwrap();
    orch.wait(id).await.unwrap();

    let done = orch.status(id).await.unwrap();
    assert_eq!(done, orch.status(id).await.unwrap());
    assert_eq!(done.status, WorkflowStatus::Cancelled);
}

#[tokio::test]
async fn test_event_stream_names() {
    let invoker = Arc::new(FakeInvoker::new());
    let orch = orchestrator(1, invoker.clone(), fast_config()).await;
    let mut events = orch.subscribe_events();

    let spec = WorkflowSpec::new("events").with_task(Task::new("only"));
    orch.orchestrate(spec).await.unwrap();

    let mut names = Vec::new();
    while let Ok(event) = events.try_recv() {
        names.push(event.name());
    }
    assert_eq!(
        names,
        vec![
            "workflow:start",
            "phase:start",
            "task:start",
            "task:complete",
            "phase:complete",
            "workflow:complete"
        ]
    );
}

#[tokio::test]
async fn test_consensus_gate_halts_when_not_reached() {
    let invoker = Arc::new(FakeInvoker::new());
    invoker.vote("worker-1", json!({"vote": "approve"}));
    invoker.vote("worker-2", json!({"vote": "reject", "reason": "too risky"}));
    let orch = orchestrator(2, invoker.clone(), fast_config()).await;

    let gate = ConsensusGate {
        after_phase: 0,
        topic: "ship".to_string(),
        participants: vec!["worker-1".to_string(), "worker-2".to_string()],
        threshold: 0.75,
        timeout_ms: 1000,
    };
    let spec = WorkflowSpec::new("gated")
        .with_task(Task::new("design"))
        .with_task(Task::new("build").depends_on("design"))
        .with_settings(WorkflowSettings {
            gates: vec![gate],
            ..WorkflowSettings::default()
        });

    let report = orch.orchestrate(spec).await.unwrap();

    assert_eq!(report.status, WorkflowStatus::Failed);
    assert_eq!(report.halt_reason, Some(HaltReason::ConsensusNotReached));
    assert_eq!(report.consensus.len(), 1);
    assert!(!report.consensus[0].reached);
    assert_eq!(report.consensus[0].approvals, 1);
    assert_eq!(report.first_failed_phase, Some(0));
    assert_eq!(report.task("build").unwrap().status, TaskStatus::Pending);
}

#[tokio::test]
async fn test_report_serializes_to_json() {
    let invoker = Arc::new(FakeInvoker::new());
    let orch = orchestrator(1, invoker, fast_config()).await;

    let report = orch
        .orchestrate(WorkflowSpec::new("json").with_task(Task::new("t")))
        .await
        .unwrap();
    let value = serde_json::to_value(&report).unwrap();

    assert_eq!(value["status"], json!("completed"));
    assert_eq!(value["tasks"][0]["status"], json!("completed"));
    assert_eq!(value["worker_metrics"][0]["worker_id"], json!("worker-1"));
    assert_eq!(value["phases"][0]["status"], json!("completed"));
}

#[tokio::test]
async fn test_forget_drops_finished_execution() {
    let orch = orchestrator(1, Arc::new(FakeInvoker::new()), fast_config()).await;
    let spec = WorkflowSpec::new("short").with_task(Task::new("only"));
    let id = spec.id;

    orch.orchestrate(spec).await.unwrap();
    assert!(orch.report(id).await.is_some());

    orch.forget(id).await.unwrap();
    assert!(orch.report(id).await.is_none());
    assert!(matches!(
        orch.status(id).await,
        Err(OrchError::Workflow(WorkflowError::NotFound(_)))
    ));
    assert!(orch.forget(id).await.is_err());
}

#[tokio::test]
async fn test_forget_refuses_running_execution() {
    let invoker = Arc::new(FakeInvoker::with_default(Behavior::Hang));
    let orch = orchestrator(1, invoker, fast_config()).await;
    let spec = WorkflowSpec::new("hanging").with_task(Task::new("wait"));

    let id = orch.submit(spec).await.unwrap();
    assert!(matches!(
        orch.forget(id).await,
        Err(OrchError::Workflow(WorkflowError::StillRunning(_)))
    ));

    orch.cancel(id).await.unwrap();
    let report = orch.wait(id).await.unwrap();
    assert_eq!(report.status, WorkflowStatus::Cancelled);
    orch.forget(id).await.unwrap();
}

#[tokio::test]
async fn test_retention_cap_evicts_oldest_finished() {
    let mut config = fast_config();
    config.max_retained_executions = 2;
    let orch = orchestrator(1, Arc::new(FakeInvoker::new()), config).await;

    let mut ids = Vec::new();
    for name in ["first", "second", "third"] {
        let spec = WorkflowSpec::new(name).with_task(Task::new("step"));
        ids.push(spec.id);
        orch.orchestrate(spec).await.unwrap();
    }

    assert!(orch.status(ids[0]).await.is_err());
    assert!(orch.status(ids[1]).await.is_ok());
    assert!(orch.status(ids[2]).await.is_ok());
    let names: Vec<String> = orch.executions().await.into_iter().map(|e| e.name).collect();
    assert_eq!(names, vec!["second", "third"]);
}
