mod common;

use common::{fast_config, orchestrator, Behavior, FakeInvoker};
use orchcore::{OrchError, Task, WorkflowError, WorkflowSpec, WorkflowStatus};
use orchruntime::{MultiWorkflowCoordinator, Stage, StageStatus};
use std::sync::Arc;
use std::time::Duration;

fn single(name: &str, task: &str) -> WorkflowSpec {
    WorkflowSpec::new(name).with_task(Task::new(task))
}

#[tokio::test]
async fn test_failed_parallel_stage_skips_the_rest() {
    let invoker = Arc::new(FakeInvoker::new());
    invoker.set("b-task", Behavior::Fail);
    let orch = orchestrator(4, invoker.clone(), fast_config()).await;

    let mut coord = MultiWorkflowCoordinator::new(orch);
    let a = coord.add_workflow(single("a", "a-task"));
    let b = coord.add_workflow(single("b", "b-task"));
    let c = coord.add_workflow(single("c", "c-task"));

    let report = coord
        .run(&[Stage::parallel(vec![a, b]), Stage::sequential(vec![c])])
        .await
        .unwrap();

    assert_eq!(report.status, WorkflowStatus::Failed);
    let first = report.stage(0).unwrap();
    assert_eq!(first.status, StageStatus::Failed);
    assert_eq!(first.workflows.len(), 2, "both members ran to the end");
    assert!(first.workflows.iter().any(|r| r.name == "a" && r.is_success()));
    assert!(first.workflows.iter().any(|r| r.name == "b" && !r.is_success()));

    let second = report.stage(1).unwrap();
    assert_eq!(second.status, StageStatus::Skipped);
    assert!(second.workflows.is_empty());
    assert!(invoker.calls_for("c-task").is_empty(), "skipped stage never runs");
}

#[tokio::test]
async fn test_sequential_stages_run_in_order() {
    let invoker = Arc::new(FakeInvoker::new());
    let orch = orchestrator(2, invoker.clone(), fast_config()).await;

    let mut coord = MultiWorkflowCoordinator::new(orch);
    let first = coord.add_workflow(single("first", "one"));
    let second = coord.add_workflow(single("second", "two"));
    let third = coord.add_workflow(single("third", "three"));

    let report = coord
        .run(&[
            Stage::sequential(vec![first, second]),
            Stage::parallel(vec![third]),
        ])
        .await
        .unwrap();

    assert_eq!(report.status, WorkflowStatus::Completed);
    assert!(report
        .stages
        .iter()
        .all(|s| s.status == StageStatus::Completed));

    let one = &invoker.calls_for("one")[0];
    let two = &invoker.calls_for("two")[0];
    let three = &invoker.calls_for("three")[0];
    assert!(two.started >= one.finished.unwrap());
    assert!(three.started >= two.finished.unwrap());
}

#[tokio::test]
async fn test_sequential_stage_stops_at_first_failure() {
    let invoker = Arc::new(FakeInvoker::new());
    invoker.set("broken", Behavior::Fail);
    let orch = orchestrator(2, invoker.clone(), fast_config()).await;

    let mut coord = MultiWorkflowCoordinator::new(orch);
    let bad = coord.add_workflow(single("bad", "broken"));
    let good = coord.add_workflow(single("good", "fine"));

    let report = coord.run(&[Stage::sequential(vec![bad, good])]).await.unwrap();

    assert_eq!(report.stages[0].status, StageStatus::Failed);
    assert_eq!(report.stages[0].workflows.len(), 1);
    assert!(invoker.calls_for("fine").is_empty());
}

#[tokio::test]
async fn test_partial_success_keeps_going() {
    let invoker = Arc::new(FakeInvoker::new());
    invoker.set("broken", Behavior::Fail);
    let orch = orchestrator(2, invoker.clone(), fast_config()).await;

    let mut coord = MultiWorkflowCoordinator::new(orch).allow_partial_success(true);
    let bad = coord.add_workflow(single("bad", "broken"));
    let good = coord.add_workflow(single("good", "fine"));
    let after = coord.add_workflow(single("after", "later"));

    let report = coord
        .run(&[
            Stage::sequential(vec![bad, good]),
            Stage::sequential(vec![after]),
        ])
        .await
        .unwrap();

    assert_eq!(report.stages[0].status, StageStatus::Completed);
    assert_eq!(report.stages[0].workflows.len(), 2);
    assert_eq!(report.stages[1].status, StageStatus::Completed);
    assert_eq!(invoker.calls_for("later").len(), 1);
}

#[tokio::test]
async fn test_unknown_or_cyclic_workflow_rejected_before_start() {
    let invoker = Arc::new(FakeInvoker::new());
    let orch = orchestrator(1, invoker.clone(), fast_config()).await;

    let mut coord = MultiWorkflowCoordinator::new(orch);
    let ok = coord.add_workflow(single("ok", "fine"));
    let cyclic = coord.add_workflow(
        WorkflowSpec::new("loop")
            .with_task(Task::new("x").depends_on("y"))
            .with_task(Task::new("y").depends_on("x")),
    );

    let err = coord
        .run(&[Stage::sequential(vec![ok]), Stage::sequential(vec![cyclic])])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OrchError::Workflow(WorkflowError::CycleDetected(_))
    ));

    let missing = uuid::Uuid::new_v4();
    let err = coord.run(&[Stage::sequential(vec![missing])]).await.unwrap_err();
    assert!(matches!(err, OrchError::Workflow(WorkflowError::NotFound(_))));
    assert_eq!(invoker.call_count(), 0, "nothing runs when validation fails");
}

#[tokio::test]
async fn test_stage_timeout_bounds_members() {
    let invoker = Arc::new(FakeInvoker::with_default(Behavior::Hang));
    let orch = orchestrator(1, invoker, fast_config()).await;

    let mut coord = MultiWorkflowCoordinator::new(orch);
    let slow = coord.add_workflow(single("slow", "forever"));

    let report = tokio::time::timeout(
        Duration::from_secs(5),
        coord.run(&[Stage::sequential(vec![slow]).with_timeout_ms(100)]),
    )
    .await
    .expect("stage timeout should end the run")
    .unwrap();

    assert_eq!(report.stages[0].status, StageStatus::Failed);
    assert_eq!(report.stages[0].workflows[0].status, WorkflowStatus::Failed);
}

#[tokio::test]
async fn test_progress_reflects_finished_workflows() {
    let invoker = Arc::new(FakeInvoker::with_default(Behavior::Succeed { delay_ms: 50 }));
    let orch = orchestrator(2, invoker, fast_config()).await;

    let mut coord =
        MultiWorkflowCoordinator::new(orch).with_poll_interval(Duration::from_millis(10));
    let a = coord.add_workflow(single("a", "a-task"));
    let b = coord.add_workflow(
        WorkflowSpec::new("b")
            .with_task(Task::new("b1"))
            .with_task(Task::new("b2").depends_on("b1")),
    );
    let progress = coord.progress();

    coord
        .run(&[Stage::sequential(vec![a]), Stage::sequential(vec![b])])
        .await
        .unwrap();

    let last = progress.borrow().clone();
    assert_eq!(last.workflows.len(), 2);
    assert!(last
        .workflows
        .iter()
        .all(|w| w.status == Some(WorkflowStatus::Completed)));
    assert_eq!(last.workflows[1].total_phases, 2);
    assert!((last.overall_percent - 100.0).abs() < 1e-9);
}
