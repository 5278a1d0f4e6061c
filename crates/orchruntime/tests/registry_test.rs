mod common;

use orchcore::{ReleaseMetrics, WorkerStatus};
use orchruntime::{TeamRules, WorkerDefinition, WorkerManifest, WorkerRegistry};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

fn caps(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[test]
fn test_team_assignment_longest_keyword_wins() {
    let rules = TeamRules::new("general")
        .with_team("security", ["security"])
        .with_team("platform", ["sec", "infra"]);

    assert_eq!(rules.assign(&caps(&["Security-Audit"])), "security");
    assert_eq!(rules.assign(&caps(&["infrastructure"])), "platform");
    assert_eq!(rules.assign(&caps(&["writing"])), "general");
    assert_eq!(rules.assign(&BTreeSet::new()), "general");
}

#[tokio::test]
async fn test_discover_assigns_teams_and_skips_known_workers() {
    let mut manifest = WorkerManifest::default()
        .with_worker(WorkerDefinition::new("security-auditor").with_capability("security-review"))
        .with_worker(WorkerDefinition::new("tech-writer").with_capability("docs"));
    manifest
        .teams
        .insert("security".to_string(), vec!["security".to_string()]);

    let registry = WorkerRegistry::new();
    assert_eq!(registry.discover(&manifest).await, 2);
    assert_eq!(registry.discover(&manifest).await, 0, "known workers are skipped");

    let auditor = registry.get("security-auditor").await.unwrap();
    assert_eq!(auditor.team, "security");
    assert_eq!(auditor.name, "Security Auditor");
    assert_eq!(auditor.status, WorkerStatus::Idle);

    let writer = registry.get("tech-writer").await.unwrap();
    assert_eq!(writer.team, "general");
}

#[tokio::test]
async fn test_acquire_honours_preference_and_capabilities() {
    let manifest = WorkerManifest::default()
        .with_worker(WorkerDefinition::new("rust-dev").with_capability("rust"))
        .with_worker(WorkerDefinition::new("py-dev").with_capability("python"));
    let registry = WorkerRegistry::new();
    registry.discover(&manifest).await;

    let picked = registry.acquire(Some("py-dev"), &BTreeSet::new()).await;
    assert_eq!(picked.as_deref(), Some("py-dev"));

    // Preferred worker is busy, fall back to a capable idle one
    let picked = registry.acquire(Some("py-dev"), &caps(&["rust"])).await;
    assert_eq!(picked.as_deref(), Some("rust-dev"));

    assert_eq!(registry.acquire(None, &caps(&["rust"])).await, None);
    assert_eq!(registry.acquire(None, &caps(&["go"])).await, None);
    assert!(!registry.has_capable_worker(&caps(&["go"])).await);
    assert!(registry.has_capable_worker(&caps(&["rust"])).await);
}

#[tokio::test]
async fn test_acquire_prefers_better_performer_and_breaks_ties_by_registration() {
    let registry = common::registry(3, &[]).await;

    // Fresh workers score equally: the earliest registered wins
    let first = registry.acquire(None, &BTreeSet::new()).await.unwrap();
    assert_eq!(first, "worker-1");
    registry
        .release(&first, ReleaseMetrics { duration_ms: 500, success: false })
        .await
        .unwrap();

    // worker-1 now has a worse success rate and a recent release
    let next = registry.acquire(None, &BTreeSet::new()).await.unwrap();
    assert_eq!(next, "worker-2");
}

#[tokio::test]
async fn test_concurrent_acquire_never_hands_out_a_worker_twice() {
    let registry = common::registry(10, &[]).await;

    let mut handles = Vec::new();
    for _ in 0..50 {
        let registry = registry.clone();
        handles.push(tokio::spawn(async move {
            registry.acquire(None, &BTreeSet::new()).await
        }));
    }

    let mut acquired = Vec::new();
    for handle in handles {
        if let Some(id) = handle.await.unwrap() {
            acquired.push(id);
        }
    }

    let unique: HashSet<_> = acquired.iter().collect();
    assert_eq!(acquired.len(), 10, "exactly one acquisition per worker");
    assert_eq!(unique.len(), 10, "no worker handed out twice");
    assert_eq!(registry.idle_count().await, 0);
}

#[tokio::test]
async fn test_release_updates_running_mean_and_success_ema() {
    let registry = common::registry(1, &[]).await;

    for (duration_ms, success) in [(100, true), (300, false)] {
        let id = registry.acquire(None, &BTreeSet::new()).await.unwrap();
        registry
            .release(&id, ReleaseMetrics { duration_ms, success })
            .await
            .unwrap();
    }

    let worker = registry.get("worker-1").await.unwrap();
    assert_eq!(worker.status, WorkerStatus::Idle);
    assert_eq!(worker.workload, 2);
    assert_eq!(worker.performance.completed_invocations, 2);
    assert!((worker.performance.avg_response_time_ms - 200.0).abs() < 1e-9);
    // 1.0 -> success keeps 1.0 -> failure gives 0.7
    assert!((worker.performance.success_rate - 0.7).abs() < 1e-9);

    // Releasing an idle worker is ignored
    registry
        .release("worker-1", ReleaseMetrics { duration_ms: 1, success: true })
        .await
        .unwrap();
    let worker = registry.get("worker-1").await.unwrap();
    assert_eq!(worker.performance.completed_invocations, 2);
}

#[tokio::test]
async fn test_try_acquire_targets_one_worker() {
    let registry = common::registry(2, &[]).await;

    assert!(registry.try_acquire("worker-2").await);
    assert!(!registry.try_acquire("worker-2").await, "already busy");
    assert!(!registry.try_acquire("worker-9").await, "unknown worker");
    assert_eq!(registry.get("worker-1").await.unwrap().status, WorkerStatus::Idle);
}

#[tokio::test]
async fn test_release_wakes_waiters() {
    let registry = common::registry(1, &[]).await;
    let id = registry.acquire(None, &BTreeSet::new()).await.unwrap();

    let waiter = {
        let registry: Arc<WorkerRegistry> = registry.clone();
        tokio::spawn(async move { registry.wait_for_release().await })
    };
    tokio::task::yield_now().await;
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    registry
        .release(&id, ReleaseMetrics { duration_ms: 5, success: true })
        .await
        .unwrap();
    tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
        .await
        .expect("waiter should wake on release")
        .unwrap();
}

#[tokio::test]
async fn test_reload_and_remove() {
    let registry = common::registry(2, &["rust"]).await;
    let id = registry.acquire(None, &BTreeSet::new()).await.unwrap();

    assert!(registry.remove(&id).await.is_err(), "busy workers cannot be removed");

    registry
        .release(&id, ReleaseMetrics { duration_ms: 40, success: true })
        .await
        .unwrap();

    let updated = WorkerManifest::default()
        .with_worker(WorkerDefinition::new("worker-1").with_capability("go"))
        .with_worker(WorkerDefinition::new("worker-3"));
    assert_eq!(registry.reload(&updated).await, 2);
    assert_eq!(registry.len().await, 3);

    let worker = registry.get("worker-1").await.unwrap();
    assert_eq!(worker.capabilities, caps(&["go"]));
    assert_eq!(worker.performance.completed_invocations, 1, "stats survive reload");

    let removed = registry.remove("worker-2").await.unwrap();
    assert_eq!(removed.id, "worker-2");
    assert!(registry.get("worker-2").await.is_none());
}
