use crate::registry::WorkerRegistry;
use futures::future::join_all;
use orchcore::{
    ConsensusGate, ConsensusOutcome, EventBus, InvocationContext, OrchError, ReleaseMetrics, Task,
    Vote, VoteRecord, WorkerId, WorkerInvoker, WorkflowId,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Task kind sent to participants when their vote is requested
pub const VOTE_TASK_KIND: &str = "consensus.vote";

const ACQUIRE_RETRY: Duration = Duration::from_millis(50);

/// Collects approve/reject votes from a set of workers
///
/// Votes are ordinary invocations of kind [`VOTE_TASK_KIND`]; the worker
/// answers with `{"vote": "approve" | "reject" | "abstain", "reason": ...}`.
/// Participants that do not answer in time, fail, or answer with anything
/// else abstain.
pub struct ConsensusCoordinator {
    registry: Arc<WorkerRegistry>,
    invoker: Arc<dyn WorkerInvoker>,
    events: Arc<EventBus>,
}

impl ConsensusCoordinator {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        invoker: Arc<dyn WorkerInvoker>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            registry,
            invoker,
            events,
        }
    }

    /// Poll `participants` on `topic` and decide against `threshold`
    pub async fn build_consensus(
        &self,
        topic: &str,
        participants: &[WorkerId],
        threshold: f64,
        timeout: Duration,
    ) -> ConsensusOutcome {
        self.collect(
            WorkflowId::nil(),
            topic,
            participants,
            threshold,
            timeout,
            &CancellationToken::new(),
        )
        .await
    }

    /// Like [`ConsensusCoordinator::build_consensus`], failing when not reached
    pub async fn require_consensus(
        &self,
        topic: &str,
        participants: &[WorkerId],
        threshold: f64,
        timeout: Duration,
    ) -> Result<ConsensusOutcome, OrchError> {
        let outcome = self
            .build_consensus(topic, participants, threshold, timeout)
            .await;
        if outcome.reached {
            Ok(outcome)
        } else {
            Err(not_reached(&outcome))
        }
    }

    /// Evaluate a workflow gate on behalf of a running execution
    pub async fn evaluate_gate(
        &self,
        workflow_id: WorkflowId,
        gate: &ConsensusGate,
        cancel: &CancellationToken,
    ) -> ConsensusOutcome {
        self.collect(
            workflow_id,
            &gate.topic,
            &gate.participants,
            gate.threshold,
            Duration::from_millis(gate.timeout_ms),
            cancel,
        )
        .await
    }

    async fn collect(
        &self,
        workflow_id: WorkflowId,
        topic: &str,
        participants: &[WorkerId],
        threshold: f64,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> ConsensusOutcome {
        let mut unique: Vec<WorkerId> = Vec::with_capacity(participants.len());
        for id in participants {
            if !unique.contains(id) {
                unique.push(id.clone());
            }
        }

        tracing::info!(
            "Requesting consensus on '{}' from {} participants",
            topic,
            unique.len()
        );

        let deadline = Instant::now() + timeout;
        let handles: Vec<_> = unique
            .iter()
            .map(|worker_id| {
                let ballot = Ballot {
                    registry: self.registry.clone(),
                    invoker: self.invoker.clone(),
                    events: self.events.clone(),
                    workflow_id,
                    topic: topic.to_string(),
                    worker_id: worker_id.clone(),
                    deadline,
                    cancel: cancel.child_token(),
                };
                tokio::spawn(ballot.cast())
            })
            .collect();

        let mut votes: HashMap<WorkerId, VoteRecord> = HashMap::new();
        for (worker_id, joined) in unique.iter().zip(join_all(handles).await) {
            let record = joined.unwrap_or_else(|e| abstain(worker_id, &format!("vote task failed: {}", e)));
            votes.insert(worker_id.clone(), record);
        }

        let details: Vec<VoteRecord> = unique
            .iter()
            .filter_map(|id| votes.remove(id))
            .collect();
        let count = |vote: Vote| details.iter().filter(|r| r.vote == vote).count();
        let approvals = count(Vote::Approve);
        let rejections = count(Vote::Reject);
        let abstentions = count(Vote::Abstain);
        let total = details.len();
        let reached = total > 0 && approvals as f64 / total as f64 >= threshold;

        tracing::info!(
            "Consensus on '{}': {}/{} approvals, {} rejections, {} abstentions (threshold {:.2}, reached: {})",
            topic,
            approvals,
            total,
            rejections,
            abstentions,
            threshold,
            reached
        );

        ConsensusOutcome {
            topic: topic.to_string(),
            reached,
            threshold,
            approvals,
            rejections,
            abstentions,
            details,
        }
    }
}

/// Error for an outcome that fell short of its threshold
pub fn not_reached(outcome: &ConsensusOutcome) -> OrchError {
    OrchError::ConsensusNotReached {
        topic: outcome.topic.clone(),
        approvals: outcome.approvals,
        total: outcome.total(),
        threshold: outcome.threshold,
    }
}

fn abstain(worker_id: &str, reason: &str) -> VoteRecord {
    VoteRecord {
        worker_id: worker_id.to_string(),
        vote: Vote::Abstain,
        reason: Some(reason.to_string()),
    }
}

/// Interpret a vote response; anything unrecognised abstains
fn parse_vote(output: &serde_json::Value) -> (Vote, Option<String>) {
    let reason = output
        .get("reason")
        .and_then(|v| v.as_str())
        .map(String::from);
    let raw = output
        .get("vote")
        .and_then(|v| v.as_str())
        .or_else(|| output.as_str())
        .map(str::to_ascii_lowercase);

    let vote = match raw.as_deref() {
        Some("approve") => Vote::Approve,
        Some("reject") => Vote::Reject,
        _ => Vote::Abstain,
    };
    (vote, reason)
}

/// One participant's vote request
struct Ballot {
    registry: Arc<WorkerRegistry>,
    invoker: Arc<dyn WorkerInvoker>,
    events: Arc<EventBus>,
    workflow_id: WorkflowId,
    topic: String,
    worker_id: WorkerId,
    deadline: Instant,
    cancel: CancellationToken,
}

impl Ballot {
    async fn cast(self) -> VoteRecord {
        if !self.reserve().await {
            return abstain(&self.worker_id, "no response before deadline");
        }

        let Some(worker) = self.registry.get(&self.worker_id).await else {
            return abstain(&self.worker_id, "unknown worker");
        };

        let task = Task::new(format!("{}:{}", self.topic, self.worker_id))
            .with_kind(VOTE_TASK_KIND)
            .with_payload(serde_json::json!({
                "topic": self.topic,
                "workflow_id": self.workflow_id,
            }));

        let ctx = InvocationContext {
            workflow_id: self.workflow_id,
            worker,
            events: self.events.create_emitter(self.workflow_id, task.id.clone()),
            task,
            inputs: HashMap::new(),
            attempt: 1,
            timeout: self.deadline.saturating_duration_since(Instant::now()),
            cancellation: self.cancel.clone(),
        };

        let start = Instant::now();
        let response = tokio::select! {
            res = tokio::time::timeout_at(self.deadline, self.invoker.invoke(ctx)) => res.ok(),
            _ = self.cancel.cancelled() => None,
        };
        if response.is_none() {
            self.cancel.cancel();
        }

        let success = matches!(response, Some(Ok(_)));
        let metrics = ReleaseMetrics {
            duration_ms: start.elapsed().as_millis() as u64,
            success,
        };
        if let Err(e) = self.registry.release(&self.worker_id, metrics).await {
            tracing::warn!("Failed to release voter {}: {}", self.worker_id, e);
        }

        match response {
            Some(Ok(output)) => {
                let (vote, reason) = parse_vote(&output.output);
                VoteRecord {
                    worker_id: self.worker_id.clone(),
                    vote,
                    reason,
                }
            }
            Some(Err(e)) => abstain(&self.worker_id, &e.to_string()),
            None => abstain(&self.worker_id, "no response before deadline"),
        }
    }

    /// Wait until the participant itself is idle and reserve it
    async fn reserve(&self) -> bool {
        let wait = async {
            loop {
                if self.registry.try_acquire(&self.worker_id).await {
                    return true;
                }
                if self.registry.get(&self.worker_id).await.is_none() {
                    return false;
                }
                tokio::select! {
                    _ = self.registry.wait_for_release() => {}
                    _ = tokio::time::sleep(ACQUIRE_RETRY) => {}
                    _ = self.cancel.cancelled() => return false,
                }
            }
        };
        tokio::time::timeout_at(self.deadline, wait)
            .await
            .unwrap_or(false)
    }
}
