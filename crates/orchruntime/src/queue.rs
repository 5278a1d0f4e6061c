use orchcore::{Priority, TaskId};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Why a task was parked in the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueReason {
    NoWorker,
    ConcurrencyLimit,
    ResourcePressure,
    Retry,
}

impl QueueReason {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueReason::NoWorker => "no idle worker",
            QueueReason::ConcurrencyLimit => "concurrency limit reached",
            QueueReason::ResourcePressure => "resources unhealthy",
            QueueReason::Retry => "retry",
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub task_id: TaskId,
    pub priority: Priority,
    pub reason: QueueReason,
    pub enqueued_at: Instant,
}

impl QueuedTask {
    pub fn waited(&self) -> Duration {
        self.enqueued_at.elapsed()
    }

    /// Record the latest deferral reason; the wait clock restarts when it changes
    pub fn with_reason(mut self, reason: QueueReason) -> Self {
        if self.reason != reason {
            self.reason = reason;
            self.enqueued_at = Instant::now();
        }
        self
    }
}

/// Four strict-priority FIFO lanes
///
/// A higher lane is always drained completely before a lower one; there is
/// no starvation countermeasure. Each execution owns its queue.
pub struct TaskQueue {
    lanes: [VecDeque<QueuedTask>; 4],
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            lanes: Default::default(),
        }
    }

    pub fn enqueue(&mut self, task_id: impl Into<TaskId>, priority: Priority, reason: QueueReason) {
        let entry = QueuedTask {
            task_id: task_id.into(),
            priority,
            reason,
            enqueued_at: Instant::now(),
        };
        self.lanes[priority.lane()].push_back(entry);
    }

    /// Put an entry back at the head of its lane, keeping its original wait time
    pub fn requeue_front(&mut self, entry: QueuedTask) {
        self.lanes[entry.priority.lane()].push_front(entry);
    }

    /// Pop the oldest entry of the highest non-empty lane
    pub fn dequeue(&mut self) -> Option<QueuedTask> {
        self.lanes.iter_mut().find_map(|lane| lane.pop_front())
    }

    /// Remove a specific task, wherever it sits
    pub fn remove(&mut self, task_id: &str) -> Option<QueuedTask> {
        for lane in self.lanes.iter_mut() {
            if let Some(pos) = lane.iter().position(|e| e.task_id == task_id) {
                return lane.remove(pos);
            }
        }
        None
    }

    /// Empty every lane, highest priority first
    pub fn drain(&mut self) -> Vec<QueuedTask> {
        self.lanes.iter_mut().flat_map(|lane| lane.drain(..)).collect()
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.lanes
            .iter()
            .any(|lane| lane.iter().any(|e| e.task_id == task_id))
    }

    pub fn len(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn lane_len(&self, priority: Priority) -> usize {
        self.lanes[priority.lane()].len()
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}
