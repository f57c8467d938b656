// Priority task queue.
//
// Tasks are ordered by scan profile: interactive scans preempt batch
// scans, then higher scan priority wins, then arrival order. The pool
// loops live in the worker service; this type only orders tasks and keeps
// the runtime counters served by `GET /status`.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;

use super::receiver::WorkerTask;

struct QueuedTask {
    interactive: bool,
    priority: i32,
    seq: u64,
    task: Arc<WorkerTask>,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.interactive
            .cmp(&other.interactive)
            .then(self.priority.cmp(&other.priority))
            // Earlier arrivals first: reversed because BinaryHeap is a max-heap.
            .then(other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Default, Serialize)]
pub struct SchedulerCounters {
    pub queued: AtomicU64,
    pub running: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub cancelled: AtomicU64,
}

#[derive(Default)]
pub struct TaskScheduler {
    queue: Mutex<BinaryHeap<QueuedTask>>,
    notify: Notify,
    seq: AtomicU64,
    pub counters: SchedulerCounters,
}

impl TaskScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, task: Arc<WorkerTask>) {
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        self.queue.lock().push(QueuedTask {
            interactive: task.interactive,
            priority: task.priority,
            seq,
            task,
        });
        self.counters.queued.fetch_add(1, AtomicOrdering::Relaxed);
        self.notify.notify_one();
    }

    /// Wait for and take the highest-priority task.
    pub async fn next(&self) -> Arc<WorkerTask> {
        loop {
            if let Some(queued) = self.queue.lock().pop() {
                self.counters.queued.fetch_sub(1, AtomicOrdering::Relaxed);
                return queued.task;
            }
            self.notify.notified().await;
        }
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }
}
