//! Bounded FIFO admission. See SPEC_FULL.md §4.9 "Scheduler".
//!
//! Grounded on `agent-runner/src/executor.rs`'s `TaskExecutor` session-
//! tracking maps, generalized from unlimited concurrency to a bounded
//! `VecDeque` queue plus a running set, since the teacher never capped how
//! many sessions it drove at once.

use std::collections::{HashSet, VecDeque};

use tokio::sync::Mutex;

/// Greedy, single-writer admission control: at most `max_concurrent` task
/// ids may be "running" at a time; the rest wait in FIFO order.
pub struct Scheduler {
    max_concurrent: u32,
    queue: Mutex<VecDeque<String>>,
    running: Mutex<HashSet<String>>,
}

impl Scheduler {
    pub fn new(max_concurrent: u32) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            queue: Mutex::new(VecDeque::new()),
            running: Mutex::new(HashSet::new()),
        }
    }

    /// Whether `task_id` is already queued or running.
    pub async fn has_active(&self, task_id: &str) -> bool {
        if self.running.lock().await.contains(task_id) {
            return true;
        }
        self.queue.lock().await.iter().any(|id| id == task_id)
    }

    pub async fn enqueue(&self, task_id: String) {
        self.queue.lock().await.push_back(task_id);
    }

    /// Removes `task_id` from the queue before it ever started executing.
    /// Returns whether it was found there.
    pub async fn remove_queued(&self, task_id: &str) -> bool {
        let mut queue = self.queue.lock().await;
        let before = queue.len();
        queue.retain(|id| id != task_id);
        queue.len() != before
    }

    /// Marks `task_id` running outside the normal queue/drain cycle, for
    /// operations (follow-up prompts) that re-occupy a task's slot without
    /// going back through the queue.
    pub async fn mark_running(&self, task_id: String) {
        self.running.lock().await.insert(task_id);
    }

    /// Pops as many queued ids as there is free capacity for and marks them
    /// running. Call after every enqueue and every completion.
    pub async fn drain_ready(&self) -> Vec<String> {
        let mut queue = self.queue.lock().await;
        let mut running = self.running.lock().await;
        let mut ready = Vec::new();
        while running.len() < self.max_concurrent as usize {
            match queue.pop_front() {
                Some(id) => {
                    running.insert(id.clone());
                    ready.push(id);
                }
                None => break,
            }
        }
        ready
    }

    pub async fn complete(&self, task_id: &str) {
        self.running.lock().await.remove(task_id);
    }
}
