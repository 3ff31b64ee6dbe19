use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::trace;

use super::Scheduler;
use crate::task::{execute, Deadline, Reason, Task, TaskState};

/// Runs every task on the calling thread as soon as it is submitted.
#[derive(Debug, Default)]
pub struct ImmediateScheduler {
    executed: AtomicU64,
}

impl ImmediateScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tasks this scheduler actually ran.
    pub fn executed_count(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }

    fn run(&self, task: &dyn Task) {
        if task.is_done() {
            return;
        }
        trace!(task = %task.id(), "Executing task");
        execute(task);
        self.executed.fetch_add(1, Ordering::Relaxed);
    }
}

impl Scheduler for ImmediateScheduler {
    /// Running prefetch work inline would stall the caller.
    fn supports_prefetch(&self, _gpu_tasks: bool) -> bool {
        false
    }

    fn schedule(&self, task: Arc<dyn Task>) {
        self.run(task.as_ref());
    }

    fn reschedule(&self, task: Arc<dyn Task>, reason: Reason, deadline: Deadline) {
        task.set_state(TaskState::Pending(reason));
        if deadline < task.deadline() {
            task.set_deadline(deadline);
        }
        self.run(task.as_ref());
    }
}
