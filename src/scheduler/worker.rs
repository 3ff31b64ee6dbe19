//! Deadline-ordered worker pool on top of Tokio.
//!
//! Tasks wait in a priority queue ordered by deadline, with FIFO order among
//! equal deadlines. Worker loops pop the most urgent task and execute it on
//! the blocking thread pool, since tile production is CPU work.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::Scheduler;
use crate::task::{execute, Deadline, Reason, Task, TaskId, TaskState};

// =============================================================================
// Queue
// =============================================================================

struct QueuedTask {
    deadline: Deadline,
    sequence: u64,
    task: Arc<dyn Task>,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.sequence == other.sequence
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    // BinaryHeap is a max-heap: the earliest deadline, then the earliest
    // submission, must compare greatest.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<QueuedTask>,

    /// Queued tasks with the deadline and sequence of their live heap entry.
    /// Heap entries whose sequence does not match are stale.
    queued: HashMap<TaskId, (Deadline, u64)>,

    next_sequence: u64,
}

struct Shared {
    queue: Mutex<QueueState>,
    work_available: Notify,
    idle: Notify,

    /// Tasks queued or running
    pending: AtomicUsize,

    executed: AtomicU64,
    shutdown: AtomicBool,
}

impl Shared {
    /// Queues `task` at `deadline`. A task already queued at the same or an
    /// earlier deadline is left alone.
    fn enqueue(&self, task: Arc<dyn Task>, deadline: Deadline) -> bool {
        let id = task.id();
        {
            let mut queue = self.queue.lock();
            match queue.queued.get(&id) {
                Some(&(queued_deadline, _)) if queued_deadline <= deadline => return false,
                Some(_) => {}
                None => {
                    self.pending.fetch_add(1, Ordering::AcqRel);
                }
            }
            let sequence = queue.next_sequence;
            queue.next_sequence += 1;
            queue.queued.insert(id, (deadline, sequence));
            queue.heap.push(QueuedTask {
                deadline,
                sequence,
                task,
            });
        }
        self.work_available.notify_one();
        true
    }

    fn pop(&self) -> Option<Arc<dyn Task>> {
        let mut stale = Vec::new();
        let next = {
            let mut queue = self.queue.lock();
            loop {
                let Some(entry) = queue.heap.pop() else {
                    break None;
                };
                let id = entry.task.id();
                if queue.queued.get(&id).map(|&(_, s)| s) == Some(entry.sequence) {
                    queue.queued.remove(&id);
                    break Some(entry.task);
                }
                stale.push(entry.task);
            }
        };
        // Stale entries may hold the last reference to a task whose drop
        // reaches back into the cache.
        drop(stale);
        next
    }

    fn finish(&self) {
        self.executed.fetch_add(1, Ordering::Relaxed);
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }

    fn queued_len(&self) -> usize {
        self.queue.lock().queued.len()
    }
}

// =============================================================================
// Worker Scheduler
// =============================================================================

/// Executes tasks on a fixed number of Tokio worker loops, most urgent
/// deadline first.
///
/// Only CPU tasks are eligible for prefetching; GPU tasks need the thread
/// owning the graphics context and are always executed on demand.
pub struct WorkerScheduler {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerScheduler {
    /// Spawns `workers` worker loops (at least one) on `handle`.
    pub fn new(handle: &Handle, workers: usize) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(QueueState::default()),
            work_available: Notify::new(),
            idle: Notify::new(),
            pending: AtomicUsize::new(0),
            executed: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
        });

        let count = workers.max(1);
        let handles = (0..count)
            .map(|worker| handle.spawn(worker_loop(Arc::clone(&shared), worker)))
            .collect();
        debug!(workers = count, "Worker scheduler started");

        Self {
            shared,
            workers: Mutex::new(handles),
        }
    }

    /// Number of tasks queued or running.
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    /// Number of tasks waiting in the queue.
    pub fn queued(&self) -> usize {
        self.shared.queued_len()
    }

    pub fn executed_count(&self) -> u64 {
        self.shared.executed.load(Ordering::Relaxed)
    }

    /// Resolves once no task is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stops the worker loops. Queued tasks are dropped without running;
    /// tasks already executing finish.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.work_available.notify_waiters();
        let workers = std::mem::take(&mut *self.workers.lock());
        debug!(workers = workers.len(), "Worker scheduler shutting down");
        let (live, dropped) = {
            let mut queue = self.shared.queue.lock();
            let live = queue.queued.len();
            queue.queued.clear();
            (live, std::mem::take(&mut queue.heap))
        };
        if live > 0 {
            debug!(tasks = live, "Dropping queued tasks");
            if self.shared.pending.fetch_sub(live, Ordering::AcqRel) == live {
                self.shared.idle.notify_waiters();
            }
        }
        drop(dropped);
        drop(workers);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }
}

impl Drop for WorkerScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for WorkerScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerScheduler")
            .field("pending", &self.pending())
            .field("executed", &self.executed_count())
            .finish_non_exhaustive()
    }
}

impl Scheduler for WorkerScheduler {
    fn supports_prefetch(&self, gpu_tasks: bool) -> bool {
        !gpu_tasks
    }

    fn schedule(&self, task: Arc<dyn Task>) {
        if task.is_done() || self.is_shutdown() {
            return;
        }
        let deadline = task.deadline();
        if self.shared.enqueue(task, deadline) {
            trace!(deadline, "Task queued");
        }
    }

    fn reschedule(&self, task: Arc<dyn Task>, reason: Reason, deadline: Deadline) {
        task.set_state(TaskState::Pending(reason));
        if deadline < task.deadline() {
            task.set_deadline(deadline);
        }
        self.schedule(task);
    }
}

async fn worker_loop(shared: Arc<Shared>, worker: usize) {
    loop {
        let notified = shared.work_available.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }

        let Some(task) = shared.pop() else {
            notified.await;
            continue;
        };

        // Leave the wakeup for another idle worker.
        drop(notified);
        if shared.queued_len() > 0 {
            shared.work_available.notify_one();
        }

        let id = task.id();
        let result = tokio::task::spawn_blocking(move || execute(task.as_ref())).await;
        match result {
            Ok(changed) => trace!(worker, task = %id, changed, "Task executed"),
            Err(e) => warn!(worker, task = %id, error = %e, "Task execution failed"),
        }
        shared.finish();
    }
    trace!(worker, "Worker stopped");
}

// =============================================================================
// Tests
// =============================================================================
