//! Deferred units of tile production work.
//!
//! A [`Task`] is a piece of work with a deadline and a completion state. Tile
//! producers create one task per tile; tasks that need the content of other
//! tiles are composed into a [`TaskGraph`] whose result node is the tile's own
//! task.
//!
//! # Lifecycle
//!
//! ```text
//!   Pending(reason) ──execute()──▶ Done
//!         ▲                         │
//!         └──── set_state(Pending) ─┘
//! ```
//!
//! [`execute`] drives a pending task through its phases in order:
//! `init → begin → run → end`, then marks it [`TaskState::Done`]. A task sent
//! back to pending while it runs stays pending: its result is already stale.
//!
//! # Deadlines
//!
//! Deadlines are opaque priorities. [`CURRENT_FRAME`] is the most urgent
//! value and [`BACKGROUND_DEADLINE`] the least; ordering tasks by deadline is
//! the scheduler's job, not the cache's.

mod graph;

pub use graph::{NodeId, TaskGraph};

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::trace;

/// Opaque scheduling priority. Lower values are more urgent.
pub type Deadline = u32;

/// Deadline of work needed for the frame being produced right now.
pub const CURRENT_FRAME: Deadline = 0;

/// Deadline of background work such as prefetching and invalidation refreshes.
pub const BACKGROUND_DEADLINE: Deadline = 1 << 31;

/// Global counter for task ids.
static TASK_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

// =============================================================================
// Task Identity and State
// =============================================================================

/// Process-unique task identifier.
///
/// Ids are never reused, so comparing ids is enough to tell whether a slot
/// is still owned by the task that is about to write into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    /// Allocates the next unused id.
    pub fn next() -> Self {
        Self(TASK_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw id value.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Why a task went back to the pending state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reason {
    /// A task this one depends on produced new results.
    DependencyChanged,
    /// The data the task produces changed and must be recomputed.
    DataChanged,
    /// The task's result was dropped and is needed again.
    DataNeeded,
}

/// Completion state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// The task's result is valid.
    Done,
    /// The task must run again before its result can be used.
    Pending(Reason),
}

impl TaskState {
    pub fn is_done(self) -> bool {
        matches!(self, TaskState::Done)
    }

    /// The reason the task is pending, if it is.
    pub fn reason(self) -> Option<Reason> {
        match self {
            TaskState::Done => None,
            TaskState::Pending(reason) => Some(reason),
        }
    }
}

// =============================================================================
// Task Trait
// =============================================================================

/// A unit of deferred work.
///
/// Implementations use interior mutability: tasks are shared between the
/// cache, task graphs and the scheduler through `Arc<dyn Task>`.
pub trait Task: Send + Sync {
    /// Returns the unique id of this task.
    fn id(&self) -> TaskId;

    /// Returns the current deadline.
    fn deadline(&self) -> Deadline;

    /// Replaces the deadline.
    fn set_deadline(&self, deadline: Deadline);

    /// Whether the task must run on the thread that owns the GPU context.
    fn is_gpu_task(&self) -> bool {
        false
    }

    /// Returns the completion state.
    fn state(&self) -> TaskState;

    /// Sets the completion state.
    ///
    /// Implementations may react to transitions, e.g. acquiring the inputs
    /// they need when they become `Pending(DataNeeded)`.
    fn set_state(&self, state: TaskState);

    fn is_done(&self) -> bool {
        self.state().is_done()
    }

    /// Counter that grows every time the task goes back to pending.
    fn generation(&self) -> u64 {
        0
    }

    /// Marks the task done after a run that started at `generation`.
    ///
    /// Returns `false`, leaving the task pending, if it went back to pending
    /// since then. Implementations tracking a generation must check and set
    /// atomically, e.g. with [`TaskStatus::complete`].
    fn complete(&self, generation: u64) -> bool {
        if self.generation() != generation {
            return false;
        }
        self.set_state(TaskState::Done);
        true
    }

    /// Prepares the task for execution. Called before `begin`.
    fn init(&self) {}

    /// Sets up the execution context. Called immediately before `run`.
    fn begin(&self) {}

    /// Performs the work. Returns `true` if the task's result changed.
    fn run(&self) -> bool;

    /// Restores the execution context. Called immediately after `run`.
    fn end(&self) {}
}

/// Runs a pending task through all of its phases and marks it done, unless
/// it was sent back to pending in the meantime.
///
/// Returns the task's `changed` flag, or `false` without running anything if
/// the task was already done.
pub fn execute(task: &dyn Task) -> bool {
    let generation = task.generation();
    if task.is_done() {
        return false;
    }
    task.init();
    task.begin();
    let changed = task.run();
    task.end();
    if !task.complete(generation) {
        trace!(task = %task.id(), "Task went pending while running, keeping it pending");
    }
    changed
}

// =============================================================================
// Task Status
// =============================================================================

/// Thread-safe state and deadline storage shared by task implementations.
#[derive(Debug)]
pub struct TaskStatus {
    inner: Mutex<StatusInner>,
}

#[derive(Debug)]
struct StatusInner {
    state: TaskState,
    deadline: Deadline,
    /// Bumped on every transition to pending
    generation: u64,
}

impl TaskStatus {
    /// Creates a status for a task that has never run.
    pub fn new(deadline: Deadline) -> Self {
        Self {
            inner: Mutex::new(StatusInner {
                state: TaskState::Pending(Reason::DataNeeded),
                deadline,
                generation: 0,
            }),
        }
    }

    pub fn state(&self) -> TaskState {
        self.inner.lock().state
    }

    /// Stores a new state and returns the previous one.
    pub fn replace_state(&self, state: TaskState) -> TaskState {
        let mut inner = self.inner.lock();
        if !state.is_done() {
            inner.generation += 1;
        }
        std::mem::replace(&mut inner.state, state)
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    /// Marks the status done if no transition to pending happened since
    /// `generation` was read.
    pub fn complete(&self, generation: u64) -> bool {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return false;
        }
        inner.state = TaskState::Done;
        true
    }

    pub fn deadline(&self) -> Deadline {
        self.inner.lock().deadline
    }

    pub fn set_deadline(&self, deadline: Deadline) {
        self.inner.lock().deadline = deadline;
    }
}

// =============================================================================
// Tests
// =============================================================================
