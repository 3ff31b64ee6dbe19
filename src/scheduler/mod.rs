//! Task schedulers.
//!
//! The tile cache never runs production work itself. It hands tasks to a
//! [`Scheduler`], which decides when and where they execute:
//!
//! - [`ImmediateScheduler`]: executes on the calling thread, right away
//! - [`WorkerScheduler`]: a Tokio-backed pool ordered by deadline
//!
//! The cache calls the scheduler only after releasing its own lock, so a
//! scheduler is free to execute tasks synchronously and those tasks may call
//! back into the cache.

mod immediate;
mod worker;

pub use immediate::ImmediateScheduler;
pub use worker::WorkerScheduler;

use std::sync::Arc;

use crate::task::{Deadline, Reason, Task};

/// Accepts tasks for execution.
pub trait Scheduler: Send + Sync {
    /// Whether prefetch tasks of the given kind can be executed without
    /// hurting the work needed for the current frame.
    fn supports_prefetch(&self, gpu_tasks: bool) -> bool;

    /// Submits a task. Tasks that are already done are ignored.
    fn schedule(&self, task: Arc<dyn Task>);

    /// Marks a task pending for `reason` and makes sure it runs again,
    /// before `deadline` when feasible.
    fn reschedule(&self, task: Arc<dyn Task>, reason: Reason, deadline: Deadline);
}
