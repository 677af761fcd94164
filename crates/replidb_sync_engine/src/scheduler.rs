//! Task scheduler abstraction.

use crate::error::SyncResult;

/// A unit of work handed to the scheduler.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs dispatch tasks, typically on a thread pool.
///
/// A scheduler either accepts a task and eventually runs it exactly once, or
/// rejects it with an error. A rejected task is dropped without running.
pub trait TaskScheduler: Send + Sync {
    /// Submits a task.
    fn submit(&self, task: Task) -> SyncResult<()>;
}
