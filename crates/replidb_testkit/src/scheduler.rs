//! Task schedulers for tests.

use parking_lot::Mutex;
use replidb_sync_engine::{SyncError, SyncResult, Task, TaskScheduler};
use std::sync::atomic::{AtomicBool, Ordering};

/// Runs every task immediately on the submitting thread.
#[derive(Debug, Default)]
pub struct InlineScheduler;

impl TaskScheduler for InlineScheduler {
    fn submit(&self, task: Task) -> SyncResult<()> {
        task();
        Ok(())
    }
}

/// Holds tasks until [`run_all`](Self::run_all) or [`run_one`](Self::run_one).
#[derive(Default)]
pub struct ManualScheduler {
    tasks: Mutex<Vec<Task>>,
    reject: AtomicBool,
}

impl ManualScheduler {
    /// Creates an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tasks waiting to run.
    pub fn pending(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Makes every following submission fail with `Busy`.
    pub fn set_reject(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    /// Runs the oldest waiting task. Returns false if there was none.
    pub fn run_one(&self) -> bool {
        let task = {
            let mut tasks = self.tasks.lock();
            if tasks.is_empty() {
                return false;
            }
            tasks.remove(0)
        };
        task();
        true
    }

    /// Runs tasks, including those submitted meanwhile, until none are left.
    pub fn run_all(&self) -> usize {
        let mut ran = 0;
        while self.run_one() {
            ran += 1;
        }
        ran
    }
}

impl TaskScheduler for ManualScheduler {
    fn submit(&self, task: Task) -> SyncResult<()> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(SyncError::busy("scheduler rejecting tasks"));
        }
        self.tasks.lock().push(task);
        Ok(())
    }
}

/// Runs tasks on a tokio runtime's blocking pool.
pub struct TokioScheduler {
    handle: tokio::runtime::Handle,
}

impl TokioScheduler {
    /// Schedules onto the given runtime.
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }
}

impl TaskScheduler for TokioScheduler {
    fn submit(&self, task: Task) -> SyncResult<()> {
        drop(self.handle.spawn_blocking(task));
        Ok(())
    }
}
