//! Process-wide shutdown registry
//!
//! Components register teardown closures as they acquire resources. On
//! [`Shutdown::trigger`] the cancellation token fires first, then the closures
//! run once in reverse registration order.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Identifier returned by [`Shutdown::add_task`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

pub struct Shutdown {
    token: CancellationToken,
    tasks: Mutex<Vec<(TaskId, Task)>>,
    next_id: AtomicU64,
    triggered: AtomicBool,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            triggered: AtomicBool::new(false),
        }
    }

    /// Register a teardown task. Runs immediately if shutdown already happened.
    pub fn add_task<F>(&self, task: F) -> TaskId
    where
        F: FnOnce() + Send + 'static,
    {
        let id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed));
        {
            let mut tasks = self.tasks.lock();
            if !self.triggered.load(Ordering::SeqCst) {
                tasks.push((id, Box::new(task)));
                return id;
            }
        }
        task();
        id
    }

    /// Drop a task that is no longer needed (its resource was already released)
    pub fn remove_task(&self, id: TaskId) -> bool {
        let mut tasks = self.tasks.lock();
        let before = tasks.len();
        tasks.retain(|(task_id, _)| *task_id != id);
        tasks.len() != before
    }

    /// Cancel the token and run all tasks, newest first. Idempotent.
    pub fn trigger(&self) {
        if self.triggered.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Shutdown triggered");
        self.token.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for (_, task) in tasks.into_iter().rev() {
            task();
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Root token; every session token is a child of it
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn pending_tasks(&self) -> usize {
        self.tasks.lock().len()
    }
}
