use std::sync::{Arc, Condvar, Mutex, PoisonError};

use tokio::runtime::Handle;

/// Runs blocking work on the tokio blocking pool.
#[derive(Clone)]
pub struct TaskPool {
    handle: Handle,
}

impl TaskPool {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Panics when called outside of a tokio runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    /// Fire and forget. The task is counted in `group` until it returns, or panics.
    pub fn spawn(&self, group: &TaskGroup, task: impl FnOnce() + Send + 'static) {
        let guard = group.enter();
        self.handle.spawn_blocking(move || {
            let _guard = guard;
            task();
        });
    }
}

/// Counts running tasks, so that they can be joined.
#[derive(Clone, Default)]
pub struct TaskGroup {
    inner: Arc<(Mutex<usize>, Condvar)>,
}

impl TaskGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_finished(&self) -> bool {
        self.running() == 0
    }

    pub fn running(&self) -> usize {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until every task of the group has returned.
    pub fn wait(&self) {
        let (count, finished) = &*self.inner;
        let mut count = count.lock().unwrap_or_else(PoisonError::into_inner);
        while *count > 0 {
            count = finished
                .wait(count)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn enter(&self) -> TaskGuard {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        TaskGuard {
            group: self.clone(),
        }
    }
}

struct TaskGuard {
    group: TaskGroup,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        let (count, finished) = &*self.group.inner;
        let mut count = count.lock().unwrap_or_else(PoisonError::into_inner);
        *count -= 1;
        if *count == 0 {
            finished.notify_all();
        }
    }
}
