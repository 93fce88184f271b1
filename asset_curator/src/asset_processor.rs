use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use crate::{
    curator::AssetCurator,
    task_pool::{TaskGroup, TaskPool},
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProcessTaskState {
    Stopped,
    Running,
    /// Told to stop, some jobs are still running.
    Stopping,
}

/// Upper bound for how long an idle worker sleeps before it looks for work again.
const IDLE_TIMEOUT: Duration = Duration::from_millis(100);

struct ProcessorStatus {
    state: ProcessTaskState,
    running_workers: usize,
}

struct ProcessorShared {
    curator: Arc<AssetCurator>,
    status: Mutex<ProcessorStatus>,
    stopped: Condvar,
    stop_requested: AtomicBool,
    cancel: AtomicBool,
}

/// Background workers that keep transforming whatever the curator says is ready.
pub struct AssetProcessor {
    shared: Arc<ProcessorShared>,
    pool: TaskPool,
    workers: usize,
    tasks: TaskGroup,
}

impl AssetProcessor {
    pub fn new(curator: Arc<AssetCurator>, pool: TaskPool, workers: usize) -> Self {
        Self {
            shared: Arc::new(ProcessorShared {
                curator,
                status: Mutex::new(ProcessorStatus {
                    state: ProcessTaskState::Stopped,
                    running_workers: 0,
                }),
                stopped: Condvar::new(),
                stop_requested: AtomicBool::new(false),
                cancel: AtomicBool::new(false),
            }),
            pool,
            workers: workers.max(1),
            tasks: TaskGroup::new(),
        }
    }

    pub fn state(&self) -> ProcessTaskState {
        self.shared.lock_status().state
    }

    /// Returns false while a previous stop is still winding down.
    pub fn start_process_task(&self) -> bool {
        let mut status = self.shared.lock_status();
        match status.state {
            ProcessTaskState::Running => return true,
            ProcessTaskState::Stopping => {
                log::warn!("Asset processor is still stopping, can't start it again yet");
                return false;
            }
            ProcessTaskState::Stopped => {}
        }

        self.shared.stop_requested.store(false, Ordering::Release);
        self.shared.cancel.store(false, Ordering::Release);
        status.state = ProcessTaskState::Running;
        status.running_workers = self.workers;
        drop(status);

        log::info!("Starting asset processor with {} workers", self.workers);
        for _ in 0..self.workers {
            let shared = self.shared.clone();
            self.pool.spawn(&self.tasks, move || shared.run_worker());
        }
        true
    }

    /// A graceful stop lets the running jobs finish and returns right away.
    /// A forced stop cancels them, throws away their results and waits until every worker is gone.
    pub fn stop_process_task(&self, force: bool) {
        {
            let mut status = self.shared.lock_status();
            if status.state == ProcessTaskState::Stopped {
                return;
            }
            status.state = ProcessTaskState::Stopping;
            self.shared.stop_requested.store(true, Ordering::Release);
            if force {
                self.shared.cancel.store(true, Ordering::Release);
            }
        }
        log::info!("Stopping asset processor (force: {})", force);
        self.shared.curator.wake_workers();
        if force {
            self.wait_for_stopped();
        }
    }

    pub fn wait_for_stopped(&self) {
        let mut status = self.shared.lock_status();
        while status.state != ProcessTaskState::Stopped {
            status = self
                .shared
                .stopped
                .wait(status)
                .unwrap_or_else(PoisonError::into_inner);
        }
        drop(status);
        self.tasks.wait();
    }
}

impl Drop for AssetProcessor {
    fn drop(&mut self) {
        self.stop_process_task(true);
    }
}

impl ProcessorShared {
    fn lock_status(&self) -> MutexGuard<'_, ProcessorStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run_worker(&self) {
        let _exit = WorkerExit { shared: self };
        while !self.stop_requested.load(Ordering::Acquire) {
            let Some(guid) = self.curator.next_asset_to_process() else {
                self.curator.wait_for_work(IDLE_TIMEOUT);
                continue;
            };
            match self.curator.process_asset(guid, &self.cancel) {
                Ok(state) => log::debug!("Processed {}: {}", guid, state),
                Err(err) => log::warn!("Processing {} failed: {}", guid, err),
            }
        }
    }
}

/// The last worker to leave marks the processor as stopped, also when a job panicked.
struct WorkerExit<'a> {
    shared: &'a ProcessorShared,
}

impl Drop for WorkerExit<'_> {
    fn drop(&mut self) {
        let mut status = self.shared.lock_status();
        status.running_workers -= 1;
        if status.running_workers == 0 {
            status.state = ProcessTaskState::Stopped;
            self.shared.stopped.notify_all();
            log::info!("Asset processor stopped");
        }
    }
}
