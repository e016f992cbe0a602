use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{error, trace};

use crate::config::ExecutorConfig;
use crate::error::{ExecutorError, Result};
use crate::instruction::OpFuncType;

/// Why the driving thread woke up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitEvent {
    /// Every task of the pass has finished.
    TaskCompletion,
    /// A worker caught an error; other tasks may still be in flight.
    ExceptionCaught,
}

#[derive(Debug, Default)]
struct BlockerState {
    idle: bool,
    exception: bool,
}

/// The single point where the driving thread blocks during a pass.
#[derive(Debug, Default)]
pub struct MainThreadBlocker {
    state: Mutex<BlockerState>,
    cond: Condvar,
}

impl MainThreadBlocker {
    fn lock(&self) -> Result<MutexGuard<'_, BlockerState>> {
        self.state
            .lock()
            .map_err(|_| ExecutorError::InvariantViolation("blocker lock is poisoned".into()))
    }

    fn update(&self, f: impl FnOnce(&mut BlockerState)) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut state);
        self.cond.notify_all();
    }

    pub fn reset(&self) {
        self.update(|s| *s = BlockerState::default());
    }

    pub fn notify_idle(&self) {
        self.update(|s| s.idle = true);
    }

    pub fn notify_exception(&self) {
        self.update(|s| s.exception = true);
    }

    /// Block until the pass is idle or a worker reported an error.
    pub fn wait_event(&self) -> Result<WaitEvent> {
        let state = self
            .cond
            .wait_while(self.lock()?, |s| !s.idle && !s.exception)
            .map_err(|_| ExecutorError::InvariantViolation("blocker lock is poisoned".into()))?;
        Ok(if state.exception {
            WaitEvent::ExceptionCaught
        } else {
            WaitEvent::TaskCompletion
        })
    }

    /// Block until no task of the pass is queued or running.
    pub fn wait_idle(&self) -> Result<()> {
        let _state = self
            .cond
            .wait_while(self.lock()?, |s| !s.idle)
            .map_err(|_| ExecutorError::InvariantViolation("blocker lock is poisoned".into()))?;
        Ok(())
    }
}

/// Decrements the outstanding-task count when a task ends, even by panic.
struct TaskGuard {
    outstanding: Arc<AtomicUsize>,
    blocker: Arc<MainThreadBlocker>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.blocker.notify_idle();
        }
    }
}

/// Host and device worker pools plus the per-pass atomic counters.
///
/// The driver holds one extra count while it seeds a pass, so the pass
/// cannot be reported idle before every root task is queued.
pub struct AsyncWorkQueue {
    host: ThreadPool,
    device: ThreadPool,
    outstanding: Arc<AtomicUsize>,
    blocker: Arc<MainThreadBlocker>,
    atomic_deps: Vec<AtomicUsize>,
    atomic_var_ref: Vec<AtomicUsize>,
}

impl std::fmt::Debug for AsyncWorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncWorkQueue")
            .field("host_threads", &self.host.current_num_threads())
            .field("device_threads", &self.device.current_num_threads())
            .field("outstanding", &self.outstanding.load(Ordering::Relaxed))
            .finish()
    }
}

fn build_pool(prefix: &'static str, threads: usize) -> Result<ThreadPool> {
    Ok(ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(move |i| format!("{prefix}-{i}"))
        .panic_handler(|_| error!("worker task panicked outside of a kernel"))
        .build()?)
}

impl AsyncWorkQueue {
    pub fn new(config: &ExecutorConfig, num_instructions: usize, num_vars: usize) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            host: build_pool("ir-host", config.host_num_threads)?,
            device: build_pool("ir-device", config.device_num_threads)?,
            outstanding: Arc::new(AtomicUsize::new(0)),
            blocker: Arc::new(MainThreadBlocker::default()),
            atomic_deps: (0..num_instructions).map(|_| AtomicUsize::new(0)).collect(),
            atomic_var_ref: (0..num_vars).map(|_| AtomicUsize::new(0)).collect(),
        })
    }

    pub fn prepare_atomic_deps(&self, dependency_count: &[usize]) {
        for (atomic, &count) in self.atomic_deps.iter().zip(dependency_count) {
            atomic.store(count, Ordering::Relaxed);
        }
    }

    pub fn prepare_atomic_var_ref(&self, var_ref_count: &[usize]) {
        for (atomic, &count) in self.atomic_var_ref.iter().zip(var_ref_count) {
            atomic.store(count, Ordering::Relaxed);
        }
    }

    pub fn atomic_deps(&self) -> &[AtomicUsize] {
        &self.atomic_deps
    }

    pub fn atomic_var_ref(&self) -> &[AtomicUsize] {
        &self.atomic_var_ref
    }

    pub fn blocker(&self) -> &MainThreadBlocker {
        &self.blocker
    }

    /// Start a pass: reset the blocker and take the seeding count.
    pub fn begin_pass(&self) {
        self.blocker.reset();
        self.outstanding.store(1, Ordering::Release);
    }

    /// Drop the seeding count; the pass may now become idle.
    pub fn end_seeding(&self) {
        drop(TaskGuard {
            outstanding: Arc::clone(&self.outstanding),
            blocker: Arc::clone(&self.blocker),
        });
    }

    /// Queue `task` on the pool serving `func_type`.
    pub fn add_task(&self, func_type: OpFuncType, task: impl FnOnce() + Send + 'static) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        let guard = TaskGuard {
            outstanding: Arc::clone(&self.outstanding),
            blocker: Arc::clone(&self.blocker),
        };
        let pool = match func_type {
            OpFuncType::QueueSync => &self.host,
            OpFuncType::QueueAsync => &self.device,
        };
        trace!(?func_type, "queue task");
        pool.spawn(move || {
            let _guard = guard;
            task();
        });
    }

    pub fn wait_event(&self) -> Result<WaitEvent> {
        self.blocker.wait_event()
    }

    pub fn wait_idle(&self) -> Result<()> {
        self.blocker.wait_idle()
    }
}
