//! Worker pool coordinating worker threads
//!
//! The pool owns the shared lock-free submission queue, one local deque
//! per worker and the shutdown phase every worker observes.

use crate::config::{PoolConfig, ShutdownMode};
use crate::deque::LocalQueue;
use crate::error::{PoolError, PoolResult, TaskError};
use crate::queue::LockFreeQueue;
use crate::stats::{Counters, PoolStats};
use crate::task::{self, CancellationToken, Runnable, TaskBody, TaskHandle};
use crate::worker::{self, WorkerState};
use crossbeam_deque::Stealer;
use parking_lot::Mutex;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Pool-wide lifecycle phase
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Phase {
    Running = 0,
    /// Graceful shutdown: run everything queued, then exit
    Draining = 1,
    /// Cancel-pending shutdown: finish in-flight tasks only
    Cancelling = 2,
}

impl Phase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Phase::Running,
            1 => Phase::Draining,
            _ => Phase::Cancelling,
        }
    }
}

/// State shared between the pool handle and its workers
pub(crate) struct Shared {
    pub(crate) global: LockFreeQueue<Runnable>,
    pub(crate) stealers: Vec<Stealer<Runnable>>,
    pub(crate) counters: Arc<Counters>,
    pub(crate) idle_sleep: Duration,

    /// Stored and loaded with SeqCst together with `Counters::outstanding`
    phase: AtomicU8,

    /// Parent flag of every task token; set on cancel-pending shutdown
    cancel_flag: Arc<AtomicBool>,

    worker_states: Vec<AtomicU8>,
}

impl Shared {
    /// Identity used to match worker threads to their pool
    pub(crate) fn id(&self) -> usize {
        self as *const Shared as usize
    }

    pub(crate) fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    pub(crate) fn set_worker_state(&self, id: usize, state: WorkerState) {
        if let Some(slot) = self.worker_states.get(id) {
            slot.store(state as u8, Ordering::Release);
        }
    }

    /// Pop and cancel everything left in the shared queue
    fn discard_global(&self) -> usize {
        let mut discarded = 0;
        while let Some(runnable) = self.global.pop() {
            drop(runnable);
            discarded += 1;
        }
        discarded
    }
}

/// Fixed-size pool of worker threads
///
/// ```ignore
/// let pool = WorkerPool::new(4)?;
/// let handle = pool.submit(|| 6 * 7);
/// assert_eq!(handle.wait(), Ok(&42));
/// pool.shutdown(ShutdownMode::GracefulDrain);
/// ```
pub struct WorkerPool {
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    config: PoolConfig,
}

impl WorkerPool {
    /// Create a pool with `worker_count` workers and default settings
    pub fn new(worker_count: usize) -> PoolResult<Self> {
        Self::with_config(PoolConfig::new(worker_count))
    }

    /// Create a pool from a full configuration
    pub fn with_config(config: PoolConfig) -> PoolResult<Self> {
        config.validate()?;

        let locals: Vec<LocalQueue<Runnable>> = (0..config.worker_count)
            .map(|_| LocalQueue::new(config.local_order))
            .collect();
        let stealers = locals.iter().map(LocalQueue::stealer).collect();

        let shared = Arc::new(Shared {
            global: LockFreeQueue::new(),
            stealers,
            counters: Arc::new(Counters::default()),
            idle_sleep: config.idle_sleep,
            phase: AtomicU8::new(Phase::Running as u8),
            cancel_flag: Arc::new(AtomicBool::new(false)),
            worker_states: (0..config.worker_count)
                .map(|_| AtomicU8::new(WorkerState::Running as u8))
                .collect(),
        });

        let pool = WorkerPool {
            shared,
            handles: Mutex::new(Vec::with_capacity(config.worker_count)),
            config,
        };

        for (id, local) in locals.into_iter().enumerate() {
            let shared = Arc::clone(&pool.shared);
            let mut builder =
                thread::Builder::new().name(format!("{}-{}", pool.config.thread_name_prefix, id));
            if let Some(size) = pool.config.stack_size {
                builder = builder.stack_size(size);
            }

            match builder.spawn(move || worker::run_loop(id, local, shared)) {
                Ok(handle) => pool.handles.lock().push(handle),
                Err(e) => {
                    tracing::error!(worker = id, error = %e, "failed to spawn worker thread");
                    pool.shutdown(ShutdownMode::CancelPending);
                    return Err(PoolError::ThreadSpawn(e));
                }
            }
        }

        tracing::info!(
            workers = pool.config.worker_count,
            order = ?pool.config.local_order,
            "worker pool started"
        );
        Ok(pool)
    }

    /// Submit a closure for asynchronous execution
    ///
    /// From inside one of this pool's tasks the work goes to the calling
    /// worker's own deque; from anywhere else it goes to the shared queue.
    pub fn submit<F, T>(&self, f: F) -> TaskHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + Sync + 'static,
    {
        self.spawn(Box::new(move |_| Ok(f())))
    }

    /// Submit a closure that receives the task's cancellation token
    pub fn submit_with_token<F, T>(&self, f: F) -> TaskHandle<T>
    where
        F: FnOnce(&CancellationToken) -> T + Send + 'static,
        T: Send + Sync + 'static,
    {
        self.spawn(Box::new(move |token| Ok(f(token))))
    }

    /// Submit a fallible closure; an `Err` is stored as [`TaskError::Failed`]
    pub fn submit_fallible<F, T, E>(&self, f: F) -> TaskHandle<T>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        T: Send + Sync + 'static,
        E: Display,
    {
        self.spawn(Box::new(move |_| {
            f().map_err(|e| TaskError::Failed(e.to_string()))
        }))
    }

    fn spawn<T: Send + Sync + 'static>(&self, body: TaskBody<T>) -> TaskHandle<T> {
        let shared = &self.shared;
        let token = CancellationToken::with_parent(Arc::clone(&shared.cancel_flag));
        let (handle, raw) = task::new_task(body, token);

        shared.counters.submitted.fetch_add(1, Ordering::Relaxed);
        // Counted before the phase is read so a draining worker cannot
        // exit while this submission is in flight
        shared.counters.outstanding.fetch_add(1, Ordering::SeqCst);
        let runnable = Runnable::new(raw, Arc::clone(&shared.counters));

        let runnable = match worker::push_local(shared.id(), runnable) {
            Ok(()) => return handle,
            Err(runnable) => runnable,
        };

        if shared.phase() != Phase::Running {
            tracing::warn!(
                task = handle.id().as_u64(),
                "worker pool is shutting down; task cancelled"
            );
            drop(runnable);
            return handle;
        }

        shared.global.push(runnable);

        // Lost the race with a cancel-pending shutdown that already swept the queue
        if shared.phase() == Phase::Cancelling {
            shared.discard_global();
        }
        handle
    }

    /// Stop the pool
    ///
    /// Waits for every worker thread to exit. In
    /// [`GracefulDrain`](ShutdownMode::GracefulDrain) mode all queued tasks
    /// run first; in [`CancelPending`](ShutdownMode::CancelPending) mode
    /// only in-flight tasks finish and queued ones resolve as cancelled.
    /// Only the first call picks the mode; later calls are no-ops.
    pub fn shutdown(&self, mode: ShutdownMode) {
        let target = match mode {
            ShutdownMode::GracefulDrain => Phase::Draining,
            ShutdownMode::CancelPending => Phase::Cancelling,
        };

        let first = self
            .shared
            .phase
            .compare_exchange(
                Phase::Running as u8,
                target as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if first {
            if mode == ShutdownMode::CancelPending {
                self.shared.cancel_flag.store(true, Ordering::SeqCst);
            }
            tracing::info!(?mode, "shutting down worker pool");
        }

        if worker::is_worker_of(self.shared.id()) {
            // Joining from inside would wait on ourselves
            tracing::warn!("shutdown called from a worker; threads are joined by the next shutdown from outside");
            return;
        }

        let handles = std::mem::take(&mut *self.handles.lock());
        if handles.is_empty() {
            return;
        }
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }

        let discarded = self.shared.discard_global();
        tracing::info!(discarded, stats = ?self.stats(), "worker pool stopped");
    }

    /// Whether shutdown has begun
    pub fn is_shutting_down(&self) -> bool {
        self.shared.phase() != Phase::Running
    }

    /// Number of worker threads
    pub fn worker_count(&self) -> usize {
        self.config.worker_count
    }

    /// The configuration the pool was built with
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Current state of every worker, indexed by worker id
    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.shared
            .worker_states
            .iter()
            .map(|state| WorkerState::from_u8(state.load(Ordering::Acquire)))
            .collect()
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        self.shared.counters.snapshot()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown(self.config.shutdown_on_drop);
    }
}
