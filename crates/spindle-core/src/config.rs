//! Worker pool configuration

use crate::error::{PoolError, PoolResult};
use std::time::Duration;

/// Default idle sleep once the spin/yield backoff is exhausted
pub const DEFAULT_IDLE_SLEEP: Duration = Duration::from_micros(100);

/// Default worker thread name prefix
pub const DEFAULT_THREAD_NAME_PREFIX: &str = "spindle-worker";

/// Discipline of the owner end of each worker's local deque
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LocalOrder {
    /// Owner pops the oldest task; same-producer order is kept
    #[default]
    Fifo,
    /// Owner pops the newest task (cache locality), stealers take the oldest
    Lifo,
}

/// What happens to queued tasks when the pool shuts down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownMode {
    /// Execute every queued task before the workers exit
    #[default]
    GracefulDrain,
    /// Finish in-flight tasks only; resolve queued ones as cancelled
    CancelPending,
}

/// Worker pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker threads (must be positive)
    pub worker_count: usize,

    /// Local deque discipline
    pub local_order: LocalOrder,

    /// Worker threads are named `{prefix}-{id}`
    pub thread_name_prefix: String,

    /// Stack size for worker threads (None = platform default)
    pub stack_size: Option<usize>,

    /// Sleep between polls once an idle worker has exhausted its backoff
    pub idle_sleep: Duration,

    /// Mode used when the pool is dropped without an explicit shutdown
    pub shutdown_on_drop: ShutdownMode,
}

impl PoolConfig {
    /// Create a configuration with `worker_count` workers and defaults elsewhere
    pub fn new(worker_count: usize) -> Self {
        Self {
            worker_count,
            ..Self::default()
        }
    }

    /// Set the local deque discipline
    pub fn with_local_order(mut self, order: LocalOrder) -> Self {
        self.local_order = order;
        self
    }

    /// Set the worker thread name prefix
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Set the worker thread stack size
    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    /// Set the idle sleep
    pub fn with_idle_sleep(mut self, sleep: Duration) -> Self {
        self.idle_sleep = sleep;
        self
    }

    /// Set the shutdown mode used on drop
    pub fn with_shutdown_on_drop(mut self, mode: ShutdownMode) -> Self {
        self.shutdown_on_drop = mode;
        self
    }

    /// Check the configuration before any thread is spawned
    pub fn validate(&self) -> PoolResult<()> {
        if self.worker_count == 0 {
            return Err(PoolError::Configuration(
                "worker_count must be at least 1".to_string(),
            ));
        }
        if self.stack_size == Some(0) {
            return Err(PoolError::Configuration(
                "stack_size must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_count: num_cpus::get(),
            local_order: LocalOrder::default(),
            thread_name_prefix: DEFAULT_THREAD_NAME_PREFIX.to_string(),
            stack_size: None,
            idle_sleep: DEFAULT_IDLE_SLEEP,
            shutdown_on_drop: ShutdownMode::default(),
        }
    }
}
