//! Error types for pool construction and task execution

/// Errors raised while building or starting a worker pool
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Invalid pool parameters
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The OS refused to spawn a worker thread
    #[error("Failed to spawn worker thread: {0}")]
    ThreadSpawn(#[from] std::io::Error),
}

/// Pool construction result
pub type PoolResult<T> = Result<T, PoolError>;

/// Why a task did not produce a value
///
/// Stored inside the task's handle; a failing task never takes its
/// worker thread down with it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// The task body panicked; holds the panic message
    #[error("Task panicked: {0}")]
    Panicked(String),

    /// A fallible task body returned an error
    #[error("Task failed: {0}")]
    Failed(String),

    /// The task was resolved without running
    #[error("Task cancelled")]
    Cancelled,
}

/// Outcome of a task as seen through its handle
pub type TaskResult<T> = Result<T, TaskError>;
