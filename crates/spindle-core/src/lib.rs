//! Spindle: a work-stealing task scheduler core
//!
//! This crate provides:
//! - Hazard-pointer based memory reclamation ([`hazard`])
//! - A lock-free multi-producer multi-consumer FIFO queue ([`queue`])
//! - Per-worker deques with randomized stealing ([`deque`])
//! - Tasks with waitable, cancellable handles ([`task`])
//! - A fixed-size worker pool with graceful and cancelling shutdown ([`pool`])

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod deque;
pub mod error;
pub mod hazard;
pub mod pool;
pub mod queue;
pub mod stats;
pub mod task;
mod worker;

pub use config::{LocalOrder, PoolConfig, ShutdownMode};
pub use error::{PoolError, PoolResult, TaskError, TaskResult};
pub use hazard::{HazardDomain, ReclaimStats};
pub use pool::WorkerPool;
pub use queue::LockFreeQueue;
pub use stats::PoolStats;
pub use task::{CancellationToken, TaskHandle, TaskId, TaskState};
pub use worker::{current_worker_id, WorkerState};
