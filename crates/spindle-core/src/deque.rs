//! Per-worker local deque and work finding
//!
//! Each worker owns a [`LocalQueue`]. The owner pushes and pops at its
//! end; other workers steal through a [`Stealer`] from the opposite end.

use crate::config::LocalOrder;
use crate::queue::LockFreeQueue;
use crossbeam_deque::{Steal, Stealer, Worker};

/// Where a worker found its next task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// The worker's own deque
    Local,
    /// The shared submission queue
    Global,
    /// Another worker's deque
    Stolen,
}

/// Single-owner task buffer
pub struct LocalQueue<T> {
    worker: Worker<T>,
}

impl<T> LocalQueue<T> {
    /// Create an empty deque with the given owner-end discipline
    pub fn new(order: LocalOrder) -> Self {
        let worker = match order {
            LocalOrder::Fifo => Worker::new_fifo(),
            LocalOrder::Lifo => Worker::new_lifo(),
        };
        Self { worker }
    }

    /// Handle other workers use to steal from this deque
    pub fn stealer(&self) -> Stealer<T> {
        self.worker.stealer()
    }

    /// Push at the owner end
    pub fn push(&self, item: T) {
        self.worker.push(item);
    }

    /// Pop at the owner end
    pub fn pop(&self) -> Option<T> {
        self.worker.pop()
    }

    /// Number of items in the deque
    pub fn len(&self) -> usize {
        self.worker.len()
    }

    /// Whether the deque is empty
    pub fn is_empty(&self) -> bool {
        self.worker.is_empty()
    }
}

/// Find the next task: own deque, then the shared queue, then a peer
///
/// `own` is skipped when stealing; pass `usize::MAX` when the caller
/// owns none of the `stealers`.
pub fn find_work<T: Send>(
    local: &LocalQueue<T>,
    global: &LockFreeQueue<T>,
    stealers: &[Stealer<T>],
    own: usize,
) -> Option<(T, Source)> {
    // 1. Own deque: no contention with stealers at this end
    if let Some(item) = local.pop() {
        return Some((item, Source::Local));
    }

    // 2. Shared submission queue
    if let Some(item) = global.pop() {
        return Some((item, Source::Global));
    }

    // 3. Steal from a peer
    steal_from_others(stealers, own).map(|item| (item, Source::Stolen))
}

/// Try every peer once, starting from a random victim
fn steal_from_others<T>(stealers: &[Stealer<T>], own: usize) -> Option<T> {
    use rand::Rng;

    if stealers.is_empty() {
        return None;
    }

    // Randomly select a victim to reduce contention
    let start = rand::thread_rng().gen_range(0..stealers.len());

    for i in 0..stealers.len() {
        let index = (start + i) % stealers.len();
        if index == own {
            continue;
        }

        loop {
            match stealers[index].steal() {
                Steal::Success(item) => return Some(item),
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }
    }

    None
}
