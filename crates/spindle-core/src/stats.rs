//! Pool statistics

use crate::deque::Source;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total tasks submitted
    pub submitted: u64,

    /// Tasks that ran and returned a value
    pub completed: u64,

    /// Tasks that ran and panicked or returned an error
    pub failed: u64,

    /// Tasks resolved without running
    pub cancelled: u64,

    /// Tasks taken from a worker's own deque
    pub local_pops: u64,

    /// Tasks taken from the shared queue
    pub global_pops: u64,

    /// Tasks stolen from another worker
    pub steals: u64,

    /// Tasks submitted but not yet finished or discarded
    pub outstanding: usize,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) submitted: AtomicU64,
    pub(crate) completed: AtomicU64,
    pub(crate) failed: AtomicU64,
    pub(crate) cancelled: AtomicU64,
    local_pops: AtomicU64,
    global_pops: AtomicU64,
    steals: AtomicU64,

    /// Read together with the pool phase to decide when a draining worker may exit
    pub(crate) outstanding: AtomicUsize,
}

impl Counters {
    pub(crate) fn record_source(&self, source: Source) {
        let counter = match source {
            Source::Local => &self.local_pops,
            Source::Global => &self.global_pops,
            Source::Stolen => &self.steals,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    pub(crate) fn snapshot(&self) -> PoolStats {
        PoolStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            local_pops: self.local_pops.load(Ordering::Relaxed),
            global_pops: self.global_pops.load(Ordering::Relaxed),
            steals: self.steals.load(Ordering::Relaxed),
            outstanding: self.outstanding(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_source() {
        let counters = Counters::default();
        counters.record_source(Source::Local);
        counters.record_source(Source::Local);
        counters.record_source(Source::Global);
        counters.record_source(Source::Stolen);

        let stats = counters.snapshot();
        assert_eq!(stats.local_pops, 2);
        assert_eq!(stats.global_pops, 1);
        assert_eq!(stats.steals, 1);
        assert_eq!(stats.outstanding, 0);
    }
}
