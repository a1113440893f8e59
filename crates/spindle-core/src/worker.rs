//! Worker thread that executes Tasks
//!
//! Workers pull from their own deque first, then the shared queue, then
//! steal from peers. Idle workers back off with bounded spinning and
//! short sleeps instead of blocking, so shutdown stays responsive.

use crate::deque::{self, LocalQueue};
use crate::pool::{Phase, Shared};
use crate::task::Runnable;
use crossbeam::utils::Backoff;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::thread;

/// Lifecycle of a worker thread
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    /// Executing tasks normally
    Running = 0,
    /// Shutdown observed; finishing up before exit
    Draining = 1,
    /// Loop exited; the thread is about to be joined
    Stopped = 2,
}

impl WorkerState {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => WorkerState::Running,
            1 => WorkerState::Draining,
            _ => WorkerState::Stopped,
        }
    }
}

/// State a worker thread exposes to tasks it runs
struct WorkerContext {
    pool_id: usize,
    id: usize,
    local: LocalQueue<Runnable>,
}

thread_local! {
    static CURRENT: RefCell<Option<Rc<WorkerContext>>> = RefCell::new(None);
}

fn current() -> Option<Rc<WorkerContext>> {
    CURRENT.try_with(|cur| cur.borrow().clone()).ok().flatten()
}

/// Id of the worker executing the calling task, if any
pub fn current_worker_id() -> Option<usize> {
    current().map(|ctx| ctx.id)
}

/// Whether the calling thread is a worker of pool `pool_id`
pub(crate) fn is_worker_of(pool_id: usize) -> bool {
    current().map_or(false, |ctx| ctx.pool_id == pool_id)
}

/// Push onto the calling worker's own deque if it belongs to `pool_id`
///
/// Hands the runnable back otherwise.
pub(crate) fn push_local(pool_id: usize, runnable: Runnable) -> Result<(), Runnable> {
    match current() {
        Some(ctx) if ctx.pool_id == pool_id => {
            ctx.local.push(runnable);
            Ok(())
        }
        _ => Err(runnable),
    }
}

/// Worker thread main loop
pub(crate) fn run_loop(id: usize, local: LocalQueue<Runnable>, shared: Arc<Shared>) {
    let ctx = Rc::new(WorkerContext {
        pool_id: shared.id(),
        id,
        local,
    });
    CURRENT.with(|cur| *cur.borrow_mut() = Some(Rc::clone(&ctx)));
    tracing::debug!(worker = id, "worker started");

    let backoff = Backoff::new();
    let mut draining = false;

    loop {
        let phase = shared.phase();
        if phase != Phase::Running && !draining {
            draining = true;
            shared.set_worker_state(id, WorkerState::Draining);
            tracing::debug!(worker = id, ?phase, "worker draining");
        }

        match phase {
            Phase::Cancelling => break,
            // Nothing queued or running anywhere in the pool
            Phase::Draining if shared.counters.outstanding() == 0 => break,
            _ => {}
        }

        let Some((runnable, source)) =
            deque::find_work(&ctx.local, &shared.global, &shared.stealers, id)
        else {
            if backoff.is_completed() {
                thread::sleep(shared.idle_sleep);
            } else {
                backoff.snooze();
            }
            continue;
        };

        backoff.reset();
        shared.counters.record_source(source);

        if shared.phase() == Phase::Cancelling {
            // Pulled after the cancel flag went up: discard, never run
            drop(runnable);
            break;
        }

        if let Some(task) = runnable.id() {
            tracing::trace!(worker = id, task = task.as_u64(), ?source, "running task");
        }
        runnable.run();
    }

    // Anything left locally resolves as cancelled
    let mut discarded = 0usize;
    while let Some(runnable) = ctx.local.pop() {
        drop(runnable);
        discarded += 1;
    }

    CURRENT.with(|cur| cur.borrow_mut().take());
    shared.set_worker_state(id, WorkerState::Stopped);
    tracing::debug!(worker = id, discarded, "worker stopped");
}
