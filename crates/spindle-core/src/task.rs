//! Tasks, handles and cooperative cancellation

use crate::error::{TaskError, TaskResult};
use crate::stats::Counters;
use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Unique identifier for a Task
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

impl TaskId {
    /// Generate a new unique TaskId
    pub fn new() -> Self {
        TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// State of a Task
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    /// Queued, not yet picked up
    Pending = 0,
    /// Currently executing on a worker
    Running = 1,
    /// Ran to the end (value, error or panic stored)
    Completed = 2,
    /// Resolved without running
    Cancelled = 3,
}

impl TaskState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => TaskState::Pending,
            1 => TaskState::Running,
            2 => TaskState::Completed,
            _ => TaskState::Cancelled,
        }
    }
}

/// Cooperative cancellation signal handed to task bodies
///
/// Reports cancelled once the task's handle was cancelled or its pool
/// began a cancel-pending shutdown. Nothing is interrupted; task bodies
/// poll [`is_cancelled`](Self::is_cancelled) at points of their choosing.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    own: Arc<AtomicBool>,
    parent: Option<Arc<AtomicBool>>,
}

impl CancellationToken {
    /// A standalone token
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that also observes `parent`
    pub(crate) fn with_parent(parent: Arc<AtomicBool>) -> Self {
        Self {
            own: Arc::new(AtomicBool::new(false)),
            parent: Some(parent),
        }
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.own.store(true, Ordering::Release);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.own.load(Ordering::Acquire)
            || self
                .parent
                .as_ref()
                .map_or(false, |parent| parent.load(Ordering::Acquire))
    }
}

pub(crate) type TaskBody<T> = Box<dyn FnOnce(&CancellationToken) -> TaskResult<T> + Send>;

/// What running a task amounted to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunOutcome {
    Completed,
    Failed,
    /// The task had already been cancelled
    Skipped,
}

/// Type-erased view of a task used by the queues
pub(crate) trait RawTask: Send + Sync {
    fn id(&self) -> TaskId;

    /// Execute the body if the task is still pending
    ///
    /// The outcome is counted in `counters` before the result is published.
    fn run(&self, counters: &Counters) -> RunOutcome;

    /// Resolve as cancelled if the task has not started
    fn cancel_pending(&self) -> bool;
}

struct TaskCell<T> {
    id: TaskId,
    state: AtomicU8,
    body: Mutex<Option<TaskBody<T>>>,

    /// Written exactly once, by whoever moves the task out of `Pending`
    result: OnceCell<TaskResult<T>>,

    /// Waiters block here until `result` is set
    completion_lock: Mutex<()>,
    completion_condvar: Condvar,

    token: CancellationToken,
}

impl<T> TaskCell<T> {
    fn transition(&self, to: TaskState) -> bool {
        self.state
            .compare_exchange(
                TaskState::Pending as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn publish(&self, result: TaskResult<T>, state: TaskState) {
        let _ = self.result.set(result);
        self.state.store(state as u8, Ordering::Release);

        let _lock = self.completion_lock.lock();
        self.completion_condvar.notify_all();
    }
}

impl<T: Send + Sync> RawTask for TaskCell<T> {
    fn id(&self) -> TaskId {
        self.id
    }

    fn run(&self, counters: &Counters) -> RunOutcome {
        if !self.transition(TaskState::Running) {
            return RunOutcome::Skipped;
        }
        let body = self.body.lock().take();
        let Some(body) = body else {
            return RunOutcome::Skipped;
        };

        let result = match panic::catch_unwind(AssertUnwindSafe(|| body(&self.token))) {
            Ok(result) => result,
            Err(payload) => Err(TaskError::Panicked(panic_message(payload.as_ref()))),
        };
        let (outcome, counter) = match result {
            Ok(_) => (RunOutcome::Completed, &counters.completed),
            Err(_) => (RunOutcome::Failed, &counters.failed),
        };
        // Anyone woken by `publish` must already see the count
        counter.fetch_add(1, Ordering::Relaxed);

        self.publish(result, TaskState::Completed);
        outcome
    }

    fn cancel_pending(&self) -> bool {
        if !self.transition(TaskState::Cancelled) {
            return false;
        }
        let body = self.body.lock().take();
        drop(body);

        self.token.cancel();
        self.publish(Err(TaskError::Cancelled), TaskState::Cancelled);
        true
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Create a task and the handle that observes it
pub(crate) fn new_task<T: Send + Sync + 'static>(
    body: TaskBody<T>,
    token: CancellationToken,
) -> (TaskHandle<T>, Arc<dyn RawTask>) {
    let cell = Arc::new(TaskCell {
        id: TaskId::new(),
        state: AtomicU8::new(TaskState::Pending as u8),
        body: Mutex::new(Some(body)),
        result: OnceCell::new(),
        completion_lock: Mutex::new(()),
        completion_condvar: Condvar::new(),
        token,
    });
    let raw: Arc<dyn RawTask> = cell.clone();
    (TaskHandle { cell }, raw)
}

/// Handle for awaiting a Task's result
///
/// Cloning is cheap; every clone observes the same result.
pub struct TaskHandle<T> {
    cell: Arc<TaskCell<T>>,
}

impl<T> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T: Send + Sync> TaskHandle<T> {
    /// Get the task ID
    pub fn id(&self) -> TaskId {
        self.cell.id
    }

    /// Current state of the task
    ///
    /// Terminal as soon as [`is_ready`](Self::is_ready) returns `true`.
    pub fn state(&self) -> TaskState {
        match self.cell.result.get() {
            Some(Err(TaskError::Cancelled)) => TaskState::Cancelled,
            Some(_) => TaskState::Completed,
            None => TaskState::from_u8(self.cell.state.load(Ordering::Acquire)),
        }
    }

    /// Whether the result is available
    pub fn is_ready(&self) -> bool {
        self.cell.result.get().is_some()
    }

    /// The result, if available, without blocking
    pub fn try_get(&self) -> Option<TaskResult<&T>> {
        self.cell
            .result
            .get()
            .map(|result| result.as_ref().map_err(Clone::clone))
    }

    /// Block until the result is available
    pub fn wait(&self) -> TaskResult<&T> {
        let mut lock = self.cell.completion_lock.lock();
        loop {
            if let Some(result) = self.try_get() {
                return result;
            }
            self.cell.completion_condvar.wait(&mut lock);
        }
    }

    /// Block for at most `timeout`
    ///
    /// Returns `None` if the result is still unavailable; the task itself
    /// keeps running. A timeout too large to form a deadline waits forever.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<TaskResult<&T>> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return Some(self.wait());
        };
        let mut lock = self.cell.completion_lock.lock();
        loop {
            if let Some(result) = self.try_get() {
                return Some(result);
            }
            if self
                .cell
                .completion_condvar
                .wait_until(&mut lock, deadline)
                .timed_out()
            {
                return self.try_get();
            }
        }
    }

    /// Cancel the task
    ///
    /// Returns `true` if the task had not started: it will never run and
    /// its result is `Cancelled`. A running task only sees its token flip.
    ///
    /// The queued entry is not unlinked; it stays counted as outstanding
    /// until a worker pops and discards it.
    pub fn cancel(&self) -> bool {
        if self.cell.cancel_pending() {
            return true;
        }
        self.cell.token.cancel();
        false
    }
}

impl<T: Send + Sync> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

/// Queue entry for a submitted task
///
/// Dropping an entry that never ran resolves its task as cancelled, so
/// no handle is left waiting on a discarded task.
pub(crate) struct Runnable {
    task: Option<Arc<dyn RawTask>>,
    counters: Arc<Counters>,
}

impl Runnable {
    pub(crate) fn new(task: Arc<dyn RawTask>, counters: Arc<Counters>) -> Self {
        Self {
            task: Some(task),
            counters,
        }
    }

    pub(crate) fn id(&self) -> Option<TaskId> {
        self.task.as_ref().map(|task| task.id())
    }

    /// Execute the task on the calling thread
    pub(crate) fn run(mut self) -> RunOutcome {
        let Some(task) = self.task.take() else {
            return RunOutcome::Skipped;
        };
        let outcome = task.run(&self.counters);
        if outcome == RunOutcome::Skipped {
            self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
        }
        outcome
    }
}

impl Drop for Runnable {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
            task.cancel_pending();
        }
        self.counters.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn make<T: Send + Sync + 'static>(
        f: impl FnOnce(&CancellationToken) -> TaskResult<T> + Send + 'static,
    ) -> (TaskHandle<T>, Runnable, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        counters.outstanding.fetch_add(1, Ordering::SeqCst);
        let (handle, raw) = new_task(Box::new(f), CancellationToken::new());
        (handle, Runnable::new(raw, counters.clone()), counters)
    }

    #[test]
    fn test_task_id_unique() {
        let a = TaskId::new();
        let b = TaskId::new();
        assert_ne!(a, b);
        assert!(b.as_u64() > a.as_u64());
    }

    #[test]
    fn test_run_publishes_result() {
        let (handle, runnable, counters) = make(|_| Ok(42));
        assert_eq!(handle.state(), TaskState::Pending);
        assert!(!handle.is_ready());
        assert!(handle.try_get().is_none());

        assert_eq!(runnable.run(), RunOutcome::Completed);
        assert!(handle.is_ready());
        assert_eq!(handle.state(), TaskState::Completed);
        assert_eq!(handle.wait(), Ok(&42));
        assert_eq!(handle.try_get(), Some(Ok(&42)));

        let stats = counters.snapshot();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.outstanding, 0);
    }

    #[test]
    fn test_panic_is_captured() {
        let (handle, runnable, counters) = make::<u32>(|_| panic!("task exploded"));
        assert_eq!(runnable.run(), RunOutcome::Failed);
        assert_eq!(
            handle.wait(),
            Err(TaskError::Panicked("task exploded".to_string()))
        );
        assert_eq!(counters.snapshot().failed, 1);
    }

    #[test]
    fn test_formatted_panic_message() {
        let (handle, runnable, _) = make::<u32>(|_| panic!("bad input {}", 7));
        runnable.run();
        assert_eq!(
            handle.wait(),
            Err(TaskError::Panicked("bad input 7".to_string()))
        );
    }

    #[test]
    fn test_cancel_before_run() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let (handle, runnable, counters) = make(move |_| {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });

        assert!(handle.cancel());
        assert_eq!(handle.state(), TaskState::Cancelled);
        assert_eq!(handle.wait(), Err(TaskError::Cancelled));

        // The queued entry is now a tombstone
        assert_eq!(runnable.run(), RunOutcome::Skipped);
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(counters.snapshot().cancelled, 1);
        assert_eq!(counters.snapshot().outstanding, 0);
    }

    #[test]
    fn test_cancel_after_completion_is_noop() {
        let (handle, runnable, _) = make(|_| Ok("done"));
        runnable.run();
        assert!(!handle.cancel());
        assert_eq!(handle.wait(), Ok(&"done"));
    }

    #[test]
    fn test_cancel_while_running_flips_token() {
        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let (handle, runnable, _) = make(move |token| {
            started_tx.send(()).unwrap();
            while !token.is_cancelled() {
                thread::sleep(Duration::from_millis(1));
            }
            Ok("observed")
        });

        let worker = thread::spawn(move || runnable.run());
        started_rx.recv().unwrap();

        assert!(!handle.cancel());
        assert_eq!(handle.wait(), Ok(&"observed"));
        assert_eq!(worker.join().unwrap(), RunOutcome::Completed);
    }

    #[test]
    fn test_dropped_runnable_resolves_cancelled() {
        let (handle, runnable, counters) = make(|_| Ok(1));
        drop(runnable);

        assert_eq!(handle.state(), TaskState::Cancelled);
        assert_eq!(handle.wait(), Err(TaskError::Cancelled));
        let stats = counters.snapshot();
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.outstanding, 0);
    }

    #[test]
    fn test_wait_timeout_expires() {
        let (handle, runnable, _) = make(|_| Ok(5));
        let started = Instant::now();
        assert!(handle.wait_timeout(Duration::from_millis(20)).is_none());
        assert!(started.elapsed() >= Duration::from_millis(20));

        runnable.run();
        assert_eq!(handle.wait_timeout(Duration::from_millis(20)), Some(Ok(&5)));
    }

    #[test]
    fn test_many_waiters_observe_one_result() {
        let (handle, runnable, _) = make(|_| Ok(vec![1, 2, 3]));

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let handle = handle.clone();
                thread::spawn(move || {
                    let sum = handle.wait().map(|v| v.iter().sum::<i32>());
                    sum
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(10));
        runnable.run();

        for waiter in waiters {
            assert_eq!(waiter.join().unwrap(), Ok(6));
        }
    }

    #[test]
    fn test_wait_timeout_with_unbounded_duration() {
        let (handle, runnable, _) = make(|_| {
            thread::sleep(Duration::from_millis(5));
            Ok(2u32)
        });
        let worker = thread::spawn(move || runnable.run());

        assert_eq!(handle.wait_timeout(Duration::MAX), Some(Ok(&2)));
        worker.join().unwrap();
    }

    #[test]
    fn test_counters_visible_to_woken_waiter() {
        for _ in 0..50 {
            let (ok, ok_runnable, counters) = make(|_| Ok(1));
            let (bad, bad_runnable) = {
                counters.outstanding.fetch_add(1, Ordering::SeqCst);
                let (handle, raw) =
                    new_task::<u32>(Box::new(|_| panic!("boom")), CancellationToken::new());
                (handle, Runnable::new(raw, counters.clone()))
            };

            let worker = thread::spawn(move || {
                ok_runnable.run();
                bad_runnable.run();
            });

            ok.wait().unwrap();
            assert_eq!(counters.snapshot().completed, 1);
            assert!(bad.wait().is_err());
            assert_eq!(counters.snapshot().failed, 1);
            worker.join().unwrap();
        }
    }

    #[test]
    fn test_state_terminal_once_ready() {
        for _ in 0..50 {
            let (handle, runnable, _) = make(|_| Ok(()));
            let observer = {
                let handle = handle.clone();
                thread::spawn(move || {
                    while !handle.is_ready() {
                        std::hint::spin_loop();
                    }
                    handle.state()
                })
            };

            runnable.run();
            assert_eq!(observer.join().unwrap(), TaskState::Completed);
        }
    }

    #[test]
    fn test_token_observes_parent() {
        let parent = Arc::new(AtomicBool::new(false));
        let token = CancellationToken::with_parent(parent.clone());
        assert!(!token.is_cancelled());

        parent.store(true, Ordering::SeqCst);
        assert!(token.is_cancelled());

        let standalone = CancellationToken::new();
        standalone.cancel();
        assert!(standalone.is_cancelled());
    }
}
