//! Lock-Free MPMC Queue
//!
//! Michael-Scott linked queue. The chain always starts with a dummy
//! node, so `head` and `tail` are never null and `head == tail` with no
//! successor means empty. Popped dummies are retired through the
//! hazard pointer registry rather than freed, since other consumers may
//! still be reading them.

use crate::hazard::{self, HazardGuard};
use crossbeam::utils::CachePadded;
use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicIsize, AtomicPtr, Ordering};

struct Node<T> {
    /// Initialized for every node except the current dummy, whose payload
    /// has been moved out (or never existed).
    value: UnsafeCell<MaybeUninit<T>>,
    next: AtomicPtr<Node<T>>,
}

impl<T> Node<T> {
    fn dummy() -> *mut Self {
        Box::into_raw(Box::new(Self {
            value: UnsafeCell::new(MaybeUninit::uninit()),
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }

    fn new(value: T) -> *mut Self {
        Box::into_raw(Box::new(Self {
            value: UnsafeCell::new(MaybeUninit::new(value)),
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }
}

/// A lock-free multi-producer, multi-consumer FIFO queue
///
/// Items pushed by one thread are popped in push order. `pop` never
/// blocks; an empty queue simply yields `None`.
pub struct LockFreeQueue<T> {
    /// Dequeue end; always points at the dummy node
    head: CachePadded<AtomicPtr<Node<T>>>,

    /// Enqueue end; may lag one node behind the real last node
    tail: CachePadded<AtomicPtr<Node<T>>>,

    /// Approximate number of items (may be briefly negative under races)
    len: AtomicIsize,

    _owns: PhantomData<T>,
}

// SAFETY: payloads are moved between threads only through push/pop, and
// every shared node access is protected by a hazard pointer.
unsafe impl<T: Send> Send for LockFreeQueue<T> {}
unsafe impl<T: Send> Sync for LockFreeQueue<T> {}

impl<T: Send> LockFreeQueue<T> {
    /// Create an empty queue holding only the dummy node
    pub fn new() -> Self {
        let dummy = Node::<T>::dummy();
        Self {
            head: CachePadded::new(AtomicPtr::new(dummy)),
            tail: CachePadded::new(AtomicPtr::new(dummy)),
            len: AtomicIsize::new(0),
            _owns: PhantomData,
        }
    }

    /// Append `value` at the tail
    pub fn push(&self, value: T) {
        let node = Node::new(value);
        let guard = HazardGuard::new();

        loop {
            let tail = guard.protect(&self.tail);
            // SAFETY: `tail` was current while published, and the tail node
            // is never retired before `head` moves past it.
            let next = unsafe { (*tail).next.load(Ordering::Acquire) };

            if !next.is_null() {
                // Tail is lagging; help it forward and retry
                let _ = self
                    .tail
                    .compare_exchange(tail, next, Ordering::Release, Ordering::Relaxed);
                continue;
            }

            // SAFETY: as above; `tail` is protected.
            let linked = unsafe {
                (*tail)
                    .next
                    .compare_exchange(ptr::null_mut(), node, Ordering::Release, Ordering::Relaxed)
                    .is_ok()
            };

            if linked {
                // Best effort: whoever sees the stale tail can advance it
                let _ = self
                    .tail
                    .compare_exchange(tail, node, Ordering::Release, Ordering::Relaxed);
                self.len.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
    }

    /// Remove the value at the head, or return `None` if the queue is empty
    pub fn pop(&self) -> Option<T> {
        let head_guard = HazardGuard::new();
        let next_guard = HazardGuard::new();

        loop {
            let head = head_guard.protect(&self.head);
            let tail = self.tail.load(Ordering::Acquire);
            // SAFETY: `head` is protected and was current when published.
            let next = unsafe { (*head).next.load(Ordering::Acquire) };
            next_guard.set(next);

            // `next` is only retired after `head` moves past it, so an
            // unchanged head proves the published `next` is still live.
            if self.head.load(Ordering::Acquire) != head {
                continue;
            }

            if next.is_null() {
                return None;
            }

            if head == tail {
                let _ = self
                    .tail
                    .compare_exchange(tail, next, Ordering::Release, Ordering::Relaxed);
                continue;
            }

            if self
                .head
                .compare_exchange(head, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                // SAFETY: winning the CAS makes this thread the only reader of
                // `next`'s payload; `next_guard` keeps the node alive.
                let value = unsafe { (*(*next).value.get()).assume_init_read() };
                drop(next_guard);
                drop(head_guard);
                // SAFETY: `head` is unlinked and was allocated by `Node::dummy`/`Node::new`.
                unsafe { hazard::retire(head) };
                self.len.fetch_sub(1, Ordering::Relaxed);
                return Some(value);
            }
        }
    }

    /// Whether the queue currently holds no items
    pub fn is_empty(&self) -> bool {
        let guard = HazardGuard::new();
        let head = guard.protect(&self.head);
        // SAFETY: `head` is protected.
        unsafe { (*head).next.load(Ordering::Acquire).is_null() }
    }

    /// Approximate number of items
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed).max(0) as usize
    }
}

impl<T: Send> Default for LockFreeQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for LockFreeQueue<T> {
    fn drop(&mut self) {
        // Exclusive access: no other thread can hold a hazard on the chain.
        let mut cur = *self.head.get_mut();
        // SAFETY: `cur` is the dummy; its payload is not initialized.
        unsafe {
            let dummy = Box::from_raw(cur);
            cur = dummy.next.load(Ordering::Relaxed);
        }
        while !cur.is_null() {
            // SAFETY: every node after the dummy holds an initialized payload.
            unsafe {
                let node = Box::from_raw(cur);
                cur = node.next.load(Ordering::Relaxed);
                drop(node.value.into_inner().assume_init());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn test_push_pop_fifo() {
        let queue = LockFreeQueue::new();
        queue.push(1);
        queue.push(2);
        queue.push(3);

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(3));
        assert_eq!(queue.pop(), None);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_empty_pop_returns_none() {
        let queue: LockFreeQueue<String> = LockFreeQueue::new();
        assert!(queue.is_empty());
        assert_eq!(queue.pop(), None);
        assert_eq!(queue.pop(), None);

        queue.push("a".to_string());
        assert!(!queue.is_empty());
        assert_eq!(queue.pop().as_deref(), Some("a"));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drop_releases_remaining_items() {
        struct Tracked(Arc<AtomicUsize>);
        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        {
            let queue = LockFreeQueue::new();
            for _ in 0..5 {
                queue.push(Tracked(drops.clone()));
            }
            drop(queue.pop());
            assert_eq!(drops.load(Ordering::SeqCst), 1);
        }
        assert_eq!(drops.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_concurrent_producers_consumers() {
        const PRODUCERS: usize = 4;
        const CONSUMERS: usize = 4;
        const PER_PRODUCER: usize = 5_000;

        let queue = Arc::new(LockFreeQueue::new());
        let popped = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(PRODUCERS + CONSUMERS));

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let queue = queue.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    for i in 0..PER_PRODUCER {
                        queue.push((p, i));
                    }
                })
            })
            .collect();

        let consumers: Vec<_> = (0..CONSUMERS)
            .map(|_| {
                let queue = queue.clone();
                let popped = popped.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let mut seen = Vec::new();
                    while popped.load(Ordering::SeqCst) < PRODUCERS * PER_PRODUCER {
                        match queue.pop() {
                            Some(item) => {
                                popped.fetch_add(1, Ordering::SeqCst);
                                seen.push(item);
                            }
                            None => thread::yield_now(),
                        }
                    }
                    seen
                })
            })
            .collect();

        for p in producers {
            p.join().unwrap();
        }

        let mut all = HashSet::new();
        for c in consumers {
            let seen = c.join().unwrap();

            // Each consumer observes every producer's items in push order
            let mut last = vec![None; PRODUCERS];
            for &(p, i) in &seen {
                if let Some(prev) = last[p] {
                    assert!(i > prev, "producer {} order violated: {} after {}", p, i, prev);
                }
                last[p] = Some(i);
            }

            for item in seen {
                assert!(all.insert(item), "item {:?} delivered twice", item);
            }
        }

        assert_eq!(all.len(), PRODUCERS * PER_PRODUCER);
        assert!(queue.pop().is_none());
    }
}
