//! Hazard Pointer Registry
//!
//! Hazard pointers let lock-free structures free unlinked nodes without
//! locks. Before dereferencing a shared node, a thread publishes the
//! node's address in one of its hazard slots. Unlinked nodes are
//! *retired* onto a per-thread list instead of being freed, and a
//! periodic scan frees only the retired nodes whose address appears in
//! no slot.
//!
//! Layout:
//! - one process-wide [`HazardDomain`] holding an intrusive, push-only
//!   list of records; each record carries [`SLOTS_PER_RECORD`] slots
//! - each thread lazily claims a record on first use and releases it
//!   (for reuse by later threads) when the thread exits
//! - each thread owns its retired list; nothing else touches it
//! - nodes still retired when a thread exits are handed to a lock-free
//!   orphan list that the next scan on any thread adopts
//!
//! Unreclaimed memory stays bounded by threads × slots × the retirement
//! batch size, since every thread scans after [`RECLAIM_THRESHOLD`]
//! retirements.

use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{fence, AtomicBool, AtomicPtr, AtomicU64, Ordering};

/// Hazard slots per thread record
pub const SLOTS_PER_RECORD: usize = 4;

/// Retirements per thread between reclamation scans
pub const RECLAIM_THRESHOLD: usize = 64;

/// A thread's published hazard slots
struct HazardRecord {
    /// Next record in the domain list. Written once before the record is published.
    next: AtomicPtr<HazardRecord>,

    /// Whether a thread (or an overflow guard) currently owns this record
    active: AtomicBool,

    /// Published addresses; null when unused
    slots: [AtomicPtr<()>; SLOTS_PER_RECORD],
}

impl HazardRecord {
    fn new_active() -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
            active: AtomicBool::new(true),
            slots: Default::default(),
        }
    }

    fn clear(&self) {
        for slot in &self.slots {
            slot.store(ptr::null_mut(), Ordering::Release);
        }
    }
}

/// A node waiting for reclamation
struct Retired {
    ptr: *mut (),
    reclaim: unsafe fn(*mut ()),
}

// SAFETY: `retire` only accepts `T: Send`, so the pointee may be freed on any thread.
unsafe impl Send for Retired {}

impl Retired {
    /// # Safety
    /// No thread may still reference the node.
    unsafe fn reclaim(self) {
        (self.reclaim)(self.ptr)
    }
}

unsafe fn drop_boxed<T>(ptr: *mut ()) {
    drop(Box::from_raw(ptr.cast::<T>()));
}

/// Retired nodes left behind by an exited thread
struct OrphanBatch {
    nodes: Vec<Retired>,
    next: *mut OrphanBatch,
}

/// Reclamation counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimStats {
    /// Nodes handed to `retire`
    pub retired: u64,

    /// Nodes actually freed
    pub reclaimed: u64,

    /// Reclamation scans performed
    pub scans: u64,
}

impl ReclaimStats {
    /// Retired nodes not yet freed
    pub fn pending(&self) -> u64 {
        self.retired.saturating_sub(self.reclaimed)
    }
}

/// Process-wide hazard pointer domain
pub struct HazardDomain {
    /// Head of the push-only record list
    records: AtomicPtr<HazardRecord>,

    /// Head of the orphaned retired-batch stack
    orphans: AtomicPtr<OrphanBatch>,

    retired: AtomicU64,
    reclaimed: AtomicU64,
    scans: AtomicU64,
}

static GLOBAL_DOMAIN: HazardDomain = HazardDomain::new();

impl HazardDomain {
    const fn new() -> Self {
        Self {
            records: AtomicPtr::new(ptr::null_mut()),
            orphans: AtomicPtr::new(ptr::null_mut()),
            retired: AtomicU64::new(0),
            reclaimed: AtomicU64::new(0),
            scans: AtomicU64::new(0),
        }
    }

    /// The process-wide domain
    pub fn global() -> &'static HazardDomain {
        &GLOBAL_DOMAIN
    }

    /// Snapshot of the reclamation counters
    pub fn stats(&self) -> ReclaimStats {
        ReclaimStats {
            retired: self.retired.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
            scans: self.scans.load(Ordering::Relaxed),
        }
    }

    /// Whether any slot currently publishes `ptr`
    pub fn is_protected<T>(&self, ptr: *const T) -> bool {
        fence(Ordering::SeqCst);
        let target = ptr as *mut ();
        self.iter_records().any(|record| {
            record
                .slots
                .iter()
                .any(|slot| slot.load(Ordering::Acquire) == target)
        })
    }

    /// Number of slots currently publishing an address
    pub fn active_slots(&self) -> usize {
        self.iter_records()
            .flat_map(|record| record.slots.iter())
            .filter(|slot| !slot.load(Ordering::Relaxed).is_null())
            .count()
    }

    fn iter_records(&self) -> impl Iterator<Item = &HazardRecord> {
        let mut cur = self.records.load(Ordering::Acquire);
        std::iter::from_fn(move || {
            if cur.is_null() {
                return None;
            }
            // SAFETY: records are leaked on creation and never freed.
            let record = unsafe { &*cur };
            cur = record.next.load(Ordering::Acquire);
            Some(record)
        })
    }

    /// Claim an inactive record or push a fresh one
    fn claim_record(&'static self) -> &'static HazardRecord {
        for record in self.iter_records() {
            if !record.active.load(Ordering::Relaxed)
                && record
                    .active
                    .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return record;
            }
        }

        let record: &'static HazardRecord = Box::leak(Box::new(HazardRecord::new_active()));
        let new = record as *const HazardRecord as *mut HazardRecord;
        let mut head = self.records.load(Ordering::Relaxed);
        loop {
            record.next.store(head, Ordering::Relaxed);
            match self
                .records
                .compare_exchange_weak(head, new, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return record,
                Err(actual) => head = actual,
            }
        }
    }

    fn release_record(&self, record: &HazardRecord) {
        record.clear();
        record.active.store(false, Ordering::Release);
    }

    /// Sorted snapshot of every published address
    fn hazards(&self) -> Vec<*mut ()> {
        // Pairs with the fence in `HazardGuard::set`.
        fence(Ordering::SeqCst);

        let mut hazards: Vec<*mut ()> = self
            .iter_records()
            .flat_map(|record| record.slots.iter())
            .map(|slot| slot.load(Ordering::Acquire))
            .filter(|ptr| !ptr.is_null())
            .collect();
        hazards.sort_unstable();
        hazards.dedup();
        hazards
    }

    fn push_orphans(&self, nodes: Vec<Retired>) {
        if nodes.is_empty() {
            return;
        }
        let batch = Box::into_raw(Box::new(OrphanBatch {
            nodes,
            next: ptr::null_mut(),
        }));
        let mut head = self.orphans.load(Ordering::Relaxed);
        loop {
            // SAFETY: `batch` is unpublished until the CAS succeeds.
            unsafe { (*batch).next = head };
            match self
                .orphans
                .compare_exchange_weak(head, batch, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    fn adopt_orphans(&self) -> Vec<Retired> {
        let mut cur = self.orphans.swap(ptr::null_mut(), Ordering::Acquire);
        let mut adopted = Vec::new();
        while !cur.is_null() {
            // SAFETY: the swap handed us exclusive ownership of the whole chain.
            let batch = unsafe { Box::from_raw(cur) };
            cur = batch.next;
            adopted.extend(batch.nodes);
        }
        adopted
    }

    /// Free every node no slot protects; return the survivors
    fn scan(&self, retired: Vec<Retired>) -> Vec<Retired> {
        self.scans.fetch_add(1, Ordering::Relaxed);
        if retired.is_empty() {
            return retired;
        }

        let hazards = self.hazards();
        let mut kept = Vec::new();
        let mut freed = 0u64;

        for node in retired {
            if hazards.binary_search(&node.ptr).is_ok() {
                kept.push(node);
            } else {
                // SAFETY: unlinked before retirement and absent from every slot.
                unsafe { node.reclaim() };
                freed += 1;
            }
        }

        self.reclaimed.fetch_add(freed, Ordering::Relaxed);
        tracing::trace!(freed, kept = kept.len(), "hazard scan");
        kept
    }
}

/// Per-thread hazard state
struct LocalHazards {
    domain: &'static HazardDomain,
    record: &'static HazardRecord,
    /// Bitmask of slots held by live guards
    in_use: Cell<u8>,
    retired: RefCell<Vec<Retired>>,
    since_scan: Cell<usize>,
}

impl LocalHazards {
    fn new() -> Self {
        let domain = HazardDomain::global();
        Self {
            domain,
            record: domain.claim_record(),
            in_use: Cell::new(0),
            retired: RefCell::new(Vec::with_capacity(RECLAIM_THRESHOLD * 2)),
            since_scan: Cell::new(0),
        }
    }

    fn claim_slot(&self) -> Option<usize> {
        let used = self.in_use.get();
        let index = (0..SLOTS_PER_RECORD).find(|&i| used & (1u8 << i) == 0)?;
        self.in_use.set(used | (1u8 << index));
        Some(index)
    }

    fn release_slot(&self, index: usize) {
        self.in_use.set(self.in_use.get() & !(1u8 << index));
    }

    fn retire(&self, node: Retired) {
        self.retired.borrow_mut().push(node);
        let count = self.since_scan.get() + 1;
        if count >= RECLAIM_THRESHOLD {
            self.since_scan.set(0);
            self.reclaim();
        } else {
            self.since_scan.set(count);
        }
    }

    fn reclaim(&self) -> usize {
        // Freed nodes may retire more nodes from their destructors, so no
        // borrow is held across the scan.
        let mut pending = std::mem::take(&mut *self.retired.borrow_mut());
        pending.extend(self.domain.adopt_orphans());
        let before = pending.len();
        let kept = self.domain.scan(pending);
        let freed = before - kept.len();
        self.retired.borrow_mut().extend(kept);
        freed
    }
}

impl Drop for LocalHazards {
    fn drop(&mut self) {
        let pending = std::mem::take(self.retired.get_mut());
        let kept = self.domain.scan(pending);
        self.domain.push_orphans(kept);

        if self.in_use.get() != 0 {
            // A guard kept in another thread-local outlives this one and
            // still writes to its slot, so the record is never reused.
            return;
        }
        self.record.clear();
        self.domain.release_record(self.record);
    }
}

thread_local! {
    static LOCAL: LocalHazards = LocalHazards::new();
}

enum SlotOwner {
    /// Slot index inside the thread's own record
    Local(usize),
    /// Extra record claimed because the thread's slots were exhausted
    Overflow(&'static HazardRecord),
}

/// A claimed hazard slot
///
/// The slot can be re-pointed any number of times; it is cleared and
/// returned to the thread when the guard drops.
pub struct HazardGuard {
    slot: &'static AtomicPtr<()>,
    owner: SlotOwner,
    _not_send: PhantomData<*mut ()>,
}

impl HazardGuard {
    /// Claim an empty slot for the calling thread
    pub fn new() -> Self {
        let local = LOCAL
            .try_with(|local| {
                let record: &'static HazardRecord = local.record;
                local
                    .claim_slot()
                    .map(|index| (&record.slots[index], index))
            })
            .ok()
            .flatten();

        match local {
            Some((slot, index)) => Self {
                slot,
                owner: SlotOwner::Local(index),
                _not_send: PhantomData,
            },
            None => {
                let record = HazardDomain::global().claim_record();
                Self {
                    slot: &record.slots[0],
                    owner: SlotOwner::Overflow(record),
                    _not_send: PhantomData,
                }
            }
        }
    }

    /// Publish `ptr`; it is visible to every scan before this returns
    pub fn set<T>(&self, ptr: *mut T) {
        self.slot.store(ptr.cast(), Ordering::Release);
        fence(Ordering::SeqCst);
    }

    /// Load `src` and publish it until the published value is still current
    ///
    /// The returned pointer cannot be freed while this guard protects it,
    /// provided nodes are only retired after being unlinked from `src`.
    pub fn protect<T>(&self, src: &AtomicPtr<T>) -> *mut T {
        let mut ptr = src.load(Ordering::Relaxed);
        loop {
            self.set(ptr);
            let current = src.load(Ordering::Acquire);
            if current == ptr {
                return ptr;
            }
            ptr = current;
        }
    }

    /// Stop protecting anything without giving up the slot
    pub fn reset(&self) {
        self.slot.store(ptr::null_mut(), Ordering::Release);
    }
}

impl Default for HazardGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for HazardGuard {
    fn drop(&mut self) {
        self.reset();
        match self.owner {
            SlotOwner::Local(index) => {
                let _ = LOCAL.try_with(|local| local.release_slot(index));
            }
            SlotOwner::Overflow(record) => HazardDomain::global().release_record(record),
        }
    }
}

/// Publish the calling thread's intent to dereference `ptr`
///
/// The caller must re-validate that `ptr` is still reachable after this
/// returns; [`HazardGuard::protect`] does both steps.
pub fn acquire<T>(ptr: *mut T) -> HazardGuard {
    let guard = HazardGuard::new();
    guard.set(ptr);
    guard
}

/// Defer freeing `ptr` until no hazard slot references it
///
/// # Safety
/// `ptr` must come from `Box::into_raw`, must already be unreachable for
/// threads that have not protected it, and must not be retired twice.
pub unsafe fn retire<T: Send>(ptr: *mut T) {
    let domain = HazardDomain::global();
    domain.retired.fetch_add(1, Ordering::Relaxed);

    let mut node = Some(Retired {
        ptr: ptr.cast(),
        reclaim: drop_boxed::<T>,
    });
    let _ = LOCAL.try_with(|local| {
        if let Some(node) = node.take() {
            local.retire(node);
        }
    });

    // Thread-local storage is already torn down
    if let Some(node) = node {
        domain.push_orphans(vec![node]);
    }
}

/// Scan now and free every retired node of this thread that is unprotected
///
/// Also adopts nodes orphaned by exited threads. Returns the number freed.
pub fn reclaim_if_possible() -> usize {
    LOCAL.try_with(|local| local.reclaim()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_retire_then_reclaim() {
        let drops = Arc::new(AtomicUsize::new(0));
        let node = Box::into_raw(Box::new(DropCounter(drops.clone())));

        unsafe { retire(node) };
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        reclaim_if_possible();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_protected_node_survives_scan() {
        let drops = Arc::new(AtomicUsize::new(0));
        let node = Box::into_raw(Box::new(DropCounter(drops.clone())));

        let guard = acquire(node);
        assert!(HazardDomain::global().is_protected(node));

        unsafe { retire(node) };
        reclaim_if_possible();
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        drop(guard);
        reclaim_if_possible();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_protection_from_other_thread() {
        let drops = Arc::new(AtomicUsize::new(0));
        let node = Box::into_raw(Box::new(DropCounter(drops.clone())));
        let addr = node as usize;

        let (published_tx, published_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();

        let holder = thread::spawn(move || {
            let guard = acquire(addr as *mut DropCounter);
            published_tx.send(()).unwrap();
            release_rx.recv().unwrap();
            drop(guard);
        });

        published_rx.recv().unwrap();
        unsafe { retire(node) };
        reclaim_if_possible();
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        release_tx.send(()).unwrap();
        holder.join().unwrap();

        reclaim_if_possible();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_guard_clears_slot_on_drop() {
        let value = Box::into_raw(Box::new(7u64));
        {
            let _guard = acquire(value);
            assert!(HazardDomain::global().is_protected(value));
        }
        assert!(!HazardDomain::global().is_protected(value));
        unsafe { drop(Box::from_raw(value)) };
    }

    #[test]
    fn test_protect_validates_source() {
        let first = Box::into_raw(Box::new(1u32));
        let src = AtomicPtr::new(first);

        let guard = HazardGuard::new();
        let ptr = guard.protect(&src);
        assert_eq!(ptr, first);
        assert!(HazardDomain::global().is_protected(first));

        drop(guard);
        unsafe { drop(Box::from_raw(first)) };
    }

    #[test]
    fn test_more_guards_than_slots() {
        let values: Vec<*mut u32> = (0..SLOTS_PER_RECORD as u32 + 3)
            .map(|i| Box::into_raw(Box::new(i)))
            .collect();

        let guards: Vec<HazardGuard> = values.iter().map(|&v| acquire(v)).collect();
        for &v in &values {
            assert!(HazardDomain::global().is_protected(v));
        }

        drop(guards);
        for &v in &values {
            assert!(!HazardDomain::global().is_protected(v));
            unsafe { drop(Box::from_raw(v)) };
        }
    }

    #[test]
    fn test_exiting_thread_hands_off_retired_nodes() {
        let drops = Arc::new(AtomicUsize::new(0));
        let node = Box::into_raw(Box::new(DropCounter(drops.clone())));
        let addr = node as usize;

        // Keep the node hazarded so the exiting thread cannot free it itself
        let guard = acquire(node);

        thread::spawn(move || unsafe { retire(addr as *mut DropCounter) })
            .join()
            .unwrap();
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        drop(guard);

        // Another thread's scan may adopt the orphan first; it frees it on
        // its own next scan or exit.
        let deadline = Instant::now() + Duration::from_secs(5);
        while drops.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            reclaim_if_possible();
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_threshold_triggers_scan() {
        let drops = Arc::new(AtomicUsize::new(0));
        thread::spawn({
            let drops = drops.clone();
            move || {
                for _ in 0..RECLAIM_THRESHOLD {
                    let node = Box::into_raw(Box::new(DropCounter(drops.clone())));
                    unsafe { retire(node) };
                }
                // No explicit reclaim: the cadence alone must have scanned
                assert_eq!(drops.load(Ordering::SeqCst), RECLAIM_THRESHOLD);
            }
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_guard_outliving_thread_state_keeps_record() {
        struct Holder {
            guard: Option<HazardGuard>,
            outlived_local: Arc<AtomicBool>,
        }

        impl Drop for Holder {
            fn drop(&mut self) {
                let gone = LOCAL.try_with(|_| ()).is_err();
                self.outlived_local.store(gone, Ordering::SeqCst);
                self.guard.take();
            }
        }

        thread_local! {
            static HELD: RefCell<Option<Holder>> = RefCell::new(None);
        }

        let outlived_local = Arc::new(AtomicBool::new(false));
        let value = Box::into_raw(Box::new(5u64));
        let addr = value as usize;

        let record = thread::spawn({
            let outlived_local = outlived_local.clone();
            move || {
                // Registered before LOCAL, so torn down after it
                HELD.with(|_| ());
                let guard = acquire(addr as *mut u64);
                let record = LOCAL.with(|local| local.record as *const HazardRecord as usize);
                HELD.with(|held| {
                    *held.borrow_mut() = Some(Holder {
                        guard: Some(guard),
                        outlived_local,
                    })
                });
                record
            }
        })
        .join()
        .unwrap();

        assert!(!HazardDomain::global().is_protected(value));
        if outlived_local.load(Ordering::SeqCst) {
            // Still owned, so no other thread was handed a slot the late
            // guard then cleared
            let record = HazardDomain::global()
                .iter_records()
                .find(|r| *r as *const HazardRecord as usize == record)
                .unwrap();
            assert!(record.active.load(Ordering::SeqCst));
        }
        unsafe { drop(Box::from_raw(value)) };
    }

    #[test]
    fn test_stats_pending() {
        let stats = ReclaimStats {
            retired: 10,
            reclaimed: 4,
            scans: 2,
        };
        assert_eq!(stats.pending(), 6);
    }
}
