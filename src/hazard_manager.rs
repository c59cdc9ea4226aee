//! Definition and implementations of `HazardManager`
//!
//! A `HazardManager` is the reclamation engine shared by every container of one kind. It owns
//! a `HazardStorage`; each thread that touches the manager gets its own `ThreadRecord` holding
//! one registry of that storage plus a local list of retired nodes.
//!
//! Thread records live in a small per-thread table keyed by manager identity. A record keeps
//! its manager alive, so a manager is never destroyed under a thread that still uses it, and a
//! record is never destroyed under a live hazard pointer, which holds the record.
//!
//! Retired nodes are reclaimed by a scan: collect every address published by any registry of
//! the manager, then reclaim every retired node whose address is not in that set. A scan is
//! triggered when the local list reaches `retire_threshold` or when `scan_period_us` passed
//! since the previous one. Nodes left over by a detaching thread go to the manager's orphan
//! list, which the next scan of any thread adopts.

use crate::error::{Result, Status};
use crate::hazard_pointer::HazardPointer;
use crate::hazard_registry::{HazardRegistry, HAZARD_MAX_LOG2};
use crate::hazard_storage::HazardStorage;
use crate::util::{self, WrappedAlign64Type};
use std::alloc::{self, Layout};
use std::cell::{Cell, RefCell};
use std::mem;
use std::ptr::{self, NonNull};
use std::rc::Rc;
use std::sync::atomic::{AtomicI64, AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

cfg_if! {
    if #[cfg(feature = "max_thread_count_4096")] {
        pub const MAX_THREAD_COUNT: usize = 4096;
    } else if #[cfg(feature = "max_thread_count_256")] {
        pub const MAX_THREAD_COUNT: usize = 256;
    } else if #[cfg(feature = "max_thread_count_16")] {
        pub const MAX_THREAD_COUNT: usize = 16;
    } else {
        /// Default maximum count of threads attached to one manager
        pub const MAX_THREAD_COUNT: usize = 128;
    }
}

/// Tuning of a `HazardManager`.
#[derive(Clone, Debug, PartialEq)]
pub struct HazardConfig {
    /// Maximum count of threads attached at the same time, rounded up to a multiple of 64
    pub thread_maxcount: usize,
    /// Per-thread hazard slots are `(8 << registry_log2) - 1`, `registry_log2 <= 3`
    pub registry_log2: u32,
    /// Local retired nodes that trigger a scan
    pub retire_threshold: usize,
    /// Microseconds after which a retirement triggers a scan regardless of the threshold
    pub scan_period_us: i64,
}

impl Default for HazardConfig {
    fn default() -> Self {
        HazardConfig {
            thread_maxcount: MAX_THREAD_COUNT,
            registry_log2: 0,
            retire_threshold: 64,
            scan_period_us: 200_000,
        }
    }
}

impl HazardConfig {
    pub fn thread_maxcount(mut self, thread_maxcount: usize) -> Self {
        self.thread_maxcount = thread_maxcount;
        self
    }

    pub fn registry_log2(mut self, registry_log2: u32) -> Self {
        self.registry_log2 = registry_log2;
        self
    }

    pub fn retire_threshold(mut self, retire_threshold: usize) -> Self {
        self.retire_threshold = retire_threshold;
        self
    }

    pub fn scan_period_us(mut self, scan_period_us: i64) -> Self {
        self.scan_period_us = scan_period_us;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if 0 == self.thread_maxcount || HAZARD_MAX_LOG2 < self.registry_log2 {
            warn!("invalid hazard config {:?}", self);
            return Err(Status::InvalidParam);
        }
        Ok(())
    }
}

/// A retired node and the function that destroys and deallocates it.
#[derive(Copy, Clone)]
pub(crate) struct RetirementRecord {
    addr: usize,
    reclaimer: unsafe fn(*mut ()),
}

impl RetirementRecord {
    #[inline]
    unsafe fn reclaim(self) {
        (self.reclaimer)(self.addr as *mut ())
    }
}

struct OrphanNode {
    record: RetirementRecord,
    next: *mut OrphanNode,
}

#[cfg(test)]
thread_local! {
    // 1: the retirement list cannot grow; 2: no orphan node can be allocated either.
    static FAILING_GROWTH: Cell<u32> = Cell::new(0);
}

#[cfg(test)]
fn growth_fails(level: u32) -> bool {
    FAILING_GROWTH.with(|f| f.get() >= level)
}

#[cfg(not(test))]
#[inline]
fn growth_fails(_: u32) -> bool {
    false
}

fn reserve_retired(retired: &mut Vec<RetirementRecord>) -> bool {
    !growth_fails(1) && (retired.len() < retired.capacity() || retired.try_reserve(1).is_ok())
}

// Fallible counterpart of `Box::new`; the result may be turned into a `Box`.
fn try_new_orphan(record: RetirementRecord) -> Option<NonNull<OrphanNode>> {
    if growth_fails(2) {
        return None;
    }
    let node = NonNull::new(unsafe { alloc::alloc(Layout::new::<OrphanNode>()) })?
        .cast::<OrphanNode>();
    unsafe {
        ptr::write(
            node.as_ptr(),
            OrphanNode {
                record,
                next: ptr::null_mut(),
            },
        )
    };
    Some(node)
}

struct ManagerInner {
    config: HazardConfig,
    storage: HazardStorage,
    handles: AtomicUsize,
    orphans: WrappedAlign64Type<AtomicPtr<OrphanNode>>,
    hazard_waiting_count: WrappedAlign64Type<AtomicI64>,
    reclaimed_count: AtomicU64,
}

impl ManagerInner {
    fn push_orphans(&self, records: Vec<RetirementRecord>) {
        if records.is_empty() {
            return;
        }
        let mut head = ptr::null_mut::<OrphanNode>();
        let mut tail = ptr::null_mut::<OrphanNode>();
        for record in records {
            head = Box::into_raw(Box::new(OrphanNode { record, next: head }));
            if tail.is_null() {
                tail = head;
            }
        }
        self.push_orphan_chain(head, tail);
    }

    fn push_orphan_chain(&self, head: *mut OrphanNode, tail: *mut OrphanNode) {
        let mut old = self.orphans.load(Ordering::Relaxed);
        loop {
            unsafe { (*tail).next = old };
            match self
                .orphans
                .compare_exchange_weak(old, head, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => old = actual,
            }
        }
    }

    fn take_orphans(&self, receiver: &mut Vec<RetirementRecord>) -> usize {
        let mut iter = self.orphans.swap(ptr::null_mut(), Ordering::Acquire);
        let mut count = 0;
        while !iter.is_null() {
            let node = unsafe { Box::from_raw(iter) };
            receiver.push(node.record);
            iter = node.next;
            count += 1;
        }
        count
    }

    fn reclaimed(&self, count: usize) {
        self.hazard_waiting_count
            .fetch_sub(count as i64, Ordering::Relaxed);
        self.reclaimed_count
            .fetch_add(count as u64, Ordering::Relaxed);
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        // No thread record is left, hence no hazard pointer either.
        let mut records = Vec::new();
        self.take_orphans(&mut records);
        let count = records.len();
        for record in records {
            unsafe { record.reclaim() };
        }
        self.reclaimed(count);
        debug!("hazard manager destroyed, {} orphans reclaimed", count);
    }
}

/// The pairing of the calling thread with one manager.
pub struct ThreadRecord {
    manager: Arc<ManagerInner>,
    registry: usize,
    retired: RefCell<Vec<RetirementRecord>>,
    scanning: Cell<bool>,
    last_scan_us: Cell<i64>,
}

impl ThreadRecord {
    /// This thread's hazard registry.
    #[inline]
    pub fn registry(&self) -> &HazardRegistry {
        self.manager.storage.registry(self.registry)
    }

    /// Count of nodes retired by this thread and not yet reclaimed.
    pub fn retired_count(&self) -> usize {
        self.retired.borrow().len()
    }

    /// Register `node` for postponed reclamation by `reclaimer`.
    ///
    /// # Safety
    ///
    /// `node` must be already unreachable for threads that do not hold a hazard pointer to it,
    /// must not be retired twice, and `reclaimer` must be the right destructor for it.
    pub unsafe fn mark_for_cleanup(&self, node: *mut (), reclaimer: unsafe fn(*mut ())) -> Result<()> {
        assert!(!node.is_null(), "null node passed to mark_for_cleanup");
        let record = RetirementRecord {
            addr: node as usize,
            reclaimer,
        };
        self.manager
            .hazard_waiting_count
            .fetch_add(1, Ordering::Relaxed);

        let mut ret = Ok(());
        let pushed = {
            let mut retired = self.retired.borrow_mut();
            if reserve_retired(&mut retired) {
                retired.push(record);
                true
            } else {
                false
            }
        };
        if !pushed {
            ret = Err(Status::OutOfMemory);
            match try_new_orphan(record) {
                Some(node) => {
                    warn!(
                        "cannot grow retirement list of {} nodes, node {:#x} parked as orphan",
                        self.retired_count(),
                        record.addr
                    );
                    self.manager
                        .push_orphan_chain(node.as_ptr(), node.as_ptr());
                }
                None => {
                    // Never reclaimed.
                    error!(
                        "out of memory, retired node {:#x} is leaked",
                        record.addr
                    );
                    self.manager
                        .hazard_waiting_count
                        .fetch_sub(1, Ordering::Relaxed);
                }
            }
        }

        if !self.scanning.get()
            && (self.retired_count() >= self.manager.config.retire_threshold
                || self.last_scan_us.get() + self.manager.config.scan_period_us
                    <= util::get_cur_microseconds_time())
        {
            self.scan();
        }
        ret
    }

    /// Reclaim every node retired by this thread, plus adopted orphans, that no registry
    /// publishes. Returns the count of reclaimed nodes.
    pub fn scan(&self) -> usize {
        if self.scanning.replace(true) {
            return 0;
        }
        let mut candidates = mem::replace(&mut *self.retired.borrow_mut(), Vec::new());
        let adopted = self.manager.take_orphans(&mut candidates);
        if 0 != adopted {
            debug!("thread {} adopted {} orphans", util::get_thread_id(), adopted);
        }

        let protected = self.manager.storage.protected_addresses();
        let mut split = candidates.len();
        let mut idx = 0;
        while idx < split {
            if protected.contains(&candidates[idx].addr) {
                idx += 1;
            } else {
                split -= 1;
                candidates.swap(idx, split);
            }
        }
        let reclaim_count = candidates.len() - split;
        for record in candidates.drain(split..) {
            unsafe { record.reclaim() };
        }
        self.manager.reclaimed(reclaim_count);

        {
            let mut retired = self.retired.borrow_mut();
            if retired.is_empty() {
                mem::swap(&mut *retired, &mut candidates);
            } else {
                retired.extend(candidates.drain(..));
            }
        }
        trace!(
            "thread {} scan: reclaimed {}, kept {}, protected {}",
            util::get_thread_id(),
            reclaim_count,
            self.retired_count(),
            protected.len()
        );
        self.last_scan_us.set(util::get_cur_microseconds_time());
        self.scanning.set(false);
        reclaim_count
    }

    fn same_manager(&self, manager: &Arc<ManagerInner>) -> bool {
        Arc::ptr_eq(&self.manager, manager)
    }

    fn is_stale(&self) -> bool {
        0 == self.manager.handles.load(Ordering::Acquire)
    }
}

impl Drop for ThreadRecord {
    fn drop(&mut self) {
        let registry = self.manager.storage.registry(self.registry);
        debug_assert!(registry.is_empty());
        self.manager.storage.release_slot(registry);
        self.scan();
        let leftovers = mem::replace(&mut *self.retired.borrow_mut(), Vec::new());
        debug!(
            "thread {} detached from hazard registry {}, {} nodes left as orphans",
            util::get_thread_id(),
            self.registry,
            leftovers.len()
        );
        self.manager.push_orphans(leftovers);
    }
}

thread_local! {
    static LOCAL_RECORDS: RefCell<Vec<Rc<ThreadRecord>>> = RefCell::new(Vec::new());
}

/// Handle of a reclamation engine instance, one per container kind. Cloning is cheap and all
/// clones refer to the same engine.
pub struct HazardManager {
    inner: Arc<ManagerInner>,
}

impl Default for HazardManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for HazardManager {
    fn clone(&self) -> Self {
        self.inner.handles.fetch_add(1, Ordering::Relaxed);
        HazardManager {
            inner: self.inner.clone(),
        }
    }
}

impl Drop for HazardManager {
    fn drop(&mut self) {
        self.inner.handles.fetch_sub(1, Ordering::Release);
    }
}

impl HazardManager {
    /// Manager with `HazardConfig::default()`.
    ///
    /// # Examples
    ///
    /// ```
    /// use rs_cds::hazard_manager::{HazardManager, MAX_THREAD_COUNT};
    ///
    /// let manager = HazardManager::new();
    /// assert_eq!(manager.storage().capacity(), MAX_THREAD_COUNT);
    /// ```
    pub fn new() -> HazardManager {
        Self::from_valid_config(HazardConfig::default())
    }

    /// Manager with explicit tuning.
    ///
    /// # Examples
    ///
    /// ```
    /// use rs_cds::hazard_manager::{HazardConfig, HazardManager};
    /// use rs_cds::error::Status;
    ///
    /// let config = HazardConfig::default().thread_maxcount(8).registry_log2(1);
    /// let manager = HazardManager::with_config(config).unwrap();
    /// assert_eq!(manager.storage().capacity(), 64);
    ///
    /// let bad = HazardConfig::default().registry_log2(4);
    /// assert_eq!(HazardManager::with_config(bad).err(), Some(Status::InvalidParam));
    /// ```
    pub fn with_config(config: HazardConfig) -> Result<HazardManager> {
        config.validate()?;
        Ok(Self::from_valid_config(config))
    }

    pub(crate) fn from_valid_config(config: HazardConfig) -> HazardManager {
        let storage = HazardStorage::new(config.thread_maxcount, config.registry_log2);
        HazardManager {
            inner: Arc::new(ManagerInner {
                config,
                storage,
                handles: AtomicUsize::new(1),
                orphans: WrappedAlign64Type(AtomicPtr::new(ptr::null_mut())),
                hazard_waiting_count: WrappedAlign64Type(AtomicI64::new(0)),
                reclaimed_count: AtomicU64::new(0),
            }),
        }
    }

    #[inline]
    pub fn config(&self) -> &HazardConfig {
        &self.inner.config
    }

    #[inline]
    pub fn storage(&self) -> &HazardStorage {
        &self.inner.storage
    }

    /// True if both handles refer to the same engine.
    #[inline]
    pub fn same_manager(&self, other: &HazardManager) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// The calling thread's record for this manager, attaching the thread on first use.
    pub fn local(&self) -> Result<Rc<ThreadRecord>> {
        let found = LOCAL_RECORDS
            .try_with(|records| {
                records
                    .borrow()
                    .iter()
                    .find(|r| r.same_manager(&self.inner))
                    .cloned()
            })
            .map_err(|_| Status::ThreadDetached)?;
        match found {
            Some(record) => Ok(record),
            None => self.attach(),
        }
    }

    fn attach(&self) -> Result<Rc<ThreadRecord>> {
        let stale = Self::take_stale_records();
        let registry = self.inner.storage.allocate_slot()?;
        let record = Rc::new(ThreadRecord {
            manager: self.inner.clone(),
            registry: registry.index(),
            retired: RefCell::new(Vec::new()),
            scanning: Cell::new(false),
            last_scan_us: Cell::new(util::get_cur_microseconds_time()),
        });
        debug!(
            "thread {} attached to hazard registry {}",
            util::get_thread_id(),
            registry.index()
        );
        LOCAL_RECORDS
            .try_with(|records| records.borrow_mut().push(record.clone()))
            .map_err(|_| Status::ThreadDetached)?;
        drop(stale);
        Ok(record)
    }

    // Records of managers no handle refers to anymore. Dropped by the caller, outside of the
    // table borrow, since dropping a record runs reclaimers.
    fn take_stale_records() -> Vec<Rc<ThreadRecord>> {
        LOCAL_RECORDS
            .try_with(|records| {
                let mut records = records.borrow_mut();
                let mut stale = Vec::new();
                let mut idx = 0;
                while idx < records.len() {
                    if records[idx].is_stale() && 1 == Rc::strong_count(&records[idx]) {
                        stale.push(records.swap_remove(idx));
                    } else {
                        idx += 1;
                    }
                }
                stale
            })
            .unwrap_or_default()
    }

    /// Release the calling thread's registry. Nodes it retired and could not reclaim yet are
    /// handed over to the other threads of the manager. The registry is actually released
    /// once the last hazard pointer of this thread is dropped.
    pub fn detach_current_thread(&self) {
        let record = LOCAL_RECORDS
            .try_with(|records| {
                let mut records = records.borrow_mut();
                records
                    .iter()
                    .position(|r| r.same_manager(&self.inner))
                    .map(|pos| records.swap_remove(pos))
            })
            .unwrap_or(None);
        drop(record);
    }

    /// Mark `ptr` as a hazard in the calling thread's registry.
    pub fn hazard_pointer<T>(&self, ptr: *mut T) -> Result<HazardPointer<T>> {
        HazardPointer::new(&self.local()?, ptr)
    }

    /// Register `node` for postponed reclamation by `reclaimer`.
    ///
    /// # Safety
    ///
    /// See `ThreadRecord::mark_for_cleanup`.
    pub unsafe fn mark_for_cleanup(&self, node: *mut (), reclaimer: unsafe fn(*mut ())) -> Result<()> {
        self.local()?.mark_for_cleanup(node, reclaimer)
    }

    /// Reclaim now everything the calling thread can. Returns the count of reclaimed nodes.
    pub fn reclaim(&self) -> Result<usize> {
        Ok(self.local()?.scan())
    }

    /// Count of retired nodes not reclaimed yet, over all threads.
    #[inline]
    pub fn pending_count(&self) -> i64 {
        self.inner.hazard_waiting_count.load(Ordering::Relaxed)
    }

    /// Count of nodes reclaimed since creation.
    #[inline]
    pub fn reclaimed_count(&self) -> u64 {
        self.inner.reclaimed_count.load(Ordering::Relaxed)
    }
}
