//! Per-thread registry of published hazard pointers.
//!
//! A registry is written only by the thread that owns it. Any other thread may scan it while
//! computing the set of protected addresses, so every store that publishes or withdraws an
//! address is a release store and the scan uses acquire loads.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Returned by `HazardRegistry::register` when every slot is occupied.
pub const HAZARD_BADCALL: i32 = 0xBADD_CA11_u32 as i32;

/// Slot count of a registry built with `log2 == 0`.
pub const HAZARD_DEFAULT_CAPACITY: usize = 7;

/// The largest accepted `log2`; gives 63 slots, one bit of the occupancy word each.
pub const HAZARD_MAX_LOG2: u32 = 3;

pub struct HazardRegistry {
    index: usize,
    occupied: AtomicU64,
    hazards: Box<[AtomicUsize]>,
}

impl HazardRegistry {
    /// Slot count for a given `log2`: `(8 << log2) - 1`.
    #[inline]
    pub fn capacity_for(log2: u32) -> usize {
        assert!(
            log2 <= HAZARD_MAX_LOG2,
            "The capacity of hazard registry cannot exceed 63 pointers, log2={} is too big",
            log2
        );
        (8 << log2) - 1
    }

    pub fn new(log2: u32) -> HazardRegistry {
        Self::with_index(log2, 0)
    }

    pub(crate) fn with_index(log2: u32, index: usize) -> HazardRegistry {
        let capacity = Self::capacity_for(log2);
        HazardRegistry {
            index,
            occupied: AtomicU64::new(0),
            hazards: (0..capacity).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    /// The maximum count of hazard pointers registered at the same time.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.hazards.len()
    }

    /// Position of this registry inside its storage.
    #[inline]
    pub(crate) fn index(&self) -> usize {
        self.index
    }

    #[inline]
    fn slot_mask(&self) -> u64 {
        (1u64 << self.capacity()) - 1
    }

    /// Publish `ptr` in a free slot and return the slot index, or `HAZARD_BADCALL` when no slot
    /// is free. A full registry is left untouched.
    ///
    /// The returned index is only meaningful to the calling thread.
    pub fn register(&self, ptr: *const ()) -> i32 {
        assert!(!ptr.is_null(), "null pointer passed to hazard registry");
        let occupied = self.occupied.load(Ordering::Relaxed);
        let free = !occupied & self.slot_mask();
        if 0 == free {
            return HAZARD_BADCALL;
        }
        let slot = free.trailing_zeros() as usize;
        self.hazards[slot].store(ptr as usize, Ordering::Release);
        self.occupied
            .store(occupied | (1u64 << slot), Ordering::Release);
        slot as i32
    }

    /// Point an already occupied slot at another address.
    pub fn republish(&self, slot: i32, ptr: *const ()) {
        assert!(!ptr.is_null(), "null pointer passed to hazard registry");
        self.check_occupied(slot, "republish");
        self.hazards[slot as usize].store(ptr as usize, Ordering::Release);
    }

    /// Withdraw the address published in `slot`.
    ///
    /// # Panics
    ///
    /// Panics if `slot` is out of range or not occupied: that is a hazard pointer lifetime bug.
    pub fn unregister(&self, slot: i32) {
        self.check_occupied(slot, "unregister");
        let occupied = self.occupied.load(Ordering::Relaxed);
        self.hazards[slot as usize].store(0, Ordering::Release);
        self.occupied
            .store(occupied & !(1u64 << slot), Ordering::Release);
    }

    fn check_occupied(&self, slot: i32, op: &str) {
        if slot < 0
            || slot as usize >= self.capacity()
            || 0 == self.occupied.load(Ordering::Relaxed) & (1u64 << slot)
        {
            panic!(
                "Invalid hazard pointer slot index {} passed to {}",
                slot, op
            );
        }
    }

    /// Address published in `slot`, 0 if none.
    #[inline]
    pub fn hazard(&self, slot: i32) -> usize {
        if slot < 0 || slot as usize >= self.capacity() {
            return 0;
        }
        self.hazards[slot as usize].load(Ordering::Acquire)
    }

    #[inline]
    pub fn occupied_count(&self) -> usize {
        self.occupied.load(Ordering::Acquire).count_ones() as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        0 == self.occupied.load(Ordering::Acquire)
    }

    /// Call `f` with every published address. Safe to run from any thread.
    pub fn for_each_hazard<F>(&self, mut f: F)
    where
        F: FnMut(usize),
    {
        let mut occupied = self.occupied.load(Ordering::Acquire);
        while 0 != occupied {
            let slot = occupied.trailing_zeros() as usize;
            occupied &= occupied - 1;
            let addr = self.hazards[slot].load(Ordering::Acquire);
            if 0 != addr {
                f(addr);
            }
        }
    }

    /// Clear every slot. Only valid once the owning thread has given the registry up.
    pub(crate) fn reset(&self) {
        for hazard in self.hazards.iter() {
            hazard.store(0, Ordering::Relaxed);
        }
        self.occupied.store(0, Ordering::Release);
    }
}
