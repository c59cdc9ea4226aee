//! Lock-free pool of hazard registries shared by all threads of one manager.

use crate::error::{Result, Status};
use crate::hazard_registry::HazardRegistry;
use crate::util::WrappedAlign64Type;
use std::collections::HashSet;
use std::ptr;
use std::sync::atomic::{fence, AtomicU64, AtomicUsize, Ordering};

const BITS_PER_CELL: usize = 64;

pub struct HazardStorage {
    slots_map: Box<[AtomicU64]>,
    registries: Box<[WrappedAlign64Type<HazardRegistry>]>,
    high_water_mark: AtomicUsize,
}

impl HazardStorage {
    /// Create storage for at least `thread_maxcount` registries of `(8 << registry_log2) - 1`
    /// slots each. The count is rounded up to a multiple of 64, the granularity of the usage map.
    pub fn new(thread_maxcount: usize, registry_log2: u32) -> HazardStorage {
        assert!(0 < thread_maxcount, "hazard storage needs at least one registry");
        let slot_count = Self::slotcount(thread_maxcount);
        HazardStorage {
            slots_map: (0..slot_count / BITS_PER_CELL)
                .map(|_| AtomicU64::new(0))
                .collect(),
            registries: (0..slot_count)
                .map(|idx| WrappedAlign64Type(HazardRegistry::with_index(registry_log2, idx)))
                .collect(),
            high_water_mark: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn slotcount(requested_count: usize) -> usize {
        (requested_count + BITS_PER_CELL - 1) / BITS_PER_CELL * BITS_PER_CELL
    }

    /// The maximum count of registered threads.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.registries.len()
    }

    /// One past the highest registry position ever handed out.
    #[inline]
    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark.load(Ordering::Acquire)
    }

    /// Count of registries currently in use.
    pub fn used_count(&self) -> usize {
        self.slots_map
            .iter()
            .map(|cell| cell.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }

    /// Claim a free registry. Thread-safe, lock-free.
    pub fn allocate_slot(&self) -> Result<&HazardRegistry> {
        for (cell_idx, cell) in self.slots_map.iter().enumerate() {
            let mut bits = cell.load(Ordering::Relaxed);
            while std::u64::MAX != bits {
                let bit = (!bits).trailing_zeros() as usize;
                match cell.compare_exchange_weak(
                    bits,
                    bits | (1u64 << bit),
                    Ordering::Acquire,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let pos = cell_idx * BITS_PER_CELL + bit;
                        self.high_water_mark.fetch_max(pos + 1, Ordering::AcqRel);
                        return Ok(&self.registries[pos]);
                    }
                    Err(actual) => bits = actual,
                }
            }
        }
        warn!(
            "attempt to allocate more than {} hazard registry slots, \
             reduce thread count or increase hazard storage capacity",
            self.capacity()
        );
        Err(Status::StorageExhausted)
    }

    /// Give a registry back. Its contents are cleared, the registry itself stays in place since
    /// other threads may be scanning it.
    ///
    /// # Panics
    ///
    /// Panics if the registry does not belong to this storage or is not allocated.
    pub fn release_slot(&self, registry: &HazardRegistry) {
        let pos = registry.index();
        assert!(
            pos < self.capacity() && ptr::eq(&*self.registries[pos], registry),
            "Attempt to release a hazard registry that does not belong to the storage"
        );
        registry.reset();
        let bit = 1u64 << (pos % BITS_PER_CELL);
        let prev = self.slots_map[pos / BITS_PER_CELL].fetch_and(!bit, Ordering::Release);
        assert!(0 != prev & bit, "Attempt to release a free hazard registry");
    }

    /// Registry at position `pos`; used to resolve the position kept by a thread record.
    #[inline]
    pub(crate) fn registry(&self, pos: usize) -> &HazardRegistry {
        &self.registries[pos]
    }

    /// Every address currently published by any registry of this storage.
    pub fn protected_addresses(&self) -> HashSet<usize> {
        fence(Ordering::SeqCst);
        let mut protected = HashSet::new();
        let high_water_mark = self.high_water_mark();
        for registry in self.registries[..high_water_mark].iter() {
            registry.for_each_hazard(|addr| {
                protected.insert(addr);
            });
        }
        protected
    }
}

#[cfg(test)]
mod test {
    use crate::error::Status;
    use crate::hazard_registry::HazardRegistry;
    use crate::hazard_storage::HazardStorage;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_capacity() {
        assert_eq!(HazardStorage::new(1, 0).capacity(), 64);
        assert_eq!(HazardStorage::new(64, 0).capacity(), 64);
        assert_eq!(HazardStorage::new(65, 0).capacity(), 128);
        assert_eq!(HazardStorage::new(128, 0).capacity(), 128);
    }

    #[test]
    fn test_allocate_release() {
        let storage = HazardStorage::new(64, 0);
        let r0 = storage.allocate_slot().unwrap();
        let r1 = storage.allocate_slot().unwrap();
        assert!(!std::ptr::eq(r0, r1));
        assert_eq!(storage.used_count(), 2);
        assert_eq!(storage.high_water_mark(), 2);

        r0.register(8 as *const ());
        storage.release_slot(r0);
        assert_eq!(storage.used_count(), 1);
        let r2 = storage.allocate_slot().unwrap();
        // The released registry is reused and comes back empty
        assert!(std::ptr::eq(r0, r2));
        assert!(r2.is_empty());
        assert_eq!(storage.high_water_mark(), 2);
    }

    #[test]
    fn test_exhausted() {
        let storage = HazardStorage::new(64, 0);
        let all: Vec<_> = (0..64).map(|_| storage.allocate_slot().unwrap()).collect();
        assert_eq!(storage.allocate_slot().err(), Some(Status::StorageExhausted));
        storage.release_slot(all[17]);
        assert!(std::ptr::eq(storage.allocate_slot().unwrap(), all[17]));
    }

    #[test]
    #[should_panic(expected = "does not belong")]
    fn test_release_foreign() {
        let storage = HazardStorage::new(64, 0);
        let foreign = HazardRegistry::new(0);
        storage.release_slot(&foreign);
    }

    #[test]
    #[should_panic(expected = "free hazard registry")]
    fn test_release_twice() {
        let storage = HazardStorage::new(64, 0);
        let registry = storage.allocate_slot().unwrap();
        storage.release_slot(registry);
        storage.release_slot(registry);
    }

    #[test]
    fn test_protected_addresses() {
        let storage = HazardStorage::new(64, 0);
        let r0 = storage.allocate_slot().unwrap();
        let r1 = storage.allocate_slot().unwrap();
        r0.register(8 as *const ());
        r1.register(16 as *const ());
        let slot = r1.register(24 as *const ());
        r1.unregister(slot);
        let expected: HashSet<usize> = vec![8, 16].into_iter().collect();
        assert_eq!(storage.protected_addresses(), expected);
    }

    #[test]
    fn test_concurrent_allocate() {
        let storage = Arc::new(HazardStorage::new(128, 0));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let storage = storage.clone();
                thread::spawn(move || {
                    (0..16)
                        .map(|_| storage.allocate_slot().unwrap().index())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut seen = HashSet::new();
        for t in threads {
            for idx in t.join().unwrap() {
                assert!(seen.insert(idx));
            }
        }
        assert_eq!(seen.len(), 128);
        assert_eq!(storage.used_count(), 128);
        assert_eq!(storage.allocate_slot().err(), Some(Status::StorageExhausted));
    }
}
