//! Hazard pointer guard.
//!
//! A `HazardPointer` marks a node as being accessed by the current thread. While it is marked,
//! no thread reclaims the node even if it gets retired. Marking alone is not enough: the node
//! may have been retired before the mark became visible, so a pointer loaded from a shared link
//! must be validated against that link after marking. `protect_link` does both.
//!
//! Guards hold an `Rc` of the thread record and therefore can never be passed between threads.

use crate::error::{Result, Status};
use crate::hazard_manager::ThreadRecord;
use crate::hazard_registry::HAZARD_BADCALL;
use crate::util;
use std::fmt;
use std::ptr;
use std::rc::Rc;
use std::sync::atomic::{fence, AtomicPtr, AtomicUsize, Ordering};

pub struct HazardPointer<T> {
    record: Rc<ThreadRecord>,
    slot: i32,
    ptr: *mut T,
}

impl<T> HazardPointer<T> {
    /// A guard that protects nothing yet. It takes a registry slot on the first `mark`.
    pub fn empty(record: &Rc<ThreadRecord>) -> HazardPointer<T> {
        HazardPointer {
            record: record.clone(),
            slot: HAZARD_BADCALL,
            ptr: ptr::null_mut(),
        }
    }

    /// Mark `ptr` as a hazard pointer.
    pub fn new(record: &Rc<ThreadRecord>, ptr: *mut T) -> Result<HazardPointer<T>> {
        let mut hp = Self::empty(record);
        hp.mark(ptr)?;
        Ok(hp)
    }

    /// Re-point this guard at `ptr`; a null `ptr` resets it. The previous pointer is no longer
    /// protected after this call.
    pub fn mark(&mut self, ptr: *mut T) -> Result<()> {
        if ptr.is_null() {
            self.reset();
            return Ok(());
        }
        let registry = self.record.registry();
        if HAZARD_BADCALL == self.slot {
            let slot = registry.register(ptr as *const ());
            if HAZARD_BADCALL == slot {
                warn!(
                    "hazard registry of thread {} is full, capacity={}",
                    util::get_thread_id(),
                    registry.capacity()
                );
                return Err(Status::RegistryFull);
            }
            self.slot = slot;
        } else {
            registry.republish(self.slot, ptr as *const ());
        }
        self.ptr = ptr;
        // Order the publication before any validating load.
        fence(Ordering::SeqCst);
        Ok(())
    }

    /// Protect the node a tagged link word refers to. Returns the link value the protection
    /// was validated against; its mark bit is kept, the protected pointer is the unmarked one.
    pub fn protect_link(&mut self, src: &AtomicUsize) -> Result<usize> {
        let mut link = src.load(Ordering::Acquire);
        loop {
            self.mark(util::unmarked(link) as *mut T)?;
            let current = src.load(Ordering::Acquire);
            if current == link {
                return Ok(link);
            }
            link = current;
        }
    }

    /// Protect the node an atomic pointer refers to.
    pub fn protect(&mut self, src: &AtomicPtr<T>) -> Result<*mut T> {
        let mut ptr = src.load(Ordering::Acquire);
        loop {
            self.mark(ptr)?;
            let current = src.load(Ordering::Acquire);
            if current == ptr {
                return Ok(ptr);
            }
            ptr = current;
        }
    }

    #[inline]
    pub fn get(&self) -> *mut T {
        self.ptr
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.ptr.is_null()
    }

    /// # Safety
    ///
    /// The pointer must have been validated as reachable after it was marked.
    #[inline]
    pub unsafe fn as_ref(&self) -> Option<&T> {
        self.ptr.as_ref()
    }

    /// Mark the pointer as safe for reclaim.
    pub fn reset(&mut self) {
        if HAZARD_BADCALL != self.slot {
            self.record.registry().unregister(self.slot);
            self.slot = HAZARD_BADCALL;
        }
        self.ptr = ptr::null_mut();
    }

    /// Thread record this guard publishes into.
    #[inline]
    pub fn record(&self) -> &Rc<ThreadRecord> {
        &self.record
    }
}

impl<T> Drop for HazardPointer<T> {
    fn drop(&mut self) {
        self.reset();
    }
}

impl<T> fmt::Debug for HazardPointer<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("HazardPointer")
            .field("slot", &self.slot)
            .field("ptr", &self.ptr)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use crate::error::Status;
    use crate::hazard_manager::{HazardConfig, HazardManager};
    use crate::hazard_pointer::HazardPointer;
    use crate::util;
    use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

    #[test]
    fn test_mark_reset() {
        let manager = HazardManager::new();
        let mut value = String::from("Hello, world!");
        let hp = manager.hazard_pointer(&mut value as *mut String).unwrap();
        assert!(!hp.is_null());
        assert_eq!(unsafe { hp.as_ref() }.unwrap(), "Hello, world!");
        let registry = hp.record().registry();
        assert_eq!(registry.occupied_count(), 1);
        assert!(manager
            .storage()
            .protected_addresses()
            .contains(&(&value as *const String as usize)));
        drop(hp);
        assert!(manager.local().unwrap().registry().is_empty());
    }

    #[test]
    fn test_null_takes_no_slot() {
        let manager = HazardManager::new();
        let hp = manager.hazard_pointer(std::ptr::null_mut::<f64>()).unwrap();
        assert!(hp.is_null());
        assert!(manager.local().unwrap().registry().is_empty());
    }

    #[test]
    fn test_remark_reuses_slot() {
        let manager = HazardManager::new();
        let record = manager.local().unwrap();
        let mut a = 1u64;
        let mut b = 2u64;
        let mut hp = HazardPointer::empty(&record);
        hp.mark(&mut a).unwrap();
        hp.mark(&mut b).unwrap();
        assert_eq!(record.registry().occupied_count(), 1);
        assert_eq!(unsafe { *hp.as_ref().unwrap() }, 2);
        hp.mark(std::ptr::null_mut()).unwrap();
        assert!(record.registry().is_empty());
    }

    #[test]
    fn test_registry_full() {
        let manager = HazardManager::with_config(HazardConfig::default().registry_log2(0)).unwrap();
        let mut values = [0u64; 8];
        let base = values.as_mut_ptr();
        let held: Vec<_> = (0..7)
            .map(|i| manager.hazard_pointer(unsafe { base.add(i) }).unwrap())
            .collect();
        let err = manager.hazard_pointer(unsafe { base.add(7) }).err();
        assert_eq!(err, Some(Status::RegistryFull));
        drop(held);
        assert!(manager.hazard_pointer(unsafe { base.add(7) }).is_ok());
    }

    #[test]
    fn test_protect() {
        let manager = HazardManager::new();
        let mut a = 5i32;
        let src = AtomicPtr::new(&mut a as *mut i32);
        let mut hp = HazardPointer::empty(&manager.local().unwrap());
        let p = hp.protect(&src).unwrap();
        assert_eq!(p, &mut a as *mut i32);
        assert_eq!(hp.get(), p);
    }

    #[test]
    fn test_protect_link_keeps_mark() {
        let manager = HazardManager::new();
        let mut a = 5u64;
        let addr = &mut a as *mut u64 as usize;
        let src = AtomicUsize::new(util::marked(addr));
        let mut hp = HazardPointer::<u64>::empty(&manager.local().unwrap());
        let link = hp.protect_link(&src).unwrap();
        assert!(util::is_marked(link));
        assert_eq!(hp.get() as usize, addr);
        src.store(0, Ordering::Release);
        assert_eq!(hp.protect_link(&src).unwrap(), 0);
        assert!(hp.is_null());
    }
}
