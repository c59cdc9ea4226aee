//! Michael & Scott lock-free FIFO queue on hazard pointers.
//!
//! `head` always points to a dummy node whose successor holds the first value. Popping swings
//! `head` to that successor, which becomes the new dummy once its value is taken, and retires
//! the old dummy.

use crate::allocator::{GlobalNodeAllocator, NodeAllocator};
use crate::concurrent_container::ConcurrentContainer;
use crate::error::Result;
use crate::hazard_manager::HazardManager;
use crate::hazard_pointer::HazardPointer;
use crate::util::WrappedAlign64Type;
use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

type FIFONodePtr<T> = *mut FIFONode<T>;

struct FIFONode<T> {
    next: AtomicPtr<FIFONode<T>>,
    value: UnsafeCell<Option<T>>,
}

impl<T> FIFONode<T> {
    fn new(value: Option<T>) -> Self {
        FIFONode {
            next: AtomicPtr::new(ptr::null_mut()),
            value: UnsafeCell::new(value),
        }
    }
}

pub struct ConcurrentQueue<T, A: NodeAllocator = GlobalNodeAllocator> {
    head: WrappedAlign64Type<AtomicPtr<FIFONode<T>>>,
    tail: WrappedAlign64Type<AtomicPtr<FIFONode<T>>>,
    container: ConcurrentContainer<FIFONode<T>, A>,
    _marker: PhantomData<FIFONodePtr<T>>,
}

unsafe impl<T: Send, A: NodeAllocator> Send for ConcurrentQueue<T, A> {}

unsafe impl<T: Send, A: NodeAllocator> Sync for ConcurrentQueue<T, A> {}

impl<T: Send + 'static> ConcurrentQueue<T> {
    pub fn new() -> Result<Self> {
        Self::with_manager(HazardManager::new())
    }
}

impl<T: Send + 'static, A: NodeAllocator> ConcurrentQueue<T, A> {
    pub fn with_manager(manager: HazardManager) -> Result<Self> {
        let container = ConcurrentContainer::new(manager);
        let dummy = container.make_node(FIFONode::new(None))?;
        Ok(ConcurrentQueue {
            head: WrappedAlign64Type(AtomicPtr::new(dummy)),
            tail: WrappedAlign64Type(AtomicPtr::new(dummy)),
            container,
            _marker: PhantomData,
        })
    }

    #[inline]
    pub fn manager(&self) -> &HazardManager {
        self.container.manager()
    }

    pub fn push(&self, v: T) -> Result<()> {
        let record = self.container.local()?;
        let mut hp_tail = HazardPointer::empty(&record);
        let node = self.container.make_node(FIFONode::new(Some(v)))?;
        loop {
            let tail = match hp_tail.protect(&self.tail) {
                Ok(tail) => tail,
                Err(status) => {
                    unsafe { self.container.delete_node(node) };
                    return Err(status);
                }
            };
            let next = unsafe { (*tail).next.load(Ordering::Acquire) };
            if tail != self.tail.load(Ordering::Acquire) {
                continue;
            }
            if !next.is_null() {
                // Tail is lagging, help it forward
                let _ = self.tail.compare_exchange(
                    tail,
                    next,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                );
                continue;
            }
            let linked = unsafe {
                (*tail).next.compare_exchange(
                    ptr::null_mut(),
                    node,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
            };
            if linked.is_ok() {
                let _ = self.tail.compare_exchange(
                    tail,
                    node,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                );
                return Ok(());
            }
        }
    }

    pub fn pop(&self) -> Result<Option<T>> {
        let record = self.container.local()?;
        let mut hp_head = HazardPointer::empty(&record);
        let mut hp_next = HazardPointer::empty(&record);
        loop {
            let head = hp_head.protect(&self.head)?;
            let tail = self.tail.load(Ordering::Acquire);
            let next = unsafe { (*head).next.load(Ordering::Acquire) };
            hp_next.mark(next)?;
            if head != self.head.load(Ordering::Acquire) {
                continue;
            }
            if next.is_null() {
                return Ok(None);
            }
            if head == tail {
                let _ = self.tail.compare_exchange(
                    tail,
                    next,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                );
                continue;
            }
            if self
                .head
                .compare_exchange(head, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                // Only the thread that made `next` the dummy touches its value.
                let ret = unsafe { (*(*next).value.get()).take() };
                debug_assert!(ret.is_some());
                drop(hp_head);
                if let Err(status) = unsafe { self.container.retire_node(head) } {
                    warn!("failed to retire queue node {:p}: {}", head, status);
                }
                return Ok(ret);
            }
        }
    }

    pub fn empty(&self) -> Result<bool> {
        let record = self.container.local()?;
        let mut hp_head = HazardPointer::empty(&record);
        let head = hp_head.protect(&self.head)?;
        Ok(unsafe { (*head).next.load(Ordering::Acquire) }.is_null())
    }
}

impl<T, A: NodeAllocator> Drop for ConcurrentQueue<T, A> {
    fn drop(&mut self) {
        let mut head = self.head.load(Ordering::Relaxed);
        while !head.is_null() {
            let next = unsafe { (*head).next.load(Ordering::Relaxed) };
            unsafe { self.container.delete_node(head) };
            head = next;
        }
    }
}
