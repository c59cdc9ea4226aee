//! Node base shared by the concurrent containers.
//!
//! `ConcurrentContainer` allocates, constructs, destroys and retires the nodes of one
//! container. Nodes are handed to the hazard manager of the container on retirement and
//! reclaimed by `reclaim_node`, which needs nothing but the node type and the allocator type.

use crate::allocator::{self, GlobalNodeAllocator, NodeAllocator};
use crate::error::Result;
use crate::hazard_manager::{HazardManager, ThreadRecord};
use std::alloc::Layout;
use std::cell::Cell;
use std::marker::PhantomData;
use std::mem;
use std::ptr::{self, NonNull};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

const NODE_ID_RANGE: u64 = 1 << 16;

static NODE_ID_SOURCE: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static NODE_IDS: Cell<(u64, u64)> = Cell::new((0, 0));
}

/// Unique id for a new node. Each thread draws ids from its own range of 2^16 and takes a new
/// range from the global counter when it runs out.
pub fn next_node_id() -> u64 {
    NODE_IDS
        .try_with(|ids| {
            let (mut next, mut end) = ids.get();
            if next == end {
                next = NODE_ID_SOURCE.fetch_add(NODE_ID_RANGE, Ordering::Relaxed);
                end = next + NODE_ID_RANGE;
            }
            ids.set((next + 1, end));
            next
        })
        .unwrap_or_else(|_| NODE_ID_SOURCE.fetch_add(1, Ordering::Relaxed))
}

/// Destroy and deallocate a retired node.
///
/// # Safety
///
/// `node` must be a constructed `N` allocated by an `A`, unreachable by any thread.
pub unsafe fn reclaim_node<N, A: NodeAllocator>(node: *mut ()) {
    let node = node as *mut N;
    ptr::drop_in_place(node);
    A::default().deallocate(NonNull::new_unchecked(node as *mut u8), Layout::new::<N>());
}

pub struct ConcurrentContainer<N, A: NodeAllocator = GlobalNodeAllocator> {
    manager: HazardManager,
    allocator: A,
    _marker: PhantomData<fn() -> N>,
}

// Gives the memory back when node construction fails or panics.
struct DeallocOnUnwind<'a, N, A: NodeAllocator> {
    container: &'a ConcurrentContainer<N, A>,
    node: *mut N,
}

impl<'a, N, A: NodeAllocator> Drop for DeallocOnUnwind<'a, N, A> {
    fn drop(&mut self) {
        unsafe { self.container.deallocate_node(self.node) }
    }
}

impl<N, A: NodeAllocator> ConcurrentContainer<N, A> {
    /// # Panics
    ///
    /// Panics if `A` is not stateless.
    pub fn new(manager: HazardManager) -> Self {
        assert!(
            allocator::is_stateless::<A>(),
            "concurrent containers require a stateless or always-equal node allocator"
        );
        assert!(0 != mem::size_of::<N>(), "zero-sized nodes are not supported");
        ConcurrentContainer {
            manager,
            allocator: A::default(),
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn manager(&self) -> &HazardManager {
        &self.manager
    }

    /// Calling thread's record of the manager.
    #[inline]
    pub fn local(&self) -> Result<Rc<ThreadRecord>> {
        self.manager.local()
    }

    /// Raw memory for one node.
    pub fn allocate_node(&self) -> Result<*mut N> {
        let ptr = unsafe { self.allocator.allocate(Layout::new::<N>())? };
        Ok(ptr.as_ptr() as *mut N)
    }

    /// # Safety
    ///
    /// `node` must come from `allocate_node` and hold no constructed value.
    pub unsafe fn deallocate_node(&self, node: *mut N) {
        self.allocator
            .deallocate(NonNull::new_unchecked(node as *mut u8), Layout::new::<N>())
    }

    pub fn make_node(&self, node: N) -> Result<*mut N> {
        let ptr = self.allocate_node()?;
        unsafe { ptr::write(ptr, node) };
        Ok(ptr)
    }

    /// Allocate, then construct with `f`. If `f` fails or panics the memory is released
    /// before the failure propagates.
    pub fn try_make_node<F>(&self, f: F) -> Result<*mut N>
    where
        F: FnOnce() -> Result<N>,
    {
        let ptr = self.allocate_node()?;
        let guard = DeallocOnUnwind {
            container: self,
            node: ptr,
        };
        let node = f()?;
        unsafe { ptr::write(ptr, node) };
        mem::forget(guard);
        Ok(ptr)
    }

    /// Destroy and deallocate at once.
    ///
    /// # Safety
    ///
    /// No other thread may reach `node`.
    pub unsafe fn delete_node(&self, node: *mut N) {
        ptr::drop_in_place(node);
        self.deallocate_node(node);
    }

    /// Hand an unlinked node over to the hazard manager.
    ///
    /// # Safety
    ///
    /// `node` must already be unreachable from the container and retired only once.
    pub unsafe fn retire_node(&self, node: *mut N) -> Result<()> {
        self.manager
            .mark_for_cleanup(node as *mut (), reclaim_node::<N, A>)
    }
}

#[cfg(test)]
mod test {
    use crate::allocator::{GlobalNodeAllocator, NodeAllocator};
    use crate::concurrent_container::*;
    use crate::error::{Result, Status};
    use std::alloc::Layout;
    use std::collections::HashSet;
    use std::panic::{self, AssertUnwindSafe};
    use std::ptr::NonNull;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    static ALLOCATED: AtomicUsize = AtomicUsize::new(0);
    static DEALLOCATED: AtomicUsize = AtomicUsize::new(0);

    #[derive(Default)]
    struct Counting;

    impl NodeAllocator for Counting {
        const IS_ALWAYS_EQUAL: bool = true;

        unsafe fn allocate(&self, layout: Layout) -> Result<NonNull<u8>> {
            ALLOCATED.fetch_add(1, Ordering::SeqCst);
            GlobalNodeAllocator.allocate(layout)
        }

        unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
            DEALLOCATED.fetch_add(1, Ordering::SeqCst);
            GlobalNodeAllocator.deallocate(ptr, layout)
        }
    }

    struct Node {
        v: u64,
        dropped: Arc<AtomicUsize>,
    }

    impl Drop for Node {
        fn drop(&mut self) {
            self.dropped.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_node_ids_unique() {
        let threads: Vec<_> = (0..4)
            .map(|_| thread::spawn(|| (0..70_000).map(|_| next_node_id()).collect::<Vec<_>>()))
            .collect();
        let mut seen = HashSet::new();
        for t in threads {
            for id in t.join().unwrap() {
                assert_ne!(id, 0);
                assert!(seen.insert(id));
            }
        }
    }

    // The only test of this module that uses `Counting`, so the counters are exact.
    #[test]
    fn test_make_delete_retire() {
        let container =
            ConcurrentContainer::<Node, Counting>::new(HazardManager::new());
        let dropped = Arc::new(AtomicUsize::new(0));

        let a = container
            .make_node(Node {
                v: 1,
                dropped: dropped.clone(),
            })
            .unwrap();
        assert_eq!(unsafe { (*a).v }, 1);
        unsafe { container.delete_node(a) };
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
        assert_eq!(DEALLOCATED.load(Ordering::SeqCst), 1);

        let failed = container.try_make_node(|| Err(Status::InvalidParam));
        assert_eq!(failed.err(), Some(Status::InvalidParam));
        assert_eq!(ALLOCATED.load(Ordering::SeqCst), 2);
        assert_eq!(DEALLOCATED.load(Ordering::SeqCst), 2);

        let panicked = panic::catch_unwind(AssertUnwindSafe(|| {
            container.try_make_node(|| -> Result<Node> { panic!("constructor failed") })
        }));
        assert!(panicked.is_err());
        assert_eq!(ALLOCATED.load(Ordering::SeqCst), 3);
        assert_eq!(DEALLOCATED.load(Ordering::SeqCst), 3);

        let b = container
            .try_make_node(|| {
                Ok(Node {
                    v: 2,
                    dropped: dropped.clone(),
                })
            })
            .unwrap();
        let hp = container.manager().hazard_pointer(b).unwrap();
        unsafe { container.retire_node(b).unwrap() };
        assert_eq!(container.manager().reclaim().unwrap(), 0);
        assert_eq!(unsafe { hp.as_ref() }.map(|n| n.v), Some(2));
        drop(hp);
        assert_eq!(container.manager().reclaim().unwrap(), 1);
        assert_eq!(dropped.load(Ordering::SeqCst), 2);
        assert_eq!(ALLOCATED.load(Ordering::SeqCst), 4);
        assert_eq!(DEALLOCATED.load(Ordering::SeqCst), 4);
    }

    #[derive(Default)]
    struct Stateful {
        _arena: Vec<u8>,
    }

    impl NodeAllocator for Stateful {
        unsafe fn allocate(&self, layout: Layout) -> Result<NonNull<u8>> {
            GlobalNodeAllocator.allocate(layout)
        }

        unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
            GlobalNodeAllocator.deallocate(ptr, layout)
        }
    }

    #[test]
    #[should_panic(expected = "stateless")]
    fn test_stateful_allocator_rejected() {
        ConcurrentContainer::<u64, Stateful>::new(HazardManager::new());
    }
}
