//! Node allocators.
//!
//! A retired node is deallocated long after its container may be gone, by whatever thread
//! happens to scan. The reclaimer therefore builds a fresh `A::default()` to give the memory
//! back, which is only correct when every instance of the allocator is interchangeable.

use crate::error::{Result, Status};
use std::alloc::{self, Layout};
use std::mem;
use std::ptr::NonNull;

pub trait NodeAllocator: Default + Send + Sync + 'static {
    /// Any instance can free memory allocated by any other instance.
    const IS_ALWAYS_EQUAL: bool = false;

    /// # Safety
    ///
    /// `layout` must have a non-zero size.
    unsafe fn allocate(&self, layout: Layout) -> Result<NonNull<u8>>;

    /// # Safety
    ///
    /// `ptr` must come from `allocate` of an equal allocator with the same `layout`.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// True if containers may use `A` for their nodes.
#[inline]
pub fn is_stateless<A: NodeAllocator>() -> bool {
    A::IS_ALWAYS_EQUAL || 0 == mem::size_of::<A>()
}

/// The global allocator.
#[derive(Default, Copy, Clone, Debug)]
pub struct GlobalNodeAllocator;

impl NodeAllocator for GlobalNodeAllocator {
    const IS_ALWAYS_EQUAL: bool = true;

    unsafe fn allocate(&self, layout: Layout) -> Result<NonNull<u8>> {
        match NonNull::new(alloc::alloc(layout)) {
            Some(ptr) => Ok(ptr),
            None => {
                warn!("failed to allocate node of {} bytes", layout.size());
                Err(Status::OutOfMemory)
            }
        }
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        alloc::dealloc(ptr.as_ptr(), layout)
    }
}
