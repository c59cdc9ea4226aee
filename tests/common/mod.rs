#![allow(dead_code)]

use rs_cds::allocator::{GlobalNodeAllocator, NodeAllocator};
use rs_cds::error::{Result, Status};
use rs_cds::util;
use std::alloc::Layout;
use std::ops::Deref;
use std::ops::DerefMut;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub struct ShardPtr<T>(pub *mut T);

unsafe impl<T> Send for ShardPtr<T> {}

unsafe impl<T> Sync for ShardPtr<T> {}

impl<T> ShardPtr<T> {
    pub fn new(data: *mut T) -> Self {
        ShardPtr(data)
    }

    pub fn as_ref(&self) -> &T {
        unsafe { &*self.0 }
    }
}

impl<T> Copy for ShardPtr<T> {}

impl<T> Clone for ShardPtr<T> {
    fn clone(&self) -> Self {
        ShardPtr(self.0)
    }
}

impl<T> Deref for ShardPtr<T> {
    type Target = *mut T;

    fn deref(&self) -> &<Self as Deref>::Target {
        &self.0
    }
}

impl<T> DerefMut for ShardPtr<T> {
    fn deref_mut(&mut self) -> &mut <Self as Deref>::Target {
        &mut self.0
    }
}

pub fn init_log() {
    let _ = env_logger::try_init();
}

pub fn set_cpu_affinity() {
    if let Some(cpus) = core_affinity::get_core_ids() {
        if !cpus.is_empty() {
            let idx = util::get_thread_id() as usize % cpus.len();
            core_affinity::set_for_current(cpus[idx]);
            debug!("set_cpu_affinity {} {}", util::get_thread_id(), idx);
        }
    }
}

pub fn cpu_count() -> usize {
    core_affinity::get_core_ids()
        .map(|cpus| cpus.len())
        .unwrap_or(4)
        .max(2)
}

/// Define a stateless allocator type counting its calls in its own static counters.
macro_rules! counting_allocator {
    ($name:ident) => {
        #[derive(Default)]
        struct $name;

        impl $name {
            fn counters() -> &'static [std::sync::atomic::AtomicUsize; 2] {
                static COUNTERS: [std::sync::atomic::AtomicUsize; 2] = [
                    std::sync::atomic::AtomicUsize::new(0),
                    std::sync::atomic::AtomicUsize::new(0),
                ];
                &COUNTERS
            }

            fn allocated() -> usize {
                Self::counters()[0].load(std::sync::atomic::Ordering::SeqCst)
            }

            fn deallocated() -> usize {
                Self::counters()[1].load(std::sync::atomic::Ordering::SeqCst)
            }
        }

        impl rs_cds::allocator::NodeAllocator for $name {
            const IS_ALWAYS_EQUAL: bool = true;

            unsafe fn allocate(
                &self,
                layout: std::alloc::Layout,
            ) -> rs_cds::error::Result<std::ptr::NonNull<u8>> {
                Self::counters()[0].fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                rs_cds::allocator::NodeAllocator::allocate(
                    &rs_cds::allocator::GlobalNodeAllocator,
                    layout,
                )
            }

            unsafe fn deallocate(&self, ptr: std::ptr::NonNull<u8>, layout: std::alloc::Layout) {
                Self::counters()[1].fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                rs_cds::allocator::NodeAllocator::deallocate(
                    &rs_cds::allocator::GlobalNodeAllocator,
                    ptr,
                    layout,
                )
            }
        }
    };
}

pub const POISON: u8 = 0xA5;

pub const POISON_WORD: u64 = 0xA5A5_A5A5_A5A5_A5A5;

static QUARANTINED: AtomicUsize = AtomicUsize::new(0);

/// Freed blocks are overwritten with `POISON` and never given back, so a read through a
/// dangling pointer sees the poison instead of a reused block.
#[derive(Default)]
pub struct PoisoningAllocator;

impl PoisoningAllocator {
    pub fn quarantined() -> usize {
        QUARANTINED.load(Ordering::SeqCst)
    }
}

impl NodeAllocator for PoisoningAllocator {
    const IS_ALWAYS_EQUAL: bool = true;

    unsafe fn allocate(&self, layout: Layout) -> Result<NonNull<u8>> {
        GlobalNodeAllocator.allocate(layout)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        ptr::write_bytes(ptr.as_ptr(), POISON, layout.size());
        QUARANTINED.fetch_add(1, Ordering::SeqCst);
    }
}

static FAILING: AtomicBool = AtomicBool::new(false);

/// Node allocator refusing every allocation while `set_failing(true)` is in effect.
#[derive(Default)]
pub struct FailingAllocator;

impl FailingAllocator {
    pub fn set_failing(failing: bool) {
        FAILING.store(failing, Ordering::SeqCst);
    }
}

impl NodeAllocator for FailingAllocator {
    const IS_ALWAYS_EQUAL: bool = true;

    unsafe fn allocate(&self, layout: Layout) -> Result<NonNull<u8>> {
        if FAILING.load(Ordering::SeqCst) {
            return Err(Status::OutOfMemory);
        }
        GlobalNodeAllocator.allocate(layout)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        GlobalNodeAllocator.deallocate(ptr, layout)
    }
}
