//! Small helpers shared by the reclamation engine and the containers.

use std::cell::Cell;
use std::hint;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicI64, Ordering};

static GLOBAL_THREAD_ID: AtomicI64 = AtomicI64::new(0);

/// Sequential id of the calling thread, assigned on first call.
pub fn get_thread_id() -> i64 {
    thread_local!(static THREAD_ID: Cell<i64> = Cell::new(-1););
    THREAD_ID
        .try_with(|tid| {
            if -1 == tid.get() {
                tid.set(GLOBAL_THREAD_ID.fetch_add(1, Ordering::Relaxed));
            }
            tid.get()
        })
        .unwrap_or(-1)
}

/// Pads and aligns `T` to a cache line, so that neighbours modified by different threads do
/// not share a line.
#[repr(align(64))]
pub struct WrappedAlign64Type<T>(pub T);

impl<T> Default for WrappedAlign64Type<T>
where
    T: Default,
{
    fn default() -> Self {
        WrappedAlign64Type(T::default())
    }
}

impl<T> Deref for WrappedAlign64Type<T> {
    type Target = T;

    fn deref(&self) -> &<Self as Deref>::Target {
        &self.0
    }
}

impl<T> DerefMut for WrappedAlign64Type<T> {
    fn deref_mut(&mut self) -> &mut <Self as Deref>::Target {
        &mut self.0
    }
}

pub fn get_cur_microseconds_time() -> i64 {
    let timespec = time::get_time();
    timespec.sec * 1_000_000 + timespec.nsec as i64 / 1_000
}

#[inline]
pub fn pause() {
    hint::spin_loop();
}

/// Deletion mark carried in the least significant bit of a link word.
pub const MARK_BIT: usize = 1;

#[inline]
pub fn is_marked(link: usize) -> bool {
    link & MARK_BIT != 0
}

#[inline]
pub fn marked(link: usize) -> usize {
    link | MARK_BIT
}

#[inline]
pub fn unmarked(link: usize) -> usize {
    link & !MARK_BIT
}
