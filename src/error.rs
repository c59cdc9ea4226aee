//! Definition of error and status.

use std::error;
use std::fmt;
use std::result;

/// Status of a failed hazard or container operation.
///
/// Only resource exhaustion and configuration problems are reported this way. Lost CAS races
/// are retried internally and lifetime defects panic.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum Status {
    /// All hazard slots of the current thread's registry are occupied
    RegistryFull,
    /// Hazard storage has no free registry left for another thread
    StorageExhausted,
    /// Node allocation or retirement bookkeeping failed to allocate memory
    OutOfMemory,
    /// Invalid parameter
    InvalidParam,
    /// Current thread has already torn down its thread-local state
    ThreadDetached,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl error::Error for Status {}

pub type Result<T> = result::Result<T, Status>;
