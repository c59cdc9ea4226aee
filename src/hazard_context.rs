//! One hazard manager per tag type.
//!
//! Containers of one kind share a manager so that a thread needs a single registry for all of
//! them. `HazardContext` hands out that manager by tag: the first request for a tag creates the
//! manager, every later one gets a handle to the same engine.

use crate::error::Result;
use crate::hazard_manager::{HazardConfig, HazardManager};
use crate::spin_lock::SpinLock;
use std::any::TypeId;
use std::cell::UnsafeCell;

pub struct HazardContext {
    config: HazardConfig,
    lock: SpinLock,
    managers: UnsafeCell<Vec<(TypeId, HazardManager)>>,
}

unsafe impl Sync for HazardContext {}

impl Default for HazardContext {
    fn default() -> Self {
        HazardContext {
            config: HazardConfig::default(),
            lock: SpinLock::default(),
            managers: UnsafeCell::new(Vec::new()),
        }
    }
}

impl HazardContext {
    /// Every manager of the context gets `config`.
    pub fn new(config: HazardConfig) -> Result<HazardContext> {
        config.validate()?;
        Ok(HazardContext {
            config,
            ..Default::default()
        })
    }

    /// The manager for `Tag`, created on first request.
    pub fn manager<Tag: 'static>(&self) -> HazardManager {
        let tag = TypeId::of::<Tag>();
        let _guard = self.lock.lock_guard();
        let managers = unsafe { &mut *self.managers.get() };
        if let Some((_, manager)) = managers.iter().find(|(id, _)| *id == tag) {
            return manager.clone();
        }
        let manager = HazardManager::from_valid_config(self.config.clone());
        managers.push((tag, manager.clone()));
        debug!("hazard manager #{} created for {:?}", managers.len(), tag);
        manager
    }

    /// Count of managers created so far.
    pub fn len(&self) -> usize {
        let _guard = self.lock.lock_guard();
        unsafe { (*self.managers.get()).len() }
    }

    pub fn is_empty(&self) -> bool {
        0 == self.len()
    }
}
