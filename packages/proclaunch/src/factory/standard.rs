// packages/proclaunch/src/factory/standard.rs
//! Direct spawning in this process

use crate::factory::FactoryBase;
use crate::runtime::{ProcessBackend, ProcessInfo};

/// Produces plain local backends
pub struct StandardFactory {
    pub(crate) base: FactoryBase,
}

impl StandardFactory {
    pub fn new() -> Self {
        Self {
            base: FactoryBase::new(),
        }
    }

    pub(crate) fn create(&self, info: ProcessInfo) -> ProcessBackend {
        ProcessBackend::local(info)
    }
}

impl Default for StandardFactory {
    fn default() -> Self {
        Self::new()
    }
}
