// packages/proclaunch/src/manager.rs
//! Backend manager: the priority-ordered factory chain
//!
//! The manager owns the shared memory flag and idle delegate and pushes
//! every change to all factories synchronously, in chain order. Factory
//! notifications are re-published on the manager's own channel.

use crate::factory::{BackendFactory, FactoryEvent};
use crate::runtime::{IdleDelegate, ProcessBackend, ProcessInfo};
use crate::utils::errors::{LaunchError, Result};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

struct ManagerInner {
    factories: RwLock<Vec<BackendFactory>>,
    memory_restricted: AtomicBool,
    idle: Mutex<Option<IdleDelegate>>,
    events: broadcast::Sender<FactoryEvent>,
}

/// Routes launches to the first factory that accepts them
#[derive(Clone)]
pub struct BackendManager {
    inner: Arc<ManagerInner>,
}

impl BackendManager {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(ManagerInner {
                factories: RwLock::new(Vec::new()),
                memory_restricted: AtomicBool::new(false),
                idle: Mutex::new(None),
                events,
            }),
        }
    }

    /// Append a factory at the lowest priority
    ///
    /// The factory picks up the current memory flag and idle delegate.
    pub fn add_factory(&self, factory: impl Into<BackendFactory>) {
        let factory = factory.into();
        factory.attach(self.inner.events.clone());
        factory.set_memory_restricted(self.memory_restricted());
        factory.set_idle_delegate(self.idle_delegate());
        debug!("Added {} factory", factory.kind());

        self.inner.factories.write().push(factory);
        let _ = self.inner.events.send(FactoryEvent::InternalProcessesChanged);
    }

    pub fn factory_count(&self) -> usize {
        self.inner.factories.read().len()
    }

    /// Backend from the first factory whose `can_create` accepts `info`
    pub fn create(&self, info: ProcessInfo) -> Result<ProcessBackend> {
        let factories = self.inner.factories.read();
        match factories.iter().find(|factory| factory.can_create(&info)) {
            Some(factory) => factory.create(info),
            None => {
                debug!("No factory for {}", info.program);
                Err(LaunchError::NoMatchingFactory(info.program))
            }
        }
    }

    pub fn memory_restricted(&self) -> bool {
        self.inner.memory_restricted.load(Ordering::SeqCst)
    }

    pub fn set_memory_restricted(&self, restricted: bool) {
        if self.inner.memory_restricted.swap(restricted, Ordering::SeqCst) == restricted {
            return;
        }
        info!("Memory restricted: {}", restricted);
        for factory in self.inner.factories.read().iter() {
            factory.set_memory_restricted(restricted);
        }
    }

    pub fn idle_delegate(&self) -> Option<IdleDelegate> {
        self.inner.idle.lock().clone()
    }

    /// Gate replenishment of every factory on `idle`
    pub fn set_idle_delegate(&self, idle: Option<IdleDelegate>) {
        *self.inner.idle.lock() = idle.clone();
        for factory in self.inner.factories.read().iter() {
            factory.set_idle_delegate(idle.clone());
        }
    }

    /// Spare and launcher pids across all factories
    pub fn internal_processes(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self
            .inner
            .factories
            .read()
            .iter()
            .flat_map(BackendFactory::internal_processes)
            .collect();
        pids.sort_unstable();
        pids.dedup();
        pids
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FactoryEvent> {
        self.inner.events.subscribe()
    }

    /// Run `f` against the factory at `index`
    pub fn with_factory<T>(&self, index: usize, f: impl FnOnce(&BackendFactory) -> T) -> Option<T> {
        self.inner.factories.read().get(index).map(f)
    }

    /// Tear down every factory's spares and connections
    pub fn shutdown(&self) {
        let factories = std::mem::take(&mut *self.inner.factories.write());
        for factory in &factories {
            factory.shutdown();
        }
        info!("Backend manager shut down ({} factories)", factories.len());
    }
}

impl Default for BackendManager {
    fn default() -> Self {
        Self::new()
    }
}
