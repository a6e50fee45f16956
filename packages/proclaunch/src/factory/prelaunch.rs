// packages/proclaunch/src/factory/prelaunch.rs
//! Warm spare pool
//!
//! Keeps at most one hidden, already-spawned instance of a template
//! process. `create` hands the spare out (relabelled with the requested
//! configuration) and schedules a replacement.
//!
//! # Lifecycle
//!
//! ```text
//!  arm ──(interval | idle grant)──► prestart ──► spare ready
//!   ▲                                               │
//!   └──────────── create / spare died ◄─────────────┘
//! ```
//!
//! - No spare and no timer while memory is restricted or prelaunch is off
//! - A spare that fails to start disables prelaunch for good
//! - Replenishment waits on the idle delegate when one is installed

use crate::factory::{FactoryBase, FactoryEvent};
use crate::observability;
use crate::runtime::local_backend::SpareExit;
use crate::runtime::{IdleDelegate, ProcessBackend, ProcessError, ProcessInfo};
use crate::utils::errors::{LaunchError, Result};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const DEFAULT_LAUNCH_INTERVAL: Duration = Duration::from_millis(1000);

struct Spare {
    backend: ProcessBackend,
    watcher: JoinHandle<()>,
    seq: u64,
}

impl Spare {
    fn discard(self) {
        self.watcher.abort();
        debug!("Discarding prelaunched process {:?}", self.backend.pid());
    }
}

struct PrelaunchState {
    template: Option<ProcessInfo>,
    enabled: bool,
    launch_interval: Duration,
    idle: Option<IdleDelegate>,
    spare: Option<Spare>,
    timer: Option<JoinHandle<()>>,
    timer_seq: u64,
    spare_seq: u64,
}

struct PrelaunchInner {
    base: FactoryBase,
    state: Mutex<PrelaunchState>,
}

/// Factory that serves launches from a pre-warmed spare
pub struct PrelaunchFactory {
    inner: Arc<PrelaunchInner>,
}

impl PrelaunchFactory {
    /// Start keeping a spare of `template` (nothing happens until one is set)
    pub fn new(template: Option<ProcessInfo>) -> Self {
        let inner = Arc::new(PrelaunchInner {
            base: FactoryBase::new(),
            state: Mutex::new(PrelaunchState {
                template,
                enabled: true,
                launch_interval: DEFAULT_LAUNCH_INTERVAL,
                idle: None,
                spare: None,
                timer: None,
                timer_seq: 0,
                spare_seq: 0,
            }),
        });
        inner.arm(&mut inner.state.lock());
        Self { inner }
    }

    pub fn with_launch_interval(self, interval: Duration) -> Self {
        self.set_launch_interval(interval);
        self
    }

    pub(crate) fn base(&self) -> &FactoryBase {
        &self.inner.base
    }

    pub fn process_info(&self) -> Option<ProcessInfo> {
        self.inner.state.lock().template.clone()
    }

    /// Replace the template; the current spare no longer matches and is
    /// discarded.
    pub fn set_process_info(&self, template: Option<ProcessInfo>) {
        let discarded = {
            let mut state = self.inner.state.lock();
            state.template = template;
            let discarded = state.spare.take();
            self.inner.arm(&mut state);
            discarded
        };
        if let Some(spare) = discarded {
            spare.discard();
            self.inner.base.emit(FactoryEvent::InternalProcessesChanged);
        }
    }

    pub fn launch_interval(&self) -> Duration {
        self.inner.state.lock().launch_interval
    }

    /// A pending timer restarts with the new interval
    pub fn set_launch_interval(&self, interval: Duration) {
        let mut state = self.inner.state.lock();
        if state.launch_interval == interval {
            return;
        }
        state.launch_interval = interval;
        if state.timer.is_some() {
            self.inner.arm(&mut state);
        }
    }

    pub fn prelaunch_enabled(&self) -> bool {
        self.inner.state.lock().enabled
    }

    pub fn set_prelaunch_enabled(&self, enabled: bool) {
        let discarded = {
            let mut state = self.inner.state.lock();
            if state.enabled == enabled {
                return;
            }
            state.enabled = enabled;
            let discarded = if enabled { None } else { state.spare.take() };
            self.inner.arm(&mut state);
            discarded
        };
        if let Some(spare) = discarded {
            spare.discard();
            self.inner.base.emit(FactoryEvent::InternalProcessesChanged);
        }
    }

    /// A live spare is waiting to be handed out
    pub fn has_prelaunched_process(&self) -> bool {
        self.inner
            .state
            .lock()
            .spare
            .as_ref()
            .map(|spare| spare.backend.is_ready())
            .unwrap_or(false)
    }

    pub(crate) fn internal_processes(&self) -> Vec<u32> {
        let state = self.inner.state.lock();
        state
            .spare
            .as_ref()
            .filter(|spare| spare.backend.is_ready())
            .and_then(|spare| spare.backend.pid())
            .into_iter()
            .collect()
    }

    pub(crate) fn create(&self, info: ProcessInfo) -> Result<ProcessBackend> {
        let mut state = self.inner.state.lock();
        let template = state
            .template
            .clone()
            .ok_or_else(|| LaunchError::NoMatchingFactory(info.program.clone()))?;

        let spare = state.spare.take();
        self.inner.arm(&mut state);
        drop(state);

        let backend = match spare {
            Some(spare) if spare.backend.is_ready() => {
                spare.watcher.abort();
                debug!("Handing out prelaunched process {:?}", spare.backend.pid());
                spare.backend
            }
            stale => {
                if let Some(stale) = stale {
                    stale.discard();
                }
                let backend = ProcessBackend::local(template);
                if let Err(e) = backend.prestart() {
                    warn!("Failed to prestart {}: {}", info.program, e);
                }
                backend
            }
        };
        backend.set_info(info)?;
        self.inner.base.emit(FactoryEvent::InternalProcessesChanged);
        Ok(backend)
    }

    pub(crate) fn handle_memory_restriction_change(&self, restricted: bool) {
        let discarded = {
            let mut state = self.inner.state.lock();
            let discarded = if restricted { state.spare.take() } else { None };
            self.inner.arm(&mut state);
            debug_assert!(!restricted || (state.spare.is_none() && state.timer.is_none()));
            discarded
        };
        if let Some(spare) = discarded {
            spare.discard();
            self.inner.base.emit(FactoryEvent::InternalProcessesChanged);
        }
    }

    /// Gate replenishment on `idle` instead of the plain interval
    pub(crate) fn set_idle_delegate(&self, idle: Option<IdleDelegate>) {
        let mut state = self.inner.state.lock();
        state.idle = idle;
        if state.timer.is_some() {
            self.inner.arm(&mut state);
        }
    }

    pub(crate) fn shutdown(&self) {
        let discarded = {
            let mut state = self.inner.state.lock();
            state.enabled = false;
            self.inner.arm(&mut state);
            state.spare.take()
        };
        if let Some(spare) = discarded {
            spare.discard();
            self.inner.base.emit(FactoryEvent::InternalProcessesChanged);
        }
    }
}

impl PrelaunchInner {
    /// Cancel any pending timer and, if a spare is wanted, schedule one
    fn arm(self: &Arc<Self>, state: &mut PrelaunchState) {
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.timer_seq += 1;

        if !state.enabled
            || self.base.memory_restricted()
            || state.template.is_none()
            || state.spare.is_some()
        {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("No async runtime, prelaunch timer not armed");
            return;
        };

        let weak = Arc::downgrade(self);
        let seq = state.timer_seq;
        let interval = state.launch_interval;
        let idle = state.idle.clone();
        state.timer = Some(handle.spawn(async move {
            match idle {
                Some(idle) => idle.wait_idle().await,
                None => tokio::time::sleep(interval).await,
            }
            if let Some(inner) = weak.upgrade() {
                inner.launch_spare(seq);
            }
        }));
    }

    fn launch_spare(self: &Arc<Self>, seq: u64) {
        let mut state = self.state.lock();
        if state.timer_seq != seq {
            return;
        }
        state.timer = None;
        if !state.enabled || self.base.memory_restricted() || state.spare.is_some() {
            return;
        }
        let Some(template) = state.template.clone() else {
            return;
        };

        let backend = ProcessBackend::local(template);
        match backend.prestart() {
            Ok(exit) => {
                state.spare_seq += 1;
                let spare_seq = state.spare_seq;
                let watcher = tokio::spawn(watch_spare(Arc::downgrade(self), spare_seq, exit));
                info!("Prelaunched {} (PID {:?})", backend.program(), backend.pid());
                state.spare = Some(Spare {
                    backend,
                    watcher,
                    seq: spare_seq,
                });
                drop(state);

                observability::record_spare_launched();
                self.base.emit(FactoryEvent::ProcessPrelaunched);
                self.base.emit(FactoryEvent::InternalProcessesChanged);
            }
            Err(e) => {
                warn!("Prelaunch of {} failed, disabling prelaunch: {}", backend.program(), e);
                state.enabled = false;
                drop(state);

                self.base
                    .emit(FactoryEvent::InternalProcessError(ProcessError::FailedToStart));
                self.base.emit(FactoryEvent::PrelaunchDisabled);
            }
        }
    }

    /// The spare with sequence `seq` exited while pooled
    fn spare_lost(self: &Arc<Self>, seq: u64, error: Option<ProcessError>) {
        let mut state = self.state.lock();
        if state.spare.as_ref().map(|spare| spare.seq) != Some(seq) {
            return;
        }
        let lost = state.spare.take();
        self.arm(&mut state);
        drop(state);
        drop(lost);

        warn!("Prelaunched process lost ({:?})", error);
        observability::record_spare_lost();
        if let Some(error) = error {
            self.base.emit(FactoryEvent::InternalProcessError(error));
        }
        self.base.emit(FactoryEvent::InternalProcessesChanged);
    }
}

impl Drop for PrelaunchInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        if let Some(spare) = state.spare.take() {
            spare.discard();
        }
    }
}

async fn watch_spare(factory: Weak<PrelaunchInner>, seq: u64, exit: SpareExit) {
    let Ok(error) = exit.await else {
        return;
    };
    if let Some(factory) = factory.upgrade() {
        factory.spare_lost(seq, error);
    }
}
