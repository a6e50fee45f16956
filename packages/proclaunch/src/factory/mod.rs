// packages/proclaunch/src/factory/mod.rs
//! Backend factories
//!
//! A factory decides whether it can service a launch (through its
//! [`Matcher`]) and produces the backend for it. The manager walks its
//! factories in order and the first match wins.
//!
//! - **Standard**: spawns directly in this process
//! - **Prelaunch**: hands out a pre-warmed spare and replenishes it
//! - **Remote**: proxies to a launcher over a pipe or a Unix socket
//!
//! Factories without a matcher never match.

pub mod prelaunch;
pub mod remote;
pub mod standard;

pub use prelaunch::PrelaunchFactory;
pub use remote::{RemoteFactory, RemoteTransport};
pub use standard::StandardFactory;

use crate::observability;
use crate::runtime::{IdleDelegate, Matcher, ProcessBackend, ProcessError, ProcessInfo, Rewriter};
use crate::utils::errors::{LaunchError, Result};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Factory-level notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FactoryEvent {
    /// The set of pooled/infrastructure pids changed
    InternalProcessesChanged,
    /// A pooled process failed
    InternalProcessError(ProcessError),
    /// Replenishment failed to start and was switched off for good
    PrelaunchDisabled,
    /// A new spare is ready
    ProcessPrelaunched,
}

struct BaseInner {
    matcher: RwLock<Option<Arc<dyn Matcher>>>,
    rewriter: RwLock<Option<Arc<dyn Rewriter>>>,
    memory_restricted: AtomicBool,
    events: broadcast::Sender<FactoryEvent>,
    forward: Mutex<Option<broadcast::Sender<FactoryEvent>>>,
}

/// State every factory variant shares: matching, rewriting, the memory
/// flag and the event channel
#[derive(Clone)]
pub(crate) struct FactoryBase {
    inner: Arc<BaseInner>,
}

impl FactoryBase {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(BaseInner {
                matcher: RwLock::new(None),
                rewriter: RwLock::new(None),
                memory_restricted: AtomicBool::new(false),
                events,
                forward: Mutex::new(None),
            }),
        }
    }

    pub fn matches(&self, info: &ProcessInfo) -> bool {
        self.inner
            .matcher
            .read()
            .as_ref()
            .map(|matcher| matcher.matches(info))
            .unwrap_or(false)
    }

    pub fn rewrite(&self, info: ProcessInfo) -> ProcessInfo {
        match self.inner.rewriter.read().as_ref() {
            Some(rewriter) => rewriter.rewrite(info),
            None => info,
        }
    }

    pub fn memory_restricted(&self) -> bool {
        self.inner.memory_restricted.load(Ordering::SeqCst)
    }

    /// Returns whether the flag changed
    fn swap_memory_restricted(&self, restricted: bool) -> bool {
        self.inner.memory_restricted.swap(restricted, Ordering::SeqCst) != restricted
    }

    /// Publish to direct subscribers and the owning manager
    pub fn emit(&self, event: FactoryEvent) {
        let _ = self.inner.events.send(event.clone());
        if let Some(forward) = self.inner.forward.lock().as_ref() {
            let _ = forward.send(event);
        }
    }
}

/// One entry of the manager's factory chain
pub enum BackendFactory {
    Standard(StandardFactory),
    Prelaunch(PrelaunchFactory),
    Remote(RemoteFactory),
}

impl BackendFactory {
    fn base(&self) -> &FactoryBase {
        match self {
            BackendFactory::Standard(factory) => &factory.base,
            BackendFactory::Prelaunch(factory) => factory.base(),
            BackendFactory::Remote(factory) => factory.base(),
        }
    }

    /// Label used in logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            BackendFactory::Standard(_) => "standard",
            BackendFactory::Prelaunch(_) => "prelaunch",
            BackendFactory::Remote(factory) => factory.kind(),
        }
    }

    pub fn set_matcher(&self, matcher: impl Matcher + 'static) {
        *self.base().inner.matcher.write() = Some(Arc::new(matcher));
    }

    pub fn clear_matcher(&self) {
        *self.base().inner.matcher.write() = None;
    }

    pub fn set_rewriter(&self, rewriter: impl Rewriter + 'static) {
        *self.base().inner.rewriter.write() = Some(Arc::new(rewriter));
    }

    pub fn with_matcher(self, matcher: impl Matcher + 'static) -> Self {
        self.set_matcher(matcher);
        self
    }

    pub fn with_rewriter(self, rewriter: impl Rewriter + 'static) -> Self {
        self.set_rewriter(rewriter);
        self
    }

    /// A matcher is installed, accepts `info`, and the variant is able to
    /// produce a backend right now
    pub fn can_create(&self, info: &ProcessInfo) -> bool {
        if !self.base().matches(info) {
            return false;
        }
        match self {
            BackendFactory::Standard(_) => true,
            BackendFactory::Prelaunch(factory) => factory.process_info().is_some(),
            BackendFactory::Remote(factory) => factory.is_connected(),
        }
    }

    /// Build a backend for `info` (after the optional rewriter)
    pub fn create(&self, info: ProcessInfo) -> Result<ProcessBackend> {
        if !self.can_create(&info) {
            return Err(LaunchError::NoMatchingFactory(info.program));
        }
        let info = self.base().rewrite(info);
        debug!("{} factory creating backend for {}", self.kind(), info.program);

        let backend = match self {
            BackendFactory::Standard(factory) => factory.create(info),
            BackendFactory::Prelaunch(factory) => factory.create(info)?,
            BackendFactory::Remote(factory) => factory.create(info)?,
        };
        observability::record_backend_created(self.kind());
        Ok(backend)
    }

    /// pids of processes this factory keeps for its own purposes
    pub fn internal_processes(&self) -> Vec<u32> {
        match self {
            BackendFactory::Standard(_) => Vec::new(),
            BackendFactory::Prelaunch(factory) => factory.internal_processes(),
            BackendFactory::Remote(factory) => factory.internal_processes(),
        }
    }

    pub fn memory_restricted(&self) -> bool {
        self.base().memory_restricted()
    }

    pub fn set_memory_restricted(&self, restricted: bool) {
        if self.base().swap_memory_restricted(restricted) {
            self.handle_memory_restriction_change();
        }
    }

    /// React to the memory flag that was just stored
    fn handle_memory_restriction_change(&self) {
        let restricted = self.memory_restricted();
        debug!("{} factory memory restricted: {}", self.kind(), restricted);
        match self {
            BackendFactory::Standard(_) => {}
            BackendFactory::Prelaunch(factory) => factory.handle_memory_restriction_change(restricted),
            BackendFactory::Remote(factory) => factory.handle_memory_restriction_change(restricted),
        }
    }

    pub fn set_idle_delegate(&self, idle: Option<IdleDelegate>) {
        match self {
            BackendFactory::Standard(_) => {}
            BackendFactory::Prelaunch(factory) => factory.set_idle_delegate(idle),
            BackendFactory::Remote(factory) => factory.set_idle_delegate(idle),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FactoryEvent> {
        self.base().inner.events.subscribe()
    }

    /// Also publish this factory's events on `sink`
    pub(crate) fn attach(&self, sink: broadcast::Sender<FactoryEvent>) {
        *self.base().inner.forward.lock() = Some(sink);
    }

    /// Tear down spares, timers, connections and launcher children
    pub fn shutdown(&self) {
        match self {
            BackendFactory::Standard(_) => {}
            BackendFactory::Prelaunch(factory) => factory.shutdown(),
            BackendFactory::Remote(factory) => factory.shutdown(),
        }
    }

    pub fn as_prelaunch(&self) -> Option<&PrelaunchFactory> {
        match self {
            BackendFactory::Prelaunch(factory) => Some(factory),
            _ => None,
        }
    }

    pub fn as_remote(&self) -> Option<&RemoteFactory> {
        match self {
            BackendFactory::Remote(factory) => Some(factory),
            _ => None,
        }
    }
}

impl From<StandardFactory> for BackendFactory {
    fn from(factory: StandardFactory) -> Self {
        BackendFactory::Standard(factory)
    }
}

impl From<PrelaunchFactory> for BackendFactory {
    fn from(factory: PrelaunchFactory) -> Self {
        BackendFactory::Prelaunch(factory)
    }
}

impl From<RemoteFactory> for BackendFactory {
    fn from(factory: RemoteFactory) -> Self {
        BackendFactory::Remote(factory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{GdbRewriter, KeyMatcher, MatchAll, ProcessState};

    #[test]
    fn test_no_matcher_never_matches() {
        let factory = BackendFactory::from(StandardFactory::new());
        let info = ProcessInfo::new("sleep");
        assert!(!factory.can_create(&info));
        assert!(matches!(
            factory.create(info),
            Err(LaunchError::NoMatchingFactory(program)) if program == "sleep"
        ));
    }

    #[test]
    fn test_matcher_gates_creation() {
        let factory = BackendFactory::from(StandardFactory::new()).with_matcher(KeyMatcher::new("pipe"));
        let mut info = ProcessInfo::new("sleep");
        assert!(!factory.can_create(&info));

        info.set_value("pipe", serde_json::json!(true)).unwrap();
        assert!(factory.can_create(&info));
        let backend = factory.create(info).unwrap();
        assert_eq!(backend.state(), ProcessState::NotRunning);

        factory.clear_matcher();
        assert!(!factory.can_create(&ProcessInfo::new("sleep")));
    }

    #[test]
    fn test_rewriter_applied() {
        let factory = BackendFactory::from(StandardFactory::new())
            .with_matcher(MatchAll)
            .with_rewriter(GdbRewriter);
        let backend = factory
            .create(ProcessInfo::new("/usr/bin/abc").with_arguments(["a"]))
            .unwrap();
        let info = backend.info();
        assert_eq!(info.program, "gdb");
        assert_eq!(info.arguments, vec!["--", "/usr/bin/abc", "a"]);
    }

    #[test]
    fn test_events_forwarded_to_sink() {
        let factory = BackendFactory::from(StandardFactory::new());
        let (sink, mut forwarded) = broadcast::channel(8);
        let mut direct = factory.subscribe();
        factory.attach(sink);

        factory.base().emit(FactoryEvent::InternalProcessesChanged);
        assert_eq!(direct.try_recv().unwrap(), FactoryEvent::InternalProcessesChanged);
        assert_eq!(forwarded.try_recv().unwrap(), FactoryEvent::InternalProcessesChanged);
    }

    #[test]
    fn test_memory_flag_stored() {
        let factory = BackendFactory::from(StandardFactory::new());
        assert!(!factory.memory_restricted());
        factory.set_memory_restricted(true);
        assert!(factory.memory_restricted());
    }
}
