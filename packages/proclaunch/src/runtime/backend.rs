// packages/proclaunch/src/runtime/backend.rs
//! Process backend: one supervised OS process
//!
//! A [`ProcessBackend`] is the owner-facing handle. The process itself is
//! driven either by a local driver task (direct spawn or prelaunched spare)
//! or by a remote launcher reached through a [`LauncherClient`].
//!
//! # Lifecycle
//!
//! ```text
//! NotRunning ──start()──► Starting ──spawned / pattern seen──► Running
//!     ▲                      │                                    │
//!     └──── FailedToStart ───┘◄────────── exit / stop() ──────────┘
//! ```
//!
//! `NotRunning` is both initial and terminal: a backend is started at most
//! once. All notifications of one backend are emitted from one place (its
//! driver task, or the client reader task for remote proxies), so every
//! subscriber sees them in causal order.
//!
//! [`LauncherClient`]: crate::remote::client::LauncherClient

use crate::remote::client::RemoteBackend;
use crate::runtime::local_backend::{LocalBackend, SpareExit};
use crate::runtime::process_info::ProcessInfo;
use crate::runtime::procutils;
use crate::utils::errors::{LaunchError, Result};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Default grace period between SIGTERM and SIGKILL
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessState {
    NotRunning,
    Starting,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitStatus {
    Normal,
    Crashed,
}

/// Failure kinds reported through [`BackendEvent::Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessError {
    FailedToStart,
    Crashed,
    /// `stop()` deadline passed and the process was killed
    Timedout,
    WriteError,
    ReadError,
    UnknownError,
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ProcessError::FailedToStart => "failed to start",
            ProcessError::Crashed => "crashed",
            ProcessError::Timedout => "timed out",
            ProcessError::WriteError => "write error",
            ProcessError::ReadError => "read error",
            ProcessError::UnknownError => "unknown error",
        };
        f.write_str(text)
    }
}

/// Notification emitted by a backend
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    StateChanged(ProcessState),
    Started,
    Error { kind: ProcessError, message: String },
    Finished { exit_code: i32, exit_status: ExitStatus },
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

/// Mutable part of a backend, shared with its driver
#[derive(Debug)]
pub(crate) struct CoreState {
    pub info: ProcessInfo,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub error_string: String,
    /// `start()` has been called
    pub started: bool,
    /// `Finished` (or a terminal `FailedToStart`) has been emitted
    pub finished: bool,
    pub desired_priority: Option<i32>,
    pub desired_oom: Option<i32>,
}

/// State and subscriber list of one backend
pub(crate) struct BackendCore {
    state: Mutex<CoreState>,
    subscribers: Mutex<Vec<(u64, mpsc::UnboundedSender<BackendEvent>)>>,
    next_subscriber: AtomicU64,
}

impl BackendCore {
    pub fn new(info: ProcessInfo) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(CoreState {
                desired_priority: info.priority,
                desired_oom: info.oom_adjustment,
                info,
                state: ProcessState::NotRunning,
                pid: None,
                error_string: String::new(),
                started: false,
                finished: false,
            }),
            subscribers: Mutex::new(Vec::new()),
            next_subscriber: AtomicU64::new(1),
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, CoreState> {
        self.state.lock()
    }

    pub fn state(&self) -> ProcessState {
        self.state.lock().state
    }

    pub fn pid(&self) -> Option<u32> {
        self.state.lock().pid
    }

    pub fn emit(&self, event: BackendEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }

    /// Change state, notifying only on an actual transition
    pub fn set_state(&self, state: ProcessState) {
        {
            let mut core = self.state.lock();
            if core.state == state {
                return;
            }
            core.state = state;
        }
        self.emit(BackendEvent::StateChanged(state));
    }

    pub fn report_error(&self, kind: ProcessError, message: impl Into<String>) {
        let message = message.into();
        self.state.lock().error_string = message.clone();
        self.emit(BackendEvent::Error { kind, message });
    }

    /// Emit `Finished` unless it already was
    pub fn finish(&self, exit_code: i32, exit_status: ExitStatus) {
        {
            let mut core = self.state.lock();
            if core.finished {
                return;
            }
            core.finished = true;
            core.pid = None;
        }
        self.emit(BackendEvent::Finished { exit_code, exit_status });
    }

    /// Terminal start failure: `FailedToStart` then `NotRunning`
    pub fn fail_to_start(&self, message: impl Into<String>) {
        {
            let mut core = self.state.lock();
            core.finished = true;
            core.pid = None;
        }
        self.report_error(ProcessError::FailedToStart, message);
        self.set_state(ProcessState::NotRunning);
    }

    pub fn subscribe(self: &Arc<Self>) -> BackendEvents {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().push((id, tx));
        BackendEvents {
            id,
            rx,
            core: Arc::downgrade(self),
        }
    }

    fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().retain(|(sid, _)| *sid != id);
    }
}

/// Event stream of one backend; unsubscribes on drop
pub struct BackendEvents {
    id: u64,
    rx: mpsc::UnboundedReceiver<BackendEvent>,
    core: Weak<BackendCore>,
}

impl BackendEvents {
    /// Next event, or `None` once the backend is gone
    pub async fn recv(&mut self) -> Option<BackendEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<BackendEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for BackendEvents {
    fn drop(&mut self) {
        if let Some(core) = self.core.upgrade() {
            core.unsubscribe(self.id);
        }
    }
}

pub(crate) enum BackendKind {
    Local(LocalBackend),
    Remote(RemoteBackend),
}

/// Handle to one supervised process
///
/// Uniquely owned; dropping it while the process is alive kills the process.
pub struct ProcessBackend {
    core: Arc<BackendCore>,
    kind: BackendKind,
}

impl ProcessBackend {
    /// Backend that spawns `info` directly in this process
    pub fn local(info: ProcessInfo) -> Self {
        Self {
            core: BackendCore::new(info),
            kind: BackendKind::Local(LocalBackend::new()),
        }
    }

    pub(crate) fn from_parts(core: Arc<BackendCore>, kind: BackendKind) -> Self {
        Self { core, kind }
    }

    /// Launch the process
    ///
    /// Returns immediately after moving to `Starting`; the outcome arrives as
    /// events. Fails only if the backend was already started.
    pub fn start(&self) -> Result<()> {
        {
            let mut core = self.core.lock();
            if core.started || core.state != ProcessState::NotRunning {
                return Err(LaunchError::RuntimeError(format!(
                    "backend for '{}' was already started",
                    core.info.program
                )));
            }
            core.started = true;
        }

        let info = self.info();
        debug!("Starting {}", info.program);
        self.core.set_state(ProcessState::Starting);

        if let Err(e) = info.validate() {
            self.core.fail_to_start(e.to_string());
            return Ok(());
        }

        match &self.kind {
            BackendKind::Local(local) => local.start(&self.core, info),
            BackendKind::Remote(remote) => remote.start(&self.core, info),
        }
        Ok(())
    }

    /// Terminate: SIGTERM, then SIGKILL once `timeout` passes
    ///
    /// No-op when not running.
    pub fn stop(&self, timeout: Duration) {
        if self.state() == ProcessState::NotRunning {
            return;
        }
        debug!("Stopping {:?} (timeout {:?})", self.pid(), timeout);
        match &self.kind {
            BackendKind::Local(local) => local.stop(timeout),
            BackendKind::Remote(remote) => remote.stop(timeout),
        }
    }

    /// Queue `data` for the process's stdin; returns the number of bytes
    /// accepted, 0 when not running.
    pub fn write(&self, data: &[u8]) -> usize {
        if self.state() != ProcessState::Running || data.is_empty() {
            return 0;
        }
        match &self.kind {
            BackendKind::Local(local) => local.write(data),
            BackendKind::Remote(remote) => remote.write(data),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.core.pid()
    }

    pub fn state(&self) -> ProcessState {
        self.core.state()
    }

    /// Copy of the configuration this backend runs
    pub fn info(&self) -> ProcessInfo {
        self.core.lock().info.clone()
    }

    pub fn program(&self) -> String {
        self.core.lock().info.program.clone()
    }

    /// Replace the configuration of a backend that has not been started
    ///
    /// Used to relabel a prelaunched spare with the requested launch.
    pub fn set_info(&self, info: ProcessInfo) -> Result<()> {
        let mut core = self.core.lock();
        if core.started {
            return Err(LaunchError::RuntimeError(
                "cannot relabel a started backend".into(),
            ));
        }
        core.desired_priority = info.priority;
        core.desired_oom = info.oom_adjustment;
        core.info = info;
        Ok(())
    }

    pub fn error_string(&self) -> String {
        self.core.lock().error_string.clone()
    }

    pub fn subscribe(&self) -> BackendEvents {
        self.core.subscribe()
    }

    pub fn desired_priority(&self) -> Option<i32> {
        self.core.lock().desired_priority
    }

    /// Nice value of the running process as the OS reports it
    pub fn actual_priority(&self) -> Option<i32> {
        match &self.kind {
            BackendKind::Local(_) => self.visible_pid().and_then(procutils::priority_of),
            BackendKind::Remote(_) => self.visible_pid().and(self.desired_priority()),
        }
    }

    pub fn set_desired_priority(&self, priority: i32) {
        self.core.lock().desired_priority = Some(priority);
        match &self.kind {
            BackendKind::Local(_) => {
                if let Some(pid) = self.visible_pid() {
                    if let Err(e) = procutils::set_priority(pid, priority) {
                        warn!("Failed to set priority {} on PID {}: {}", priority, pid, e);
                    }
                }
            }
            BackendKind::Remote(remote) => remote.set_priority(priority),
        }
    }

    pub fn desired_oom_adjustment(&self) -> Option<i32> {
        self.core.lock().desired_oom
    }

    /// `oom_score_adj` of the running process; `None` when unsupported or
    /// not running
    pub fn actual_oom_adjustment(&self) -> Option<i32> {
        match &self.kind {
            BackendKind::Local(_) => self.visible_pid().and_then(procutils::oom_score_of),
            BackendKind::Remote(_) => self.visible_pid().and(self.desired_oom_adjustment()),
        }
    }

    pub fn set_desired_oom_adjustment(&self, oom: i32) {
        self.core.lock().desired_oom = Some(oom);
        match &self.kind {
            BackendKind::Local(_) => {
                if let Some(pid) = self.visible_pid() {
                    if let Err(e) = procutils::set_oom_score(pid, oom) {
                        warn!("Failed to set OOM adjustment {} on PID {}: {}", oom, pid, e);
                    }
                }
            }
            BackendKind::Remote(remote) => remote.set_oom_adjustment(oom),
        }
    }

    /// Spawn the template ahead of time, hidden behind `NotRunning`
    ///
    /// The returned receiver resolves if the spare dies before `start()`.
    pub(crate) fn prestart(&self) -> Result<SpareExit> {
        match &self.kind {
            BackendKind::Local(local) => local.prestart(&self.core),
            BackendKind::Remote(_) => Err(LaunchError::RuntimeError(
                "remote backends cannot be prestarted".into(),
            )),
        }
    }

    /// Prestarted and still alive
    pub fn is_ready(&self) -> bool {
        match &self.kind {
            BackendKind::Local(local) => local.is_ready(&self.core),
            BackendKind::Remote(_) => false,
        }
    }

    /// pid of a started process; a hidden spare's pid is not exposed here
    fn visible_pid(&self) -> Option<u32> {
        let core = self.core.lock();
        if core.state == ProcessState::NotRunning {
            None
        } else {
            core.pid
        }
    }
}

impl fmt::Debug for ProcessBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.core.lock();
        f.debug_struct("ProcessBackend")
            .field("program", &core.info.program)
            .field("state", &core.state)
            .field("pid", &core.pid)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_state_emits_on_change_only() {
        let core = BackendCore::new(ProcessInfo::new("true"));
        let mut events = core.subscribe();

        core.set_state(ProcessState::NotRunning);
        core.set_state(ProcessState::Starting);
        core.set_state(ProcessState::Starting);

        assert_eq!(
            events.try_recv(),
            Some(BackendEvent::StateChanged(ProcessState::Starting))
        );
        assert_eq!(events.try_recv(), None);
    }

    #[test]
    fn test_finish_once() {
        let core = BackendCore::new(ProcessInfo::new("true"));
        let mut events = core.subscribe();

        core.finish(0, ExitStatus::Normal);
        core.finish(1, ExitStatus::Crashed);

        assert!(matches!(events.try_recv(), Some(BackendEvent::Finished { exit_code: 0, .. })));
        assert_eq!(events.try_recv(), None);
    }

    #[test]
    fn test_unsubscribe_on_drop() {
        let core = BackendCore::new(ProcessInfo::new("true"));
        let events = core.subscribe();
        assert_eq!(core.subscribers.lock().len(), 1);
        drop(events);
        assert!(core.subscribers.lock().is_empty());
    }

    #[test]
    fn test_stop_on_idle_backend_is_silent() {
        let backend = ProcessBackend::local(ProcessInfo::new("sleep"));
        let mut events = backend.subscribe();
        backend.stop(DEFAULT_STOP_TIMEOUT);
        assert_eq!(events.try_recv(), None);
        assert_eq!(backend.write(b"hello"), 0);
        assert_eq!(backend.state(), ProcessState::NotRunning);
    }

    #[test]
    fn test_invalid_info_fails_to_start() {
        let backend = ProcessBackend::local(ProcessInfo::default());
        let mut events = backend.subscribe();
        backend.start().unwrap();

        assert_eq!(
            events.try_recv(),
            Some(BackendEvent::StateChanged(ProcessState::Starting))
        );
        assert!(matches!(
            events.try_recv(),
            Some(BackendEvent::Error { kind: ProcessError::FailedToStart, .. })
        ));
        assert_eq!(
            events.try_recv(),
            Some(BackendEvent::StateChanged(ProcessState::NotRunning))
        );
        assert!(backend.start().is_err());
    }

    #[test]
    fn test_relabel_before_start() {
        let backend = ProcessBackend::local(ProcessInfo::new("cat"));
        backend
            .set_info(ProcessInfo::new("cat").with_identifier("worker-1").with_priority(5))
            .unwrap();
        assert_eq!(backend.info().identifier.as_deref(), Some("worker-1"));
        assert_eq!(backend.desired_priority(), Some(5));
    }
}
