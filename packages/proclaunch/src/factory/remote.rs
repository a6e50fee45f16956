// packages/proclaunch/src/factory/remote.rs
//! Factories backed by a remote launcher
//!
//! - **Pipe**: spawns the launcher as a child and speaks to it over its
//!   stdin/stdout. The launcher's pid counts as an internal process.
//! - **Socket**: connects to a launcher listening on a Unix socket and
//!   reconnects every second while the connection is down.
//!
//! Memory restriction is forwarded to the launcher. Its idle requests are
//! answered from the local idle delegate, or once per default idle
//! interval when there is none.

use crate::factory::{FactoryBase, FactoryEvent};
use crate::remote::{ClientEvent, FrameValidator, LauncherClient};
use crate::runtime::idle_delegate::DEFAULT_IDLE_INTERVAL;
use crate::runtime::{IdleDelegate, ProcessBackend, ProcessInfo};
use crate::utils::errors::{LaunchError, Result};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Delay between connection attempts to a socket launcher
pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Where the launcher lives
#[derive(Debug, Clone)]
pub enum RemoteTransport {
    /// Spawn this launcher and talk over its stdio
    Pipe(ProcessInfo),
    /// Connect to a launcher listening here
    Socket(PathBuf),
}

#[derive(Default)]
struct RemoteState {
    client: Option<LauncherClient>,
    launcher: Option<Child>,
    launcher_pid: Option<u32>,
    idle: Option<IdleDelegate>,
    idle_requested: bool,
    relay: Option<JoinHandle<()>>,
    listener: Option<JoinHandle<()>>,
    connector: Option<JoinHandle<()>>,
    closed: bool,
}

struct RemoteInner {
    base: FactoryBase,
    transport: RemoteTransport,
    validator: FrameValidator,
    state: Mutex<RemoteState>,
}

/// Factory whose backends are proxies for processes in a remote launcher
pub struct RemoteFactory {
    inner: Arc<RemoteInner>,
}

impl RemoteFactory {
    pub fn new(transport: RemoteTransport, validator: FrameValidator) -> Result<Self> {
        let inner = Arc::new(RemoteInner {
            base: FactoryBase::new(),
            transport,
            validator,
            state: Mutex::new(RemoteState::default()),
        });

        match &inner.transport {
            RemoteTransport::Pipe(launcher) => inner.spawn_launcher(launcher)?,
            RemoteTransport::Socket(_) => inner.schedule_connect(Duration::ZERO),
        }
        Ok(Self { inner })
    }

    /// Launcher child spoken to over its stdio
    pub fn pipe(launcher: ProcessInfo) -> Result<Self> {
        Self::new(RemoteTransport::Pipe(launcher), FrameValidator::disabled())
    }

    /// Launcher listening on a Unix socket
    pub fn socket(path: impl Into<PathBuf>) -> Result<Self> {
        Self::new(RemoteTransport::Socket(path.into()), FrameValidator::disabled())
    }

    pub(crate) fn base(&self) -> &FactoryBase {
        &self.inner.base
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self.inner.transport {
            RemoteTransport::Pipe(_) => "pipe",
            RemoteTransport::Socket(_) => "socket",
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner
            .state
            .lock()
            .client
            .as_ref()
            .map(LauncherClient::is_connected)
            .unwrap_or(false)
    }

    /// pid of a pipe launcher child
    pub fn launcher_pid(&self) -> Option<u32> {
        self.inner.state.lock().launcher_pid
    }

    pub(crate) fn create(&self, info: ProcessInfo) -> Result<ProcessBackend> {
        match &self.inner.state.lock().client {
            Some(client) => Ok(client.create_backend(info)),
            None => Err(LaunchError::ConnectionClosed),
        }
    }

    pub(crate) fn internal_processes(&self) -> Vec<u32> {
        let state = self.inner.state.lock();
        let mut pids: Vec<u32> = state.launcher_pid.into_iter().collect();
        if let Some(client) = &state.client {
            pids.extend(client.internal_processes());
        }
        pids
    }

    pub(crate) fn handle_memory_restriction_change(&self, restricted: bool) {
        if let Some(client) = &self.inner.state.lock().client {
            client.set_memory_restricted(restricted);
        }
    }

    pub(crate) fn set_idle_delegate(&self, idle: Option<IdleDelegate>) {
        let mut state = self.inner.state.lock();
        state.idle = idle;
        let requested = state.idle_requested;
        self.inner.relay_idle(&mut state, requested);
    }

    pub(crate) fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        state.closed = true;
        for task in [state.relay.take(), state.listener.take(), state.connector.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
        if let Some(client) = state.client.take() {
            client.close();
        }
        if let Some(mut launcher) = state.launcher.take() {
            let _ = launcher.start_kill();
        }
        state.launcher_pid = None;
    }
}

impl RemoteInner {
    fn spawn_launcher(self: &Arc<Self>, launcher: &ProcessInfo) -> Result<()> {
        let mut command = Command::new(&launcher.program);
        command
            .args(&launcher.arguments)
            .envs(&launcher.environment)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = &launcher.working_directory {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| {
            LaunchError::ProcessSpawnFailed(format!("launcher {}: {}", launcher.program, e))
        })?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(LaunchError::ProcessSpawnFailed(
                "launcher stdio was not captured".into(),
            ));
        };
        let pid = child.id();
        info!("Spawned launcher {} (PID {:?})", launcher.program, pid);

        let client = LauncherClient::spawn(stdout, stdin, self.validator.clone());
        let mut state = self.state.lock();
        state.launcher = Some(child);
        state.launcher_pid = pid;
        self.attach(&mut state, client);
        drop(state);

        self.base.emit(FactoryEvent::InternalProcessesChanged);
        Ok(())
    }

    fn schedule_connect(self: &Arc<Self>, delay: Duration) {
        let RemoteTransport::Socket(path) = &self.transport else {
            return;
        };
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("No async runtime, not connecting to {}", path.display());
            return;
        };
        let path = path.clone();
        let weak = Arc::downgrade(self);
        state.connector = Some(handle.spawn(async move {
            tokio::time::sleep(delay).await;
            connect_loop(weak, path).await;
        }));
    }

    /// Install `client` as the live connection
    fn attach(self: &Arc<Self>, state: &mut RemoteState, client: LauncherClient) {
        if state.closed {
            client.close();
            return;
        }
        if self.base.memory_restricted() {
            client.set_memory_restricted(true);
        }
        let events = client.subscribe();
        state.listener = Some(tokio::spawn(listen(Arc::downgrade(self), events)));
        state.client = Some(client);
    }

    fn disconnected(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            state.client = None;
            state.listener = None;
            state.idle_requested = false;
            if let Some(relay) = state.relay.take() {
                relay.abort();
            }
            if let Some(mut launcher) = state.launcher.take() {
                error!("Lost connection to launcher (PID {:?})", state.launcher_pid);
                let _ = launcher.start_kill();
                state.launcher_pid = None;
            }
        }
        self.base.emit(FactoryEvent::InternalProcessesChanged);

        if let RemoteTransport::Socket(path) = &self.transport {
            warn!("Lost connection to launcher at {}, reconnecting", path.display());
            self.schedule_connect(RECONNECT_DELAY);
        }
    }

    /// Keep granting idle capacity to the launcher while it asks for it
    fn relay_idle(&self, state: &mut RemoteState, requested: bool) {
        state.idle_requested = requested;
        if let Some(relay) = state.relay.take() {
            relay.abort();
        }
        let Some(client) = state.client.clone() else {
            return;
        };
        if !requested {
            return;
        }

        let idle = state.idle.clone();
        state.relay = Some(tokio::spawn(async move {
            loop {
                if let Some(idle) = &idle {
                    idle.wait_idle().await;
                }
                debug!("Granting idle capacity to launcher");
                client.idle_cpu_available();
                if idle.is_none() {
                    tokio::time::sleep(DEFAULT_IDLE_INTERVAL).await;
                }
            }
        }));
    }
}

impl Drop for RemoteInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for task in [state.relay.take(), state.listener.take(), state.connector.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
        if let Some(client) = state.client.take() {
            client.close();
        }
    }
}

async fn connect_loop(factory: Weak<RemoteInner>, path: PathBuf) {
    loop {
        match UnixStream::connect(&path).await {
            Ok(stream) => {
                let Some(factory) = factory.upgrade() else {
                    return;
                };
                info!("Connected to launcher at {}", path.display());
                let (reader, writer) = stream.into_split();
                let client = LauncherClient::spawn(reader, writer, factory.validator.clone());
                {
                    let mut state = factory.state.lock();
                    state.connector = None;
                    factory.attach(&mut state, client);
                }
                factory.base.emit(FactoryEvent::InternalProcessesChanged);
                return;
            }
            Err(e) => {
                debug!("Launcher at {} unavailable: {}", path.display(), e);
                if factory.strong_count() == 0 {
                    return;
                }
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

async fn listen(
    factory: Weak<RemoteInner>,
    mut events: tokio::sync::broadcast::Receiver<ClientEvent>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!("Missed {} launcher notifications", skipped);
                continue;
            }
            Err(RecvError::Closed) => ClientEvent::Disconnected,
        };
        let Some(factory) = factory.upgrade() else {
            return;
        };
        match event {
            ClientEvent::InternalProcesses(_) => {
                factory.base.emit(FactoryEvent::InternalProcessesChanged)
            }
            ClientEvent::IdleCpuRequested(requested) => {
                factory.relay_idle(&mut factory.state.lock(), requested)
            }
            ClientEvent::Disconnected => {
                factory.disconnected();
                return;
            }
        }
    }
}
