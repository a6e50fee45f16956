// packages/proclaunch/src/remote/launcher.rs
//! Launcher side of the remote protocol
//!
//! Serves one client connection on top of a [`BackendManager`]. A `start`
//! for a new id creates a backend through the manager's factory chain;
//! everything that backend emits is sent back tagged with the same id.
//! Ids are forgotten once their process has finished or failed to start.
//!
//! The manager's internal process list and the idle requests of an
//! external idle delegate are reported as untagged events.

use crate::factory::FactoryEvent;
use crate::manager::BackendManager;
use crate::remote::client::{decode_inbound, write_frames};
use crate::remote::protocol::{self, Command, Event, Frame, SetKey};
use crate::remote::schema::FrameValidator;
use crate::runtime::{BackendEvent, IdleDelegate, ProcessBackend, ProcessError, ProcessInfo, ProcessState};
use crate::utils::errors::{LaunchError, Result};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tracing::{debug, info, trace, warn};

struct Session {
    backend: ProcessBackend,
    forwarder: JoinHandle<()>,
    failed: bool,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

/// Per-connection state owned by the serving task
struct Connection<'a> {
    manager: &'a BackendManager,
    outbound: mpsc::UnboundedSender<Frame>,
    events: mpsc::UnboundedSender<(u64, BackendEvent)>,
    sessions: HashMap<u64, Session>,
    idle: Option<IdleDelegate>,
}

/// Serves launcher connections for one manager
#[derive(Clone)]
pub struct Launcher {
    manager: BackendManager,
    validator: Arc<FrameValidator>,
}

impl Launcher {
    pub fn new(manager: BackendManager, validator: FrameValidator) -> Self {
        Self {
            manager,
            validator: Arc::new(validator),
        }
    }

    pub fn manager(&self) -> &BackendManager {
        &self.manager
    }

    /// Serve one connection until the client hangs up
    ///
    /// Every process started over the connection is killed when it ends.
    pub async fn serve<R, W>(&self, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let validator = self.validator.clone();
        let mut writer_task =
            tokio::spawn(async move { write_frames(writer, outbound_rx, &validator).await });
        let mut writer_open = true;

        let (events, mut events_rx) = mpsc::unbounded_channel();
        let idle = self.manager.idle_delegate().filter(IdleDelegate::is_external);
        let mut requested = idle.as_ref().map(IdleDelegate::watch_requested);
        let mut manager_events = self.manager.subscribe();

        let mut conn = Connection {
            manager: &self.manager,
            outbound,
            events,
            sessions: HashMap::new(),
            idle,
        };
        conn.report_internal_processes();
        if conn.idle.as_ref().map(IdleDelegate::is_requested).unwrap_or(false) {
            conn.send(Frame::control_event(Event::IdleCpuRequested(true)));
        }

        let mut lines = FramedRead::new(reader, protocol::codec());
        let result = loop {
            tokio::select! {
                line = lines.next() => match line {
                    Some(Ok(line)) => match decode_inbound(&line, &self.validator) {
                        Ok(Some(frame)) => conn.handle(frame),
                        Ok(None) => {}
                        Err(_) => break Err(LaunchError::Protocol("frame failed validation".into())),
                    },
                    Some(Err(e)) => break Err(LaunchError::Protocol(e.to_string())),
                    None => break Ok(()),
                },
                Some((id, event)) = events_rx.recv() => conn.forward(id, event),
                changed = manager_events.recv() => match changed {
                    Ok(FactoryEvent::InternalProcessesChanged) | Err(RecvError::Lagged(_)) => {
                        conn.report_internal_processes()
                    }
                    Ok(_) | Err(RecvError::Closed) => {}
                },
                Some(request) = requested_changed(&mut requested) => {
                    conn.send(Frame::control_event(Event::IdleCpuRequested(request)))
                }
                _ = &mut writer_task, if writer_open => {
                    writer_open = false;
                    break Ok(());
                }
            }
        };

        if !conn.sessions.is_empty() {
            info!("Connection closed, killing {} processes", conn.sessions.len());
        }
        drop(conn);
        if writer_open {
            let _ = writer_task.await;
        }
        result
    }
}

impl Connection<'_> {
    fn send(&self, frame: Frame) {
        if self.outbound.send(frame).is_err() {
            trace!("Dropping frame for a closed connection");
        }
    }

    fn report_internal_processes(&self) {
        let pids = self.manager.internal_processes();
        self.send(Frame::control_event(Event::InternalProcesses(pids)));
    }

    fn handle(&mut self, frame: Frame) {
        match frame {
            Frame::Command {
                id: Some(id),
                command: Command::Start(info),
            } => self.start(id, info),
            Frame::Command {
                id: Some(id),
                command,
            } => match self.sessions.get(&id) {
                Some(session) => apply(&session.backend, command),
                None => trace!("Ignoring {:?} for unknown id {}", command, id),
            },
            Frame::Command {
                id: None,
                command: Command::Memory { restricted },
            } => self.manager.set_memory_restricted(restricted),
            Frame::Command {
                id: None,
                command: Command::IdleCpuAvailable,
            } => match &self.idle {
                Some(idle) => {
                    idle.signal_available();
                }
                None => trace!("Ignoring idle grant without an external idle delegate"),
            },
            Frame::Command { id: None, command } => warn!("Ignoring untagged {:?}", command),
            Frame::Event { event, .. } => warn!("Ignoring event from client: {:?}", event),
        }
    }

    fn start(&mut self, id: u64, info: ProcessInfo) {
        if self.sessions.contains_key(&id) {
            warn!("Ignoring duplicate start for id {}", id);
            return;
        }

        let backend = match self.manager.create(info) {
            Ok(backend) => backend,
            Err(e) => {
                warn!("Cannot start id {}: {}", id, e);
                self.send(Frame::event(
                    id,
                    Event::Error {
                        kind: ProcessError::FailedToStart,
                        message: e.to_string(),
                    },
                ));
                self.send(Frame::event(id, Event::StateChanged(ProcessState::NotRunning)));
                return;
            }
        };

        let mut events = backend.subscribe();
        let forward = self.events.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if forward.send((id, event)).is_err() {
                    break;
                }
            }
        });

        debug!("Starting {} as id {}", backend.program(), id);
        if let Err(e) = backend.start() {
            warn!("Failed to start id {}: {}", id, e);
        }
        self.sessions.insert(
            id,
            Session {
                backend,
                forwarder,
                failed: false,
            },
        );
    }

    fn forward(&mut self, id: u64, event: BackendEvent) {
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };

        let (event, done) = match event {
            BackendEvent::StateChanged(state) => (
                Event::StateChanged(state),
                state == ProcessState::NotRunning && session.failed,
            ),
            BackendEvent::Started => (
                Event::Started {
                    pid: session.backend.pid(),
                },
                false,
            ),
            BackendEvent::Error { kind, message } => {
                session.failed |= kind == ProcessError::FailedToStart;
                (Event::Error { kind, message }, false)
            }
            BackendEvent::Finished {
                exit_code,
                exit_status,
            } => (
                Event::Finished {
                    exit_code,
                    exit_status,
                },
                true,
            ),
            BackendEvent::Stdout(output) => (Event::Stdout(output), false),
            BackendEvent::Stderr(output) => (Event::Stderr(output), false),
        };

        self.send(Frame::event(id, event));
        if done {
            trace!("Forgetting id {}", id);
            self.sessions.remove(&id);
        }
    }
}

fn apply(backend: &ProcessBackend, command: Command) {
    match command {
        Command::Stop { timeout } => backend.stop(timeout),
        Command::Write(data) => {
            let written = backend.write(&data);
            if written < data.len() {
                debug!("Dropped write of {} bytes to {:?}", data.len(), backend.pid());
            }
        }
        Command::Set {
            key: SetKey::Priority,
            value,
        } => backend.set_desired_priority(value),
        Command::Set {
            key: SetKey::OomAdjustment,
            value,
        } => backend.set_desired_oom_adjustment(value),
        other => warn!("Ignoring tagged {:?}", other),
    }
}

/// Next value of the idle request flag; pends forever without a delegate
async fn requested_changed(watch: &mut Option<watch::Receiver<bool>>) -> Option<bool> {
    let Some(rx) = watch.as_mut() else {
        return std::future::pending().await;
    };
    if rx.changed().await.is_err() {
        *watch = None;
        return None;
    }
    let requested = *rx.borrow_and_update();
    Some(requested)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::{BackendFactory, PrelaunchFactory, StandardFactory};
    use crate::remote::{ClientEvent, LauncherClient};
    use crate::runtime::{BackendEvents, ExitStatus, KeyMatcher, MatchAll};
    use std::time::Duration;
    use tokio::time::{sleep, timeout, Instant};

    fn connect(manager: BackendManager) -> (LauncherClient, JoinHandle<Result<()>>) {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let (read, write) = tokio::io::split(local);
        let client = LauncherClient::spawn(read, write, FrameValidator::disabled());

        let launcher = Launcher::new(manager, FrameValidator::disabled());
        let (remote_read, remote_write) = tokio::io::split(remote);
        let server = tokio::spawn(async move { launcher.serve(remote_read, remote_write).await });
        (client, server)
    }

    fn standard_manager() -> BackendManager {
        let manager = BackendManager::new();
        manager.add_factory(BackendFactory::from(StandardFactory::new()).with_matcher(MatchAll));
        manager
    }

    async fn next(events: &mut BackendEvents) -> BackendEvent {
        timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap()
    }

    async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !check() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_remote_process_lifecycle() {
        let (client, _server) = connect(standard_manager());
        let info = ProcessInfo::new("sh").with_arguments(["-c", "read line; echo \"got $line\"; exit 3"]);
        let backend = client.create_backend(info);
        let mut events = backend.subscribe();
        backend.start().unwrap();

        assert_eq!(next(&mut events).await, BackendEvent::StateChanged(ProcessState::Starting));
        assert_eq!(next(&mut events).await, BackendEvent::StateChanged(ProcessState::Running));
        assert_eq!(next(&mut events).await, BackendEvent::Started);
        let pid = backend.pid().unwrap();
        assert!(crate::runtime::procutils::is_running(pid));

        assert_eq!(backend.write(b"hello\n"), 6);
        let mut output = Vec::new();
        let finished = loop {
            match next(&mut events).await {
                BackendEvent::Stdout(chunk) => output.extend(chunk),
                event @ BackendEvent::Finished { .. } => break event,
                _ => {}
            }
        };
        assert_eq!(output, b"got hello\n");
        assert_eq!(
            finished,
            BackendEvent::Finished {
                exit_code: 3,
                exit_status: ExitStatus::Normal
            }
        );
        assert_eq!(backend.state(), ProcessState::NotRunning);
        eventually("id released", || client.backend_count() == 0).await;
    }

    #[tokio::test]
    async fn test_no_matching_factory_fails_to_start() {
        let manager = BackendManager::new();
        manager.add_factory(BackendFactory::from(StandardFactory::new()).with_matcher(KeyMatcher::new("remote")));
        let (client, _server) = connect(manager);

        let backend = client.create_backend(ProcessInfo::new("sleep"));
        let mut events = backend.subscribe();
        backend.start().unwrap();

        assert_eq!(next(&mut events).await, BackendEvent::StateChanged(ProcessState::Starting));
        assert!(matches!(
            next(&mut events).await,
            BackendEvent::Error { kind: ProcessError::FailedToStart, .. }
        ));
        assert_eq!(next(&mut events).await, BackendEvent::StateChanged(ProcessState::NotRunning));
        assert!(backend.error_string().contains("sleep"));
    }

    #[tokio::test]
    async fn test_stop_and_priority_forwarded() {
        let (client, _server) = connect(standard_manager());
        let backend = client.create_backend(ProcessInfo::new("sleep").with_arguments(["30"]));
        let mut events = backend.subscribe();
        backend.start().unwrap();
        while next(&mut events).await != BackendEvent::Started {}
        let pid = backend.pid().unwrap();

        backend.set_desired_priority(12);
        eventually("priority applied", || {
            crate::runtime::procutils::priority_of(pid) == Some(12)
        })
        .await;

        backend.stop(Duration::from_millis(500));
        let finished = loop {
            if let event @ BackendEvent::Finished { .. } = next(&mut events).await {
                break event;
            }
        };
        assert!(matches!(
            finished,
            BackendEvent::Finished { exit_status: ExitStatus::Crashed, .. }
        ));
        eventually("process gone", || !crate::runtime::procutils::is_running(pid)).await;
    }

    #[tokio::test]
    async fn test_memory_command_reaches_manager() {
        let manager = standard_manager();
        let (client, _server) = connect(manager.clone());
        client.set_memory_restricted(true);
        eventually("restriction", || manager.memory_restricted()).await;
        client.set_memory_restricted(false);
        eventually("release", || !manager.memory_restricted()).await;
    }

    #[tokio::test]
    async fn test_idle_requests_relayed_to_client() {
        let manager = BackendManager::new();
        manager.set_idle_delegate(Some(IdleDelegate::external()));
        manager.add_factory(
            BackendFactory::from(
                PrelaunchFactory::new(Some(ProcessInfo::new("sleep").with_arguments(["30"])))
                    .with_launch_interval(Duration::from_millis(20)),
            )
            .with_matcher(MatchAll),
        );
        let (client, _server) = connect(manager.clone());
        let mut client_events = client.subscribe();

        timeout(Duration::from_secs(5), async {
            while client_events.recv().await.unwrap() != ClientEvent::IdleCpuRequested(true) {}
        })
        .await
        .unwrap();
        assert!(manager.internal_processes().is_empty());

        client.idle_cpu_available();
        eventually("remote spare reported", || !client.internal_processes().is_empty()).await;
        assert_eq!(client.internal_processes(), manager.internal_processes());
    }

    #[tokio::test]
    async fn test_hangup_kills_processes() {
        let (client, server) = connect(standard_manager());
        let backend = client.create_backend(ProcessInfo::new("sleep").with_arguments(["30"]));
        let mut events = backend.subscribe();
        backend.start().unwrap();
        while next(&mut events).await != BackendEvent::Started {}
        let pid = backend.pid().unwrap();

        client.close();
        let served = timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
        assert!(served.is_ok());
        eventually("process killed", || !crate::runtime::procutils::is_running(pid)).await;
    }
}
