// packages/proclaunch/src/remote/client.rs
//! Launcher client: id ↔ proxy multiplexer
//!
//! One `LauncherClient` serves one connection to a remote launcher. Every
//! proxy backend it creates gets a locally assigned id; commands for that
//! backend are tagged with the id and events carrying it are routed back to
//! the proxy alone.
//!
//! # Architecture
//!
//! ```text
//! ProcessBackend(Remote id=1) ─┐                    ┌─► launcher
//! ProcessBackend(Remote id=2) ─┼─► writer task ─────┤
//!                              │                    │
//! BackendCore(id=1) ◄──┐       │                    │
//! BackendCore(id=2) ◄──┴─ reader task ◄─────────────┘
//! ```
//!
//! When the connection drops every outstanding proxy gets an
//! `UnknownError` and moves to `NotRunning`.

use crate::observability;
use crate::remote::protocol::{self, Command, Event, Frame, RemoteMessage};
use crate::remote::schema::{FrameValidator, Verdict};
use crate::runtime::backend::{BackendCore, BackendKind};
use crate::runtime::{ProcessBackend, ProcessError, ProcessInfo, ProcessState};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc, Notify};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, trace, warn};

/// Launcher-level notifications
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The launcher's own pool changed
    InternalProcesses(Vec<u32>),
    /// The launcher wants (or no longer wants) idle capacity
    IdleCpuRequested(bool),
    Disconnected,
}

struct ClientShared {
    outbound: mpsc::UnboundedSender<Frame>,
    backends: DashMap<u64, Weak<BackendCore>>,
    next_id: AtomicU64,
    connected: AtomicBool,
    remote_pids: Mutex<Vec<u32>>,
    events: broadcast::Sender<ClientEvent>,
    shutdown: Notify,
    writer_stop: Arc<Notify>,
}

impl ClientShared {
    fn send(&self, frame: Frame) -> bool {
        self.outbound.send(frame).is_ok()
    }
}

/// One connection to a remote launcher
#[derive(Clone)]
pub struct LauncherClient {
    shared: Arc<ClientShared>,
}

impl LauncherClient {
    /// Start serving a connection split into its two halves
    pub fn spawn<R, W>(reader: R, writer: W, validator: FrameValidator) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);
        let shared = Arc::new(ClientShared {
            outbound,
            backends: DashMap::new(),
            next_id: AtomicU64::new(1),
            connected: AtomicBool::new(true),
            remote_pids: Mutex::new(Vec::new()),
            events,
            shutdown: Notify::new(),
            writer_stop: Arc::new(Notify::new()),
        });
        let validator = Arc::new(validator);

        tokio::spawn(write_loop(
            writer,
            outbound_rx,
            validator.clone(),
            shared.writer_stop.clone(),
            Arc::downgrade(&shared),
        ));
        tokio::spawn(read_loop(reader, validator, shared.clone()));

        Self { shared }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// New proxy backend bound to `info`; nothing is sent until `start()`
    pub fn create_backend(&self, info: ProcessInfo) -> ProcessBackend {
        let core = BackendCore::new(info);
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared.backends.insert(id, Arc::downgrade(&core));
        trace!("Created remote proxy {}", id);

        ProcessBackend::from_parts(
            core,
            BackendKind::Remote(RemoteBackend {
                id,
                client: self.shared.clone(),
                started: AtomicBool::new(false),
            }),
        )
    }

    /// Number of proxies still routed by this client
    pub fn backend_count(&self) -> usize {
        self.shared.backends.len()
    }

    pub fn set_memory_restricted(&self, restricted: bool) {
        self.shared
            .send(Frame::control_command(Command::Memory { restricted }));
    }

    /// Grant the launcher one unit of idle capacity
    pub fn idle_cpu_available(&self) {
        self.shared
            .send(Frame::control_command(Command::IdleCpuAvailable));
    }

    /// The launcher's internal processes as last reported
    pub fn internal_processes(&self) -> Vec<u32> {
        self.shared.remote_pids.lock().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.shared.events.subscribe()
    }

    /// Close the connection; outstanding proxies fail with `UnknownError`
    pub fn close(&self) {
        self.shared.shutdown.notify_one();
    }
}

/// Remote half of a [`ProcessBackend`]
pub(crate) struct RemoteBackend {
    id: u64,
    client: Arc<ClientShared>,
    started: AtomicBool,
}

impl RemoteBackend {
    pub fn start(&self, core: &Arc<BackendCore>, mut info: ProcessInfo) {
        if !self.client.connected.load(Ordering::SeqCst) {
            core.fail_to_start("launcher connection closed");
            return;
        }
        {
            let core = core.lock();
            info.priority = core.desired_priority;
            info.oom_adjustment = core.desired_oom;
        }
        self.started.store(true, Ordering::SeqCst);
        if !self.client.send(Frame::command(self.id, Command::Start(info))) {
            core.fail_to_start("launcher connection closed");
        }
    }

    pub fn stop(&self, timeout: Duration) {
        self.client
            .send(Frame::command(self.id, Command::Stop { timeout }));
    }

    pub fn write(&self, data: &[u8]) -> usize {
        if self
            .client
            .send(Frame::command(self.id, Command::Write(data.to_vec())))
        {
            data.len()
        } else {
            0
        }
    }

    pub fn set_priority(&self, priority: i32) {
        self.set(protocol::SetKey::Priority, priority);
    }

    pub fn set_oom_adjustment(&self, oom: i32) {
        self.set(protocol::SetKey::OomAdjustment, oom);
    }

    fn set(&self, key: protocol::SetKey, value: i32) {
        // Before start the values travel inside the start command
        if self.started.load(Ordering::SeqCst) {
            self.client
                .send(Frame::command(self.id, Command::Set { key, value }));
        }
    }
}

impl Drop for RemoteBackend {
    fn drop(&mut self) {
        let live = self.client.backends.remove(&self.id).is_some();
        if live && self.started.load(Ordering::SeqCst) {
            debug!("Remote proxy {} dropped, stopping", self.id);
            self.client.send(Frame::command(
                self.id,
                Command::Stop {
                    timeout: Duration::ZERO,
                },
            ));
        }
    }
}

async fn write_loop<W>(
    writer: W,
    outbound: mpsc::UnboundedReceiver<Frame>,
    validator: Arc<FrameValidator>,
    stop: Arc<Notify>,
    shared: Weak<ClientShared>,
) where
    W: AsyncWrite + Unpin,
{
    tokio::select! {
        _ = write_frames(writer, outbound, &validator) => {}
        _ = stop.notified() => return,
    }
    if let Some(shared) = shared.upgrade() {
        shared.shutdown.notify_one();
    }
}

/// Encode, validate and write frames until the queue closes or the peer
/// goes away
pub(crate) async fn write_frames<W>(
    writer: W,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    validator: &FrameValidator,
) where
    W: AsyncWrite + Unpin,
{
    let mut sink = FramedWrite::new(writer, protocol::codec());

    while let Some(frame) = outbound.recv().await {
        let value = match frame.to_message().and_then(|m| Ok(serde_json::to_value(m)?)) {
            Ok(value) => value,
            Err(e) => {
                warn!("Failed to encode frame: {}", e);
                continue;
            }
        };
        match validator.check_outbound(&value) {
            Verdict::Accept => {}
            Verdict::Drop => {
                observability::record_frame_dropped("schema");
                continue;
            }
            Verdict::Close => break,
        }
        if let Err(e) = sink.send(value.to_string()).await {
            error!("Failed to write frame: {}", e);
            break;
        }
    }
}

async fn read_loop<R>(reader: R, validator: Arc<FrameValidator>, shared: Arc<ClientShared>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = FramedRead::new(reader, protocol::codec());

    loop {
        let line = tokio::select! {
            line = lines.next() => line,
            _ = shared.shutdown.notified() => {
                debug!("Closing launcher connection");
                break;
            }
        };

        let line = match line {
            Some(Ok(line)) => line,
            Some(Err(e)) => {
                error!("Launcher connection failed: {}", e);
                break;
            }
            None => {
                debug!("Launcher closed the connection");
                break;
            }
        };

        match decode_inbound(&line, &validator) {
            Ok(Some(frame)) => dispatch(&shared, frame),
            Ok(None) => {}
            Err(Verdict::Close) => break,
            Err(_) => {}
        }
    }

    connection_lost(&shared);
}

/// `Ok(None)` for a dropped frame, `Err(Verdict::Close)` to hang up
pub(crate) fn decode_inbound(
    line: &str,
    validator: &FrameValidator,
) -> std::result::Result<Option<Frame>, Verdict> {
    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => {
            warn!("Dropping malformed frame: {}", e);
            observability::record_frame_dropped("malformed");
            return Ok(None);
        }
    };

    match validator.check_inbound(&value) {
        Verdict::Accept => {}
        Verdict::Drop => {
            observability::record_frame_dropped("schema");
            return Ok(None);
        }
        Verdict::Close => return Err(Verdict::Close),
    }

    let frame = serde_json::from_value::<RemoteMessage>(value)
        .map_err(Into::into)
        .and_then(Frame::from_message);
    match frame {
        Ok(frame) => Ok(Some(frame)),
        Err(e) => {
            warn!("Dropping invalid frame: {}", e);
            observability::record_frame_dropped("invalid");
            Ok(None)
        }
    }
}

fn dispatch(shared: &ClientShared, frame: Frame) {
    match frame {
        Frame::Event { id: Some(id), event } => route(shared, id, event),
        Frame::Event { id: None, event: Event::InternalProcesses(pids) } => {
            debug!("Launcher internal processes: {:?}", pids);
            *shared.remote_pids.lock() = pids.clone();
            let _ = shared.events.send(ClientEvent::InternalProcesses(pids));
        }
        Frame::Event { id: None, event: Event::IdleCpuRequested(request) } => {
            let _ = shared.events.send(ClientEvent::IdleCpuRequested(request));
        }
        Frame::Event { id: None, event } => warn!("Ignoring event without id: {:?}", event),
        Frame::Command { command, .. } => warn!("Ignoring command from launcher: {:?}", command),
    }
}

fn route(shared: &ClientShared, id: u64, event: Event) {
    let core = shared.backends.get(&id).and_then(|entry| entry.upgrade());
    let Some(core) = core else {
        trace!("Discarding event for unknown id {}", id);
        return;
    };

    match event {
        Event::Started { pid } => {
            core.lock().pid = pid;
            core.emit(crate::runtime::BackendEvent::Started);
        }
        Event::StateChanged(state) => {
            core.set_state(state);
            if state == ProcessState::NotRunning && core.lock().finished {
                shared.backends.remove(&id);
            }
        }
        Event::Error { kind, message } => {
            if kind == ProcessError::FailedToStart {
                let mut core = core.lock();
                core.finished = true;
                core.pid = None;
            }
            core.report_error(kind, message);
        }
        Event::Finished {
            exit_code,
            exit_status,
        } => {
            core.finish(exit_code, exit_status);
            shared.backends.remove(&id);
        }
        Event::Stdout(output) => core.emit(crate::runtime::BackendEvent::Stdout(output)),
        Event::Stderr(output) => core.emit(crate::runtime::BackendEvent::Stderr(output)),
        Event::InternalProcesses(_) | Event::IdleCpuRequested(_) => {
            warn!("Ignoring launcher-level event tagged with id {}", id)
        }
    }
}

fn connection_lost(shared: &ClientShared) {
    shared.connected.store(false, Ordering::SeqCst);
    shared.writer_stop.notify_one();
    shared.remote_pids.lock().clear();

    let ids: Vec<u64> = shared.backends.iter().map(|entry| *entry.key()).collect();
    for id in ids {
        let Some((_, core)) = shared.backends.remove(&id) else {
            continue;
        };
        let Some(core) = core.upgrade() else {
            continue;
        };
        let state = core.state();
        if state == ProcessState::NotRunning {
            continue;
        }
        core.report_error(ProcessError::UnknownError, "launcher connection lost");
        core.set_state(ProcessState::NotRunning);
        if state == ProcessState::Running {
            core.finish(0, crate::runtime::ExitStatus::Crashed);
        } else {
            core.lock().finished = true;
        }
    }

    let _ = shared.events.send(ClientEvent::Disconnected);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::schema::{Schema, ValidationMode};
    use crate::runtime::{BackendEvent, BackendEvents, ExitStatus};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    struct FakeLauncher {
        lines: tokio::io::Lines<BufReader<tokio::io::ReadHalf<DuplexStream>>>,
        writer: tokio::io::WriteHalf<DuplexStream>,
    }

    impl FakeLauncher {
        async fn next_frame(&mut self) -> Frame {
            let line = tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            protocol::decode(&line).unwrap()
        }

        async fn send_raw(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).await.unwrap();
            self.writer.write_all(b"\n").await.unwrap();
        }

        async fn send(&mut self, frame: Frame) {
            let line = protocol::encode(&frame).unwrap();
            self.send_raw(&line).await;
        }

        /// Acknowledge a start the way a launcher does
        async fn run(&mut self, id: u64, pid: u32) {
            self.send(Frame::event(id, Event::StateChanged(ProcessState::Starting))).await;
            self.send(Frame::event(id, Event::StateChanged(ProcessState::Running))).await;
            self.send(Frame::event(id, Event::Started { pid: Some(pid) })).await;
        }
    }

    fn connect() -> (LauncherClient, FakeLauncher) {
        connect_with(FrameValidator::disabled())
    }

    fn connect_with(validator: FrameValidator) -> (LauncherClient, FakeLauncher) {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let (read, write) = tokio::io::split(local);
        let client = LauncherClient::spawn(read, write, validator);
        let (remote_read, remote_write) = tokio::io::split(remote);
        let launcher = FakeLauncher {
            lines: BufReader::new(remote_read).lines(),
            writer: remote_write,
        };
        (client, launcher)
    }

    async fn next(events: &mut BackendEvents) -> BackendEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap()
    }

    async fn start_running(
        client: &LauncherClient,
        launcher: &mut FakeLauncher,
        pid: u32,
    ) -> (ProcessBackend, BackendEvents) {
        let backend = client.create_backend(ProcessInfo::new("/bin/cat"));
        let mut events = backend.subscribe();
        backend.start().unwrap();

        let id = match launcher.next_frame().await {
            Frame::Command { id: Some(id), command: Command::Start(info) } => {
                assert_eq!(info.program, "/bin/cat");
                id
            }
            other => panic!("expected start, got {:?}", other),
        };
        launcher.run(id, pid).await;

        assert_eq!(next(&mut events).await, BackendEvent::StateChanged(ProcessState::Starting));
        assert_eq!(next(&mut events).await, BackendEvent::StateChanged(ProcessState::Running));
        assert_eq!(next(&mut events).await, BackendEvent::Started);
        assert_eq!(backend.pid(), Some(pid));
        (backend, events)
    }

    #[tokio::test]
    async fn test_proxy_lifecycle() {
        let (client, mut launcher) = connect();
        let (backend, mut events) = start_running(&client, &mut launcher, 4242).await;

        assert_eq!(backend.write(b"ping\n"), 5);
        let id = match launcher.next_frame().await {
            Frame::Command { id: Some(id), command: Command::Write(data) } => {
                assert_eq!(data, b"ping\n");
                id
            }
            other => panic!("expected write, got {:?}", other),
        };

        launcher.send(Frame::event(id, Event::Stdout(b"ping\n".to_vec()))).await;
        assert_eq!(next(&mut events).await, BackendEvent::Stdout(b"ping\n".to_vec()));

        backend.stop(Duration::from_millis(250));
        assert_eq!(
            launcher.next_frame().await,
            Frame::command(id, Command::Stop { timeout: Duration::from_millis(250) })
        );

        launcher.send(Frame::event(id, Event::StateChanged(ProcessState::NotRunning))).await;
        launcher
            .send(Frame::event(
                id,
                Event::Finished { exit_code: 0, exit_status: ExitStatus::Normal },
            ))
            .await;
        assert_eq!(next(&mut events).await, BackendEvent::StateChanged(ProcessState::NotRunning));
        assert_eq!(
            next(&mut events).await,
            BackendEvent::Finished { exit_code: 0, exit_status: ExitStatus::Normal }
        );
        assert_eq!(client.backend_count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_frames_are_dropped() {
        let (client, mut launcher) = connect();
        let (_backend, mut events) = start_running(&client, &mut launcher, 10).await;

        launcher.send_raw("{not json").await;
        launcher.send_raw(r#"{"event":"stdout","id":1,"data":{}}"#).await;
        launcher.send(Frame::event(999, Event::Stdout(b"lost".to_vec()))).await;
        launcher.send(Frame::event(1, Event::Stdout(b"kept".to_vec()))).await;

        assert_eq!(next(&mut events).await, BackendEvent::Stdout(b"kept".to_vec()));
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_connection_loss_fails_every_proxy() {
        let (client, mut launcher) = connect();
        let mut client_events = client.subscribe();
        let (first, mut first_events) = start_running(&client, &mut launcher, 100).await;
        let (second, mut second_events) = start_running(&client, &mut launcher, 101).await;

        drop(launcher);

        for events in [&mut first_events, &mut second_events] {
            assert!(matches!(
                next(events).await,
                BackendEvent::Error { kind: ProcessError::UnknownError, .. }
            ));
            assert_eq!(next(events).await, BackendEvent::StateChanged(ProcessState::NotRunning));
            assert_eq!(
                next(events).await,
                BackendEvent::Finished { exit_code: 0, exit_status: ExitStatus::Crashed }
            );
        }
        assert_eq!(first.state(), ProcessState::NotRunning);
        assert_eq!(second.state(), ProcessState::NotRunning);
        assert_eq!(client_events.recv().await.unwrap(), ClientEvent::Disconnected);
        assert!(!client.is_connected());

        let late = client.create_backend(ProcessInfo::new("/bin/cat"));
        let mut late_events = late.subscribe();
        late.start().unwrap();
        assert_eq!(next(&mut late_events).await, BackendEvent::StateChanged(ProcessState::Starting));
        assert!(matches!(
            next(&mut late_events).await,
            BackendEvent::Error { kind: ProcessError::FailedToStart, .. }
        ));
    }

    #[tokio::test]
    async fn test_schema_violation_closes_connection() {
        let events_only = Schema::from_value(serde_json::json!({
            "type": "object",
            "required": ["event"]
        }))
        .unwrap();
        let (client, mut launcher) =
            connect_with(FrameValidator::new(ValidationMode::Close, Some(events_only), None));
        let mut client_events = client.subscribe();
        let (first, mut first_events) = start_running(&client, &mut launcher, 200).await;
        let (second, mut second_events) = start_running(&client, &mut launcher, 201).await;

        launcher.send_raw(r#"{"command":"stop","id":1}"#).await;

        for events in [&mut first_events, &mut second_events] {
            assert!(matches!(
                next(events).await,
                BackendEvent::Error { kind: ProcessError::UnknownError, .. }
            ));
            assert_eq!(next(events).await, BackendEvent::StateChanged(ProcessState::NotRunning));
            assert_eq!(
                next(events).await,
                BackendEvent::Finished { exit_code: 0, exit_status: ExitStatus::Crashed }
            );
        }
        assert_eq!(first.state(), ProcessState::NotRunning);
        assert_eq!(second.state(), ProcessState::NotRunning);
        assert_eq!(client_events.recv().await.unwrap(), ClientEvent::Disconnected);
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_remote_failed_to_start() {
        let (client, mut launcher) = connect();
        let backend = client.create_backend(ProcessInfo::new("/nonexistent"));
        let mut events = backend.subscribe();
        backend.start().unwrap();
        let id = launcher.next_frame().await.id().unwrap();

        launcher
            .send(Frame::event(
                id,
                Event::Error { kind: ProcessError::FailedToStart, message: "no such file".into() },
            ))
            .await;
        launcher.send(Frame::event(id, Event::StateChanged(ProcessState::NotRunning))).await;

        assert_eq!(next(&mut events).await, BackendEvent::StateChanged(ProcessState::Starting));
        assert_eq!(
            next(&mut events).await,
            BackendEvent::Error { kind: ProcessError::FailedToStart, message: "no such file".into() }
        );
        assert_eq!(next(&mut events).await, BackendEvent::StateChanged(ProcessState::NotRunning));
        assert_eq!(backend.error_string(), "no such file");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(client.backend_count(), 0);
    }

    #[tokio::test]
    async fn test_control_messages() {
        let (client, mut launcher) = connect();
        let mut client_events = client.subscribe();

        client.set_memory_restricted(true);
        assert_eq!(
            launcher.next_frame().await,
            Frame::control_command(Command::Memory { restricted: true })
        );
        client.idle_cpu_available();
        assert_eq!(
            launcher.next_frame().await,
            Frame::control_command(Command::IdleCpuAvailable)
        );

        launcher
            .send(Frame::control_event(Event::InternalProcesses(vec![7, 8])))
            .await;
        assert_eq!(
            client_events.recv().await.unwrap(),
            ClientEvent::InternalProcesses(vec![7, 8])
        );
        assert_eq!(client.internal_processes(), vec![7, 8]);

        launcher.send(Frame::control_event(Event::IdleCpuRequested(true))).await;
        assert_eq!(client_events.recv().await.unwrap(), ClientEvent::IdleCpuRequested(true));
    }

    #[tokio::test]
    async fn test_dropping_running_proxy_stops_it() {
        let (client, mut launcher) = connect();
        let (backend, _events) = start_running(&client, &mut launcher, 55).await;
        drop(backend);

        match launcher.next_frame().await {
            Frame::Command { command: Command::Stop { timeout }, .. } => {
                assert_eq!(timeout, Duration::ZERO)
            }
            other => panic!("expected stop, got {:?}", other),
        }
        assert_eq!(client.backend_count(), 0);
    }
}
