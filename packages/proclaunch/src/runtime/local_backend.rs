// packages/proclaunch/src/runtime/local_backend.rs
//! Local process driver
//!
//! Spawns the child with `tokio::process` and runs one driver task per
//! child that owns it exclusively. Everything the owner asks for (write,
//! stop, reveal) is a message to that task; everything the child does
//! (output, exit) is turned into [`BackendEvent`]s by that task alone.
//!
//! # Architecture
//!
//! ```text
//! ProcessBackend ──Control──► Driver ──BackendEvent──► subscribers
//!                               │  ▲
//!                      stdin ◄──┘  └── stdout / stderr / wait()
//!                    (writer task)
//! ```
//!
//! A prestarted spare runs the same driver in a hidden phase: the child is
//! alive and its pid known, but the backend reports `NotRunning` and its
//! output is discarded until `start()` reveals it. A spare that dies while
//! hidden emits nothing; its pool learns of it through [`SpareExit`], and a
//! later `start()` fails with `FailedToStart`.

use crate::runtime::backend::{BackendCore, BackendEvent, ExitStatus, ProcessError, ProcessState};
use crate::runtime::process_info::ProcessInfo;
use crate::runtime::procutils::{self, Adjustment};
use crate::utils::errors::{LaunchError, Result};
use nix::sys::signal::Signal;
use parking_lot::Mutex;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

const READ_CHUNK: usize = 8192;

/// How long to keep reading pipes after the child has exited
const DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

/// Resolves when a hidden spare dies; carries `Crashed` if it was killed
pub(crate) type SpareExit = oneshot::Receiver<Option<ProcessError>>;

enum Control {
    Write(Vec<u8>),
    Stop(Duration),
    Reveal(ProcessInfo),
}

#[derive(Default)]
struct LocalState {
    control: Option<mpsc::UnboundedSender<Control>>,
    prestarted: bool,
    /// Why a prestart failed; reported by the next `start()`
    failed: Option<String>,
}

/// Local half of a [`ProcessBackend`](crate::runtime::ProcessBackend)
#[derive(Default)]
pub(crate) struct LocalBackend {
    state: Mutex<LocalState>,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self, core: &Arc<BackendCore>, info: ProcessInfo) {
        let mut state = self.state.lock();

        if let Some(message) = state.failed.take() {
            drop(state);
            core.fail_to_start(message);
            return;
        }

        if state.prestarted {
            let revealed = state
                .control
                .as_ref()
                .map(|control| control.send(Control::Reveal(info)).is_ok())
                .unwrap_or(false);
            if !revealed {
                drop(state);
                core.fail_to_start("prelaunched process is no longer running");
            }
            return;
        }

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                drop(state);
                core.fail_to_start(format!("no async runtime: {}", e));
                return;
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        state.control = Some(tx);
        drop(state);

        let core = core.clone();
        handle.spawn(async move {
            let mut child = match spawn_child(&info) {
                Ok(child) => child,
                Err(e) => {
                    debug!("Failed to start {}: {}", info.program, e);
                    core.fail_to_start(e.to_string());
                    return;
                }
            };
            let Some(pid) = child.id() else {
                core.fail_to_start("process exited during spawn");
                return;
            };
            core.lock().pid = Some(pid);
            debug!("Process {} spawned with PID: {}", info.program, pid);

            let mut driver = Driver::new(core, pid, &mut child, Phase::Starting);
            driver.apply_scheduling();
            driver.pattern = info.start_output_pattern().map(<[u8]>::to_vec);
            if driver.pattern.is_none() {
                driver.enter_running();
            }
            driver.run(child, rx).await;
        });
    }

    /// Spawn the current configuration as a hidden spare
    ///
    /// A failure is remembered and surfaces as `FailedToStart` on `start()`.
    pub fn prestart(&self, core: &Arc<BackendCore>) -> Result<SpareExit> {
        let mut state = self.state.lock();
        if state.control.is_some() || state.failed.is_some() {
            return Err(LaunchError::RuntimeError("backend already spawned".into()));
        }

        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| LaunchError::RuntimeError(e.to_string()))?;

        let info = core.lock().info.clone();
        let spawned = info.validate().and_then(|_| {
            let child = spawn_child(&info)?;
            match child.id() {
                Some(pid) => Ok((child, pid)),
                None => Err(LaunchError::ProcessSpawnFailed(
                    "process exited during spawn".into(),
                )),
            }
        });
        let (mut child, pid) = match spawned {
            Ok(spawned) => spawned,
            Err(e) => {
                state.failed = Some(e.to_string());
                return Err(e);
            }
        };
        core.lock().pid = Some(pid);
        debug!("Prestarted {} with PID: {}", info.program, pid);

        let (tx, rx) = mpsc::unbounded_channel();
        state.control = Some(tx);
        state.prestarted = true;

        let (exit_tx, exit_rx) = oneshot::channel();
        let mut driver = Driver::new(core.clone(), pid, &mut child, Phase::Hidden);
        driver.spare_exit = Some(exit_tx);
        handle.spawn(driver.run(child, rx));
        Ok(exit_rx)
    }

    pub fn is_ready(&self, core: &BackendCore) -> bool {
        let state = self.state.lock();
        let core = core.lock();
        state.prestarted && core.pid.is_some() && !core.finished && !core.started
    }

    pub fn stop(&self, timeout: Duration) {
        if let Some(control) = &self.state.lock().control {
            let _ = control.send(Control::Stop(timeout));
        }
    }

    pub fn write(&self, data: &[u8]) -> usize {
        match &self.state.lock().control {
            Some(control) if control.send(Control::Write(data.to_vec())).is_ok() => data.len(),
            _ => 0,
        }
    }
}

fn spawn_child(info: &ProcessInfo) -> Result<Child> {
    let mut command = Command::new(&info.program);
    command
        .args(&info.arguments)
        .envs(&info.environment)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);

    if let Some(dir) = &info.working_directory {
        command.current_dir(dir);
    }
    if let Some(uid) = info.uid {
        command.uid(uid);
    }
    if let Some(gid) = info.gid {
        command.gid(gid);
    }

    let umask = info.umask;
    let drop_caps = info.drop_capabilities;
    if umask.is_some() || drop_caps.is_some() {
        // SAFETY: the hook only makes async-signal-safe syscalls
        unsafe {
            command.pre_exec(move || {
                if let Some(mask) = umask {
                    libc::umask(mask as libc::mode_t);
                }
                if let Some(caps) = drop_caps {
                    drop_capabilities(caps)?;
                }
                Ok(())
            });
        }
    }

    command
        .spawn()
        .map_err(|e| LaunchError::ProcessSpawnFailed(format!("{}: {}", info.program, e)))
}

#[cfg(target_os = "linux")]
fn drop_capabilities(mask: u64) -> io::Result<()> {
    for cap in 0..64u32 {
        if mask & (1u64 << cap) == 0 {
            continue;
        }
        // SAFETY: PR_CAPBSET_DROP takes a capability number and no pointers
        if unsafe { libc::prctl(libc::PR_CAPBSET_DROP, cap as libc::c_ulong, 0, 0, 0) } != 0 {
            let err = io::Error::last_os_error();
            // Capability unknown to this kernel
            if err.raw_os_error() == Some(libc::EINVAL) {
                continue;
            }
            return Err(err);
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn drop_capabilities(_mask: u64) -> io::Result<()> {
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Prestarted spare, not yet handed to anyone
    Hidden,
    /// Spawned, waiting for the start output pattern
    Starting,
    Running,
}

struct Driver {
    core: Arc<BackendCore>,
    pid: u32,
    phase: Phase,
    pattern: Option<Vec<u8>>,
    pending_out: Vec<u8>,
    pending_err: Vec<u8>,
    input: Option<mpsc::UnboundedSender<Vec<u8>>>,
    write_failed: Option<oneshot::Receiver<io::Error>>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    kill_deadline: Option<Instant>,
    escalated: bool,
    spare_exit: Option<oneshot::Sender<Option<ProcessError>>>,
}

impl Driver {
    fn new(core: Arc<BackendCore>, pid: u32, child: &mut Child, phase: Phase) -> Self {
        let (input, write_failed) = match child.stdin.take() {
            Some(stdin) => {
                let (input, write_failed) = spawn_writer(stdin);
                (Some(input), Some(write_failed))
            }
            None => (None, None),
        };

        Self {
            core,
            pid,
            phase,
            pattern: None,
            pending_out: Vec::new(),
            pending_err: Vec::new(),
            input,
            write_failed,
            stdout: child.stdout.take(),
            stderr: child.stderr.take(),
            kill_deadline: None,
            escalated: false,
            spare_exit: None,
        }
    }

    async fn run(mut self, mut child: Child, mut control: mpsc::UnboundedReceiver<Control>) {
        let mut out_buf = vec![0u8; READ_CHUNK];
        let mut err_buf = vec![0u8; READ_CHUNK];
        let mut owner_gone = false;

        let status = loop {
            tokio::select! {
                status = child.wait() => break status,

                command = control.recv(), if !owner_gone => match command {
                    Some(command) => self.handle_control(command),
                    None => {
                        owner_gone = true;
                        debug!("Backend for PID {} dropped, killing", self.pid);
                        self.signal(Signal::SIGKILL);
                    }
                },

                read = read_chunk(&mut self.stdout, &mut out_buf) => match read {
                    Ok(0) => self.stdout = None,
                    Ok(n) => self.on_stdout(&out_buf[..n]),
                    Err(e) => {
                        self.stdout = None;
                        self.on_read_error(e);
                    }
                },

                read = read_chunk(&mut self.stderr, &mut err_buf) => match read {
                    Ok(0) => self.stderr = None,
                    Ok(n) => self.on_stderr(&err_buf[..n]),
                    Err(e) => {
                        self.stderr = None;
                        self.on_read_error(e);
                    }
                },

                failure = wait_write_failure(&mut self.write_failed) => {
                    self.write_failed = None;
                    if let Some(e) = failure {
                        if self.phase != Phase::Hidden {
                            self.core.report_error(ProcessError::WriteError, e.to_string());
                        }
                    }
                },

                _ = sleep_until(self.kill_deadline) => self.escalate(),
            }
        };

        // A reveal queued from here on is answered below, or refused by the
        // closed channel
        control.close();
        self.input = None;
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        let rest = drain(self.stdout.take(), deadline).await;
        if !rest.is_empty() {
            self.on_stdout(&rest);
        }
        let rest = drain(self.stderr.take(), deadline).await;
        if !rest.is_empty() {
            self.on_stderr(&rest);
        }

        let mut revealed = false;
        while let Ok(command) = control.try_recv() {
            revealed |= matches!(command, Control::Reveal(_));
        }
        if self.phase == Phase::Hidden && revealed {
            self.core.fail_to_start("prelaunched process exited before it was started");
            return;
        }

        match status {
            Ok(status) => self.on_exit(status.code(), status.signal()),
            Err(e) if self.phase == Phase::Hidden => {
                warn!("Failed to wait for spare PID {}: {}", self.pid, e);
                self.lose_spare(Some(ProcessError::UnknownError));
            }
            Err(e) => {
                warn!("Failed to wait for PID {}: {}", self.pid, e);
                self.core.report_error(ProcessError::UnknownError, e.to_string());
                self.core.set_state(ProcessState::NotRunning);
                self.core.finish(0, ExitStatus::Crashed);
            }
        }
    }

    fn handle_control(&mut self, command: Control) {
        match command {
            Control::Write(data) => {
                if let Some(input) = &self.input {
                    let _ = input.send(data);
                }
            }
            Control::Stop(timeout) => {
                if self.kill_deadline.is_some() || self.escalated {
                    return;
                }
                self.signal(Signal::SIGTERM);
                self.kill_deadline = Some(Instant::now() + timeout);
            }
            Control::Reveal(info) => self.reveal(info),
        }
    }

    /// Hand a spare over to its new owner
    fn reveal(&mut self, info: ProcessInfo) {
        if self.phase != Phase::Hidden {
            return;
        }
        debug!("Revealing prelaunched PID {} as {}", self.pid, info.program);
        self.spare_exit = None;

        match serde_json::to_vec(&info) {
            Ok(mut line) => {
                line.push(b'\n');
                if let Some(input) = &self.input {
                    let _ = input.send(line);
                }
            }
            Err(e) => warn!("Failed to encode process info for PID {}: {}", self.pid, e),
        }

        self.phase = Phase::Starting;
        self.apply_scheduling();
        self.pattern = info.start_output_pattern().map(<[u8]>::to_vec);
        if self.pattern.is_none() {
            self.enter_running();
        }
    }

    fn apply_scheduling(&self) {
        let (priority, oom) = {
            let core = self.core.lock();
            (core.desired_priority, core.desired_oom)
        };

        if let Some(priority) = priority {
            if let Err(e) = procutils::set_priority(self.pid, priority) {
                warn!("Failed to set priority {} on PID {}: {}", priority, self.pid, e);
            }
        }
        if let Some(oom) = oom {
            match procutils::set_oom_score(self.pid, oom) {
                Ok(Adjustment::Applied) => {}
                Ok(Adjustment::Unsupported) => trace!("OOM adjustment unsupported here"),
                Err(e) => warn!("Failed to set OOM adjustment {} on PID {}: {}", oom, self.pid, e),
            }
        }
    }

    fn enter_running(&mut self) {
        self.phase = Phase::Running;
        self.core.set_state(ProcessState::Running);
        self.core.emit(BackendEvent::Started);

        if !self.pending_out.is_empty() {
            let out = std::mem::take(&mut self.pending_out);
            self.core.emit(BackendEvent::Stdout(out));
        }
        if !self.pending_err.is_empty() {
            let err = std::mem::take(&mut self.pending_err);
            self.core.emit(BackendEvent::Stderr(err));
        }
    }

    fn on_stdout(&mut self, chunk: &[u8]) {
        match self.phase {
            Phase::Hidden => trace!("Discarding {} bytes from spare PID {}", chunk.len(), self.pid),
            Phase::Starting => {
                self.pending_out.extend_from_slice(chunk);
                let seen = self
                    .pattern
                    .as_deref()
                    .map(|pattern| contains(&self.pending_out, pattern))
                    .unwrap_or(true);
                if seen {
                    self.enter_running();
                }
            }
            Phase::Running => self
                .core
                .emit(BackendEvent::Stdout(chunk.to_vec())),
        }
    }

    fn on_stderr(&mut self, chunk: &[u8]) {
        match self.phase {
            Phase::Hidden => {}
            Phase::Starting => self.pending_err.extend_from_slice(chunk),
            Phase::Running => self
                .core
                .emit(BackendEvent::Stderr(chunk.to_vec())),
        }
    }

    fn on_read_error(&self, e: io::Error) {
        if self.phase != Phase::Hidden {
            self.core.report_error(ProcessError::ReadError, e.to_string());
        }
    }

    fn on_exit(&mut self, code: Option<i32>, signal: Option<i32>) {
        debug!("PID {} exited (code {:?}, signal {:?})", self.pid, code, signal);
        let exit_status = if signal.is_some() {
            ExitStatus::Crashed
        } else {
            ExitStatus::Normal
        };
        let exit_code = code.unwrap_or(0);

        match self.phase {
            Phase::Hidden => self.lose_spare(signal.map(|_| ProcessError::Crashed)),
            Phase::Starting => {
                self.core
                    .fail_to_start("process exited before its start output pattern appeared");
            }
            Phase::Running => {
                if let Some(signal) = signal {
                    let kind = if self.escalated {
                        ProcessError::Timedout
                    } else {
                        ProcessError::Crashed
                    };
                    self.core
                        .report_error(kind, format!("process killed by signal {}", signal));
                }
                self.core.set_state(ProcessState::NotRunning);
                self.core.finish(exit_code, exit_status);
            }
        }
    }

    /// Hidden death: tell the pool, leave the owner's stream untouched
    fn lose_spare(&mut self, error: Option<ProcessError>) {
        self.core.lock().pid = None;
        if let Some(exit) = self.spare_exit.take() {
            let _ = exit.send(error);
        }
    }

    fn escalate(&mut self) {
        self.kill_deadline = None;
        self.escalated = true;
        debug!("Process still alive, sending SIGKILL to PID {}", self.pid);
        self.signal(Signal::SIGKILL);
    }

    fn signal(&self, signal: Signal) {
        if let Err(e) = procutils::send_signal(self.pid, signal) {
            debug!("Failed to send {:?} to PID {}: {}", signal, self.pid, e);
        }
    }
}

fn spawn_writer(mut stdin: ChildStdin) -> (mpsc::UnboundedSender<Vec<u8>>, oneshot::Receiver<io::Error>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (failed_tx, failed_rx) = oneshot::channel();

    tokio::spawn(async move {
        while let Some(data) = rx.recv().await {
            let result = match stdin.write_all(&data).await {
                Ok(()) => stdin.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                let _ = failed_tx.send(e);
                return;
            }
        }
    });

    (tx, failed_rx)
}

async fn read_chunk<R: AsyncRead + Unpin>(reader: &mut Option<R>, buf: &mut [u8]) -> io::Result<usize> {
    match reader {
        Some(reader) => reader.read(buf).await,
        None => std::future::pending().await,
    }
}

async fn wait_write_failure(failed: &mut Option<oneshot::Receiver<io::Error>>) -> Option<io::Error> {
    match failed {
        Some(rx) => rx.await.ok(),
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn drain<R: AsyncRead + Unpin>(reader: Option<R>, deadline: Instant) -> Vec<u8> {
    let mut rest = Vec::new();
    if let Some(mut reader) = reader {
        let mut buf = [0u8; READ_CHUNK];
        while let Ok(Ok(n)) = tokio::time::timeout_at(deadline, reader.read(&mut buf)).await {
            if n == 0 {
                break;
            }
            rest.extend_from_slice(&buf[..n]);
        }
    }
    rest
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use crate::runtime::backend::{BackendEvents, DEFAULT_STOP_TIMEOUT};
    use crate::runtime::{BackendEvent, ExitStatus, ProcessBackend, ProcessError, ProcessInfo, ProcessState};
    use std::time::Duration;

    const ECHO_SCRIPT: &str =
        r#"while read line; do case "$line" in stop) exit 0;; crash) exit 2;; *) echo "$line";; esac; done"#;

    fn echo_info() -> ProcessInfo {
        ProcessInfo::new("/bin/sh").with_arguments(["-c", ECHO_SCRIPT])
    }

    async fn next(events: &mut BackendEvents) -> BackendEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for backend event")
            .expect("backend event stream closed")
    }

    /// Collect events up to and including the first one matching `done`
    async fn collect_until(
        events: &mut BackendEvents,
        done: impl Fn(&BackendEvent) -> bool,
    ) -> Vec<BackendEvent> {
        let mut seen = Vec::new();
        loop {
            let event = next(events).await;
            let stop = done(&event);
            seen.push(event);
            if stop {
                return seen;
            }
        }
    }

    fn is_finished(event: &BackendEvent) -> bool {
        matches!(event, BackendEvent::Finished { .. })
    }

    async fn wait_started(events: &mut BackendEvents) {
        let seen = collect_until(events, |e| *e == BackendEvent::Started).await;
        assert_eq!(
            seen,
            vec![
                BackendEvent::StateChanged(ProcessState::Starting),
                BackendEvent::StateChanged(ProcessState::Running),
                BackendEvent::Started,
            ]
        );
    }

    #[tokio::test]
    async fn test_start_write_and_exit_code() {
        let backend = ProcessBackend::local(echo_info());
        let mut events = backend.subscribe();
        backend.start().unwrap();
        wait_started(&mut events).await;

        let pid = backend.pid().unwrap();
        let pgid = nix::unistd::getpgid(Some(nix::unistd::Pid::from_raw(pid as i32))).unwrap();
        assert_eq!(pgid.as_raw(), pid as i32);

        assert_eq!(backend.write(b"hello\n"), 6);
        let mut output = Vec::new();
        while !output.ends_with(b"hello\n") {
            match next(&mut events).await {
                BackendEvent::Stdout(chunk) => output.extend(chunk),
                other => panic!("unexpected event {:?}", other),
            }
        }

        backend.write(b"crash\n");
        let seen = collect_until(&mut events, is_finished).await;
        assert_eq!(
            seen,
            vec![
                BackendEvent::StateChanged(ProcessState::NotRunning),
                BackendEvent::Finished { exit_code: 2, exit_status: ExitStatus::Normal },
            ]
        );
        assert_eq!(backend.pid(), None);
        assert_eq!(backend.write(b"late\n"), 0);
    }

    #[tokio::test]
    async fn test_stop_reports_crash() {
        let backend = ProcessBackend::local(ProcessInfo::new("sleep").with_arguments(["10"]));
        let mut events = backend.subscribe();
        backend.start().unwrap();
        wait_started(&mut events).await;

        backend.stop(DEFAULT_STOP_TIMEOUT);
        backend.stop(DEFAULT_STOP_TIMEOUT);
        let seen = collect_until(&mut events, is_finished).await;
        assert!(matches!(
            seen[0],
            BackendEvent::Error { kind: ProcessError::Crashed, .. }
        ));
        assert_eq!(seen[1], BackendEvent::StateChanged(ProcessState::NotRunning));
        assert_eq!(
            seen[2],
            BackendEvent::Finished { exit_code: 0, exit_status: ExitStatus::Crashed }
        );
        assert_eq!(seen.len(), 3);
    }

    #[tokio::test]
    async fn test_stop_escalates_to_kill() {
        let info = ProcessInfo::new("/bin/sh")
            .with_arguments(["-c", "trap '' TERM; echo ready; while :; do sleep 0.05; done"]);
        let backend = ProcessBackend::local(info);
        let mut events = backend.subscribe();
        backend.start().unwrap();
        collect_until(&mut events, |e| matches!(e, BackendEvent::Stdout(_))).await;

        backend.stop(Duration::from_millis(100));
        let seen = collect_until(&mut events, is_finished).await;
        assert!(seen.contains(&BackendEvent::Error {
            kind: ProcessError::Timedout,
            message: "process killed by signal 9".into(),
        }));
        assert_eq!(backend.state(), ProcessState::NotRunning);
    }

    #[tokio::test]
    async fn test_fail_to_start() {
        let backend = ProcessBackend::local(ProcessInfo::new("/nonexistent/launcher-test-binary"));
        let mut events = backend.subscribe();
        backend.start().unwrap();

        let seen = collect_until(&mut events, |e| {
            *e == BackendEvent::StateChanged(ProcessState::NotRunning)
        })
        .await;
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], BackendEvent::StateChanged(ProcessState::Starting));
        assert!(matches!(
            seen[1],
            BackendEvent::Error { kind: ProcessError::FailedToStart, .. }
        ));
        assert!(!backend.error_string().is_empty());

        drop(backend);
        assert_eq!(events.recv().await, None);
    }

    #[tokio::test]
    async fn test_start_output_pattern() {
        let info = ProcessInfo::new("/bin/sh")
            .with_arguments(["-c", "echo booting; sleep 0.2; echo READY; cat"])
            .with_start_output_pattern("READY");
        let backend = ProcessBackend::local(info);
        let mut events = backend.subscribe();
        backend.start().unwrap();

        assert_eq!(next(&mut events).await, BackendEvent::StateChanged(ProcessState::Starting));
        assert_eq!(next(&mut events).await, BackendEvent::StateChanged(ProcessState::Running));
        assert_eq!(next(&mut events).await, BackendEvent::Started);
        match next(&mut events).await {
            BackendEvent::Stdout(out) => {
                let text = String::from_utf8(out).unwrap();
                assert!(text.starts_with("booting\n"));
                assert!(text.contains("READY"));
            }
            other => panic!("expected buffered output, got {:?}", other),
        }
        backend.stop(DEFAULT_STOP_TIMEOUT);
    }

    #[tokio::test]
    async fn test_exit_before_pattern_fails_to_start() {
        let info = ProcessInfo::new("/bin/sh")
            .with_arguments(["-c", "echo nope"])
            .with_start_output_pattern("READY");
        let backend = ProcessBackend::local(info);
        let mut events = backend.subscribe();
        backend.start().unwrap();

        let seen = collect_until(&mut events, |e| {
            *e == BackendEvent::StateChanged(ProcessState::NotRunning)
        })
        .await;
        assert!(matches!(
            seen[1],
            BackendEvent::Error { kind: ProcessError::FailedToStart, .. }
        ));
        assert!(!seen.iter().any(is_finished));
        assert!(!seen.contains(&BackendEvent::Started));
    }

    #[tokio::test]
    async fn test_prestart_and_reveal() {
        let backend = ProcessBackend::local(ProcessInfo::new("cat"));
        let _exit = backend.prestart().unwrap();
        assert!(backend.is_ready());
        assert!(backend.pid().is_some());
        assert_eq!(backend.state(), ProcessState::NotRunning);
        assert_eq!(backend.actual_priority(), None);

        backend
            .set_info(ProcessInfo::new("cat").with_identifier("revealed"))
            .unwrap();
        let mut events = backend.subscribe();
        backend.start().unwrap();
        wait_started(&mut events).await;
        assert!(!backend.is_ready());

        let mut output = Vec::new();
        while !output.ends_with(b"\n") {
            if let BackendEvent::Stdout(chunk) = next(&mut events).await {
                output.extend(chunk);
            }
        }
        let info: ProcessInfo = serde_json::from_slice(&output).unwrap();
        assert_eq!(info.identifier.as_deref(), Some("revealed"));
        backend.stop(DEFAULT_STOP_TIMEOUT);
    }

    #[tokio::test]
    async fn test_spare_death_is_silent_until_start() {
        let backend = ProcessBackend::local(ProcessInfo::new("sleep").with_arguments(["0.3"]));
        let exit = backend.prestart().unwrap();
        let mut events = backend.subscribe();

        let lost = tokio::time::timeout(Duration::from_secs(5), exit).await.unwrap();
        assert_eq!(lost, Ok(None));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(events.try_recv(), None);
        assert!(!backend.is_ready());
        assert_eq!(backend.pid(), None);

        backend.start().unwrap();
        let seen = collect_until(&mut events, |e| {
            *e == BackendEvent::StateChanged(ProcessState::NotRunning)
        })
        .await;
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], BackendEvent::StateChanged(ProcessState::Starting));
        assert!(matches!(
            seen[1],
            BackendEvent::Error { kind: ProcessError::FailedToStart, .. }
        ));
        assert!(!seen.iter().any(is_finished));
    }

    #[tokio::test]
    async fn test_spare_killed_while_hidden_reports_crash() {
        let backend = ProcessBackend::local(ProcessInfo::new("sleep").with_arguments(["30"]));
        let exit = backend.prestart().unwrap();
        let mut events = backend.subscribe();
        let pid = backend.pid().unwrap();

        crate::runtime::procutils::send_signal(pid, nix::sys::signal::Signal::SIGKILL).unwrap();
        let lost = tokio::time::timeout(Duration::from_secs(5), exit).await.unwrap();
        assert_eq!(lost, Ok(Some(ProcessError::Crashed)));
        assert_eq!(events.try_recv(), None);
    }

    #[tokio::test]
    async fn test_start_while_spare_exits() {
        // The background sleep keeps stdout open, so the driver is still
        // draining pipes when start() arrives
        let backend = ProcessBackend::local(
            ProcessInfo::new("/bin/sh").with_arguments(["-c", "sleep 5 & exit 0"]),
        );
        let _exit = backend.prestart().unwrap();
        let mut events = backend.subscribe();
        tokio::time::sleep(Duration::from_millis(40)).await;

        backend.start().unwrap();
        let seen = collect_until(&mut events, |e| {
            *e == BackendEvent::StateChanged(ProcessState::NotRunning)
        })
        .await;
        assert_eq!(seen[0], BackendEvent::StateChanged(ProcessState::Starting));
        assert!(matches!(
            seen[1],
            BackendEvent::Error { kind: ProcessError::FailedToStart, .. }
        ));
        assert!(!seen.contains(&BackendEvent::Started));
        assert!(!seen.iter().any(is_finished));
        assert_eq!(backend.state(), ProcessState::NotRunning);

        backend.stop(Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(events.try_recv(), None);
    }

    #[tokio::test]
    async fn test_failed_prestart_reported_on_start() {
        let backend = ProcessBackend::local(ProcessInfo::new("/nonexistent/proclaunch-spare"));
        assert!(backend.prestart().is_err());
        assert!(!backend.is_ready());

        let mut events = backend.subscribe();
        backend.start().unwrap();
        let seen = collect_until(&mut events, |e| {
            *e == BackendEvent::StateChanged(ProcessState::NotRunning)
        })
        .await;
        assert!(seen
            .iter()
            .any(|e| matches!(e, BackendEvent::Error { kind: ProcessError::FailedToStart, .. })));
    }

    #[tokio::test]
    async fn test_priority_applied_to_all_threads() {
        let info = ProcessInfo::new("sleep").with_arguments(["10"]).with_priority(19);
        let backend = ProcessBackend::local(info);
        let mut events = backend.subscribe();
        backend.start().unwrap();
        wait_started(&mut events).await;

        assert_eq!(backend.actual_priority(), Some(19));
        let pid = backend.pid().unwrap();
        assert!(crate::runtime::procutils::thread_priorities(pid)
            .iter()
            .all(|p| *p == 19));
        backend.stop(DEFAULT_STOP_TIMEOUT);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_oom_adjustment() {
        let info = ProcessInfo::new("sleep").with_arguments(["10"]).with_oom_adjustment(500);
        let backend = ProcessBackend::local(info);
        let mut events = backend.subscribe();
        backend.start().unwrap();
        wait_started(&mut events).await;

        assert_eq!(backend.actual_oom_adjustment(), Some(500));
        backend.set_desired_oom_adjustment(499);
        assert_eq!(backend.actual_oom_adjustment(), Some(499));
        backend.stop(DEFAULT_STOP_TIMEOUT);
    }

    #[tokio::test]
    async fn test_drop_kills_child() {
        let backend = ProcessBackend::local(ProcessInfo::new("sleep").with_arguments(["10"]));
        let mut events = backend.subscribe();
        backend.start().unwrap();
        wait_started(&mut events).await;
        let pid = backend.pid().unwrap();

        drop(backend);
        collect_until(&mut events, is_finished).await;
        assert!(!crate::runtime::procutils::is_running(pid));
    }

    #[test]
    fn test_contains() {
        assert!(super::contains(b"abcREADYdef", b"READY"));
        assert!(!super::contains(b"REA", b"READY"));
    }
}
