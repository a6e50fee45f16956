// packages/proclaunch/src/remote/protocol.rs
//! Launcher wire protocol
//!
//! Newline-delimited JSON objects. Every frame is either a `command`
//! (client → launcher) or an `event` (launcher → client); no other
//! top-level keys than `command`, `event`, `id`, `data`, `error` and
//! `errorString` are accepted.
//!
//! ```text
//! {"command":"start","id":1,"data":{"program":"/bin/cat"}}
//! {"event":"started","id":1,"data":{"pid":4242}}
//! {"event":"stdout","id":1,"data":{"output":"hello\n"}}
//! {"event":"error","id":1,"error":"Crashed","errorString":"killed"}
//! {"command":"memory","data":{"restricted":true}}
//! ```
//!
//! Frames with an `id` concern one backend. Frames without one are
//! launcher-level: memory restriction, idle capacity and the launcher's
//! pool of internal processes. Ids are written as integers; a decimal
//! string id is accepted on input.

use crate::runtime::{ByteString, ExitStatus, ProcessError, ProcessInfo, ProcessState};
use crate::utils::errors::{LaunchError, Result};
use serde::de::{self, DeserializeOwned};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio_util::codec::LinesCodec;

/// Largest accepted frame (bytes, excluding the newline)
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

pub mod names {
    pub const START: &str = "start";
    pub const STOP: &str = "stop";
    pub const WRITE: &str = "write";
    pub const SET: &str = "set";
    pub const MEMORY: &str = "memory";
    pub const IDLE_CPU_AVAILABLE: &str = "idleCpuAvailable";

    pub const STARTED: &str = "started";
    pub const FINISHED: &str = "finished";
    pub const ERROR: &str = "error";
    pub const STATE_CHANGED: &str = "stateChanged";
    pub const STDOUT: &str = "stdout";
    pub const STDERR: &str = "stderr";
    pub const INTERNAL_PROCESSES: &str = "internalProcesses";
    pub const IDLE_CPU_REQUESTED: &str = "idleCpuRequested";
}

/// Line codec shared by both ends
pub fn codec() -> LinesCodec {
    LinesCodec::new_with_max_length(MAX_FRAME_LENGTH)
}

/// One frame as it appears on the wire
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RemoteMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(
        default,
        deserialize_with = "id_from_wire",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ProcessError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_string: Option<String>,
}

fn id_from_wire<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum WireId {
        Number(u64),
        Text(String),
    }

    match Option::<WireId>::deserialize(deserializer)? {
        None => Ok(None),
        Some(WireId::Number(id)) => Ok(Some(id)),
        Some(WireId::Text(text)) => text
            .parse()
            .map(Some)
            .map_err(|_| de::Error::custom(format!("invalid id '{}'", text))),
    }
}

/// Attribute settable through the `set` command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SetKey {
    Priority,
    OomAdjustment,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Start(ProcessInfo),
    Stop { timeout: Duration },
    Write(Vec<u8>),
    Set { key: SetKey, value: i32 },
    Memory { restricted: bool },
    IdleCpuAvailable,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Started { pid: Option<u32> },
    Finished { exit_code: i32, exit_status: ExitStatus },
    Error { kind: ProcessError, message: String },
    StateChanged(ProcessState),
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    InternalProcesses(Vec<u32>),
    IdleCpuRequested(bool),
}

/// Decoded frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Command { id: Option<u64>, command: Command },
    Event { id: Option<u64>, event: Event },
}

#[derive(Serialize, Deserialize)]
struct StopData {
    timeout: u64,
}

#[derive(Serialize, Deserialize)]
struct OutputData {
    output: ByteString,
}

#[derive(Serialize, Deserialize)]
struct SetData {
    key: SetKey,
    value: i32,
}

#[derive(Serialize, Deserialize)]
struct MemoryData {
    restricted: bool,
}

#[derive(Serialize, Deserialize)]
struct StartedData {
    #[serde(default)]
    pid: Option<u32>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FinishedData {
    exit_code: i32,
    exit_status: ExitStatus,
}

#[derive(Serialize, Deserialize)]
struct StateData {
    state: ProcessState,
}

#[derive(Serialize, Deserialize)]
struct PidsData {
    pids: Vec<u32>,
}

#[derive(Serialize, Deserialize)]
struct RequestData {
    request: bool,
}

impl Frame {
    pub fn command(id: u64, command: Command) -> Self {
        Frame::Command { id: Some(id), command }
    }

    pub fn event(id: u64, event: Event) -> Self {
        Frame::Event { id: Some(id), event }
    }

    /// Launcher-level frame without an id
    pub fn control_command(command: Command) -> Self {
        Frame::Command { id: None, command }
    }

    pub fn control_event(event: Event) -> Self {
        Frame::Event { id: None, event }
    }

    pub fn id(&self) -> Option<u64> {
        match self {
            Frame::Command { id, .. } | Frame::Event { id, .. } => *id,
        }
    }

    pub fn to_message(&self) -> Result<RemoteMessage> {
        let mut message = RemoteMessage {
            id: self.id(),
            ..Default::default()
        };

        match self {
            Frame::Command { command, .. } => {
                let (name, data) = match command {
                    Command::Start(info) => (names::START, Some(serde_json::to_value(info)?)),
                    Command::Stop { timeout } => (
                        names::STOP,
                        Some(serde_json::to_value(StopData {
                            timeout: timeout.as_millis() as u64,
                        })?),
                    ),
                    Command::Write(bytes) => (names::WRITE, Some(output_data(bytes)?)),
                    Command::Set { key, value } => (
                        names::SET,
                        Some(serde_json::to_value(SetData { key: *key, value: *value })?),
                    ),
                    Command::Memory { restricted } => (
                        names::MEMORY,
                        Some(serde_json::to_value(MemoryData { restricted: *restricted })?),
                    ),
                    Command::IdleCpuAvailable => (names::IDLE_CPU_AVAILABLE, None),
                };
                message.command = Some(name.to_string());
                message.data = data;
            }
            Frame::Event { event, .. } => {
                let (name, data) = match event {
                    Event::Started { pid } => (
                        names::STARTED,
                        Some(serde_json::to_value(StartedData { pid: *pid })?),
                    ),
                    Event::Finished { exit_code, exit_status } => (
                        names::FINISHED,
                        Some(serde_json::to_value(FinishedData {
                            exit_code: *exit_code,
                            exit_status: *exit_status,
                        })?),
                    ),
                    Event::Error { kind, message: text } => {
                        message.error = Some(*kind);
                        message.error_string = Some(text.clone());
                        (names::ERROR, None)
                    }
                    Event::StateChanged(state) => (
                        names::STATE_CHANGED,
                        Some(serde_json::to_value(StateData { state: *state })?),
                    ),
                    Event::Stdout(bytes) => (names::STDOUT, Some(output_data(bytes)?)),
                    Event::Stderr(bytes) => (names::STDERR, Some(output_data(bytes)?)),
                    Event::InternalProcesses(pids) => (
                        names::INTERNAL_PROCESSES,
                        Some(serde_json::to_value(PidsData { pids: pids.clone() })?),
                    ),
                    Event::IdleCpuRequested(request) => (
                        names::IDLE_CPU_REQUESTED,
                        Some(serde_json::to_value(RequestData { request: *request })?),
                    ),
                };
                message.event = Some(name.to_string());
                message.data = data;
            }
        }
        Ok(message)
    }

    pub fn from_message(message: RemoteMessage) -> Result<Self> {
        let RemoteMessage {
            command,
            event,
            id,
            data,
            error,
            error_string,
        } = message;

        match (command, event) {
            (Some(name), None) => {
                let command = match name.as_str() {
                    names::START => {
                        let info: ProcessInfo = payload(data, &name)?;
                        Command::Start(info)
                    }
                    names::STOP => {
                        let stop: StopData = payload(data, &name)?;
                        Command::Stop {
                            timeout: Duration::from_millis(stop.timeout),
                        }
                    }
                    names::WRITE => Command::Write(payload::<OutputData>(data, &name)?.output.into_bytes()),
                    names::SET => {
                        let set: SetData = payload(data, &name)?;
                        Command::Set { key: set.key, value: set.value }
                    }
                    names::MEMORY => Command::Memory {
                        restricted: payload::<MemoryData>(data, &name)?.restricted,
                    },
                    names::IDLE_CPU_AVAILABLE => Command::IdleCpuAvailable,
                    other => return Err(LaunchError::Protocol(format!("unknown command '{}'", other))),
                };
                if is_per_backend_command(&command) && id.is_none() {
                    return Err(LaunchError::Protocol(format!("command '{}' requires an id", name)));
                }
                Ok(Frame::Command { id, command })
            }
            (None, Some(name)) => {
                let event = match name.as_str() {
                    names::STARTED => Event::Started {
                        pid: payload::<StartedData>(data, &name)?.pid,
                    },
                    names::FINISHED => {
                        let finished: FinishedData = payload(data, &name)?;
                        Event::Finished {
                            exit_code: finished.exit_code,
                            exit_status: finished.exit_status,
                        }
                    }
                    names::ERROR => Event::Error {
                        kind: error.ok_or_else(|| {
                            LaunchError::Protocol("error event without 'error'".into())
                        })?,
                        message: error_string.unwrap_or_default(),
                    },
                    names::STATE_CHANGED => {
                        Event::StateChanged(payload::<StateData>(data, &name)?.state)
                    }
                    names::STDOUT => Event::Stdout(payload::<OutputData>(data, &name)?.output.into_bytes()),
                    names::STDERR => Event::Stderr(payload::<OutputData>(data, &name)?.output.into_bytes()),
                    names::INTERNAL_PROCESSES => {
                        Event::InternalProcesses(payload::<PidsData>(data, &name)?.pids)
                    }
                    names::IDLE_CPU_REQUESTED => {
                        Event::IdleCpuRequested(payload::<RequestData>(data, &name)?.request)
                    }
                    other => return Err(LaunchError::Protocol(format!("unknown event '{}'", other))),
                };
                let launcher_level =
                    matches!(event, Event::InternalProcesses(_) | Event::IdleCpuRequested(_));
                if !launcher_level && id.is_none() {
                    return Err(LaunchError::Protocol(format!("event '{}' requires an id", name)));
                }
                Ok(Frame::Event { id, event })
            }
            (Some(_), Some(_)) => Err(LaunchError::Protocol(
                "frame has both 'command' and 'event'".into(),
            )),
            (None, None) => Err(LaunchError::Protocol(
                "frame has neither 'command' nor 'event'".into(),
            )),
        }
    }
}

fn is_per_backend_command(command: &Command) -> bool {
    !matches!(command, Command::Memory { .. } | Command::IdleCpuAvailable)
}

fn output_data(bytes: &[u8]) -> Result<Value> {
    Ok(serde_json::to_value(OutputData {
        output: ByteString::from(bytes),
    })?)
}

fn payload<T: DeserializeOwned>(data: Option<Value>, name: &str) -> Result<T> {
    let data = data.ok_or_else(|| LaunchError::Protocol(format!("'{}' frame without data", name)))?;
    serde_json::from_value(data)
        .map_err(|e| LaunchError::Protocol(format!("bad '{}' payload: {}", name, e)))
}

/// Parse one line into its wire form
pub fn parse_message(line: &str) -> Result<RemoteMessage> {
    Ok(serde_json::from_str(line)?)
}

pub fn encode(frame: &Frame) -> Result<String> {
    Ok(serde_json::to_string(&frame.to_message()?)?)
}

pub fn decode(line: &str) -> Result<Frame> {
    Frame::from_message(parse_message(line)?)
}
