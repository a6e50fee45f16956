// packages/proclaunch/src/remote/mod.rs
//! Remote launcher protocol
//!
//! Newline-delimited JSON between a client process and a launcher that
//! does the actual spawning.
//!
//! - **Protocol**: frame model and wire encoding
//! - **Schema**: optional JSON-schema checks per direction
//! - **Client**: multiplexes proxy backends over one connection
//! - **Launcher**: serves a connection with a local backend manager
//!
//! # Wire Format
//!
//! ```text
//! client → {"command":"start","id":1,"data":{"program":"/bin/app"}}
//! client ← {"event":"stateChanged","id":1,"data":{"state":"Running"}}
//! client ← {"event":"started","id":1,"data":{"pid":4242}}
//! client → {"command":"memory","data":{"restricted":true}}
//! client ← {"event":"internalProcesses","data":{"pids":[4243]}}
//! ```

pub mod client;
pub mod launcher;
pub mod protocol;
pub mod schema;

pub use client::{ClientEvent, LauncherClient};
pub use launcher::Launcher;
pub use protocol::{Command, Event, Frame, RemoteMessage, SetKey};
pub use schema::{FrameValidator, Schema, ValidationMode, Verdict};
