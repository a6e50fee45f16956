// packages/proclaunch/src/runtime/mod.rs
//! Process backends and the pieces they are built from
//!
//! - **Process Info**: the launch description handed to a backend
//! - **Backend**: lifecycle state machine and owner handle
//! - **Local Backend**: direct spawn and prelaunched spares
//! - **Idle Delegate**: gates background work on idle capacity
//! - **Matching**: matchers and rewriters for the factory chain
//! - **Procutils**: priority / OOM / thread introspection
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ ProcessBackend (owner handle)                │
//! │   ├─ BackendCore: state, pid, subscribers    │
//! │   └─ Local driver task │ Remote proxy        │
//! └──────────────────────────────────────────────┘
//!            │ BackendEvent (per-backend channel)
//!            ▼
//!      owner / factory / launcher client
//! ```

pub mod backend;
pub mod idle_delegate;
pub(crate) mod local_backend;
pub mod matching;
pub mod process_info;
pub mod procutils;

// Re-export commonly used types
pub use backend::{
    BackendEvent, BackendEvents, ExitStatus, ProcessBackend, ProcessError, ProcessState,
    DEFAULT_STOP_TIMEOUT,
};
pub use idle_delegate::{IdleDelegate, IdleEvent, LoadProbe};
pub use matching::{GdbRewriter, KeyMatcher, MatchAll, Matcher, Rewriter};
pub use process_info::{ByteString, ProcessInfo};
