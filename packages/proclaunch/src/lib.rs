// packages/proclaunch/src/lib.rs
//! Proclaunch process supervision runtime
//!
//! Launches and supervises OS processes on behalf of a host application,
//! either directly, from a pool of pre-warmed spares, or through a remote
//! launcher reached over a pipe or a Unix socket.
//!
//! # Architecture
//!
//! - **runtime**: backend state machine, local process driver, idle delegate
//! - **factory**: standard, prelaunch and remote backend factories
//! - **manager**: priority-ordered factory chain with shared memory/idle policy
//! - **remote**: launcher wire protocol, client multiplexer and launcher server
//! - **observability**: tracing and metrics setup
//! - **utils**: configuration and errors

pub mod factory;
pub mod manager;
pub mod observability;
pub mod remote;
pub mod runtime;
pub mod utils;

// Re-export commonly used types
pub use factory::{BackendFactory, FactoryEvent, PrelaunchFactory, RemoteFactory, StandardFactory};
pub use manager::BackendManager;
pub use remote::{Launcher, LauncherClient};
pub use runtime::{BackendEvent, IdleDelegate, ProcessBackend, ProcessInfo, ProcessState};
pub use utils::config::LauncherConfig;
pub use utils::errors::{LaunchError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
