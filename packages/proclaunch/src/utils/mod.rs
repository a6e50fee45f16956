// packages/proclaunch/src/utils/mod.rs
//! Common utilities: error type and launcher configuration

pub mod config;
pub mod errors;

pub use self::config::LauncherConfig;
pub use errors::{LaunchError, Result};
