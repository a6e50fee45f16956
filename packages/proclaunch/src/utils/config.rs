// packages/proclaunch/src/utils/config.rs
//! Launcher configuration
//!
//! Loaded from an optional `proclaunch.{toml,yaml,json}` file, then
//! overridden by `PROCLAUNCH_*` environment variables, e.g.
//! `PROCLAUNCH_LAUNCHER__TRANSPORT=socket` or
//! `PROCLAUNCH_PRELAUNCH__INTERVAL_MS=250`.

use crate::remote::schema::ValidationMode;
use crate::utils::errors::{LaunchError, Result};
use ::config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How the launcher talks to its client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// JSON lines over stdin/stdout (spawned by a pipe factory)
    Pipe,
    /// JSON lines over a Unix domain socket listener
    Socket,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherSection {
    pub transport: Transport,
    pub socket_path: PathBuf,
    pub validation: ValidationMode,
    pub inbound_schema: Option<PathBuf>,
    pub outbound_schema: Option<PathBuf>,
}

impl Default for LauncherSection {
    fn default() -> Self {
        Self {
            transport: Transport::Pipe,
            socket_path: PathBuf::from("/tmp/proclaunch.sock"),
            validation: ValidationMode::Off,
            inbound_schema: None,
            outbound_schema: None,
        }
    }
}

/// Optional prelaunch factory hosted by the launcher
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrelaunchSection {
    /// Program to keep warm; no prelaunch factory when unset
    pub program: Option<String>,
    pub arguments: Vec<String>,
    pub interval_ms: u64,
    pub enabled: bool,
}

impl Default for PrelaunchSection {
    fn default() -> Self {
        Self {
            program: None,
            arguments: vec![],
            interval_ms: 1000,
            enabled: true,
        }
    }
}

impl PrelaunchSection {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdleKind {
    /// No local idle delegate; idle requests are relayed to the client
    None,
    /// Always idle, fires once per interval
    Timeout,
    /// Disk activity from `/sys/block/<device>/stat`
    Io,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdleSection {
    pub kind: IdleKind,
    pub interval_ms: u64,
    pub threshold: f64,
    pub device: String,
}

impl Default for IdleSection {
    fn default() -> Self {
        Self {
            kind: IdleKind::None,
            interval_ms: 1000,
            threshold: 0.4,
            device: "sda".to_string(),
        }
    }
}

impl IdleSection {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilitySection {
    /// Emit logs as JSON lines
    pub json_logs: bool,
    /// Prometheus listener, e.g. "127.0.0.1:9464"
    pub metrics_addr: Option<String>,
}

/// Top-level launcher configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    pub launcher: LauncherSection,
    pub prelaunch: PrelaunchSection,
    pub idle: IdleSection,
    pub observability: ObservabilitySection,
}

impl LauncherConfig {
    /// Load from `proclaunch.*` in the working directory (if present) and
    /// the environment.
    pub fn load() -> Result<Self> {
        Self::build(File::with_name("proclaunch").required(false))
    }

    /// Load from an explicit file plus the environment.
    pub fn load_from(path: &Path) -> Result<Self> {
        Self::build(File::from(path).required(true))
    }

    fn build<S>(file: S) -> Result<Self>
    where
        S: ::config::Source + Send + Sync + 'static,
    {
        let config: Self = Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix("PROCLAUNCH")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(" ")
                    .with_list_parse_key("prelaunch.arguments"),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.prelaunch.interval_ms == 0 {
            return Err(LaunchError::InvalidConfiguration(
                "prelaunch.interval_ms must be positive".into(),
            ));
        }
        if self.idle.interval_ms == 0 {
            return Err(LaunchError::InvalidConfiguration(
                "idle.interval_ms must be positive".into(),
            ));
        }
        if let Some(program) = &self.prelaunch.program {
            if program.is_empty() {
                return Err(LaunchError::InvalidConfiguration(
                    "prelaunch.program is empty".into(),
                ));
            }
        }
        Ok(())
    }
}
