// packages/proclaunch/src/main.rs
//! Proclaunch launcher daemon
//!
//! Serves the remote launcher protocol over stdin/stdout (when spawned by a
//! pipe factory) or on a Unix socket. Takes an optional configuration file
//! path as its only argument.

use anyhow::{Context, Result};
use proclaunch::factory::{BackendFactory, PrelaunchFactory, StandardFactory};
use proclaunch::observability::{init_metrics, init_tracing};
use proclaunch::remote::{FrameValidator, Launcher};
use proclaunch::runtime::{IdleDelegate, MatchAll, ProcessInfo};
use proclaunch::utils::config::{LauncherConfig, Transport};
use proclaunch::{BackendManager, VERSION};
use std::path::Path;
use tokio::net::UnixListener;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => LauncherConfig::load_from(Path::new(&path))
            .with_context(|| format!("loading configuration from {}", path))?,
        None => LauncherConfig::load().context("loading configuration")?,
    };

    // Logs go to stderr; stdout may carry the protocol
    init_tracing(config.observability.json_logs)?;
    init_metrics(config.observability.metrics_addr.as_deref())?;

    info!("Starting proclaunchd v{}", VERSION);
    info!("Configuration loaded: {:?}", config);

    let manager = build_manager(&config);
    let validator = FrameValidator::from_config(&config.launcher)?;
    let launcher = Launcher::new(manager.clone(), validator);

    let served = match config.launcher.transport {
        Transport::Pipe => {
            info!("Serving on stdin/stdout");
            tokio::select! {
                served = launcher.serve(tokio::io::stdin(), tokio::io::stdout()) => served.map_err(anyhow::Error::from),
                stopped = shutdown_signal() => stopped,
            }
        }
        Transport::Socket => serve_socket(&launcher, &config.launcher.socket_path).await,
    };

    manager.shutdown();
    match served {
        Ok(()) => {
            info!("Launcher stopped");
            Ok(())
        }
        Err(e) => {
            error!("Launcher error: {:#}", e);
            Err(e)
        }
    }
}

/// Optional prelaunch factory for the configured program, then a standard
/// factory for everything else
fn build_manager(config: &LauncherConfig) -> BackendManager {
    let manager = BackendManager::new();

    let idle = IdleDelegate::from_config(&config.idle).unwrap_or_else(IdleDelegate::external);
    manager.set_idle_delegate(Some(idle));

    if let Some(program) = config.prelaunch.program.clone() {
        info!(
            "Prelaunching {} every {:?}",
            program,
            config.prelaunch.interval()
        );
        let template = ProcessInfo::new(program.clone()).with_arguments(config.prelaunch.arguments.clone());
        let prelaunch = PrelaunchFactory::new(Some(template)).with_launch_interval(config.prelaunch.interval());
        prelaunch.set_prelaunch_enabled(config.prelaunch.enabled);
        manager.add_factory(
            BackendFactory::from(prelaunch)
                .with_matcher(move |info: &ProcessInfo| info.program == program),
        );
    }

    manager.add_factory(BackendFactory::from(StandardFactory::new()).with_matcher(MatchAll));
    manager
}

async fn serve_socket(launcher: &Launcher, path: &Path) -> Result<()> {
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("removing stale socket {}", path.display()))?;
    }
    let listener = UnixListener::bind(path)
        .with_context(|| format!("binding {}", path.display()))?;
    info!("Listening on {}", path.display());

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let result = loop {
        tokio::select! {
            accepted = listener.accept() => {
                let stream = match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => break Err(e.into()),
                };
                info!("Client connected");
                let launcher = launcher.clone();
                tokio::spawn(async move {
                    let (reader, writer) = stream.into_split();
                    match launcher.serve(reader, writer).await {
                        Ok(()) => info!("Client disconnected"),
                        Err(e) => warn!("Client connection failed: {}", e),
                    }
                });
            }
            stopped = &mut shutdown => break stopped,
        }
    };

    let _ = std::fs::remove_file(path);
    result
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() -> Result<()> {
    let mut terminate = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        ctrl_c = tokio::signal::ctrl_c() => ctrl_c.context("installing SIGINT handler")?,
        _ = terminate.recv() => {}
    }
    info!("Received shutdown signal, cleaning up...");
    Ok(())
}
