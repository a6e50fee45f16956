// packages/proclaunch/src/observability/mod.rs
//! Tracing and metrics setup
//!
//! Logs always go to stderr: in pipe mode stdout carries the launcher
//! protocol. Counters are recorded through the `metrics` facade and are
//! only exported when a Prometheus listener is configured.

use crate::utils::errors::{LaunchError, Result};
use metrics::{counter, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::EnvFilter;

static METRICS_DESCRIBED: AtomicBool = AtomicBool::new(false);

const BACKENDS_CREATED: &str = "proclaunch_backends_created_total";
const SPARES_LAUNCHED: &str = "proclaunch_spares_launched_total";
const SPARES_LOST: &str = "proclaunch_spares_lost_total";
const FRAMES_DROPPED: &str = "proclaunch_frames_dropped_total";

/// Install the global subscriber (`RUST_LOG` overrides the `info` default)
pub fn init_tracing(json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| LaunchError::RuntimeError(format!("failed to install tracing: {}", e)))
}

/// Describe the counters and, given an address, serve them for Prometheus
pub fn init_metrics(listen: Option<&str>) -> Result<()> {
    describe_metrics();

    let Some(listen) = listen else {
        return Ok(());
    };
    let addr: SocketAddr = listen
        .parse()
        .map_err(|e| LaunchError::InvalidConfiguration(format!("metrics address '{}': {}", listen, e)))?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| LaunchError::RuntimeError(format!("failed to start metrics exporter: {}", e)))?;
    tracing::info!("Serving metrics on {}", addr);
    Ok(())
}

fn describe_metrics() {
    if METRICS_DESCRIBED.swap(true, Ordering::SeqCst) {
        return;
    }
    metrics::describe_counter!(BACKENDS_CREATED, Unit::Count, "Backends handed out by factories");
    metrics::describe_counter!(SPARES_LAUNCHED, Unit::Count, "Prelaunched spares started");
    metrics::describe_counter!(SPARES_LOST, Unit::Count, "Spares that died before hand-off");
    metrics::describe_counter!(FRAMES_DROPPED, Unit::Count, "Launcher protocol frames dropped");
}

#[inline]
pub fn record_backend_created(factory: &'static str) {
    counter!(BACKENDS_CREATED, "factory" => factory).increment(1);
}

#[inline]
pub fn record_spare_launched() {
    counter!(SPARES_LAUNCHED).increment(1);
}

#[inline]
pub fn record_spare_lost() {
    counter!(SPARES_LOST).increment(1);
}

#[inline]
pub fn record_frame_dropped(reason: &'static str) {
    counter!(FRAMES_DROPPED, "reason" => reason).increment(1);
}
