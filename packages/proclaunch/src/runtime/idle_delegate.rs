// packages/proclaunch/src/runtime/idle_delegate.rs
//! Idle-CPU gating for spare replenishment
//!
//! Consumers call [`IdleDelegate::wait_idle`] when they want to do
//! background work (launch a spare). While anyone is waiting the delegate
//! is "requested": a ticker samples a [`LoadProbe`] once per interval and,
//! whenever the load is at or below the threshold, releases exactly one
//! waiter (FIFO). A disabled delegate releases nobody.
//!
//! Three sources are provided:
//!
//! - **timeout**: always idle, one release per interval
//! - **io**: time spent in disk I/O from `/sys/block/<dev>/stat`
//! - **external**: no ticker; releases happen through
//!   [`IdleDelegate::signal_available`] (driven by a remote peer)

use crate::utils::config::{IdleKind, IdleSection};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, trace, warn};

/// Default sampling interval
pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_millis(1000);

/// Default I/O load threshold
pub const DEFAULT_LOAD_THRESHOLD: f64 = 0.4;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IdleEvent {
    /// One waiter was released
    Available,
    /// A load sample was taken (0.0 to 1.0)
    Load(f64),
}

/// Source of load samples
pub trait LoadProbe: Send + Sync {
    /// Current load, 0.0 (idle) to 1.0 (saturated)
    fn sample(&self) -> f64;

    /// Called when sampling (re)starts after a quiet period
    fn reset(&self) {}
}

/// Always idle
#[derive(Debug, Default)]
pub struct TimeoutProbe;

impl LoadProbe for TimeoutProbe {
    fn sample(&self) -> f64 {
        0.0
    }
}

/// Fraction of wall time the device spent doing I/O since the last sample
pub struct IoProbe {
    stat_path: PathBuf,
    last: Mutex<Option<(u64, Instant)>>,
}

impl IoProbe {
    pub fn new(device: &str) -> Self {
        Self::with_stat_path(format!("/sys/block/{}/stat", device))
    }

    pub fn with_stat_path(path: impl Into<PathBuf>) -> Self {
        Self {
            stat_path: path.into(),
            last: Mutex::new(None),
        }
    }

    fn read_io_ticks(&self) -> Option<u64> {
        let stat = std::fs::read_to_string(&self.stat_path).ok()?;
        io_ticks(&stat)
    }
}

impl LoadProbe for IoProbe {
    fn sample(&self) -> f64 {
        let Some(ticks) = self.read_io_ticks() else {
            warn!("Unable to read {}", self.stat_path.display());
            return 1.0;
        };

        let now = Instant::now();
        let mut last = self.last.lock();
        let load = match *last {
            Some((last_ticks, at)) => {
                let elapsed = now.duration_since(at).as_millis() as f64;
                if elapsed > 0.0 {
                    (ticks.saturating_sub(last_ticks) as f64 / elapsed).clamp(0.0, 1.0)
                } else {
                    1.0
                }
            }
            None => 1.0,
        };
        *last = Some((ticks, now));
        load
    }

    fn reset(&self) {
        let ticks = self.read_io_ticks();
        *self.last.lock() = ticks.map(|ticks| (ticks, Instant::now()));
    }
}

/// Milliseconds spent doing I/O: the 10th field of a block device stat line
fn io_ticks(stat: &str) -> Option<u64> {
    let fields: Vec<&str> = stat.split_whitespace().collect();
    if fields.len() < 11 {
        return None;
    }
    fields[9].parse().ok()
}

enum Source {
    Ticker(Box<dyn LoadProbe>),
    External,
}

struct IdleState {
    enabled: bool,
    interval: Duration,
    threshold: f64,
    waiters: VecDeque<(u64, oneshot::Sender<()>)>,
    next_waiter: u64,
    ticker_running: bool,
}

struct Inner {
    source: Source,
    state: Mutex<IdleState>,
    requested: watch::Sender<bool>,
    events: broadcast::Sender<IdleEvent>,
}

/// Shared idle source; clones refer to the same delegate
#[derive(Clone)]
pub struct IdleDelegate {
    inner: Arc<Inner>,
}

impl IdleDelegate {
    fn with_source(source: Source, interval: Duration, threshold: f64) -> Self {
        let (requested, _) = watch::channel(false);
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                source,
                state: Mutex::new(IdleState {
                    enabled: true,
                    interval,
                    threshold,
                    waiters: VecDeque::new(),
                    next_waiter: 0,
                    ticker_running: false,
                }),
                requested,
                events,
            }),
        }
    }

    /// Always idle; releases one waiter per `interval`
    pub fn timeout(interval: Duration) -> Self {
        Self::with_probe(TimeoutProbe, interval, DEFAULT_LOAD_THRESHOLD)
    }

    /// Idle when disk I/O on `device` is at or below `threshold`
    pub fn io(device: &str, interval: Duration, threshold: f64) -> Self {
        Self::with_probe(IoProbe::new(device), interval, threshold)
    }

    pub fn with_probe(probe: impl LoadProbe + 'static, interval: Duration, threshold: f64) -> Self {
        Self::with_source(Source::Ticker(Box::new(probe)), interval, threshold)
    }

    /// Released only through [`signal_available`](Self::signal_available)
    pub fn external() -> Self {
        Self::with_source(Source::External, DEFAULT_IDLE_INTERVAL, DEFAULT_LOAD_THRESHOLD)
    }

    pub fn from_config(section: &IdleSection) -> Option<Self> {
        match section.kind {
            IdleKind::None => None,
            IdleKind::Timeout => Some(Self::timeout(section.interval())),
            IdleKind::Io => Some(Self::io(&section.device, section.interval(), section.threshold)),
        }
    }

    /// Granted by a peer rather than by local sampling
    pub fn is_external(&self) -> bool {
        matches!(self.inner.source, Source::External)
    }

    pub fn enabled(&self) -> bool {
        self.inner.state.lock().enabled
    }

    pub fn set_enabled(&self, enabled: bool) {
        debug!("Idle delegate {}", if enabled { "enabled" } else { "disabled" });
        self.inner.state.lock().enabled = enabled;
    }

    pub fn interval(&self) -> Duration {
        self.inner.state.lock().interval
    }

    /// Takes effect from the next sample
    pub fn set_interval(&self, interval: Duration) {
        self.inner.state.lock().interval = interval;
    }

    pub fn threshold(&self) -> f64 {
        self.inner.state.lock().threshold
    }

    pub fn set_threshold(&self, threshold: f64) {
        self.inner.state.lock().threshold = threshold;
    }

    /// Someone is waiting for idle capacity
    pub fn is_requested(&self) -> bool {
        *self.inner.requested.borrow()
    }

    pub fn watch_requested(&self) -> watch::Receiver<bool> {
        self.inner.requested.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IdleEvent> {
        self.inner.events.subscribe()
    }

    /// Resolve once this caller is granted idle capacity
    ///
    /// Dropping the future withdraws the request.
    pub async fn wait_idle(&self) {
        let (tx, rx) = oneshot::channel();
        let (id, start_ticker) = {
            let mut state = self.inner.state.lock();
            state.next_waiter += 1;
            let id = state.next_waiter;
            state.waiters.push_back((id, tx));
            self.inner.publish_requested(true);
            let start = matches!(self.inner.source, Source::Ticker(_)) && !state.ticker_running;
            if start {
                state.ticker_running = true;
            }
            (id, start)
        };
        let _withdraw = Withdraw {
            inner: &self.inner,
            id,
        };

        if start_ticker {
            if let Source::Ticker(probe) = &self.inner.source {
                probe.reset();
            }
            tokio::spawn(run_ticker(Arc::downgrade(&self.inner)));
        }

        let _ = rx.await;
    }

    /// Release the oldest waiter; returns whether anyone was released
    pub fn signal_available(&self) -> bool {
        if !self.enabled() {
            return false;
        }
        self.inner.grant_one()
    }
}

impl Inner {
    fn publish_requested(&self, requested: bool) {
        self.requested.send_if_modified(|current| {
            if *current == requested {
                false
            } else {
                *current = requested;
                true
            }
        });
    }

    fn grant_one(&self) -> bool {
        let mut state = self.state.lock();
        while let Some((_, waiter)) = state.waiters.pop_front() {
            if waiter.send(()).is_ok() {
                trace!("Idle capacity granted");
                let _ = self.events.send(IdleEvent::Available);
                self.publish_requested(!state.waiters.is_empty());
                return true;
            }
        }
        self.publish_requested(false);
        false
    }

    /// One sampling step; returns false once nobody is waiting
    fn on_tick(&self) -> bool {
        let (enabled, threshold) = {
            let mut state = self.state.lock();
            state.waiters.retain(|(_, waiter)| !waiter.is_closed());
            if state.waiters.is_empty() {
                state.ticker_running = false;
                self.publish_requested(false);
                return false;
            }
            (state.enabled, state.threshold)
        };

        if !enabled {
            return true;
        }

        let Source::Ticker(probe) = &self.source else {
            return false;
        };
        let load = probe.sample();
        let _ = self.events.send(IdleEvent::Load(load));
        if load <= threshold {
            self.grant_one();
        }
        true
    }
}

/// Removes an abandoned waiter so the request flag drops with it
struct Withdraw<'a> {
    inner: &'a Inner,
    id: u64,
}

impl Drop for Withdraw<'_> {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.waiters.retain(|(id, _)| *id != self.id);
        self.inner.publish_requested(!state.waiters.is_empty());
    }
}

async fn run_ticker(inner: Weak<Inner>) {
    loop {
        let interval = match inner.upgrade() {
            Some(inner) => inner.state.lock().interval,
            None => return,
        };
        tokio::time::sleep(interval).await;

        let Some(inner) = inner.upgrade() else {
            return;
        };
        if !inner.on_tick() {
            return;
        }
    }
}
