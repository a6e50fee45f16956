// packages/proclaunch/src/runtime/procutils.rs
//! OS process-table helpers
//!
//! Thin wrappers over `/proc` and the scheduling syscalls. Anything the
//! platform cannot do is reported as [`Adjustment::Unsupported`] or `None`,
//! never as an error.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::io;
use tracing::{debug, trace};

/// Outcome of a write to an optional OS capability
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjustment {
    Applied,
    Unsupported,
}

/// Check if a process is running
pub fn is_running(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Send `signal` to `pid`
pub fn send_signal(pid: u32, signal: Signal) -> io::Result<()> {
    trace!("Sending {:?} to PID {}", signal, pid);
    kill(Pid::from_raw(pid as i32), signal).map_err(io::Error::from)
}

/// Current nice value of `pid`
#[cfg(target_os = "linux")]
pub fn priority_of(pid: u32) -> Option<i32> {
    nice_from_stat(&std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?)
}

#[cfg(not(target_os = "linux"))]
pub fn priority_of(pid: u32) -> Option<i32> {
    if !is_running(pid) {
        return None;
    }
    // SAFETY: getpriority has no memory-safety preconditions
    Some(unsafe { libc::getpriority(libc::PRIO_PROCESS, pid as libc::id_t) })
}

/// Set the nice value of `pid` and, on Linux, of every one of its threads
pub fn set_priority(pid: u32, priority: i32) -> io::Result<()> {
    debug!("Setting priority {} for PID {}", priority, pid);

    for tid in task_ids(pid) {
        // SAFETY: setpriority has no memory-safety preconditions
        let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, tid as libc::id_t, priority) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            // Threads can exit between listing and adjusting them
            if tid != pid && err.raw_os_error() == Some(libc::ESRCH) {
                continue;
            }
            return Err(err);
        }
    }
    Ok(())
}

/// Current `oom_score_adj` of `pid`
#[cfg(target_os = "linux")]
pub fn oom_score_of(pid: u32) -> Option<i32> {
    std::fs::read_to_string(format!("/proc/{}/oom_score_adj", pid))
        .ok()?
        .trim()
        .parse()
        .ok()
}

#[cfg(not(target_os = "linux"))]
pub fn oom_score_of(_pid: u32) -> Option<i32> {
    None
}

/// Write `oom_score_adj` for `pid`
#[cfg(target_os = "linux")]
pub fn set_oom_score(pid: u32, value: i32) -> io::Result<Adjustment> {
    debug!("Setting OOM adjustment {} for PID {}", value, pid);
    std::fs::write(format!("/proc/{}/oom_score_adj", pid), format!("{}\n", value))?;
    Ok(Adjustment::Applied)
}

#[cfg(not(target_os = "linux"))]
pub fn set_oom_score(_pid: u32, _value: i32) -> io::Result<Adjustment> {
    Ok(Adjustment::Unsupported)
}

/// Number of threads in `pid`
#[cfg(target_os = "linux")]
pub fn thread_count(pid: u32) -> Option<usize> {
    Some(std::fs::read_dir(format!("/proc/{}/task", pid)).ok()?.count())
}

#[cfg(not(target_os = "linux"))]
pub fn thread_count(_pid: u32) -> Option<usize> {
    None
}

/// Nice value of every thread in `pid`
#[cfg(target_os = "linux")]
pub fn thread_priorities(pid: u32) -> Vec<i32> {
    task_ids(pid)
        .into_iter()
        .filter_map(|tid| {
            let stat = std::fs::read_to_string(format!("/proc/{}/task/{}/stat", pid, tid)).ok()?;
            nice_from_stat(&stat)
        })
        .collect()
}

#[cfg(not(target_os = "linux"))]
pub fn thread_priorities(pid: u32) -> Vec<i32> {
    priority_of(pid).into_iter().collect()
}

#[cfg(target_os = "linux")]
fn task_ids(pid: u32) -> Vec<u32> {
    let mut ids: Vec<u32> = std::fs::read_dir(format!("/proc/{}/task", pid))
        .map(|dir| {
            dir.filter_map(|entry| entry.ok()?.file_name().to_str()?.parse().ok())
                .collect()
        })
        .unwrap_or_default();
    if ids.is_empty() {
        ids.push(pid);
    }
    ids
}

#[cfg(not(target_os = "linux"))]
fn task_ids(pid: u32) -> Vec<u32> {
    vec![pid]
}

/// Field 19 of `/proc/<pid>/stat`. The command name (field 2) may contain
/// spaces and parentheses, so fields are counted from its closing paren.
fn nice_from_stat(stat: &str) -> Option<i32> {
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.split_whitespace().nth(16)?.parse().ok()
}
