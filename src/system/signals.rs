//! Process termination
//!
//! Graceful-then-forced termination of a process and its process group.

use std::io;
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};
use tokio::time::{sleep, Instant};

/// How long to wait for a process to disappear after SIGKILL
const KILL_CONFIRM_TIMEOUT: Duration = Duration::from_secs(1);
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGTERM
    Terminate,
    /// SIGKILL
    Kill,
}

/// How a termination request ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// Exited within the grace period after SIGTERM
    Graceful,
    /// Needed SIGKILL
    Forced,
    /// Was already gone before any signal was sent
    AlreadyExited,
    /// Still alive, or could not be signalled
    Failed(String),
}

impl Termination {
    pub fn is_terminated(&self) -> bool {
        !matches!(self, Termination::Failed(_))
    }
}

/// Send `signal` to the process group led by `pid`, or to `pid` alone when
/// it does not lead its own group.
#[cfg(unix)]
pub fn signal_group(pid: u32, signal: Signal) -> io::Result<()> {
    let raw = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;

    // SAFETY: getpgid/killpg/kill only read their integer arguments.
    let rc = unsafe {
        let pgid = libc::getpgid(pid);
        let own_pgid = libc::getpgid(0);
        if pgid == pid && pgid != own_pgid {
            libc::killpg(pgid, raw)
        } else {
            libc::kill(pid, raw)
        }
    };

    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
pub fn signal_group(pid: u32, signal: Signal) -> io::Result<()> {
    let mut sys = System::new();
    let target = Pid::from_u32(pid);
    sys.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
    let process = sys
        .process(target)
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such process"))?;
    let delivered = match signal {
        Signal::Terminate => process.kill_with(sysinfo::Signal::Term).unwrap_or(false),
        Signal::Kill => process.kill(),
    };
    if delivered {
        Ok(())
    } else {
        Err(io::Error::new(io::ErrorKind::Other, "signal not delivered"))
    }
}

/// Whether `pid` names a live process. Zombies count as exited.
pub fn is_alive(pid: u32) -> bool {
    let target = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[target]),
        true,
        ProcessRefreshKind::nothing(),
    );
    match sys.process(target) {
        Some(process) => !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead),
        None => false,
    }
}

/// Poll until `pid` is gone or `timeout` elapses. Returns true if it exited.
pub async fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !is_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(POLL_INTERVAL).await;
    }
}

/// Terminate a process we do not own: SIGTERM, wait up to `grace`, then SIGKILL.
pub async fn terminate_pid(pid: u32, grace: Duration) -> Termination {
    if !is_alive(pid) {
        tracing::info!("Process {} already exited", pid);
        return Termination::AlreadyExited;
    }

    tracing::info!("Sending SIGTERM to process {}", pid);
    match signal_group(pid, Signal::Terminate) {
        Ok(()) => {
            if wait_for_exit(pid, grace).await {
                tracing::info!("Process {} stopped gracefully", pid);
                return Termination::Graceful;
            }
            tracing::warn!(
                "Process {} still alive after {:?}, sending SIGKILL",
                pid,
                grace
            );
        }
        Err(e) => {
            if !is_alive(pid) {
                return Termination::Graceful;
            }
            tracing::warn!("SIGTERM to process {} failed: {}", pid, e);
        }
    }

    match signal_group(pid, Signal::Kill) {
        Ok(()) if wait_for_exit(pid, KILL_CONFIRM_TIMEOUT).await => {
            tracing::info!("Process {} killed", pid);
            Termination::Forced
        }
        Ok(()) => Termination::Failed(format!("process {} survived SIGKILL", pid)),
        Err(e) if !is_alive(pid) => {
            tracing::debug!("SIGKILL to {} raced with exit: {}", pid, e);
            Termination::Forced
        }
        Err(e) => {
            tracing::error!("Could not stop process {}: {}", pid, e);
            Termination::Failed(e.to_string())
        }
    }
}
