//! Platform capability interface for process-tree termination.
//!
//! Core enforcement logic never branches on platform; it talks to this trait
//! and a platform-specific implementation is selected at startup.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, RefreshKind, System};

use crate::prelude::*;

pub trait ProcessControl: Send + Sync {
    /// Returns the pids of `root` and every live descendant, root first.
    fn enumerate_descendants(&self, root: u32) -> Vec<u32>;

    /// Asks a process to stop cooperatively.
    fn send_graceful(&self, pid: u32) -> Result<()>;

    /// Kills a process unconditionally.
    fn send_forceful(&self, pid: u32) -> Result<()>;

    /// Liveness check. Signal delivery is asynchronous, so callers poll this
    /// rather than assume a signal was honored.
    fn is_alive(&self, pid: u32) -> bool;

    /// Reaps an exited direct child so it does not linger as a zombie.
    /// No-op for processes that are not our children.
    fn reap(&self, _pid: u32) {}
}

/// `ProcessControl` backed by POSIX signals.
///
/// Graceful termination uses SIGTERM; targets without it would substitute
/// SIGINT via [`UnixProcessControl::with_graceful_signal`].
pub struct UnixProcessControl {
    graceful: nix::sys::signal::Signal,
    system: Mutex<System>,
}

impl Default for UnixProcessControl {
    fn default() -> Self {
        Self::new()
    }
}

impl UnixProcessControl {
    pub fn new() -> Self {
        Self::with_graceful_signal(nix::sys::signal::Signal::SIGTERM)
    }

    pub fn with_graceful_signal(graceful: nix::sys::signal::Signal) -> Self {
        let system = System::new_with_specifics(
            RefreshKind::nothing().with_processes(ProcessRefreshKind::nothing()),
        );
        Self {
            graceful,
            system: Mutex::new(system),
        }
    }

    fn signal(&self, pid: u32, signal: nix::sys::signal::Signal) -> Result<()> {
        let target = nix::unistd::Pid::from_raw(pid as libc::pid_t);
        match nix::sys::signal::kill(target, signal) {
            Ok(()) => Ok(()),
            // Already gone: nothing left to terminate.
            Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(errno) => Err(anyhow!("failed to send {signal} to pid {pid}: {errno}")),
        }
    }
}

impl ProcessControl for UnixProcessControl {
    fn enumerate_descendants(&self, root: u32) -> Vec<u32> {
        let Ok(mut system) = self.system.lock() else {
            return Vec::new();
        };
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing(),
        );

        let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
        for (pid, process) in system.processes() {
            if let Some(parent) = process.parent() {
                children.entry(parent).or_default().push(*pid);
            }
        }

        let mut pids = Vec::new();
        let mut queue = VecDeque::from([Pid::from_u32(root)]);
        while let Some(pid) = queue.pop_front() {
            if system.process(pid).is_none() {
                continue;
            }
            pids.push(pid.as_u32());
            if let Some(child_pids) = children.get(&pid) {
                queue.extend(child_pids.iter().copied());
            }
        }
        pids
    }

    fn send_graceful(&self, pid: u32) -> Result<()> {
        debug!("sending {} to pid {pid}", self.graceful);
        self.signal(pid, self.graceful)
    }

    fn send_forceful(&self, pid: u32) -> Result<()> {
        debug!("sending SIGKILL to pid {pid}");
        self.signal(pid, nix::sys::signal::Signal::SIGKILL)
    }

    fn is_alive(&self, pid: u32) -> bool {
        let target = nix::unistd::Pid::from_raw(pid as libc::pid_t);
        // Signal 0 performs error checking only. EPERM still means the
        // process exists.
        match nix::sys::signal::kill(target, None::<nix::sys::signal::Signal>) {
            Ok(()) => true,
            Err(nix::errno::Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    fn reap(&self, pid: u32) {
        use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
        let target = nix::unistd::Pid::from_raw(pid as libc::pid_t);
        match waitpid(target, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {}
            Ok(status) => debug!("reaped pid {pid}: {status:?}"),
            // ECHILD: not our child, the OS (or its real parent) reaps it.
            Err(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn enumerates_own_tree_with_spawned_child() {
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("failed to spawn sleep");
        std::thread::sleep(Duration::from_millis(100));

        let control = UnixProcessControl::new();
        let pids = control.enumerate_descendants(std::process::id());
        assert_eq!(pids.first(), Some(&std::process::id()));
        assert!(pids.contains(&child.id()));

        child.kill().ok();
        child.wait().ok();
    }

    #[test]
    fn forceful_signal_kills_and_reap_clears_the_zombie() {
        let child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("failed to spawn sleep");
        let pid = child.id();

        let control = UnixProcessControl::new();
        assert!(control.is_alive(pid));
        control.send_forceful(pid).unwrap();

        // The child becomes a zombie until reaped; poll reap+liveness the way
        // the session controller does.
        let mut alive = true;
        for _ in 0..100 {
            control.reap(pid);
            alive = control.is_alive(pid);
            if !alive {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!alive, "pid {pid} still alive after SIGKILL and reap");
    }

    #[test]
    fn signalling_a_dead_pid_is_not_an_error() {
        let mut child = std::process::Command::new("true")
            .spawn()
            .expect("failed to spawn");
        let pid = child.id();
        child.wait().ok();

        let control = UnixProcessControl::new();
        assert!(control.send_graceful(pid).is_ok());
        assert!(control.send_forceful(pid).is_ok());
    }
}
