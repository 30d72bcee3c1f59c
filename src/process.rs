//! Process liveness and signalling, behind a trait so lifecycle logic can run
//! against a fake process table in tests.

use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGINT: the hypervisor shuts down cleanly.
    Interrupt,
    /// SIGKILL.
    Kill,
}

pub trait ProcessTable: Send + Sync {
    /// True when `pid` exists and accepts a zero signal. Errors from that check
    /// count as dead.
    fn is_alive(&self, pid: u32) -> bool;

    fn signal(&self, pid: u32, signal: Signal) -> std::io::Result<()>;
}

/// Liveness via the host OS.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsProcesses;

#[cfg(unix)]
impl ProcessTable for OsProcesses {
    fn is_alive(&self, pid: u32) -> bool {
        // kill(0, 0) would target our own process group.
        match unix_pid(pid) {
            Ok(pid) => nix::sys::signal::kill(pid, None).is_ok(),
            Err(_) => false,
        }
    }

    fn signal(&self, pid: u32, signal: Signal) -> std::io::Result<()> {
        use nix::sys::signal::Signal as UnixSignal;

        let signo = match signal {
            Signal::Interrupt => UnixSignal::SIGINT,
            Signal::Kill => UnixSignal::SIGKILL,
        };
        nix::sys::signal::kill(unix_pid(pid)?, signo).map_err(std::io::Error::from)
    }
}

#[cfg(unix)]
fn unix_pid(pid: u32) -> std::io::Result<nix::unistd::Pid> {
    i32::try_from(pid)
        .ok()
        .filter(|&p| p > 0)
        .map(nix::unistd::Pid::from_raw)
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "invalid pid"))
}

/// Hosts without POSIX signals: liveness from the process table, and an
/// interrupt falls back to termination where the OS has no equivalent.
#[cfg(not(unix))]
impl ProcessTable for OsProcesses {
    fn is_alive(&self, pid: u32) -> bool {
        if pid == 0 {
            return false;
        }
        let pid = sysinfo::Pid::from_u32(pid);
        let mut system = sysinfo::System::new();
        system.refresh_process(pid) && system.process(pid).is_some()
    }

    fn signal(&self, pid: u32, signal: Signal) -> std::io::Result<()> {
        let not_found =
            || std::io::Error::new(std::io::ErrorKind::NotFound, format!("no process {pid}"));
        if pid == 0 {
            return Err(not_found());
        }
        let spid = sysinfo::Pid::from_u32(pid);
        let mut system = sysinfo::System::new();
        system.refresh_process(spid);
        let process = system.process(spid).ok_or_else(not_found)?;

        let delivered = match signal {
            Signal::Interrupt => process
                .kill_with(sysinfo::Signal::Interrupt)
                .unwrap_or_else(|| process.kill()),
            Signal::Kill => process.kill(),
        };
        if delivered {
            Ok(())
        } else {
            Err(std::io::Error::other(format!("failed to signal process {pid}")))
        }
    }
}

/// Read a pidfile written by the hypervisor. Missing or garbled files yield
/// `None`.
pub async fn read_pidfile(path: &Path) -> Option<u32> {
    let contents = tokio::fs::read_to_string(path).await.ok()?;
    contents.trim().parse().ok().filter(|&pid| pid != 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_process_is_alive() {
        assert!(OsProcesses.is_alive(std::process::id()));
    }

    #[test]
    fn pid_zero_is_never_alive() {
        assert!(!OsProcesses.is_alive(0));
        assert!(OsProcesses.signal(0, Signal::Interrupt).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn exited_child_is_not_alive() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(!OsProcesses.is_alive(pid));
    }

    #[cfg(unix)]
    #[test]
    fn kill_stops_a_running_child() {
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        assert!(OsProcesses.is_alive(pid));

        OsProcesses.signal(pid, Signal::Kill).unwrap();
        child.wait().unwrap();
        assert!(!OsProcesses.is_alive(pid));
    }

    #[cfg(unix)]
    #[test]
    fn signalling_an_oversized_pid_is_rejected() {
        assert!(!OsProcesses.is_alive(u32::MAX));
        let err = OsProcesses.signal(u32::MAX, Signal::Kill).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn pidfile_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm.pid");
        assert_eq!(read_pidfile(&path).await, None);

        std::fs::write(&path, "12345\n").unwrap();
        assert_eq!(read_pidfile(&path).await, Some(12345));

        std::fs::write(&path, "garbage").unwrap();
        assert_eq!(read_pidfile(&path).await, None);
    }
}
