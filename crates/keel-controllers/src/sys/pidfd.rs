//! Process file descriptors and memory reclaim of killed processes.

use std::fs;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::Path;

/// A pidfd referring to one process.
#[derive(Debug)]
pub struct PidFd {
    fd: OwnedFd,
    pid: i32,
}

impl PidFd {
    /// Opens a pidfd for `pid`.
    pub fn open(pid: i32) -> io::Result<PidFd> {
        // SAFETY: pidfd_open takes plain integers and returns a new fd or -1.
        let rc = unsafe { libc::syscall(libc::SYS_pidfd_open, pid, 0) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: rc is a freshly opened descriptor we now own.
        let fd = unsafe { OwnedFd::from_raw_fd(rc as i32) };
        Ok(PidFd { fd, pid })
    }

    /// Process id.
    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Asks the kernel to reap the memory of the (killed) process now.
    ///
    /// `ESRCH` means the process is already gone and counts as success.
    pub fn release_memory(&self) -> io::Result<()> {
        // SAFETY: the fd is owned by self.
        let rc = unsafe { libc::syscall(libc::SYS_process_mrelease, self.fd.as_raw_fd(), 0) };
        if rc == 0 {
            return Ok(());
        }

        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        Err(err)
    }
}

/// Command line of `pid` with arguments joined by spaces.
pub fn cmdline(proc_root: &Path, pid: i32) -> io::Result<String> {
    let raw = fs::read(proc_root.join(pid.to_string()).join("cmdline"))?;
    let joined = raw
        .split(|b| *b == 0)
        .filter(|arg| !arg.is_empty())
        .map(String::from_utf8_lossy)
        .collect::<Vec<_>>()
        .join(" ");
    Ok(joined)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cmdline_joins_arguments() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("42")).unwrap();
        fs::write(dir.path().join("42/cmdline"), b"/bin/app\0--flag\0value\0").unwrap();

        assert_eq!(cmdline(dir.path(), 42).unwrap(), "/bin/app --flag value");
        assert!(cmdline(dir.path(), 43).is_err());
    }

    #[test]
    fn test_open_self() {
        let pidfd = PidFd::open(std::process::id() as i32).unwrap();
        assert_eq!(pidfd.pid(), std::process::id() as i32);
    }

    #[test]
    fn test_open_missing_process() {
        assert!(PidFd::open(i32::MAX).is_err());
    }
}
