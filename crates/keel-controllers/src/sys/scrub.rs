//! Filesystem scrub subprocess running at the lowest priority.

use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;

const IOPRIO_WHO_PROCESS: libc::c_int = 1;
const IOPRIO_CLASS_IDLE: libc::c_int = 3;
const IOPRIO_CLASS_SHIFT: libc::c_int = 13;

/// Capabilities kept in the bounding set of the scrub process.
const KEPT_CAPABILITIES: [libc::c_int; 5] = [
    1,  // CAP_DAC_OVERRIDE
    2,  // CAP_DAC_READ_SEARCH
    3,  // CAP_FOWNER
    17, // CAP_SYS_RAWIO
    21, // CAP_SYS_ADMIN
];

const LAST_CAPABILITY: libc::c_int = 40;

/// Runs a scrub of one mountpoint.
#[async_trait]
pub trait Scrubber: Send + Sync {
    /// Scrubs the filesystem mounted at `mountpoint`.
    async fn scrub(&self, mountpoint: &str) -> io::Result<()>;
}

/// `xfs_scrub` runner.
#[derive(Debug, Clone)]
pub struct XfsScrub {
    binary: PathBuf,
}

impl XfsScrub {
    /// Runner for the binary at `binary`.
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        XfsScrub { binary: binary.into() }
    }
}

#[async_trait]
impl Scrubber for XfsScrub {
    async fn scrub(&self, mountpoint: &str) -> io::Result<()> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["-T", "-v", mountpoint]).kill_on_drop(true);

        // SAFETY: the hook only issues async-signal-safe syscalls.
        unsafe {
            cmd.pre_exec(lower_priority);
        }

        let output = cmd.output().await?;
        if output.status.success() {
            return Ok(());
        }

        Err(io::Error::other(format!(
            "{} failed with {}: {}",
            self.binary.display(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

/// Lowest OOM, CPU and I/O priority; reduced capability bounding set.
fn lower_priority() -> io::Result<()> {
    let path = b"/proc/self/oom_score_adj\0";
    let value = b"-999";

    // SAFETY: static NUL terminated path and buffer; raw syscalls only.
    unsafe {
        let fd = libc::open(path.as_ptr().cast(), libc::O_WRONLY | libc::O_CLOEXEC);
        if fd >= 0 {
            libc::write(fd, value.as_ptr().cast(), value.len());
            libc::close(fd);
        }

        if libc::setpriority(libc::PRIO_PROCESS, 0, 19) != 0 {
            return Err(io::Error::last_os_error());
        }

        let ioprio = (IOPRIO_CLASS_IDLE << IOPRIO_CLASS_SHIFT) | 7;
        if libc::syscall(libc::SYS_ioprio_set, IOPRIO_WHO_PROCESS, 0, ioprio) != 0 {
            return Err(io::Error::last_os_error());
        }

        let param = libc::sched_param { sched_priority: 0 };
        if libc::sched_setscheduler(0, libc::SCHED_IDLE, &param) != 0 {
            return Err(io::Error::last_os_error());
        }

        for cap in 0..=LAST_CAPABILITY {
            if !KEPT_CAPABILITIES.contains(&cap) {
                // Unknown capabilities on older kernels fail with EINVAL.
                libc::prctl(libc::PR_CAPBSET_DROP, cap as libc::c_ulong, 0, 0, 0);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_binary_fails() {
        let scrub = XfsScrub::new("/nonexistent/xfs_scrub");
        assert!(scrub.scrub("/").await.is_err());
    }
}
