//! Rebinding a binary from a sealed memfd over its own path.
//!
//! The mount source is the `/proc/self/fd/N` magic link of the memfd, so the
//! process holding [`MemfdBind`] must stay alive for the mount to resolve.

use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

/// A binary bound over itself from a memfd copy.
#[derive(Debug)]
pub struct MemfdBind {
    target: PathBuf,
    // Keeps the magic link valid.
    _memfd: File,
}

fn cstring(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

fn check(rc: libc::c_int) -> io::Result<()> {
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

impl MemfdBind {
    /// Copies `target` into a sealed memfd and bind-mounts it over `target`.
    pub fn clone_and_bind(target: &Path) -> io::Result<MemfdBind> {
        let name = target
            .file_name()
            .map(|n| n.as_bytes().to_vec())
            .unwrap_or_else(|| b"memfd".to_vec());
        let name = CString::new(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        // SAFETY: name is NUL terminated; the returned fd is owned by the File below.
        let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC | libc::MFD_ALLOW_SEALING) };
        check(fd)?;
        let mut memfd = unsafe { File::from_raw_fd(fd) };

        let mut source = File::open(target)?;
        io::copy(&mut source, &mut memfd)?;

        let seals = libc::F_SEAL_SEAL | libc::F_SEAL_SHRINK | libc::F_SEAL_GROW | libc::F_SEAL_WRITE;
        // SAFETY: plain fcntl on an fd we own.
        check(unsafe { libc::fcntl(memfd.as_raw_fd(), libc::F_ADD_SEALS, seals) })?;

        let magic = cstring(Path::new(&format!("/proc/self/fd/{}", memfd.as_raw_fd())))?;
        let dest = cstring(target)?;
        // SAFETY: all pointers are valid NUL terminated strings or null.
        check(unsafe {
            libc::mount(
                magic.as_ptr(),
                dest.as_ptr(),
                std::ptr::null(),
                libc::MS_BIND,
                std::ptr::null(),
            )
        })?;

        Ok(MemfdBind {
            target: target.to_path_buf(),
            _memfd: memfd,
        })
    }

    /// Path the memfd is bound over.
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Detaches every mount stacked on the target; returns how many were removed.
    pub fn unmount_all(&self) -> io::Result<usize> {
        let dest = cstring(&self.target)?;
        let mut removed = 0;

        // SAFETY: dest is a valid NUL terminated path.
        while unsafe { libc::umount2(dest.as_ptr(), libc::MNT_DETACH) } == 0 {
            removed += 1;
        }

        Ok(removed)
    }
}
