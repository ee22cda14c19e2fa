//! Kernel parameters exposed as files under procfs and sysfs.
//!
//! Keys are dotted paths relative to the root, e.g. `proc.sys.fs.file-max`
//! or `sys.kernel.mm.transparent_hugepage.enabled`.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Prefix of sysctl keys.
pub const SYSCTL_PREFIX: &str = "proc.sys.";
/// Prefix of sysfs keys.
pub const SYSFS_PREFIX: &str = "sys.";

/// Key of a sysctl given its dotted name.
pub fn sysctl_key(name: &str) -> String {
    format!("{SYSCTL_PREFIX}{name}")
}

/// Key of a sysfs attribute given its dotted path.
pub fn sysfs_key(name: &str) -> String {
    format!("{SYSFS_PREFIX}{name}")
}

/// Kernel parameter file access rooted at a directory.
#[derive(Debug, Clone)]
pub struct KernelParams {
    root: PathBuf,
}

impl KernelParams {
    /// Parameters rooted at `root` (`/` on a live system).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        KernelParams { root: root.into() }
    }

    /// File backing `key`.
    pub fn path(&self, key: &str) -> PathBuf {
        self.root.join(key.replace('.', "/"))
    }

    /// Reads the current value; `None` if the parameter doesn't exist.
    pub fn read(&self, key: &str) -> io::Result<Option<String>> {
        match fs::read_to_string(self.path(key)) {
            Ok(value) => Ok(Some(value.trim_end().to_string())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Writes a value. The parameter must already exist.
    pub fn write(&self, key: &str, value: &str) -> io::Result<()> {
        write_existing(&self.path(key), value)
    }

    /// Restores a prior value, or removes the parameter if it didn't exist.
    ///
    /// Removal fails on a live procfs; that failure is ignored since the
    /// kernel owns the file.
    pub fn restore(&self, key: &str, prior: Option<&str>) -> io::Result<()> {
        match prior {
            Some(value) => self.write(key, value),
            None => match fs::remove_file(self.path(key)) {
                Ok(()) => Ok(()),
                Err(err) => {
                    tracing::debug!(key, error = %err, "parameter didn't exist before, leaving it in place");
                    Ok(())
                }
            },
        }
    }
}

fn write_existing(path: &Path, value: &str) -> io::Result<()> {
    let mut f = OpenOptions::new().write(true).truncate(true).open(path)?;
    f.write_all(value.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, KernelParams) {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("proc/sys/fs")).unwrap();
        fs::write(dir.path().join("proc/sys/fs/file-max"), "100000\n").unwrap();
        let params = KernelParams::new(dir.path());
        (dir, params)
    }

    #[test]
    fn test_key_to_path() {
        let params = KernelParams::new("/");
        assert_eq!(params.path(&sysctl_key("net.ipv4.ip_forward")), PathBuf::from("/proc/sys/net/ipv4/ip_forward"));
        assert_eq!(params.path(&sysfs_key("kernel.mm.ksm.run")), PathBuf::from("/sys/kernel/mm/ksm/run"));
    }

    #[test]
    fn test_read_write_restore() {
        let (_dir, params) = setup();
        let key = sysctl_key("fs.file-max");

        assert_eq!(params.read(&key).unwrap().as_deref(), Some("100000"));
        params.write(&key, "500000").unwrap();
        assert_eq!(params.read(&key).unwrap().as_deref(), Some("500000"));
        params.restore(&key, Some("100000")).unwrap();
        assert_eq!(params.read(&key).unwrap().as_deref(), Some("100000"));
    }

    #[test]
    fn test_write_missing_is_not_found() {
        let (_dir, params) = setup();
        let err = params.write(&sysctl_key("fs.nope"), "1").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert_eq!(params.read(&sysctl_key("fs.nope")).unwrap(), None);
    }
}
