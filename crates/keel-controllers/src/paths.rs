//! Filesystem locations the controllers read and write.
//!
//! Every path is overridable so the whole catalogue can run against a
//! scratch directory.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Host paths used by the controllers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemPaths {
    /// procfs mount.
    pub proc: PathBuf,
    /// Root under which `proc.sys.*` and `sys.*` kernel parameter keys resolve.
    pub kernel_params_root: PathBuf,
    /// Kernel module tree (`/lib/modules`).
    pub modules_root: PathBuf,
    /// cgroup v2 mount.
    pub cgroup_root: PathBuf,
    /// Kernel log device.
    pub kmsg: PathBuf,
    /// EFI variables.
    pub efivars: PathBuf,
    /// Kernel lockdown mode file.
    pub lockdown: PathBuf,
    /// Module signature enforcement parameter.
    pub module_sig_enforce: PathBuf,
    /// Installed extension manifests.
    pub extensions_dir: PathBuf,
    /// SPDX documents.
    pub spdx_dir: PathBuf,
    /// Seccomp profile files.
    pub seccomp_dir: PathBuf,
    /// Extension service configuration files.
    pub extension_config_dir: PathBuf,
    /// Meta key store.
    pub meta_dir: PathBuf,
    /// Container runtime shim binary rebound from a memfd.
    pub runc: PathBuf,
    /// Filesystem scrub binary.
    pub xfs_scrub: PathBuf,
    /// CRI runtime socket.
    pub cri_socket: PathBuf,
    /// System containerd socket.
    pub containerd_socket: PathBuf,
}

impl Default for SystemPaths {
    fn default() -> Self {
        SystemPaths {
            proc: PathBuf::from("/proc"),
            kernel_params_root: PathBuf::from("/"),
            modules_root: PathBuf::from("/lib/modules"),
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
            kmsg: PathBuf::from("/dev/kmsg"),
            efivars: PathBuf::from("/sys/firmware/efi/efivars"),
            lockdown: PathBuf::from("/sys/kernel/security/lockdown"),
            module_sig_enforce: PathBuf::from("/sys/module/module/parameters/sig_enforce"),
            extensions_dir: PathBuf::from("/usr/local/etc/extensions"),
            spdx_dir: PathBuf::from("/usr/share/spdx"),
            seccomp_dir: PathBuf::from("/var/lib/kubelet/seccomp/profiles"),
            extension_config_dir: PathBuf::from("/var/etc/extensions"),
            meta_dir: PathBuf::from("/var/lib/keel/meta"),
            runc: PathBuf::from("/bin/runc"),
            xfs_scrub: PathBuf::from("/usr/sbin/xfs_scrub"),
            cri_socket: PathBuf::from("/run/containerd/containerd.sock"),
            containerd_socket: PathBuf::from("/system/run/containerd/containerd.sock"),
        }
    }
}

impl SystemPaths {
    /// Paths rooted under `root`, mirroring the host layout.
    pub fn rooted(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let join = |p: &PathBuf| root.join(p.strip_prefix("/").unwrap_or(p));
        let d = SystemPaths::default();

        SystemPaths {
            proc: join(&d.proc),
            kernel_params_root: root.clone(),
            modules_root: join(&d.modules_root),
            cgroup_root: join(&d.cgroup_root),
            kmsg: join(&d.kmsg),
            efivars: join(&d.efivars),
            lockdown: join(&d.lockdown),
            module_sig_enforce: join(&d.module_sig_enforce),
            extensions_dir: join(&d.extensions_dir),
            spdx_dir: join(&d.spdx_dir),
            seccomp_dir: join(&d.seccomp_dir),
            extension_config_dir: join(&d.extension_config_dir),
            meta_dir: join(&d.meta_dir),
            runc: join(&d.runc),
            xfs_scrub: join(&d.xfs_scrub),
            cri_socket: join(&d.cri_socket),
            containerd_socket: join(&d.containerd_socket),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rooted_keeps_layout() {
        let paths = SystemPaths::rooted("/tmp/x");
        assert_eq!(paths.proc, PathBuf::from("/tmp/x/proc"));
        assert_eq!(paths.kernel_params_root, PathBuf::from("/tmp/x"));
        assert_eq!(paths.cgroup_root, PathBuf::from("/tmp/x/sys/fs/cgroup"));
    }
}
