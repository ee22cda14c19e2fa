//! Kernel modules: `/proc/modules` parsing, `modules.dep` resolution and
//! loading through `finit_module`.

use std::collections::{HashMap, HashSet};
use std::ffi::{CStr, CString};
use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use keel_resources::runtime::LoadedKernelModule;

/// `finit_module` flag for compressed module files.
const MODULE_INIT_COMPRESSED_FILE: libc::c_uint = 4;

/// Parses `/proc/modules`: `name size refcount deps state address` per line.
pub fn parse_proc_modules(content: &str) -> Vec<(String, LoadedKernelModule)> {
    content
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 6 {
                return None;
            }

            let dependencies = match fields[3] {
                "-" => Vec::new(),
                deps => deps.split(',').filter(|d| !d.is_empty()).map(str::to_string).collect(),
            };

            Some((
                fields[0].to_string(),
                LoadedKernelModule {
                    size: fields[1].parse().unwrap_or(0),
                    reference_count: fields[2].parse().unwrap_or(0),
                    dependencies,
                    state: fields[4].to_string(),
                    address: fields[5].to_string(),
                },
            ))
        })
        .collect()
}

/// Module name of a module file path (`kernel/fs/xfs/xfs.ko.zst` -> `xfs`).
pub fn module_name(path: &str) -> String {
    let file = path.rsplit('/').next().unwrap_or(path);
    let stem = file.split(".ko").next().unwrap_or(file);
    stem.replace('-', "_")
}

/// Parsed `modules.dep`.
#[derive(Debug, Default, Clone)]
pub struct ModuleDeps {
    paths: HashMap<String, String>,
    deps: HashMap<String, Vec<String>>,
}

impl ModuleDeps {
    /// Parses `path: dep dep ...` lines.
    pub fn parse(content: &str) -> Self {
        let mut md = ModuleDeps::default();

        for line in content.lines() {
            let Some((path, deps)) = line.split_once(':') else {
                continue;
            };
            let name = module_name(path.trim());
            md.paths.insert(name.clone(), path.trim().to_string());
            md.deps
                .insert(name, deps.split_whitespace().map(module_name).collect());
        }

        md
    }

    /// Relative path of a module file.
    pub fn path_of(&self, name: &str) -> Option<&str> {
        self.paths.get(&name.replace('-', "_")).map(String::as_str)
    }

    /// Load order for `name`: dependencies first, the module last.
    pub fn load_order(&self, name: &str) -> Option<Vec<String>> {
        let name = name.replace('-', "_");
        self.paths.get(&name)?;

        let mut order = Vec::new();
        let mut seen = HashSet::new();
        self.visit(&name, &mut seen, &mut order);
        Some(order)
    }

    fn visit(&self, name: &str, seen: &mut HashSet<String>, order: &mut Vec<String>) {
        if !seen.insert(name.to_string()) {
            return;
        }

        for dep in self.deps.get(name).map(Vec::as_slice).unwrap_or_default() {
            self.visit(dep, seen, order);
        }

        order.push(name.to_string());
    }
}

/// Loads one module file into the kernel.
pub trait ModuleLoader: Send + Sync {
    /// Loads `path` with `params`; an already loaded module is success.
    fn load(&self, path: &Path, params: &str) -> io::Result<()>;
}

/// Loader using the `finit_module` syscall.
#[derive(Debug, Default)]
pub struct FinitModuleLoader;

impl ModuleLoader for FinitModuleLoader {
    fn load(&self, path: &Path, params: &str) -> io::Result<()> {
        let file = File::open(path)?;
        let params = CString::new(params).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let compressed = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| matches!(e, "xz" | "zst" | "gz"));
        let flags = if compressed { MODULE_INIT_COMPRESSED_FILE } else { 0 };

        // SAFETY: fd and params stay valid for the duration of the call.
        let rc = unsafe { libc::syscall(libc::SYS_finit_module, file.as_raw_fd(), params.as_ptr(), flags) };
        if rc == 0 {
            return Ok(());
        }

        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EEXIST) {
            return Ok(());
        }
        Err(err)
    }
}

/// Kernel module tree of the running kernel.
#[derive(Clone)]
pub struct KernelModules {
    dir: PathBuf,
    loader: Arc<dyn ModuleLoader>,
}

impl std::fmt::Debug for KernelModules {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelModules").field("dir", &self.dir).finish()
    }
}

impl KernelModules {
    /// Module tree at `dir` (`/lib/modules/<release>`).
    pub fn new(dir: impl Into<PathBuf>, loader: Arc<dyn ModuleLoader>) -> Self {
        KernelModules {
            dir: dir.into(),
            loader,
        }
    }

    /// Module tree of the running kernel under `modules_root`.
    pub fn for_running_kernel(modules_root: &Path) -> io::Result<Self> {
        Ok(Self::new(modules_root.join(kernel_release()?), Arc::new(FinitModuleLoader)))
    }

    /// Loads `name` and its dependencies; returns the modules loaded, in order.
    ///
    /// Parameters apply to `name` only.
    pub fn load(&self, name: &str, params: &[String]) -> io::Result<Vec<String>> {
        let content = std::fs::read_to_string(self.dir.join("modules.dep"))?;
        let deps = ModuleDeps::parse(&content);

        let order = deps
            .load_order(name)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("module {name} not found")))?;
        let target = name.replace('-', "_");

        for module in &order {
            let Some(rel) = deps.path_of(module) else {
                continue;
            };
            let module_params = if *module == target { params.join(" ") } else { String::new() };
            self.loader.load(&self.dir.join(rel), &module_params)?;
        }

        Ok(order)
    }
}

/// Release string of the running kernel.
pub fn kernel_release() -> io::Result<String> {
    // SAFETY: utsname is plain data, filled by uname.
    let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
    if unsafe { libc::uname(&mut uts) } != 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: release is NUL terminated by the kernel.
    let release = unsafe { CStr::from_ptr(uts.release.as_ptr()) };
    Ok(release.to_string_lossy().into_owned())
}
