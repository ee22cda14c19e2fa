//! cgroup v2 reads and writes: memory pressure, memory counters, process
//! lists, child discovery and `cgroup.kill`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Memory pressure stall information of one cgroup.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Psi {
    /// `some` line: avg10, avg60, avg300, total.
    pub some: PsiLine,
    /// `full` line: avg10, avg60, avg300, total.
    pub full: PsiLine,
}

/// One line of a pressure file.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PsiLine {
    /// Share of stalled time over 10s, percent.
    pub avg10: f64,
    /// Over 60s, percent.
    pub avg60: f64,
    /// Over 300s, percent.
    pub avg300: f64,
    /// Total stalled time, microseconds.
    pub total: f64,
}

impl Psi {
    /// Parses a `memory.pressure` file.
    pub fn parse(content: &str) -> io::Result<Psi> {
        let mut psi = Psi::default();

        for line in content.lines() {
            let mut fields = line.split_whitespace();
            let target = match fields.next() {
                Some("some") => &mut psi.some,
                Some("full") => &mut psi.full,
                _ => continue,
            };

            for field in fields {
                let Some((key, value)) = field.split_once('=') else {
                    return Err(invalid(format!("malformed pressure field {field:?}")));
                };
                let value: f64 = value
                    .parse()
                    .map_err(|_| invalid(format!("malformed pressure value {field:?}")))?;
                match key {
                    "avg10" => target.avg10 = value,
                    "avg60" => target.avg60 = value,
                    "avg300" => target.avg300 = value,
                    "total" => target.total = value,
                    _ => {}
                }
            }
        }

        Ok(psi)
    }

    /// Values keyed by expression variable name (`memory_some_avg10`...).
    pub fn named(&self) -> [(&'static str, f64); 8] {
        [
            ("memory_some_avg10", self.some.avg10),
            ("memory_some_avg60", self.some.avg60),
            ("memory_some_avg300", self.some.avg300),
            ("memory_some_total", self.some.total),
            ("memory_full_avg10", self.full.avg10),
            ("memory_full_avg60", self.full.avg60),
            ("memory_full_avg300", self.full.avg300),
            ("memory_full_total", self.full.total),
        ]
    }
}

fn invalid(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// Reads `memory.pressure`; `None` if the cgroup doesn't exist.
pub fn read_psi(cgroup: &Path) -> io::Result<Option<Psi>> {
    match fs::read_to_string(cgroup.join("memory.pressure")) {
        Ok(content) => Psi::parse(&content).map(Some),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

/// Reads a memory counter such as `memory.current`; `None` if unset, `max` or missing.
pub fn read_memory_value(cgroup: &Path, file: &str) -> io::Result<Option<u64>> {
    match fs::read_to_string(cgroup.join(file)) {
        Ok(content) => {
            let content = content.trim();
            if content == "max" || content.is_empty() {
                return Ok(None);
            }
            content
                .parse()
                .map(Some)
                .map_err(|_| invalid(format!("malformed {file}: {content:?}")))
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

/// Direct child cgroups of `dir`, sorted; empty if `dir` doesn't exist.
pub fn child_cgroups(dir: &Path) -> io::Result<Vec<PathBuf>> {
    match child_dirs(dir) {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        other => other,
    }
}

fn child_dirs(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut children = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            children.push(entry.path());
        }
    }
    children.sort();
    Ok(children)
}

/// Process ids in the cgroup and all of its descendants.
pub fn cgroup_pids(cgroup: &Path) -> io::Result<Vec<i32>> {
    let mut pids = Vec::new();
    collect_pids(cgroup, &mut pids)?;
    Ok(pids)
}

fn collect_pids(dir: &Path, pids: &mut Vec<i32>) -> io::Result<()> {
    match fs::read_to_string(dir.join("cgroup.procs")) {
        Ok(content) => pids.extend(content.lines().filter_map(|l| l.trim().parse::<i32>().ok())),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }

    for child in child_dirs(dir)? {
        collect_pids(&child, pids)?;
    }
    Ok(())
}

/// Kills every process in the cgroup.
pub fn kill_cgroup(cgroup: &Path) -> io::Result<()> {
    fs::write(cgroup.join("cgroup.kill"), "1")
}
