//! One-shot facts gathered at boot: platform security state, the booted
//! bootloader entry, installed extensions and the software bill of materials.
//!
//! Each controller publishes once and returns.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use keel_resources::runtime::{BootedEntry, ExtensionStatus, SBOMItem, SecurityState};
use keel_runtime::{CancellationToken, Controller, ControllerResult, ControllerRuntime, Input, Output, ResultExt};
use serde::Deserialize;
use tracing::{debug, warn};

/// EFI global variable vendor GUID.
pub const EFI_GLOBAL_GUID: &str = "8be4df61-93ca-11d2-aa0d-00e098032b8c";
/// systemd-boot loader interface vendor GUID.
pub const EFI_LOADER_GUID: &str = "4a67b082-0a4c-41cf-b6c7-440b29bb8c4f";

/// Reads an EFI variable, stripping the 4-byte attribute header.
fn read_efi_var(efivars: &Path, name: &str, guid: &str) -> io::Result<Option<Vec<u8>>> {
    match fs::read(efivars.join(format!("{name}-{guid}"))) {
        Ok(raw) if raw.len() >= 4 => Ok(Some(raw[4..].to_vec())),
        Ok(_) => Ok(None),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

fn read_optional(path: &Path) -> io::Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(s) => Ok(Some(s)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

/// Active lockdown mode from `none [integrity] confidentiality`; empty for `none`.
pub fn parse_lockdown(content: &str) -> String {
    content
        .split_whitespace()
        .find_map(|w| w.strip_prefix('[').and_then(|w| w.strip_suffix(']')))
        .filter(|mode| *mode != "none")
        .unwrap_or_default()
        .to_string()
}

fn decode_utf16le(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|u| *u != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

/// Publishes [`SecurityState`].
#[derive(Debug, Clone)]
pub struct SecurityStateController {
    efivars: PathBuf,
    lockdown: PathBuf,
    module_sig_enforce: PathBuf,
}

impl SecurityStateController {
    /// Reads from the given EFI variable directory and kernel files.
    pub fn new(efivars: impl Into<PathBuf>, lockdown: impl Into<PathBuf>, module_sig_enforce: impl Into<PathBuf>) -> Self {
        SecurityStateController {
            efivars: efivars.into(),
            lockdown: lockdown.into(),
            module_sig_enforce: module_sig_enforce.into(),
        }
    }

    /// Gathers the current state.
    pub fn gather(&self) -> io::Result<SecurityState> {
        let secure_boot = read_efi_var(&self.efivars, "SecureBoot", EFI_GLOBAL_GUID)?
            .is_some_and(|v| v.first() == Some(&1));
        let module_signature_enforced =
            read_optional(&self.module_sig_enforce)?.is_some_and(|v| v.trim() == "Y");
        let lockdown = read_optional(&self.lockdown)?.map(|c| parse_lockdown(&c)).unwrap_or_default();

        Ok(SecurityState {
            secure_boot,
            module_signature_enforced,
            lockdown,
        })
    }
}

#[async_trait]
impl Controller for SecurityStateController {
    fn name(&self) -> &str {
        "runtime.SecurityStateController"
    }

    fn inputs(&self) -> Vec<Input> {
        Vec::new()
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<SecurityState>()]
    }

    async fn run(&mut self, _ctx: &CancellationToken, r: &mut ControllerRuntime) -> ControllerResult {
        let state = self.gather().context("reading security state")?;
        r.modify::<SecurityState, _>(SecurityState::ID, |s| {
            *s = state;
            Ok(())
        })
    }
}

/// Publishes the [`BootedEntry`] selected by the bootloader, if it reports one.
#[derive(Debug, Clone)]
pub struct BootedEntryController {
    efivars: PathBuf,
}

impl BootedEntryController {
    /// Reads from the given EFI variable directory.
    pub fn new(efivars: impl Into<PathBuf>) -> Self {
        BootedEntryController { efivars: efivars.into() }
    }

    /// Selected loader entry.
    pub fn gather(&self) -> io::Result<Option<String>> {
        Ok(read_efi_var(&self.efivars, "LoaderEntrySelected", EFI_LOADER_GUID)?
            .map(|raw| decode_utf16le(&raw))
            .filter(|entry| !entry.is_empty()))
    }
}

#[async_trait]
impl Controller for BootedEntryController {
    fn name(&self) -> &str {
        "runtime.BootedEntryController"
    }

    fn inputs(&self) -> Vec<Input> {
        Vec::new()
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<BootedEntry>()]
    }

    async fn run(&mut self, _ctx: &CancellationToken, r: &mut ControllerRuntime) -> ControllerResult {
        let Some(entry) = self.gather().context("reading booted entry")? else {
            debug!("bootloader doesn't report the booted entry");
            return Ok(());
        };

        r.modify::<BootedEntry, _>(BootedEntry::ID, |b| {
            b.entry = entry;
            Ok(())
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Manifest {
    image: String,
    metadata: ManifestMetadata,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ManifestMetadata {
    name: String,
    version: String,
    author: String,
    description: String,
}

/// Reads `<dir>/<extension>/manifest.yaml` for every installed extension, in name order.
pub fn read_extensions(dir: &Path) -> io::Result<Vec<ExtensionStatus>> {
    let mut dirs = match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect::<Vec<_>>(),
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };
    dirs.sort();

    let mut extensions = Vec::new();
    for ext in dirs {
        let path = ext.join("manifest.yaml");
        let Some(content) = read_optional(&path)? else {
            continue;
        };

        let manifest: Manifest = match serde_yaml::from_str(&content) {
            Ok(m) => m,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "skipping malformed extension manifest");
                continue;
            }
        };

        extensions.push(ExtensionStatus {
            image: manifest.image,
            name: manifest.metadata.name,
            version: manifest.metadata.version,
            author: manifest.metadata.author,
            description: manifest.metadata.description,
        });
    }

    Ok(extensions)
}

/// Publishes one [`ExtensionStatus`] per installed extension, keyed by index.
#[derive(Debug, Clone)]
pub struct ExtensionStatusController {
    dir: PathBuf,
}

impl ExtensionStatusController {
    /// Reads manifests under `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        ExtensionStatusController { dir: dir.into() }
    }
}

#[async_trait]
impl Controller for ExtensionStatusController {
    fn name(&self) -> &str {
        "runtime.ExtensionStatusController"
    }

    fn inputs(&self) -> Vec<Input> {
        Vec::new()
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<ExtensionStatus>()]
    }

    async fn run(&mut self, _ctx: &CancellationToken, r: &mut ControllerRuntime) -> ControllerResult {
        let extensions = read_extensions(&self.dir).context("reading extension manifests")?;

        for (i, ext) in extensions.into_iter().enumerate() {
            r.modify::<ExtensionStatus, _>(&i.to_string(), |s| {
                *s = ext;
                Ok(())
            })?;
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SpdxDocument {
    packages: Vec<SpdxPackage>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SpdxPackage {
    name: String,
    version_info: String,
    license_declared: String,
    external_refs: Vec<SpdxRef>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SpdxRef {
    reference_type: String,
    reference_locator: String,
}

fn spdx_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file() && p.to_string_lossy().ends_with(".spdx.json"))
            .collect::<Vec<_>>(),
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };
    files.sort();
    Ok(files)
}

/// Packages from the `*.spdx.json` documents in `dir`; `extensions/` holds those of extensions.
pub fn read_sbom(dir: &Path) -> io::Result<Vec<SBOMItem>> {
    let mut items = Vec::new();

    for (subdir, extension) in [(dir.to_path_buf(), false), (dir.join("extensions"), true)] {
        for file in spdx_files(&subdir)? {
            let doc: SpdxDocument = match serde_json::from_slice(&fs::read(&file)?) {
                Ok(doc) => doc,
                Err(err) => {
                    warn!(path = %file.display(), error = %err, "skipping malformed SPDX document");
                    continue;
                }
            };

            for pkg in doc.packages {
                let refs = |kind: &str| -> Vec<String> {
                    pkg.external_refs
                        .iter()
                        .filter(|r| r.reference_type == kind)
                        .map(|r| r.reference_locator.clone())
                        .collect()
                };

                items.push(SBOMItem {
                    cpes: refs("cpe23Type"),
                    purls: refs("purl"),
                    name: pkg.name.clone(),
                    version: pkg.version_info.clone(),
                    license: pkg.license_declared.clone(),
                    extension,
                });
            }
        }
    }

    Ok(items)
}

/// Publishes one [`SBOMItem`] per package, keyed by package name.
#[derive(Debug, Clone)]
pub struct SBOMItemController {
    dir: PathBuf,
}

impl SBOMItemController {
    /// Reads SPDX documents under `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        SBOMItemController { dir: dir.into() }
    }
}

#[async_trait]
impl Controller for SBOMItemController {
    fn name(&self) -> &str {
        "runtime.SBOMItemController"
    }

    fn inputs(&self) -> Vec<Input> {
        Vec::new()
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<SBOMItem>()]
    }

    async fn run(&mut self, _ctx: &CancellationToken, r: &mut ControllerRuntime) -> ControllerResult {
        for item in read_sbom(&self.dir).context("reading SBOM")? {
            if item.name.is_empty() {
                continue;
            }
            let id = item.name.clone();
            r.modify::<SBOMItem, _>(&id, |s| {
                *s = item;
                Ok(())
            })?;
        }
        Ok(())
    }
}
