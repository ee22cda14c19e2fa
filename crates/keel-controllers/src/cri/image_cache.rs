//! Image cache state machine over the ISO and disk cache volumes.

use std::fs;
use std::io;
use std::path::Path;

use async_trait::async_trait;
use keel_expr::envs::{self, DEFAULT_IMAGE_CACHE_DISK_LOCATOR, DEFAULT_IMAGE_CACHE_ISO_LOCATOR};
use keel_expr::Expression;
use keel_resources::block::{
    LocatorSpec, MountSpec, VolumeConfig, VolumeMountRequest, VolumeMountStatus, VolumePhase, VolumeStatus, VolumeType,
};
use keel_resources::cri::{ImageCacheConfig, ImageCacheCopyStatus, ImageCacheStatus};
use keel_resources::services::Service;
use keel_runtime::{CancellationToken, Controller, ControllerResult, ControllerRuntime, Input, Output, ResultExt};
use keel_state::Phase;
use tracing::{debug, info};

use crate::config::{active_machine_config, machine_config_input};

/// Volume holding a read-only cache shipped on the install media.
pub const VOLUME_IMAGE_CACHE_ISO: &str = "IMAGECACHE-ISO";
/// Cache partition on the system disk.
pub const VOLUME_IMAGE_CACHE_DISK: &str = "IMAGECACHE-DISK";
/// Local registry serving the cache.
pub const REGISTRYD_SERVICE_ID: &str = "registryd";

const ISO_MOUNT_POINT: &str = "/system/imagecache/iso";
const DISK_MOUNT_POINT: &str = "/system/imagecache/disk";

#[derive(Debug, Default)]
struct VolumeAnalysis {
    roots: Vec<String>,
    all_ready: bool,
    copy_status: ImageCacheCopyStatus,
}

/// Publishes [`ImageCacheConfig`] from the cache volumes and the local registry.
#[derive(Debug)]
pub struct ImageCacheConfigController {
    iso_locator: Expression,
    disk_locator: Expression,
    copy_done: bool,
    skip_copy: bool,
}

impl ImageCacheConfigController {
    /// Controller with the default volume locators.
    pub fn new() -> ControllerResult<Self> {
        let env = envs::volume_locator();
        Ok(ImageCacheConfigController {
            iso_locator: Expression::compile(DEFAULT_IMAGE_CACHE_ISO_LOCATOR, &env).context("compiling ISO locator")?,
            disk_locator: Expression::compile(DEFAULT_IMAGE_CACHE_DISK_LOCATOR, &env)
                .context("compiling disk locator")?,
            copy_done: false,
            skip_copy: false,
        })
    }

    /// Marks the ISO to disk copy as done without copying.
    pub fn without_copy(mut self) -> Self {
        self.skip_copy = true;
        self
    }

    /// One reconcile pass.
    pub fn reconcile(&mut self, r: &mut ControllerRuntime) -> ControllerResult {
        let enabled = active_machine_config(r)?.is_some_and(|cfg| cfg.machine.features.image_cache.local_enabled);
        let registryd = r.get::<Service>(REGISTRYD_SERVICE_ID)?;

        let (mut status, copy_status, roots) = if enabled {
            self.write_volume_configs(r)?;
            let volumes = self.analyze(r)?;
            let status = if volumes.all_ready && volumes.roots.is_empty() {
                ImageCacheStatus::Disabled
            } else {
                ImageCacheStatus::Preparing
            };
            (status, volumes.copy_status, volumes.roots)
        } else {
            (ImageCacheStatus::Disabled, ImageCacheCopyStatus::Skipped, Vec::new())
        };

        if status == ImageCacheStatus::Preparing
            && !roots.is_empty()
            && registryd.is_some_and(|svc| svc.spec.running && svc.spec.healthy)
        {
            status = ImageCacheStatus::Ready;
        }

        debug!(?status, ?copy_status, "image cache status");

        r.modify::<ImageCacheConfig, _>(ImageCacheConfig::ID, |cfg| {
            cfg.status = status;
            cfg.copy_status = copy_status;
            cfg.roots = roots;
            Ok(())
        })
    }

    fn write_volume_configs(&self, r: &mut ControllerRuntime) -> ControllerResult {
        let iso = self.iso_locator.clone();
        r.modify::<VolumeConfig, _>(VOLUME_IMAGE_CACHE_ISO, |cfg| {
            cfg.volume_type = VolumeType::Disk;
            cfg.locator = LocatorSpec { matcher: Some(iso) };
            cfg.mount = MountSpec {
                target_path: ISO_MOUNT_POINT.to_string(),
            };
            Ok(())
        })?;

        let disk = self.disk_locator.clone();
        r.modify::<VolumeConfig, _>(VOLUME_IMAGE_CACHE_DISK, |cfg| {
            cfg.volume_type = VolumeType::Partition;
            cfg.locator = LocatorSpec { matcher: Some(disk) };
            cfg.mount = MountSpec {
                target_path: DISK_MOUNT_POINT.to_string(),
            };
            Ok(())
        })
    }

    fn analyze(&mut self, r: &mut ControllerRuntime) -> ControllerResult<VolumeAnalysis> {
        // disk first: its root is preferred over the ISO one
        let mut volumes = Vec::with_capacity(2);
        for id in [VOLUME_IMAGE_CACHE_DISK, VOLUME_IMAGE_CACHE_ISO] {
            match r.get::<VolumeStatus>(id)? {
                Some(status) => volumes.push((id, status.spec.phase)),
                None => return Ok(VolumeAnalysis::default()),
            }
        }

        let phase_of = |id: &str| volumes.iter().find(|(v, _)| *v == id).map(|(_, phase)| *phase);
        let iso_phase = phase_of(VOLUME_IMAGE_CACHE_ISO).unwrap_or_default();
        let disk_phase = phase_of(VOLUME_IMAGE_CACHE_DISK).unwrap_or_default();

        // the copy decision needs to know whether the ISO exists at all
        if iso_phase != VolumePhase::Missing && iso_phase != VolumePhase::Ready {
            return Ok(VolumeAnalysis::default());
        }

        let iso_present = iso_phase == VolumePhase::Ready;
        let disk_missing = disk_phase == VolumePhase::Missing;
        let name = r.name().to_string();

        for (id, _) in &volumes {
            let read_only = !(*id == VOLUME_IMAGE_CACHE_DISK && iso_present);
            let (requester, volume_id) = (name.clone(), id.to_string());
            r.modify::<VolumeMountRequest, _>(&mount_id(&name, id), |req| {
                req.requester = requester;
                req.volume_id = volume_id;
                req.read_only = read_only;
                Ok(())
            })?;
        }

        let mut analysis = VolumeAnalysis {
            all_ready: true,
            ..Default::default()
        };
        let (mut copy_source, mut copy_target) = (None, None);

        for (id, phase) in &volumes {
            let (root, ready) = self.volume_root(r, &name, id, *phase)?;

            if ready {
                match *id {
                    VOLUME_IMAGE_CACHE_ISO => copy_source = root.clone(),
                    _ => copy_target = root.clone(),
                }
            }

            analysis.all_ready &= ready;
            analysis.roots.extend(root);
        }

        analysis.copy_status = match (copy_source, copy_target) {
            _ if !iso_present || disk_missing => ImageCacheCopyStatus::Skipped,
            _ if self.copy_done => ImageCacheCopyStatus::Ready,
            (Some(source), Some(target)) => {
                self.copy_cache(&source, &target)?;
                ImageCacheCopyStatus::Ready
            }
            _ => ImageCacheCopyStatus::Pending,
        };

        Ok(analysis)
    }

    /// Cache root of one volume and whether the volume is settled.
    fn volume_root(
        &self,
        r: &mut ControllerRuntime,
        name: &str,
        volume_id: &str,
        phase: VolumePhase,
    ) -> ControllerResult<(Option<String>, bool)> {
        match phase {
            VolumePhase::Missing | VolumePhase::Failed | VolumePhase::Waiting => return Ok((None, true)),
            VolumePhase::Ready => {}
            VolumePhase::Located => return Ok((None, false)),
        }

        let Some(mount) = r.get::<VolumeMountStatus>(&mount_id(name, volume_id))? else {
            return Ok((None, false));
        };

        if mount.metadata.phase() == Phase::TearingDown {
            r.remove_finalizer(mount.metadata.pointer(), name)?;
            return Ok((None, true));
        }

        if !mount.metadata.finalizers().contains(name) {
            r.add_finalizer(mount.metadata.pointer(), name)?;
        }

        let mut root = mount.spec.target.clone();
        if volume_id == VOLUME_IMAGE_CACHE_ISO {
            root = Path::new(&root).join("imagecache").to_string_lossy().into_owned();
        }

        Ok((Some(root), true))
    }

    fn copy_cache(&mut self, source: &str, target: &str) -> ControllerResult {
        info!(%source, %target, "copying image cache");

        if !self.skip_copy {
            let copied = copy_tree(Path::new(source), Path::new(target))
                .with_context(|| format!("copying image cache from {source} to {target}"))?;
            info!(bytes = copied, "image cache copied");
        }

        self.copy_done = true;
        Ok(())
    }
}

fn mount_id(controller: &str, volume_id: &str) -> String {
    format!("{controller}-{volume_id}")
}

/// Copies directories and regular files under `source` into `target`.
///
/// Files already present with the same size are skipped. Returns the number
/// of bytes in the source tree.
pub(crate) fn copy_tree(source: &Path, target: &Path) -> io::Result<u64> {
    fs::create_dir_all(target)?;

    let mut total = 0;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let meta = fs::symlink_metadata(entry.path())?;
        let dest = target.join(entry.file_name());

        if meta.is_dir() {
            total += copy_tree(&entry.path(), &dest)?;
        } else if meta.is_file() {
            total += meta.len();
            copy_file(&entry.path(), &dest, meta.len())?;
        } else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported file type: {}", entry.path().display()),
            ));
        }
    }

    Ok(total)
}

fn copy_file(source: &Path, dest: &Path, size: u64) -> io::Result<()> {
    if fs::metadata(dest).is_ok_and(|m| m.len() == size) {
        return Ok(());
    }

    let mut tmp = dest.as_os_str().to_owned();
    tmp.push(".tmp");
    fs::copy(source, &tmp)?;
    fs::rename(&tmp, dest)
}

#[async_trait]
impl Controller for ImageCacheConfigController {
    fn name(&self) -> &str {
        "cri.ImageCacheConfigController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            machine_config_input(),
            Input::weak::<VolumeStatus>(),
            Input::weak::<Service>().with_id(REGISTRYD_SERVICE_ID),
            Input::strong::<VolumeMountStatus>(),
            Input::destroy_ready::<VolumeMountRequest>(),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![
            Output::exclusive::<ImageCacheConfig>(),
            Output::shared::<VolumeConfig>(),
            Output::shared::<VolumeMountRequest>(),
        ]
    }

    async fn run(&mut self, ctx: &CancellationToken, r: &mut ControllerRuntime) -> ControllerResult {
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                ev = r.event() => {
                    if ev.is_none() {
                        return Ok(());
                    }
                }
            }

            self.reconcile(r)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::testutil::{put, seed_config, standalone_with};
    use keel_resources::document::MachineConfigDocument;
    use keel_state::{Pointer, ResourceType, Store};

    const NAME: &str = "cri.ImageCacheConfigController";

    fn setup() -> (std::sync::Arc<Store>, ControllerRuntime) {
        let (store, r) = standalone_with(
            NAME,
            vec![
                Output::exclusive::<ImageCacheConfig>(),
                Output::shared::<VolumeConfig>(),
                Output::shared::<VolumeMountRequest>(),
            ],
        );
        let mut doc = MachineConfigDocument::default();
        doc.machine.features.image_cache.local_enabled = true;
        seed_config(&store, doc);
        (store, r)
    }

    fn volume(store: &Store, id: &str, phase: VolumePhase) {
        put(
            store,
            id,
            VolumeStatus {
                phase,
                ..Default::default()
            },
        );
    }

    fn mounted(store: &Store, volume_id: &str, target: &str) {
        put(
            store,
            &mount_id(NAME, volume_id),
            VolumeMountStatus {
                volume_id: volume_id.into(),
                requester: NAME.into(),
                target: target.into(),
                read_only: false,
            },
        );
    }

    fn registryd_up(store: &Store) {
        put(
            store,
            REGISTRYD_SERVICE_ID,
            Service {
                running: true,
                healthy: true,
                unknown: false,
            },
        );
    }

    fn cache(store: &Store) -> ImageCacheConfig {
        store.get_typed::<ImageCacheConfig>(ImageCacheConfig::ID).unwrap().spec
    }

    #[tokio::test]
    async fn test_disabled_without_feature() {
        let (store, mut r) = standalone_with(NAME, vec![Output::exclusive::<ImageCacheConfig>()]);
        let mut ctrl = ImageCacheConfigController::new().unwrap();

        ctrl.reconcile(&mut r).unwrap();

        let cfg = cache(&store);
        assert_eq!(cfg.status, ImageCacheStatus::Disabled);
        assert_eq!(cfg.copy_status, ImageCacheCopyStatus::Skipped);
        assert!(store.get_typed::<VolumeConfig>(VOLUME_IMAGE_CACHE_ISO).is_err());
    }

    #[tokio::test]
    async fn test_iso_cache_becomes_ready() {
        let (store, mut r) = setup();
        let mut ctrl = ImageCacheConfigController::new().unwrap();

        volume(&store, VOLUME_IMAGE_CACHE_ISO, VolumePhase::Ready);
        volume(&store, VOLUME_IMAGE_CACHE_DISK, VolumePhase::Missing);
        ctrl.reconcile(&mut r).unwrap();

        assert_eq!(cache(&store).status, ImageCacheStatus::Preparing);
        let iso_cfg = store.get_typed::<VolumeConfig>(VOLUME_IMAGE_CACHE_ISO).unwrap().spec;
        assert_eq!(iso_cfg.volume_type, VolumeType::Disk);
        assert!(iso_cfg.locator.matcher.is_some());
        let req = store
            .get_typed::<VolumeMountRequest>(&mount_id(NAME, VOLUME_IMAGE_CACHE_ISO))
            .unwrap()
            .spec;
        assert!(req.read_only);
        assert_eq!(req.requester, NAME);

        mounted(&store, VOLUME_IMAGE_CACHE_ISO, "/imagecache/iso");
        registryd_up(&store);
        ctrl.reconcile(&mut r).unwrap();

        let cfg = cache(&store);
        assert_eq!(cfg.status, ImageCacheStatus::Ready);
        assert_eq!(cfg.roots, vec!["/imagecache/iso/imagecache".to_string()]);
        assert_eq!(cfg.copy_status, ImageCacheCopyStatus::Skipped);

        let mount = store
            .get(&Pointer::new(
                VolumeMountStatus::NAMESPACE,
                VolumeMountStatus::TYPE,
                mount_id(NAME, VOLUME_IMAGE_CACHE_ISO),
            ))
            .unwrap();
        assert!(mount.metadata().finalizers().contains(NAME));
    }

    #[tokio::test]
    async fn test_waits_for_iso_decision() {
        let (store, mut r) = setup();
        let mut ctrl = ImageCacheConfigController::new().unwrap();

        volume(&store, VOLUME_IMAGE_CACHE_ISO, VolumePhase::Waiting);
        volume(&store, VOLUME_IMAGE_CACHE_DISK, VolumePhase::Ready);
        ctrl.reconcile(&mut r).unwrap();

        let cfg = cache(&store);
        assert_eq!(cfg.status, ImageCacheStatus::Preparing);
        assert_eq!(cfg.copy_status, ImageCacheCopyStatus::Unknown);
        assert!(store
            .get_typed::<VolumeMountRequest>(&mount_id(NAME, VOLUME_IMAGE_CACHE_DISK))
            .is_err());
    }

    #[tokio::test]
    async fn test_no_volumes_found_disables_cache() {
        let (store, mut r) = setup();
        let mut ctrl = ImageCacheConfigController::new().unwrap();

        volume(&store, VOLUME_IMAGE_CACHE_ISO, VolumePhase::Missing);
        volume(&store, VOLUME_IMAGE_CACHE_DISK, VolumePhase::Missing);
        ctrl.reconcile(&mut r).unwrap();

        assert_eq!(cache(&store).status, ImageCacheStatus::Disabled);
    }

    #[tokio::test]
    async fn test_iso_copied_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let iso = dir.path().join("iso");
        let disk = dir.path().join("disk");
        fs::create_dir_all(iso.join("imagecache/blob")).unwrap();
        fs::write(iso.join("imagecache/blob/sha256-abc"), b"layer").unwrap();
        fs::create_dir_all(&disk).unwrap();

        let (store, mut r) = setup();
        let mut ctrl = ImageCacheConfigController::new().unwrap();

        volume(&store, VOLUME_IMAGE_CACHE_ISO, VolumePhase::Ready);
        volume(&store, VOLUME_IMAGE_CACHE_DISK, VolumePhase::Ready);
        mounted(&store, VOLUME_IMAGE_CACHE_ISO, iso.to_str().unwrap());
        mounted(&store, VOLUME_IMAGE_CACHE_DISK, disk.to_str().unwrap());
        ctrl.reconcile(&mut r).unwrap();

        let cfg = cache(&store);
        assert_eq!(cfg.copy_status, ImageCacheCopyStatus::Ready);
        assert_eq!(
            cfg.roots,
            vec![
                disk.to_string_lossy().into_owned(),
                iso.join("imagecache").to_string_lossy().into_owned()
            ]
        );
        assert_eq!(fs::read(disk.join("blob/sha256-abc")).unwrap(), b"layer");

        let disk_req = store
            .get_typed::<VolumeMountRequest>(&mount_id(NAME, VOLUME_IMAGE_CACHE_DISK))
            .unwrap()
            .spec;
        assert!(!disk_req.read_only);
    }

    #[tokio::test]
    async fn test_torn_down_mount_released() {
        let (store, mut r) = setup();
        let mut ctrl = ImageCacheConfigController::new().unwrap();

        volume(&store, VOLUME_IMAGE_CACHE_ISO, VolumePhase::Ready);
        volume(&store, VOLUME_IMAGE_CACHE_DISK, VolumePhase::Missing);
        mounted(&store, VOLUME_IMAGE_CACHE_ISO, "/imagecache/iso");
        ctrl.reconcile(&mut r).unwrap();

        let ptr = Pointer::new(
            VolumeMountStatus::NAMESPACE,
            VolumeMountStatus::TYPE,
            mount_id(NAME, VOLUME_IMAGE_CACHE_ISO),
        );
        store.teardown(&ptr, None).unwrap();
        ctrl.reconcile(&mut r).unwrap();

        assert!(store.get(&ptr).unwrap().metadata().finalizers().is_empty());
        let cfg = cache(&store);
        assert!(cfg.roots.is_empty());
        assert_eq!(cfg.status, ImageCacheStatus::Disabled);
    }

    #[test]
    fn test_copy_tree_skips_same_size() {
        let dir = tempfile::tempdir().unwrap();
        let (src, dst) = (dir.path().join("src"), dir.path().join("dst"));
        fs::create_dir_all(src.join("a")).unwrap();
        fs::write(src.join("a/f"), b"1234").unwrap();
        fs::create_dir_all(dst.join("a")).unwrap();
        fs::write(dst.join("a/f"), b"abcd").unwrap();

        assert_eq!(copy_tree(&src, &dst).unwrap(), 4);
        assert_eq!(fs::read(dst.join("a/f")).unwrap(), b"abcd");
    }
}
