//! Garbage collection of container images no workload references.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use keel_api::images::SYSTEM_NAMESPACE;
use keel_api::proto::images::Image;
use keel_api::ImagesClient;
use keel_resources::services::{EtcdSpec, KubeletSpec, Service};
use keel_runtime::{
    CancellationToken, Controller, ControllerError, ControllerResult, ControllerRuntime, Input, Output, ResultExt,
};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tonic::Status;
use tracing::{debug, info};

use super::reference::{parse_any, parse_named, Reference};

/// Interval between collections.
pub const IMAGE_CLEANUP_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Minimum time an image stays unreferenced before deletion.
pub const IMAGE_GC_GRACE_PERIOD: Duration = Duration::from_secs(4 * 15 * 60);

/// Image listing and deletion in one runtime namespace.
#[async_trait]
pub trait ImageService: Send {
    /// Every image.
    async fn list(&mut self) -> Result<Vec<Image>, Status>;

    /// Deletes an image by name.
    async fn delete(&mut self, name: &str) -> Result<(), Status>;
}

#[async_trait]
impl ImageService for ImagesClient {
    async fn list(&mut self) -> Result<Vec<Image>, Status> {
        ImagesClient::list(self).await
    }

    async fn delete(&mut self, name: &str) -> Result<(), Status> {
        ImagesClient::delete(self, name).await
    }
}

/// Opens an [`ImageService`] once the runtime is up.
#[async_trait]
pub trait ImageServiceProvider: Send + Sync {
    /// Connects.
    async fn connect(&self) -> ControllerResult<Box<dyn ImageService>>;
}

/// Connects to a runtime socket in the system namespace.
#[derive(Debug, Clone)]
pub struct SocketImageServiceProvider {
    socket: PathBuf,
}

impl SocketImageServiceProvider {
    /// Provider for the runtime listening on `socket`.
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        SocketImageServiceProvider { socket: socket.into() }
    }
}

#[async_trait]
impl ImageServiceProvider for SocketImageServiceProvider {
    async fn connect(&self) -> ControllerResult<Box<dyn ImageService>> {
        let client = ImagesClient::connect_unix(&self.socket, SYSTEM_NAMESPACE)
            .await
            .with_context(|| format!("connecting to {}", self.socket.display()))?;
        Ok(Box::new(client))
    }
}

fn target_digest(image: &Image) -> &str {
    image.target.as_ref().map_or("", |t| t.digest.as_str())
}

/// Resolves `expected` references to the digests of `actual` images.
///
/// Digested references resolve directly; tag-only references resolve
/// through an actual image with the same name and tag.
pub fn build_expected_digests(actual: &[Image], expected: &[String]) -> ControllerResult<HashSet<String>> {
    let refs = expected
        .iter()
        .map(|s| parse_named(s).ok_or_else(|| ControllerError::Config(format!("invalid image reference {s:?}"))))
        .collect::<ControllerResult<Vec<_>>>()?;

    let mut digests = HashSet::new();
    for expected in refs {
        if let Some(digest) = expected.digest {
            digests.insert(digest);
            continue;
        }

        let Some(tag) = expected.tag.as_deref() else {
            continue;
        };

        for image in actual {
            let Some(Reference::Named(named)) = parse_any(&image.name) else {
                debug!(image = %image.name, "skipping image without repository name");
                continue;
            };

            if named.name == expected.name && named.tag.as_deref() == Some(tag) {
                digests.insert(target_digest(image).to_string());
                break;
            }
        }
    }

    Ok(digests)
}

/// Deletes images of one runtime instance that stay unreferenced for
/// [`IMAGE_GC_GRACE_PERIOD`].
pub struct ImageGCController {
    instance: String,
    name: String,
    build_expected: bool,
    provider: Box<dyn ImageServiceProvider>,
    first_seen_unreferenced: HashMap<String, SystemTime>,
    runtime_up: bool,
    expected: Vec<String>,
}

impl std::fmt::Debug for ImageGCController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageGCController")
            .field("instance", &self.instance)
            .field("expected", &self.expected)
            .finish()
    }
}

impl ImageGCController {
    /// Collector for runtime service `instance` (`cri` or `containerd`).
    ///
    /// Only a collector with `build_expected` keeps the etcd and kubelet
    /// images; the others never run without expected images.
    pub fn new(instance: &str, build_expected: bool, provider: Box<dyn ImageServiceProvider>) -> Self {
        ImageGCController {
            instance: instance.to_string(),
            name: format!("cri.{instance}ImageGCController"),
            build_expected,
            provider,
            first_seen_unreferenced: HashMap::new(),
            runtime_up: false,
            expected: Vec::new(),
        }
    }

    /// Collector talking to the runtime socket at `socket`.
    pub fn with_socket(instance: &str, build_expected: bool, socket: impl Into<PathBuf>) -> Self {
        Self::new(instance, build_expected, Box::new(SocketImageServiceProvider::new(socket)))
    }

    /// Re-reads the runtime service state and the expected images.
    pub fn refresh(&mut self, r: &ControllerRuntime) -> ControllerResult {
        self.runtime_up = r
            .get::<Service>(&self.instance)?
            .is_some_and(|svc| svc.spec.running && svc.spec.healthy);

        self.expected.clear();
        if self.build_expected {
            if let Some(etcd) = r.get::<EtcdSpec>(EtcdSpec::ID)? {
                self.expected.push(etcd.spec.image);
            }
            if let Some(kubelet) = r.get::<KubeletSpec>(KubeletSpec::ID)? {
                self.expected.push(kubelet.spec.image);
            }
        }

        Ok(())
    }

    /// Whether the next tick should collect.
    pub fn should_collect(&self) -> bool {
        self.runtime_up && !(self.build_expected && self.expected.is_empty())
    }

    /// One collection at `now`; returns the deleted image names.
    pub async fn collect(&mut self, images: &mut dyn ImageService, now: SystemTime) -> ControllerResult<Vec<String>> {
        debug!(instance = %self.instance, "running image cleanup");

        let actual = images.list().await.context("listing images")?;
        let expected = build_expected_digests(&actual, &self.expected)?;

        // forget images removed behind the collector's back
        let present: HashSet<&str> = actual.iter().map(|image| image.name.as_str()).collect();
        self.first_seen_unreferenced.retain(|name, _| present.contains(name.as_str()));

        let mut deleted = Vec::new();
        for image in &actual {
            if expected.contains(target_digest(image)) {
                debug!(image = %image.name, "image is referenced");
                self.first_seen_unreferenced.remove(&image.name);
                continue;
            }

            let first_seen = *self.first_seen_unreferenced.entry(image.name.clone()).or_insert(now);
            let created = image.created_at.map_or(SystemTime::UNIX_EPOCH, |t| t.to_system_time());

            // an image pulled long ago still gets a full grace period once it
            // stops being referenced
            let age_runtime = now.duration_since(created).unwrap_or_default();
            let age_unreferenced = now.duration_since(first_seen).unwrap_or_default();
            let age = age_runtime.min(age_unreferenced);

            if age < IMAGE_GC_GRACE_PERIOD {
                debug!(image = %image.name, ?age, "image below minimum age");
                continue;
            }

            images
                .delete(&image.name)
                .await
                .with_context(|| format!("deleting image {}", image.name))?;
            self.first_seen_unreferenced.remove(&image.name);
            info!(image = %image.name, "deleted an image");
            deleted.push(image.name.clone());
        }

        Ok(deleted)
    }
}

#[async_trait]
impl Controller for ImageGCController {
    fn name(&self) -> &str {
        &self.name
    }

    fn inputs(&self) -> Vec<Input> {
        let mut inputs = vec![Input::weak::<Service>().with_id(self.instance.clone())];
        if self.build_expected {
            inputs.push(Input::weak::<KubeletSpec>().with_id(KubeletSpec::ID));
            inputs.push(Input::weak::<EtcdSpec>().with_id(EtcdSpec::ID));
        }
        inputs
    }

    fn outputs(&self) -> Vec<Output> {
        Vec::new()
    }

    async fn run(&mut self, ctx: &CancellationToken, r: &mut ControllerRuntime) -> ControllerResult {
        let mut ticker = interval_at(Instant::now() + IMAGE_CLEANUP_INTERVAL, IMAGE_CLEANUP_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut service: Option<Box<dyn ImageService>> = None;

        loop {
            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    if self.should_collect() {
                        if service.is_none() {
                            service = Some(self.provider.connect().await?);
                        }
                        if let Some(images) = service.as_deref_mut() {
                            self.collect(images, SystemTime::now()).await?;
                        }
                    }
                }
                ev = r.event() => {
                    if ev.is_none() {
                        return Ok(());
                    }
                    self.refresh(r)?;
                }
            }

            r.reset_restart_backoff();
        }
    }
}
