//! Registry mirror, TLS and auth settings for the container runtime.

use std::collections::BTreeMap;

use async_trait::async_trait;
use keel_resources::cri::{
    ImageCacheConfig, ImageCacheStatus, RegistriesConfig, RegistryAuth, RegistryConfig, RegistryMirror, RegistryTls,
};
use keel_resources::document::{ImageCacheFeature, RegistriesSection};
use keel_runtime::{CancellationToken, Controller, ControllerResult, ControllerRuntime, Input, Output};
use tracing::debug;

use crate::config::{active_machine_config, machine_config_input};

/// Mirror key matching every registry without its own entry.
pub const WILDCARD_MIRROR: &str = "*";

/// Builds the [`RegistriesConfig`] for `section`, putting `cache` in front
/// of every mirror when set.
pub fn build_registries(section: &RegistriesSection, cache: Option<&str>) -> RegistriesConfig {
    let mut mirrors: BTreeMap<String, RegistryMirror> = section
        .mirrors
        .iter()
        .map(|(host, doc)| {
            (
                host.clone(),
                RegistryMirror {
                    endpoints: doc.endpoints.clone(),
                    override_path: doc.override_path,
                    skip_fallback: doc.skip_fallback,
                },
            )
        })
        .collect();

    if let Some(cache) = cache {
        let local = format!("http://{cache}");
        mirrors.entry(WILDCARD_MIRROR.to_string()).or_default();
        for mirror in mirrors.values_mut() {
            mirror.endpoints.insert(0, local.clone());
        }
    }

    let config = section
        .config
        .iter()
        .map(|(host, doc)| {
            (
                host.clone(),
                RegistryConfig {
                    tls: RegistryTls {
                        insecure_skip_verify: doc.tls.insecure_skip_verify,
                        ca: doc.tls.ca.clone(),
                        client_cert: doc.tls.client_cert.clone(),
                        client_key: doc.tls.client_key.clone(),
                    },
                    auth: RegistryAuth {
                        username: doc.auth.username.clone(),
                        password: doc.auth.password.clone(),
                        auth: doc.auth.auth.clone(),
                        identity_token: doc.auth.identity_token.clone(),
                    },
                },
            )
        })
        .collect();

    RegistriesConfig { mirrors, config }
}

/// Projects the machine configuration registries into [`RegistriesConfig`],
/// cache first once the image cache is ready.
#[derive(Debug, Default)]
pub struct RegistriesConfigController;

impl RegistriesConfigController {
    /// New controller.
    pub fn new() -> Self {
        RegistriesConfigController
    }

    /// One reconcile pass.
    pub fn reconcile(&mut self, r: &mut ControllerRuntime) -> ControllerResult {
        let cfg = active_machine_config(r)?;
        let cache_ready = r
            .get::<ImageCacheConfig>(ImageCacheConfig::ID)?
            .is_some_and(|ic| ic.spec.status == ImageCacheStatus::Ready);

        let default_feature = ImageCacheFeature::default();
        let (section, feature) = match cfg.as_deref() {
            Some(doc) => (doc.machine.registries.clone(), &doc.machine.features.image_cache),
            None => (RegistriesSection::default(), &default_feature),
        };

        let cache = cache_ready.then_some(feature.registry_address.as_str());
        let built = build_registries(&section, cache);
        debug!(mirrors = built.mirrors.len(), cache_first = cache_ready, "registries config");

        r.modify::<RegistriesConfig, _>(RegistriesConfig::ID, |spec| {
            *spec = built;
            Ok(())
        })
    }
}

#[async_trait]
impl Controller for RegistriesConfigController {
    fn name(&self) -> &str {
        "cri.RegistriesConfigController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            machine_config_input(),
            Input::weak::<ImageCacheConfig>().with_id(ImageCacheConfig::ID),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<RegistriesConfig>()]
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

    use crate::testutil::{put, seed_config, standalone};
    use keel_resources::document::{MachineConfigDocument, RegistryAuthDoc, RegistryConfigDoc, RegistryMirrorDoc};

    fn doc() -> MachineConfigDocument {
        let mut doc = MachineConfigDocument::default();
        doc.machine.registries.mirrors.insert(
            "docker.io".into(),
            RegistryMirrorDoc {
                endpoints: vec!["https://mirror.io".into()],
                override_path: true,
                skip_fallback: false,
            },
        );
        doc.machine.registries.config.insert(
            "docker.io".into(),
            RegistryConfigDoc {
                auth: RegistryAuthDoc {
                    username: "example".into(),
                    password: "pass".into(),
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        doc
    }

    #[tokio::test]
    async fn test_mirrors_projected() {
        let (store, mut r) = standalone::<RegistriesConfig>("cri.RegistriesConfigController");
        seed_config(&store, doc());

        RegistriesConfigController::new().reconcile(&mut r).unwrap();

        let spec = store.get_typed::<RegistriesConfig>(RegistriesConfig::ID).unwrap().spec;
        assert_eq!(spec.mirrors.len(), 1);
        assert_eq!(spec.mirrors["docker.io"].endpoints, vec!["https://mirror.io".to_string()]);
        assert!(spec.mirrors["docker.io"].override_path);
        assert_eq!(spec.config["docker.io"].auth.username, "example");
    }

    #[tokio::test]
    async fn test_cache_first_when_ready() {
        let (store, mut r) = standalone::<RegistriesConfig>("cri.RegistriesConfigController");
        seed_config(&store, doc());
        put(
            &store,
            ImageCacheConfig::ID,
            ImageCacheConfig {
                status: ImageCacheStatus::Ready,
                roots: vec!["/imagecache".into()],
                ..Default::default()
            },
        );

        let mut ctrl = RegistriesConfigController::new();
        ctrl.reconcile(&mut r).unwrap();

        let first = store.get_typed::<RegistriesConfig>(RegistriesConfig::ID).unwrap();
        let local = "http://127.0.0.1:65000".to_string();
        assert_eq!(first.spec.mirrors[WILDCARD_MIRROR].endpoints, vec![local.clone()]);
        assert_eq!(
            first.spec.mirrors["docker.io"].endpoints,
            vec![local, "https://mirror.io".to_string()]
        );

        ctrl.reconcile(&mut r).unwrap();
        let second = store.get_typed::<RegistriesConfig>(RegistriesConfig::ID).unwrap();
        assert_eq!(first.spec, second.spec);
        assert_eq!(first.metadata.version(), second.metadata.version());
    }

    #[test]
    fn test_existing_wildcard_extended() {
        let mut section = RegistriesSection::default();
        section.mirrors.insert(
            WILDCARD_MIRROR.into(),
            RegistryMirrorDoc {
                endpoints: vec!["https://all.example".into()],
                ..Default::default()
            },
        );

        let built = build_registries(&section, Some("10.0.0.1:5000"));
        assert_eq!(built.mirrors.len(), 1);
        assert_eq!(
            built.mirrors[WILDCARD_MIRROR].endpoints,
            vec!["http://10.0.0.1:5000".to_string(), "https://all.example".to_string()]
        );
    }
}
