//! Owns the ordered service graph for one manifest generation: builds
//! services from the manifest, topologically sorts them, runs the
//! launch pipeline, and periodically reaps obsolete containers and
//! images. The rotate-to-tail topological sort's "cap iterations at 2*N"
//! safety valve mirrors the same pattern used in
//! `manifest.rs::detect_dependency_cycles`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use semver::Version;
use tracing::{info, instrument, warn};

use crate::engine::Engine;
use crate::error::Error;
use crate::manifest::Manifest;
use crate::naming::{self, hash16};
use crate::registry::{NullRegistry, Registry};
use crate::service_runtime::ServiceRuntime;

pub const IMAGES_TO_KEEP: usize = 2;

pub struct Application {
    pub services: Vec<Arc<ServiceRuntime>>,
    by_name: HashMap<String, Arc<ServiceRuntime>>,
    stopping: AtomicBool,
    daemon_version: String,
}

impl Application {
    pub fn build(
        manifest: &Manifest,
        engine: Arc<dyn Engine>,
        daemon_version: &str,
    ) -> Result<Arc<Self>, Error> {
        // An absent `Registration` block (neither Ip nor Endpoint set) means
        // registration is simply unused; either field set alone is a
        // misconfiguration and must fail construction rather than silently
        // dropping writes, per the fatal-registration-misconfig requirement.
        let registry: Arc<dyn Registry> = if manifest.registration.ip.is_none()
            && manifest.registration.endpoint.is_none()
        {
            Arc::new(NullRegistry)
        } else {
            Arc::new(crate::registry::HttpRegistry::new(&manifest.registration)?)
        };
        let registration_prefix = manifest.registration.prefix.clone();
        let registration_ip = manifest.registration.ip.clone().unwrap_or_default();
        let registration_ttl = manifest.registration.ttl_seconds;

        let order = topological_order(&manifest.services)?;

        let mut by_name = HashMap::new();
        for name in &order {
            let spec = manifest.services[name].clone();
            let hash = hash16(&spec, daemon_version);
            let runtime = ServiceRuntime::new(
                spec,
                hash,
                engine.clone(),
                registry.clone(),
                registration_prefix.clone(),
                registration_ip.clone(),
                registration_ttl,
            );
            by_name.insert(name.clone(), runtime);
        }

        // Dependency linking requires every service to already exist, and
        // must itself proceed in dependency order so a service's
        // transitive-dependency list only ever references already-linked
        // runtimes.
        let services: Vec<Arc<ServiceRuntime>> = order
            .iter()
            .map(|name| by_name[name].clone())
            .collect();

        Ok(Arc::new(Application {
            services,
            by_name,
            stopping: AtomicBool::new(false),
            daemon_version: daemon_version.to_string(),
        }))
    }

    pub async fn link_all_dependencies(&self) {
        for service in &self.services {
            service.link_dependencies(&self.by_name).await;
        }
    }

    pub fn mark_stopping(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        for service in &self.services {
            service.enqueue_stop();
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    pub async fn is_up(&self) -> bool {
        if self.services.is_empty() {
            return false;
        }
        for service in &self.services {
            if !service.is_up().await {
                return false;
            }
        }
        true
    }

    /// Pulls every image (sequentially, to avoid hammering the
    /// registry), marks `previous` as stopping, then launches each
    /// service in dependency order.
    #[instrument(skip_all)]
    pub async fn launch(self: &Arc<Self>, previous: Option<&Arc<Application>>, engine: &dyn Engine) {
        for service in &self.services {
            if !service.spec.enabled {
                continue;
            }
            if let Err(err) = engine
                .pull_image(&service.spec.image, &service.spec.tag, service.spec.registry.as_deref())
                .await
            {
                warn!(service = %service.spec.name, %err, "image pull failed, launching anyway");
            }
        }

        if let Some(previous) = previous {
            previous.mark_stopping();
        }

        for service in &self.services {
            if service.spec.enabled {
                service.enqueue_launch();
            }
        }
    }

    pub async fn stop_and_remove_container(&self, engine: &dyn Engine, id: &str) -> Result<(), Error> {
        let _ = engine.stop_container(id).await;
        engine.remove_container(id).await
    }

    /// Reaps containers this daemon owns that are not a current replica
    /// of any live service, and prunes old image tags per service,
    /// keeping `IMAGES_TO_KEEP`.
    #[instrument(skip_all)]
    pub async fn cleanup(&self, engine: &dyn Engine) {
        self.cleanup_containers(engine).await;
        self.cleanup_images(engine).await;
    }

    async fn cleanup_containers(&self, engine: &dyn Engine) {
        let Ok(containers) = engine.list_containers(true).await else {
            return;
        };

        let mut current_names = std::collections::HashSet::new();
        for service in &self.services {
            for index in 0..service.spec.scale as usize {
                current_names.insert(crate::naming::container_name(
                    &service.spec.name,
                    &service.hash16,
                    index,
                ));
            }
        }

        for container in containers {
            let Some(name) = container.names.as_ref().and_then(|n| n.first()) else {
                continue;
            };
            let stripped = name.trim_start_matches('/');
            if !naming::is_owned(stripped) {
                continue;
            }
            if current_names.contains(stripped) {
                continue;
            }
            if let Some(id) = container.id.as_deref() {
                info!(name = %stripped, "removing obsolete container");
                let _ = self.stop_and_remove_container(engine, id).await;
            }
        }
    }

    /// Prunes images per service, filtering out the image any running
    /// container is currently based on and keeping `IMAGES_TO_KEEP` by
    /// descending semver. A tag matching this daemon's own running
    /// version is excluded the same way, so an upgrade in progress never
    /// prunes the image it is currently running from.
    async fn cleanup_images(&self, engine: &dyn Engine) {
        let Ok(images) = engine.list_images().await else {
            return;
        };

        let current_images: std::collections::HashSet<String> = self
            .services
            .iter()
            .map(|s| format!("{}:{}", s.spec.image, s.spec.tag))
            .collect();

        let mut by_repo: HashMap<String, Vec<(Version, String, String)>> = HashMap::new();
        for image in &images {
            let Some(tags) = image.repo_tags.as_ref() else { continue };
            for tag_ref in tags {
                let Some((repo, tag)) = tag_ref.rsplit_once(':') else { continue };
                if current_images.contains(tag_ref) || tag == self.daemon_version {
                    continue;
                }
                if let Ok(version) = Version::parse(tag) {
                    by_repo
                        .entry(repo.to_string())
                        .or_default()
                        .push((version, tag_ref.clone(), image.id.clone()));
                }
            }
        }

        for (_repo, mut versions) in by_repo {
            versions.sort_by(|a, b| b.0.cmp(&a.0));
            for (_, tag_ref, _id) in versions.into_iter().skip(IMAGES_TO_KEEP) {
                info!(image = %tag_ref, "pruning old image tag");
                let _ = engine.remove_image(&tag_ref).await;
            }
        }
    }
}

/// Rotate-to-tail topological sort, mirroring
/// `manifest.rs::detect_dependency_cycles`'s shape but producing the
/// actual order rather than just validating it.
fn topological_order(services: &HashMap<String, crate::manifest::ServiceSpec>) -> Result<Vec<String>, Error> {
    let mut remaining: Vec<String> = services.keys().cloned().collect();
    remaining.sort();
    let n = remaining.len();
    let mut sorted = Vec::with_capacity(n);
    let mut rotations = 0usize;
    let max_rotations = 2 * n.max(1);

    while let Some(name) = remaining.first().cloned() {
        let spec = &services[&name];
        let blocked = spec
            .dependency_names()
            .into_iter()
            .any(|dep| dep != name && remaining.iter().any(|r| r == dep));

        remaining.remove(0);
        if blocked {
            remaining.push(name);
            rotations += 1;
            if rotations > max_rotations {
                return Err(Error::custom(
                    crate::error::ErrorKind::ConfigValidate,
                    "circular dependency detected while ordering services",
                ));
            }
        } else {
            sorted.push(name);
            rotations = 0;
        }
    }

    Ok(sorted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{Manifest, RegistrationSpec, ServiceSpec};
    use bollard::models::ImageSummary;

    fn image_summary(tag_ref: &str) -> ImageSummary {
        ImageSummary {
            id: tag_ref.to_string(),
            repo_tags: Some(vec![tag_ref.to_string()]),
            ..Default::default()
        }
    }

    fn spec(name: &str, deps: &[&str]) -> ServiceSpec {
        ServiceSpec {
            name: name.to_string(),
            image: "image".to_string(),
            tag: "latest".to_string(),
            scale: 1,
            enabled: true,
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn orders_dependencies_before_dependents() {
        let mut services = HashMap::new();
        services.insert("db".to_string(), spec("db", &[]));
        services.insert("web".to_string(), spec("web", &["db"]));
        services.insert("cache".to_string(), spec("cache", &[]));

        let order = topological_order(&services).unwrap();
        let db_pos = order.iter().position(|s| s == "db").unwrap();
        let web_pos = order.iter().position(|s| s == "web").unwrap();
        assert!(db_pos < web_pos);
        assert_eq!(order.len(), 3);
    }

    #[test]
    fn detects_cycle() {
        let mut services = HashMap::new();
        services.insert("a".to_string(), spec("a", &["b"]));
        services.insert("b".to_string(), spec("b", &["a"]));
        assert!(topological_order(&services).is_err());
    }

    #[test]
    fn build_succeeds_with_no_registration_configured() {
        let manifest = Manifest::default();
        let engine: Arc<dyn Engine> = Arc::new(crate::engine::FakeEngine::new());
        assert!(Application::build(&manifest, engine, "0.1.0").is_ok());
    }

    #[test]
    fn build_fatally_errors_on_partial_registration_config() {
        let manifest = Manifest {
            registration: RegistrationSpec {
                ip: Some("10.0.0.1".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let engine: Arc<dyn Engine> = Arc::new(crate::engine::FakeEngine::new());
        assert!(Application::build(&manifest, engine, "0.1.0").is_err());
    }

    #[tokio::test]
    async fn cleanup_images_protects_the_daemon_own_running_tag() {
        let engine = Arc::new(crate::engine::FakeEngine::new());
        engine
            .set_images(vec![
                image_summary("kirunad:0.1.0"),
                image_summary("kirunad:0.2.0"),
                image_summary("kirunad:0.3.0"),
            ])
            .await;

        let app = Application {
            services: Vec::new(),
            by_name: HashMap::new(),
            stopping: AtomicBool::new(false),
            daemon_version: "0.1.0".to_string(),
        };

        app.cleanup_images(engine.as_ref()).await;

        let remaining_tags: Vec<String> = engine
            .list_images()
            .await
            .unwrap()
            .into_iter()
            .flat_map(|i| i.repo_tags.unwrap_or_default())
            .collect();
        assert!(remaining_tags.contains(&"kirunad:0.1.0".to_string()));
    }
}
