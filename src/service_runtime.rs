//! Per-service rollout state machine: create-or-adopt, start, register,
//! retire-old. Rather than a typestate enum re-assigned at each
//! transition, this service holds its running containers directly and
//! mutates them in place behind its own serialized work queue — the
//! daemon recomputes everything from engine inspects rather than
//! persisting a state enum to a database.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bollard::container::Config;
use bollard::models::{HostConfig, PortBinding};
use bollard::service::ContainerStateStatusEnum;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tracing::{info, instrument, warn};

use crate::container_runner::{ContainerEvent, ContainerRunner, ContainerRunnerConfig};
use crate::engine::Engine;
use crate::error::Error;
use crate::manifest::ServiceSpec;
use crate::naming::{self, container_name};
use crate::registry::Registry;

pub const MAX_FAILURES: i64 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceEvent {
    Started,
    AllStarted,
    Stopped,
}

struct Replica {
    runner: ContainerRunner,
    running: bool,
}

type BoxedOp = Box<dyn FnOnce(Arc<ServiceRuntime>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// Runtime object for one manifest service entry. Owns its own
/// single-consumer work queue so `launch`/`stop`/replacement steps never
/// interleave for this service.
pub struct ServiceRuntime {
    pub spec: ServiceSpec,
    pub hash16: String,
    engine: Arc<dyn Engine>,
    registry: Arc<dyn Registry>,
    registration_prefix: String,
    registration_ip: String,
    registration_ttl: u64,
    replicas: Mutex<HashMap<usize, Replica>>,
    dependencies: RwLock<Vec<Arc<ServiceRuntime>>>,
    /// `<depFirstContainerName>:<alias>` entries for each direct
    /// dependency, in manifest order; fed straight into the container's
    /// `HostConfig.Links`.
    links: RwLock<Vec<String>>,
    recent_failures: AtomicI64,
    launched: AtomicBool,
    stopping: AtomicBool,
    events_tx: broadcast::Sender<ServiceEvent>,
    queue: mpsc::Sender<BoxedOp>,
    container_events: mpsc::Sender<ContainerEvent>,
}

impl ServiceRuntime {
    pub fn new(
        spec: ServiceSpec,
        hash16: String,
        engine: Arc<dyn Engine>,
        registry: Arc<dyn Registry>,
        registration_prefix: String,
        registration_ip: String,
        registration_ttl: u64,
    ) -> Arc<Self> {
        let (queue_tx, mut queue_rx) = mpsc::channel::<BoxedOp>(64);
        let (events_tx, _) = broadcast::channel(16);
        let (container_events_tx, container_events_rx) = mpsc::channel(64);

        let this = Arc::new(Self {
            spec,
            hash16,
            engine,
            registry,
            registration_prefix,
            registration_ip,
            registration_ttl,
            replicas: Mutex::new(HashMap::new()),
            dependencies: RwLock::new(Vec::new()),
            links: RwLock::new(Vec::new()),
            recent_failures: AtomicI64::new(0),
            launched: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            events_tx,
            queue: queue_tx,
            container_events: container_events_tx,
        });

        let self_for_queue = this.clone();
        tokio::spawn(async move {
            while let Some(op) = queue_rx.recv().await {
                op(self_for_queue.clone()).await;
            }
        });

        let self_for_events = this.clone();
        tokio::spawn(run_container_event_loop(self_for_events, container_events_rx));

        this
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.events_tx.subscribe()
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn is_launched(&self) -> bool {
        self.launched.load(Ordering::SeqCst)
    }

    pub fn is_quarantined(&self) -> bool {
        self.recent_failures.load(Ordering::SeqCst) > MAX_FAILURES
    }

    pub async fn running_replica_count(&self) -> usize {
        self.replicas.lock().await.values().filter(|r| r.running).count()
    }

    pub async fn is_up(&self) -> bool {
        if !self.spec.enabled {
            return true;
        }
        self.running_replica_count().await as u32 >= self.spec.scale
    }

    /// Resolves transitive dependencies and subscribes to their events.
    /// Must be called after every service in the application has been
    /// constructed, in dependency order.
    pub async fn link_dependencies(self: &Arc<Self>, all: &HashMap<String, Arc<ServiceRuntime>>) {
        let mut resolved = Vec::new();
        let mut links = Vec::new();

        for dep_entry in &self.spec.dependencies {
            let (dep_name, alias) = match dep_entry.split_once(':') {
                Some((name, alias)) => (name, alias),
                None => (dep_entry.as_str(), dep_entry.as_str()),
            };
            let Some(dep) = all.get(dep_name) else { continue };

            links.push(format!("{}:{alias}", dep.canonical_name(0)));

            if !resolved.iter().any(|d: &Arc<ServiceRuntime>| Arc::ptr_eq(d, dep)) {
                resolved.push(dep.clone());
            }
            let transitive = dep.dependencies.read().await;
            for t in transitive.iter() {
                if !resolved.iter().any(|d| Arc::ptr_eq(d, t)) {
                    resolved.push(t.clone());
                }
            }
        }

        *self.links.write().await = links;
        *self.dependencies.write().await = resolved.clone();

        for dep in resolved {
            let me = self.clone();
            let mut rx = dep.subscribe();
            tokio::spawn(async move {
                while let Ok(event) = rx.recv().await {
                    match event {
                        ServiceEvent::Started | ServiceEvent::AllStarted => {
                            if me.is_launched() {
                                let me2 = me.clone();
                                tokio::spawn(async move { me2.start_containers().await });
                            }
                        }
                        ServiceEvent::Stopped => {
                            let me2 = me.clone();
                            tokio::spawn(async move { me2.stop().await });
                        }
                    }
                }
            });
        }
    }

    async fn dependencies_all_running(&self) -> bool {
        let deps = self.dependencies.read().await;
        for dep in deps.iter() {
            if dep.spec.enabled && dep.running_replica_count().await == 0 {
                return false;
            }
        }
        true
    }

    fn canonical_name(&self, index: usize) -> String {
        container_name(&self.spec.name, &self.hash16, index)
    }

    /// Enqueues `launch` on this service's serialized work queue.
    pub fn enqueue_launch(self: &Arc<Self>) {
        let op: BoxedOp = Box::new(|svc| Box::pin(async move { svc.launch().await }));
        let _ = self.queue.try_send(op);
    }

    pub fn enqueue_stop(self: &Arc<Self>) {
        let op: BoxedOp = Box::new(|svc| Box::pin(async move { svc.stop().await }));
        let _ = self.queue.try_send(op);
    }

    #[instrument(skip(self), fields(service = %self.spec.name))]
    async fn launch(self: Arc<Self>) {
        self.collect_running_containers().await;

        let adopted = self.running_replica_count().await;
        if adopted == 0 && self.spec.hard_deploy {
            self.stop().await;
        }

        self.launched.store(true, Ordering::SeqCst);
        self.start_containers().await;
    }

    /// Adopts any already-running current-generation containers without
    /// touching the engine otherwise.
    async fn collect_running_containers(self: &Arc<Self>) {
        for index in 0..self.spec.scale as usize {
            let name = self.canonical_name(index);
            if let Ok(inspected) = self.engine.inspect_container(&name).await {
                let running = inspected
                    .state
                    .as_ref()
                    .and_then(|s| s.status)
                    .map(|s| s == ContainerStateStatusEnum::RUNNING)
                    .unwrap_or(false);
                if running {
                    self.adopt(index, name).await;
                }
            }
        }
    }

    #[instrument(skip(self), fields(service = %self.spec.name))]
    async fn start_containers(self: &Arc<Self>) {
        if !self.dependencies_all_running().await {
            info!("waiting on dependencies before starting");
            return;
        }

        for index in 0..self.spec.scale as usize {
            if self.replicas.lock().await.contains_key(&index) {
                continue;
            }

            let name = self.canonical_name(index);
            match self.engine.inspect_container(&name).await {
                Ok(inspected) => {
                    let running = inspected
                        .state
                        .as_ref()
                        .and_then(|s| s.status)
                        .map(|s| s == ContainerStateStatusEnum::RUNNING)
                        .unwrap_or(false);
                    if running {
                        self.adopt(index, name).await;
                        continue;
                    }
                    let _ = self.engine.remove_container(&name).await;
                    if self.create_and_start(index, &name).await.is_ok() {
                        self.adopt(index, name).await;
                    }
                }
                Err(_) => {
                    if self.create_and_start(index, &name).await.is_ok() {
                        self.adopt(index, name).await;
                    }
                }
            }
        }
    }

    async fn create_and_start(&self, index: usize, name: &str) -> Result<(), Error> {
        if let Err(err) = self.engine.pull_image(&self.spec.image, &self.spec.tag, self.spec.registry.as_deref()).await {
            warn!(%err, "image pull failed");
            return Err(err);
        }

        let config = self.generate_container_config().await;
        self.engine.create_container(name.to_string(), config).await?;
        self.engine.start_container(name).await?;
        let _ = index;
        Ok(())
    }

    /// Builds the bollard create/start option mapping for this service:
    /// environment, exposed ports, port bindings, publish-all-ports,
    /// bind mounts, and Docker links to each direct dependency's first
    /// container (resolved by `link_dependencies`).
    async fn generate_container_config(&self) -> Config<String> {
        let env: Vec<String> = self
            .spec
            .environment
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let exposed_ports = self
            .spec
            .expose
            .iter()
            .map(|p| {
                let key = if p.contains('/') { p.clone() } else { format!("{p}/tcp") };
                (key, HashMap::new())
            })
            .collect();

        let mut port_bindings = HashMap::new();
        for (container_port, port_spec) in &self.spec.ports {
            let key = if container_port.contains('/') {
                container_port.clone()
            } else {
                format!("{container_port}/tcp")
            };
            let (host_ip, host_port) = split_host_port(port_spec);
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: Some(host_ip),
                    host_port: Some(host_port),
                }]),
            );
        }

        let binds: Vec<String> = self
            .spec
            .volumes
            .iter()
            .map(|(container_path, host_path)| format!("{host_path}:{container_path}"))
            .collect();

        let links = self.links.read().await.clone();

        Config {
            image: Some(format!("{}:{}", self.spec.image, self.spec.tag)),
            cmd: if self.spec.cmd.is_empty() { None } else { Some(self.spec.cmd.clone()) },
            env: if env.is_empty() { None } else { Some(env) },
            exposed_ports: if exposed_ports.is_empty() { None } else { Some(exposed_ports) },
            host_config: Some(HostConfig {
                port_bindings: if port_bindings.is_empty() { None } else { Some(port_bindings) },
                publish_all_ports: Some(self.spec.publish_all_ports),
                binds: if binds.is_empty() { None } else { Some(binds) },
                links: if links.is_empty() { None } else { Some(links) },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn adopt(self: &Arc<Self>, index: usize, name: String) {
        let exposed_container_ports: Vec<String> = self.spec.expose.clone();
        let runner = ContainerRunner::spawn(ContainerRunnerConfig {
            engine: self.engine.clone(),
            registry: self.registry.clone(),
            name,
            service_name: self.spec.name.clone(),
            index,
            probes: self.spec.health.clone(),
            register: self.spec.register,
            registration_prefix: self.registration_prefix.clone(),
            registration_ip: self.registration_ip.clone(),
            registration_ttl: self.registration_ttl,
            exposed_container_ports,
            events: self.container_events.clone(),
        });

        self.replicas.lock().await.insert(index, Replica { runner, running: false });
    }

    /// Retires containers from a prior generation; with `force` it also
    /// retires current-generation containers (used by `stop`).
    #[instrument(skip(self), fields(service = %self.spec.name))]
    async fn stop_old_containers(&self, force: bool) {
        let Ok(containers) = self.engine.list_containers(true).await else {
            return;
        };

        for container in containers {
            let Some(name) = container.names.as_ref().and_then(|n| n.first()) else {
                continue;
            };
            let is_old = naming::is_old_generation(name, &self.spec.name, &self.hash16);
            let is_mine = naming::is_owned(name.trim_start_matches('/'))
                && naming::service_name_of(name) == Some(self.spec.name.as_str());

            let matches = if force { is_old || is_mine } else { is_old };
            if !matches {
                continue;
            }

            if let Some(id) = container.id.as_deref() {
                let _ = self.engine.stop_container(id).await;
                let _ = self.engine.remove_container(id).await;
            }
        }
    }

    #[instrument(skip(self), fields(service = %self.spec.name))]
    async fn stop(self: Arc<Self>) {
        self.stopping.store(true, Ordering::SeqCst);

        {
            let mut replicas = self.replicas.lock().await;
            for replica in replicas.values() {
                replica.runner.mark_stopping();
            }
            replicas.clear();
        }

        let _ = self.events_tx.send(ServiceEvent::Stopped);
        self.stop_old_containers(true).await;
    }
}

/// Aggregates per-container `started`/`stopped` events into the
/// service-level `started`/`all_started`/`stopped` events.
async fn run_container_event_loop(
    service: Arc<ServiceRuntime>,
    mut events: mpsc::Receiver<ContainerEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ContainerEvent::Started(index) => {
                let running_before = {
                    let mut replicas = service.replicas.lock().await;
                    let running_before = replicas.values().filter(|r| r.running).count();
                    if let Some(replica) = replicas.get_mut(&index) {
                        replica.running = true;
                    }
                    running_before
                };

                if service.recent_failures.load(Ordering::SeqCst) > 0 {
                    service.recent_failures.fetch_sub(1, Ordering::SeqCst);
                }

                let running_now = service.running_replica_count().await;
                if running_before == 0 && running_now > 0 {
                    let _ = service.events_tx.send(ServiceEvent::Started);
                }
                if running_now as u32 == service.spec.scale {
                    let _ = service.events_tx.send(ServiceEvent::AllStarted);
                    let svc = service.clone();
                    tokio::spawn(async move {
                        if let Some(ms) = svc.spec.settle_timeout_ms {
                            tokio::time::sleep(Duration::from_millis(ms)).await;
                        }
                        svc.stop_old_containers(false).await;
                    });
                }
            }
            ContainerEvent::Stopped(index) => {
                service.replicas.lock().await.remove(&index);
                let failures = service.recent_failures.fetch_add(1, Ordering::SeqCst) + 1;

                if service.running_replica_count().await == 0 {
                    let _ = service.events_tx.send(ServiceEvent::Stopped);
                }

                if failures > MAX_FAILURES {
                    warn!(failures, "service quarantined after too many restarts");
                    continue;
                }

                if !service.stopping.load(Ordering::SeqCst) {
                    service.start_containers().await;
                }
            }
        }
    }
}

/// Splits a `host` binding spec (`"PORT"` or `"IP:PORT"`) into
/// `(host_ip, host_port)`, defaulting the IP to `0.0.0.0`.
pub fn split_host_port(host: &str) -> (String, String) {
    match host.split_once(':') {
        Some((ip, port)) => (ip.to_string(), port.to_string()),
        None => ("0.0.0.0".to_string(), host.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_host_port_defaults_ip() {
        assert_eq!(split_host_port("80"), ("0.0.0.0".to_string(), "80".to_string()));
    }

    #[test]
    fn split_host_port_with_explicit_ip() {
        assert_eq!(
            split_host_port("1.2.3.4:80"),
            ("1.2.3.4".to_string(), "80".to_string())
        );
    }

    fn spec(name: &str, deps: &[&str]) -> ServiceSpec {
        ServiceSpec {
            name: name.to_string(),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            ..ServiceSpec::test_default()
        }
    }

    fn runtime(spec: ServiceSpec, hash16: &str, engine: Arc<dyn Engine>) -> Arc<ServiceRuntime> {
        ServiceRuntime::new(
            spec,
            hash16.to_string(),
            engine,
            Arc::new(crate::registry::NullRegistry),
            String::new(),
            String::new(),
            60,
        )
    }

    #[tokio::test]
    async fn links_use_first_container_of_each_direct_dependency_with_alias() {
        let engine: Arc<dyn Engine> = Arc::new(crate::engine::FakeEngine::new());
        let etcd = runtime(spec("etcd", &[]), "etcdhash0000000", engine.clone());
        let web = runtime(spec("web-app", &["etcd:etcd"]), "webhash00000000", engine);

        let mut all = HashMap::new();
        all.insert("etcd".to_string(), etcd.clone());
        all.insert("web-app".to_string(), web.clone());

        web.link_dependencies(&all).await;

        let config = web.generate_container_config().await;
        let links = config.host_config.unwrap().links.unwrap();
        assert_eq!(links, vec![format!("{}:etcd", etcd.canonical_name(0))]);
    }

    #[tokio::test]
    async fn links_default_alias_to_dependency_service_name() {
        let engine: Arc<dyn Engine> = Arc::new(crate::engine::FakeEngine::new());
        let cache = runtime(spec("cache", &[]), "cachehash000000", engine.clone());
        let web = runtime(spec("web", &["cache"]), "webhash00000001", engine);

        let mut all = HashMap::new();
        all.insert("cache".to_string(), cache.clone());
        all.insert("web".to_string(), web.clone());

        web.link_dependencies(&all).await;

        let config = web.generate_container_config().await;
        let links = config.host_config.unwrap().links.unwrap();
        assert_eq!(links, vec![format!("{}:cache", cache.canonical_name(0))]);
    }

    #[tokio::test]
    async fn launch_converges_to_up_against_a_fake_engine() {
        let engine: Arc<dyn Engine> = Arc::new(crate::engine::FakeEngine::new());
        let svc = runtime(spec("web", &[]), "webhash00000002", engine);

        svc.enqueue_launch();

        tokio::time::timeout(Duration::from_secs(2), async {
            while !svc.is_up().await {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("service should converge to up against a fake engine");
    }
}
