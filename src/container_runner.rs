//! Per-container watch loop: inspect, classify the engine-reported
//! status, probe health, and emit edge-triggered `started`/`stopped`
//! events back to the owning service.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bollard::service::ContainerStateStatusEnum;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::engine::Engine;
use crate::health;
use crate::manifest::HealthProbeSpec;
use crate::registry::{registration_key, registration_value, Registry};

pub const MAX_HEALTH_FAILURES: u32 = 4;
const FAST_INTERVAL: Duration = Duration::from_millis(250);
const SLOW_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerEvent {
    Started(usize),
    Stopped(usize),
}

/// Owns one live engine container from adoption/creation until a
/// terminal `Stopped`. The watch loop runs as its own tokio task; the
/// handle only exposes a way to request early termination (`stop`) and
/// to read its engine container id.
pub struct ContainerRunner {
    stopping: Arc<AtomicBool>,
    health_failures: Arc<AtomicU32>,
}

pub struct ContainerRunnerConfig {
    pub engine: Arc<dyn Engine>,
    pub registry: Arc<dyn Registry>,
    pub name: String,
    pub service_name: String,
    pub index: usize,
    pub probes: Vec<HealthProbeSpec>,
    pub register: bool,
    pub registration_prefix: String,
    pub registration_ip: String,
    pub registration_ttl: u64,
    pub exposed_container_ports: Vec<String>,
    pub events: mpsc::Sender<ContainerEvent>,
}

impl ContainerRunner {
    /// Spawns the watch loop for an already-created, adopted container.
    pub fn spawn(config: ContainerRunnerConfig) -> Self {
        let stopping = Arc::new(AtomicBool::new(false));
        let health_failures = Arc::new(AtomicU32::new(0));

        tokio::spawn(watch_loop(
            config,
            stopping.clone(),
            health_failures.clone(),
        ));

        Self {
            stopping,
            health_failures,
        }
    }

    /// Marks this runner stopping; its next tick becomes a no-op. Used
    /// when the owning service is retired so a crashed-container restart
    /// doesn't race a deliberate shutdown.
    pub fn mark_stopping(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    pub fn health_failures(&self) -> u32 {
        self.health_failures.load(Ordering::SeqCst)
    }
}

#[instrument(skip_all, fields(service = %config.service_name, index = config.index))]
async fn watch_loop(
    config: ContainerRunnerConfig,
    stopping: Arc<AtomicBool>,
    health_failures: Arc<AtomicU32>,
) {
    let mut interval = FAST_INTERVAL;
    let mut started = false;

    loop {
        tokio::time::sleep(interval).await;

        if stopping.load(Ordering::SeqCst) {
            return;
        }

        let inspected = match config.engine.inspect_container(&config.name).await {
            Ok(inspected) => inspected,
            Err(err) => {
                debug!(%err, "container vanished or errored during inspect");
                let _ = config.events.send(ContainerEvent::Stopped(config.index)).await;
                return;
            }
        };

        let status = inspected
            .state
            .as_ref()
            .and_then(|s| s.status)
            .unwrap_or(ContainerStateStatusEnum::EMPTY);

        if status != ContainerStateStatusEnum::RUNNING {
            info!(?status, "container no longer running");
            let _ = config.events.send(ContainerEvent::Stopped(config.index)).await;
            return;
        }

        let healthy = health::is_healthy(&config.probes, &inspected).await;

        if healthy {
            health_failures.store(0, Ordering::SeqCst);

            if config.register {
                register_ports(&config, &inspected).await;
            }

            interval = SLOW_INTERVAL;

            if !started {
                started = true;
                let _ = config.events.send(ContainerEvent::Started(config.index)).await;
            }
            continue;
        }

        if !started {
            // Still warming up: keep polling fast, don't count against budget.
            interval = FAST_INTERVAL;
            continue;
        }

        let failures = health_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures < MAX_HEALTH_FAILURES {
            interval = FAST_INTERVAL;
            continue;
        }

        warn!(failures, "health probe budget exhausted, stopping container");
        let _ = config.engine.stop_container(&config.name).await;
        let _ = config.events.send(ContainerEvent::Stopped(config.index)).await;
        return;
    }
}

async fn register_ports(config: &ContainerRunnerConfig, inspected: &bollard::service::ContainerInspectResponse) {
    let Some(ports) = inspected
        .network_settings
        .as_ref()
        .and_then(|settings| settings.ports.as_ref())
    else {
        return;
    };

    for container_port in &config.exposed_container_ports {
        let port_key = if container_port.contains('/') {
            container_port.clone()
        } else {
            format!("{container_port}/tcp")
        };

        let Some(bindings) = ports.get(&port_key).and_then(|b| b.as_ref()) else {
            continue;
        };
        let Some(host_port) = bindings.first().and_then(|b| b.host_port.clone()) else {
            continue;
        };

        let key = registration_key(
            &config.registration_prefix,
            &config.service_name,
            &config.registration_ip,
            config.index,
            &port_key,
        );
        let value = registration_value(&config.registration_ip, &host_port);

        if let Err(err) = config.registry.put(&key, &value, config.registration_ttl).await {
            warn!(%err, %key, "failed to register container endpoint");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::FakeEngine;
    use crate::registry::NullRegistry;

    fn config(engine: Arc<dyn Engine>, events: mpsc::Sender<ContainerEvent>) -> ContainerRunnerConfig {
        ContainerRunnerConfig {
            engine,
            registry: Arc::new(NullRegistry),
            name: "web-abc0123456789abc__0_kir".to_string(),
            service_name: "web".to_string(),
            index: 0,
            probes: Vec::new(),
            register: false,
            registration_prefix: String::new(),
            registration_ip: String::new(),
            registration_ttl: 60,
            exposed_container_ports: Vec::new(),
            events,
        }
    }

    #[tokio::test]
    async fn emits_started_once_then_stopped_when_container_vanishes() {
        let engine = Arc::new(FakeEngine::new());
        engine.set_running("web-abc0123456789abc__0_kir", true).await;
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let cfg = config(engine.clone(), events_tx);

        let _runner = ContainerRunner::spawn(cfg);

        let started = tokio::time::timeout(Duration::from_secs(2), events_rx.recv())
            .await
            .expect("started event should arrive");
        assert_eq!(started, Some(ContainerEvent::Started(0)));

        engine.forget("web-abc0123456789abc__0_kir").await;

        let stopped = tokio::time::timeout(Duration::from_secs(2), events_rx.recv())
            .await
            .expect("stopped event should arrive");
        assert_eq!(stopped, Some(ContainerEvent::Stopped(0)));
    }

    #[tokio::test]
    async fn not_running_container_emits_stopped_without_started() {
        let engine = Arc::new(FakeEngine::new());
        engine.set_running("web-abc0123456789abc__0_kir", false).await;
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let cfg = config(engine, events_tx);

        let _runner = ContainerRunner::spawn(cfg);

        let event = tokio::time::timeout(Duration::from_secs(1), events_rx.recv())
            .await
            .expect("stopped event should arrive");
        assert_eq!(event, Some(ContainerEvent::Stopped(0)));
    }
}
