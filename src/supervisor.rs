//! Sequences config-change reactions: one background task drains a
//! channel of pending generations and builds, launches, and swaps in a
//! new `Application` for each, using a single-consumer shape. "Collapse
//! queued bursts" is implemented with a generation counter rather than
//! literal task cancellation — a superseded build simply never reaches
//! the swap step.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{error, info, warn};

use crate::application::Application;
use crate::engine::Engine;
use crate::error::Error;
use crate::manifest::Manifest;
use crate::watcher::ConfigWatcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum SupervisorPhase {
    Empty,
    Updating,
    Idle,
}

pub struct Supervisor {
    manifest_path: PathBuf,
    engine: Arc<dyn Engine>,
    daemon_version: String,
    active: RwLock<Option<Arc<Application>>>,
    generation: AtomicU64,
    phase: RwLock<SupervisorPhase>,
    reload_tx: mpsc::Sender<()>,
}

impl Supervisor {
    pub fn new(manifest_path: PathBuf, engine: Arc<dyn Engine>, daemon_version: String) -> (Arc<Self>, mpsc::Receiver<()>) {
        let (reload_tx, reload_rx) = mpsc::channel(8);
        let supervisor = Arc::new(Self {
            manifest_path,
            engine,
            daemon_version,
            active: RwLock::new(None),
            generation: AtomicU64::new(0),
            phase: RwLock::new(SupervisorPhase::Empty),
            reload_tx,
        });
        (supervisor, reload_rx)
    }

    pub async fn active(&self) -> Option<Arc<Application>> {
        self.active.read().await.clone()
    }

    pub async fn phase(&self) -> SupervisorPhase {
        *self.phase.read().await
    }

    pub async fn request_reload(&self) {
        let _ = self.reload_tx.send(()).await;
    }

    /// Runs forever, driven by `watcher` notifications and manual
    /// `request_reload` calls, serializing config-change reactions.
    pub async fn run(self: Arc<Self>, watcher: &dyn ConfigWatcher, mut manual_rx: mpsc::Receiver<()>) {
        let mut watch_rx = watcher.watch();

        loop {
            tokio::select! {
                notified = watch_rx.recv() => {
                    if notified.is_none() {
                        return;
                    }
                }
                notified = manual_rx.recv() => {
                    if notified.is_none() {
                        return;
                    }
                }
            }

            self.clone().reconcile().await;
        }
    }

    /// Runs the very first reconcile before anything is served. Unlike
    /// every later reconcile, there is no previous application to fall
    /// back on, so a manifest-missing, circular-dependency, or
    /// registration-misconfiguration error here must propagate to the
    /// caller (`main`) as a fatal startup failure instead of being
    /// logged and swallowed.
    pub async fn load_initial(self: &Arc<Self>) -> Result<(), Error> {
        self.clone().reconcile_once().await
    }

    /// Reload entry point used by `run`'s watch/manual-trigger loop:
    /// logs and keeps the previous application on failure rather than
    /// propagating, since later reconciles always have one to fall back to.
    async fn reconcile(self: Arc<Self>) {
        if let Err(err) = self.reconcile_once().await {
            error!(%err, "reconcile failed, keeping previous application");
        }
    }

    async fn reconcile_once(self: Arc<Self>) -> Result<(), Error> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.phase.write().await = SupervisorPhase::Updating;

        let manifest = match Manifest::load(&self.manifest_path) {
            Ok(manifest) => manifest,
            Err(err) => {
                *self.phase.write().await = SupervisorPhase::Idle;
                return Err(err);
            }
        };

        let app = match Application::build(&manifest, self.engine.clone(), &self.daemon_version) {
            Ok(app) => app,
            Err(err) => {
                *self.phase.write().await = SupervisorPhase::Idle;
                return Err(err);
            }
        };

        // A newer reconcile already started while we were building;
        // drop this one instead of racing it to the swap step.
        if self.generation.load(Ordering::SeqCst) != generation {
            warn!("superseded by a newer config change, discarding this build");
            return Ok(());
        }

        app.link_all_dependencies().await;

        let previous = self.active.read().await.clone();
        app.launch(previous.as_ref(), self.engine.as_ref()).await;

        if self.generation.load(Ordering::SeqCst) != generation {
            warn!("superseded after launch, not swapping in");
            return Ok(());
        }

        info!("new application swapped in");
        *self.active.write().await = Some(app);
        *self.phase.write().await = SupervisorPhase::Idle;
        Ok(())
    }

    /// Stops every service in the active application, e.g. in response
    /// to the console's `s` key.
    pub async fn stop_all(&self) {
        if let Some(app) = self.active.read().await.clone() {
            app.mark_stopping();
        }
    }
}
