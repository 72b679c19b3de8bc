use std::sync::Arc;

use clap::Parser;
use kirunad::args::Args;
use kirunad::engine::EngineClient;
use kirunad::manifest::Manifest;
use kirunad::supervisor::Supervisor;
use kirunad::watcher::{ConfigWatcher, PollWatcher};
use tracing::{error, info};

const DAEMON_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let args = Args::parse();
    let manifest_path = args.manifest_path();

    // The manifest is loaded once up front purely to pick a log level
    // before the subscriber is initialized; the supervisor reloads it
    // properly on every reconcile.
    let initial_level = Manifest::load(&manifest_path)
        .map(|m| m.logging.console.level)
        .unwrap_or_else(|_| "info".to_string());
    kirunad::init_tracing(&initial_level);

    let engine: Arc<dyn kirunad::engine::Engine> = match EngineClient::connect() {
        Ok(engine) => Arc::new(engine),
        Err(err) => {
            error!(%err, "failed to connect to container engine");
            return std::process::ExitCode::FAILURE;
        }
    };

    let (supervisor, manual_rx) = Supervisor::new(manifest_path.clone(), engine, DAEMON_VERSION.to_string());

    // The first load has no previous application to fall back to: a
    // missing manifest, a circular dependency, or a registration
    // misconfiguration here must abort the process rather than serve
    // nothing forever.
    if let Err(err) = supervisor.load_initial().await {
        error!(%err, "failed to load initial application from manifest");
        return std::process::ExitCode::FAILURE;
    }

    let watcher = PollWatcher::new(manifest_path);

    let supervisor_for_run = supervisor.clone();
    let watcher_ref: &dyn ConfigWatcher = Box::leak(Box::new(watcher));
    let run_handle = tokio::spawn(async move { supervisor_for_run.run(watcher_ref, manual_rx).await });

    let api_supervisor = supervisor.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(err) = kirunad::api::serve(args.status_addr, api_supervisor).await {
            error!(%err, "status API exited");
        }
    });

    if args.no_console {
        info!("console disabled, running headless");
        let _ = tokio::join!(run_handle, api_handle);
    } else {
        let console_supervisor = supervisor.clone();
        tokio::select! {
            _ = kirunad::console::run(console_supervisor) => {
                info!("quit requested via console");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("quit requested via signal");
            }
        }
        supervisor.stop_all().await;
    }

    std::process::ExitCode::SUCCESS
}
