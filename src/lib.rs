//! Single-host container orchestration daemon: reconciles a declarative
//! service manifest against a container engine, watches container
//! health, retires obsolete generations, and republishes endpoints into
//! an external registry.

pub mod api;
pub mod application;
pub mod args;
pub mod console;
pub mod container_runner;
pub mod engine;
pub mod error;
pub mod health;
pub mod manifest;
pub mod naming;
pub mod registry;
pub mod service_runtime;
pub mod supervisor;
pub mod watcher;

pub use error::{Error, ErrorKind, Result};

/// Initializes the `tracing` subscriber from `Logging.Console.Level`,
/// falling back to `RUST_LOG` if set.
pub fn init_tracing(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
