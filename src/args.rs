use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
pub struct Args {
    /// Path to the service manifest. Falls back to $KIRUNA_CONF, then ./kiruna.conf
    #[clap(long, env = "KIRUNA_CONF")]
    pub manifest: Option<PathBuf>,

    /// Address to bind the status HTTP endpoint to
    #[clap(long, default_value = "127.0.0.1:8500")]
    pub status_addr: SocketAddr,

    /// Disable the interactive key console (useful under a supervisor/systemd)
    #[clap(long)]
    pub no_console: bool,
}

impl Args {
    pub fn manifest_path(&self) -> PathBuf {
        self.manifest
            .clone()
            .unwrap_or_else(|| PathBuf::from("kiruna.conf"))
    }
}
