//! `vfsbrokerd`: process entry point for the VFS broker.
//!
//! Wiring the broker to the kernel's actual task/IPC transport is out of scope for this
//! repository (§1) — that transport hands the dispatcher already-decoded `VFS_IN_*`
//! requests over a [`vfs_broker::transport::ClientLink`]. This binary owns the part that
//! *is* in scope: config/CLI handling, logging, and standing up the shared [`Broker`]
//! that every connection's [`Dispatcher`] is built against.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use vfs_broker::broker::Broker;
use vfs_broker::config::BrokerConfig;

#[derive(Parser, Debug)]
#[command(name = "vfsbrokerd", about = "User-space VFS broker")]
struct Cli {
    /// Path to a TOML config file; a missing file falls back to built-in defaults.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured listen address.
    #[arg(short, long)]
    listen: Option<String>,
}

fn load_config(path: Option<&PathBuf>) -> BrokerConfig {
    let Some(path) = path else {
        return BrokerConfig::default();
    };
    match std::fs::read_to_string(path) {
        Ok(contents) => BrokerConfig::from_toml_str(&contents).unwrap_or_else(|err| {
            warn!(path = %path.display(), error = %err, "invalid config, using defaults");
            BrokerConfig::default()
        }),
        Err(_) => BrokerConfig::default(),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_ref());
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }

    info!(listen_addr = %config.listen_addr, "vfs broker starting");
    let _broker = Arc::new(Broker::with_config(config));

    info!("vfs broker ready, waiting for the host transport to deliver requests");
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
    info!("vfs broker shutting down");
}
