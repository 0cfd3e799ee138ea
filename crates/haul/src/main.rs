//! # haul
//!
//! Server binary: loads settings, installs logging and metrics, and serves
//! until ctrl-c.

#![deny(unsafe_code)]

mod logging;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use haul_server::config::ServerConfig;
use haul_server::server::HaulServer;
use haul_server::source::SimulatedSource;
use haul_settings::HaulSettings;

/// Fetch container images, package them and hand each archive off once.
#[derive(Parser, Debug)]
#[command(name = "haul", version, about)]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file (default `~/.haul/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Where job work directories and archives live (overrides settings).
    #[arg(long)]
    downloads_dir: Option<PathBuf>,
}

impl Cli {
    fn load_settings(&self) -> Result<HaulSettings> {
        match &self.settings {
            Some(path) => haul_settings::load_settings_from_path(path)
                .with_context(|| format!("Failed to load settings from {}", path.display())),
            None => haul_settings::load_settings().context("Failed to load settings"),
        }
    }

    fn server_config(&self, settings: &HaulSettings) -> ServerConfig {
        let mut config = ServerConfig::from_settings(settings);
        if let Some(host) = &self.host {
            config.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(dir) = &self.downloads_dir {
            config.downloads_dir.clone_from(dir);
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = cli.load_settings()?;
    logging::init_subscriber(&settings.logging.level, settings.logging.json);

    let metrics = haul_server::metrics::install_recorder();
    let config = cli.server_config(&settings);
    let drain = config.shutdown_timeout();
    let source = Arc::new(SimulatedSource::new(settings.source.clone()));
    let server = HaulServer::new(config, source, Some(metrics));

    let (addr, handle) = server.listen().await.context("Failed to bind server")?;
    tracing::info!("haul listening on http://{addr}");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    server.shutdown().graceful_shutdown(drain).await;
    let _ = handle.await;
    Ok(())
}
