use std::sync::Arc;

use clap::{Parser, Subcommand};
use csi_driver::plugger::RealDiskPlugger;
use csi_driver::{Driver, DriverConfig, PreStopHook};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "civo-csi", version = csi_driver::VERSION, about = "CSI driver for Civo block volumes")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Wait for this node's VolumeAttachments to be cleaned up before
    /// the node agent terminates.
    PreStop,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = DriverConfig::from_env();

    match cli.command {
        Some(Command::PreStop) => {
            info!("Running the pre-stop hook for the driver");
            let client = kube::Client::try_default().await?;
            let hook = PreStopHook::new(client, &config.node_name)?;
            hook.run(shutdown_signal()).await
        }
        None => {
            let civo = Arc::new(civo_api::Client::new(
                &config.api_url,
                &config.api_key,
                &config.region,
            ));
            let kube_client = match kube::Client::try_default().await {
                Ok(client) => Some(client),
                Err(error) => {
                    warn!(%error, "No cluster API access, hanging volume cleanup will be disabled");
                    None
                }
            };

            let driver = Driver::new(
                &config,
                civo,
                Arc::new(RealDiskPlugger::new()),
                kube_client,
            );
            info!("Running the driver");
            driver.run(shutdown_signal()).await
        }
    }
}

/// Resolves when the process receives SIGINT or SIGTERM.
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(error) => {
            warn!(%error, "Unable to listen for SIGTERM, only handling Ctrl-C");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    info!("Running until SIGINT/SIGTERM is received");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received an interrupt signal"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }
}
