use anyhow::Result;
use clap::Parser;
use tokio::signal;
use tracing::info;

use beach_beacon::{server::Server, telemetry::Telemetry, Cli, ServerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        ws_path = %config.ws_path,
        max_connection_lifetime_secs = config.max_connection_lifetime.as_secs(),
        "starting beach-beacon"
    );

    let server = Server::bind(&config, Some(telemetry.metrics_handle())).await?;
    server.serve_until(shutdown_signal()).await?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
