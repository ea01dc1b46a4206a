use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;

/// Upper bound for the connection lifetime ceiling (one year).
const MAX_CONNECTION_LIFETIME_SECS: u64 = 365 * 24 * 60 * 60;

const RESERVED_PATHS: [&str; 2] = ["/healthz", "/metrics"];

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub ws_path: String,
    pub max_connection_lifetime: Duration,
    pub shutdown_grace: Duration,
}

#[derive(Debug, Parser)]
#[command(
    name = "beach-beacon",
    author,
    version,
    about = "Beach signaling relay for peer-to-peer connection negotiation"
)]
pub struct Cli {
    /// Address to bind the websocket listener to.
    #[arg(long, env = "BEACH_BEACON_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// Path that accepts websocket upgrades.
    #[arg(long, env = "BEACH_BEACON_WS_PATH", default_value = "/ws")]
    pub ws_path: String,

    /// Hard ceiling on how long a single connection may stay open.
    #[arg(
        long,
        env = "BEACH_BEACON_MAX_CONNECTION_LIFETIME_SECS",
        default_value_t = 86_400
    )]
    pub max_connection_lifetime_secs: u64,

    /// Grace period applied during shutdown.
    #[arg(long, env = "BEACH_BEACON_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        if !cli.ws_path.starts_with('/') {
            bail!("websocket path must start with '/': {}", cli.ws_path);
        }
        if RESERVED_PATHS.contains(&cli.ws_path.as_str()) {
            bail!("websocket path collides with a built-in route: {}", cli.ws_path);
        }
        if cli.max_connection_lifetime_secs == 0
            || cli.max_connection_lifetime_secs > MAX_CONNECTION_LIFETIME_SECS
        {
            bail!(
                "max connection lifetime must be between 1 and {} seconds, got {}",
                MAX_CONNECTION_LIFETIME_SECS,
                cli.max_connection_lifetime_secs
            );
        }

        Ok(ServerConfig {
            listen_addr,
            ws_path: cli.ws_path,
            max_connection_lifetime: Duration::from_secs(cli.max_connection_lifetime_secs),
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}
