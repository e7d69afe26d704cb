//! Sellia tunnel client: dials a sellia server and exposes local ports as
//! public tunnels (`spec.md` §4.10).

mod config;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::Cli;
use sellia_client::ClientRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let log_level = cli.log_level.clone();
    let client_config = config::resolve(cli)?;
    init_logging(&log_level)?;

    info!(server_url = %client_config.server_url, "starting sellia client");
    for spec in &client_config.tunnels {
        info!("  {}", config::describe_tunnel(spec));
    }

    let runtime = ClientRuntime::new(client_config);

    tokio::select! {
        _ = runtime.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("received Ctrl+C, shutting down");
        }
    }

    Ok(())
}

fn init_logging(log_level: &str) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|err| anyhow::anyhow!(err))
}
