//! CLI flags merged over an optional TOML config file into a
//! [`sellia_client::ClientConfig`], mirroring the server binary's config
//! layering.

use clap::Parser;
use std::path::PathBuf;

use sellia_client::{ClientConfig, TunnelSpec};
use sellia_proto::TunnelKind;

#[derive(Parser, Debug)]
#[command(name = "sellia")]
#[command(about = "Expose a local port through a sellia tunnel server", long_about = None)]
pub struct Cli {
    /// Path to a TOML config file describing the server and tunnels to open.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Server control-channel URL, e.g. "ws://example.com/ws".
    #[arg(long, env = "SELLIA_SERVER_URL")]
    pub server_url: Option<String>,

    /// Credential the server authenticates the control channel with.
    #[arg(long, env = "SELLIA_CREDENTIAL")]
    pub credential: Option<String>,

    /// Expose this local port as a single `http` tunnel (standalone mode).
    /// Ignored if the config file already lists tunnels.
    #[arg(long)]
    pub http: Option<u16>,

    /// Expose this local port as a single `tcp` tunnel (standalone mode).
    /// Ignored if the config file already lists tunnels.
    #[arg(long)]
    pub tcp: Option<u16>,

    /// Request this subdomain for the standalone tunnel above.
    #[arg(long)]
    pub subdomain: Option<String>,

    /// Log level / EnvFilter directive (e.g. "info", "sellia_client=debug").
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Loads the optional TOML file named by `cli.config`, layers the CLI flags
/// over it, and falls back to a single standalone tunnel built from
/// `--http`/`--tcp` when the file lists none.
pub fn resolve(cli: Cli) -> anyhow::Result<ClientConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .map_err(|err| anyhow::anyhow!("failed to read {}: {err}", path.display()))?;
            toml::from_str(&text)
                .map_err(|err| anyhow::anyhow!("failed to parse {}: {err}", path.display()))?
        }
        None => ClientConfig::default(),
    };

    if let Some(server_url) = cli.server_url {
        config.server_url = server_url;
    }
    if let Some(credential) = cli.credential {
        config.credential = credential;
    }

    if config.tunnels.is_empty() {
        if let Some(port) = cli.http {
            let mut spec = TunnelSpec::http(port);
            spec.requested_subdomain = cli.subdomain.clone();
            config.tunnels.push(spec);
        } else if let Some(port) = cli.tcp {
            let mut spec = TunnelSpec::tcp(port);
            spec.requested_subdomain = cli.subdomain.clone();
            config.tunnels.push(spec);
        }
    }

    if config.credential.is_empty() {
        anyhow::bail!("credential must be set via --credential, SELLIA_CREDENTIAL, or the config file");
    }
    if config.tunnels.is_empty() {
        anyhow::bail!("no tunnels configured; pass --http <port>, --tcp <port>, or list [[tunnels]] in --config");
    }

    Ok(config)
}

pub fn describe_tunnel(spec: &TunnelSpec) -> String {
    match spec.kind {
        TunnelKind::Http => format!("http -> 127.0.0.1:{}", spec.local_port),
        TunnelKind::Tcp => format!("tcp -> 127.0.0.1:{}", spec.local_port),
    }
}
