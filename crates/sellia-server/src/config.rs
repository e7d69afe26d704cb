//! Server configuration: CLI flags (with env fallback) merged over an
//! optional TOML file, mirroring the client runtime's config shape.

use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "sellia-server")]
#[command(about = "Run a sellia tunnel server", long_about = None)]
pub struct Cli {
    /// Path to a TOML config file. CLI flags below override its values.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Public-facing HTTP/WS bind address.
    #[arg(long)]
    pub bind_addr: Option<SocketAddr>,

    /// Base domain tunnels are minted under, e.g. "example.com".
    #[arg(long)]
    pub base_domain: Option<String>,

    /// Serve tunnel URLs as https:// instead of http://.
    #[arg(long)]
    pub use_https: bool,

    /// Master credential clients authenticate the control channel with.
    #[arg(long, env = "SELLIA_MASTER_CREDENTIAL")]
    pub master_credential: Option<String>,

    /// Enable raw `tcp` tunnels, binding public listeners in this range
    /// (format: "20000-20100").
    #[arg(long)]
    pub tcp_port_range: Option<String>,

    /// Log level / EnvFilter directive (e.g. "info", "sellia_gateway=debug").
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// The subset of configuration loadable from a TOML file. Every field is
/// optional so a file can specify as little or as much as it likes; CLI
/// flags always win over a file value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    pub bind_addr: Option<SocketAddr>,
    pub base_domain: Option<String>,
    pub use_https: Option<bool>,
    pub master_credential: Option<String>,
    pub tcp_port_range: Option<String>,
}

/// Fully resolved settings the binary runs with, after merging CLI flags
/// over an optional file and applying defaults.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub bind_addr: SocketAddr,
    pub base_domain: String,
    pub use_https: bool,
    pub master_credential: String,
    pub tcp_port_range: Option<(u16, u16)>,
}

impl ServerSettings {
    pub fn resolve(cli: Cli) -> anyhow::Result<Self> {
        let file = match &cli.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .map_err(|err| anyhow::anyhow!("failed to read {}: {err}", path.display()))?;
                toml::from_str(&text)
                    .map_err(|err| anyhow::anyhow!("failed to parse {}: {err}", path.display()))?
            }
            None => FileConfig::default(),
        };

        let bind_addr = cli
            .bind_addr
            .or(file.bind_addr)
            .unwrap_or_else(|| "0.0.0.0:8080".parse().expect("valid default addr"));
        let base_domain = cli
            .base_domain
            .or(file.base_domain)
            .unwrap_or_else(|| "localhost".to_string());
        let use_https = cli.use_https || file.use_https.unwrap_or(false);
        let master_credential = cli
            .master_credential
            .or(file.master_credential)
            .ok_or_else(|| anyhow::anyhow!("master_credential must be set via --master-credential, SELLIA_MASTER_CREDENTIAL, or the config file"))?;
        let tcp_port_range = cli
            .tcp_port_range
            .or(file.tcp_port_range)
            .map(|range| parse_port_range(&range))
            .transpose()?;

        Ok(Self {
            bind_addr,
            base_domain,
            use_https,
            master_credential,
            tcp_port_range,
        })
    }
}

fn parse_port_range(range: &str) -> anyhow::Result<(u16, u16)> {
    let (start, end) = range
        .split_once('-')
        .ok_or_else(|| anyhow::anyhow!("invalid port range {range:?}, expected START-END"))?;
    let start: u16 = start.parse()?;
    let end: u16 = end.parse()?;
    if start >= end {
        return Err(anyhow::anyhow!("port range start must be less than end"));
    }
    Ok((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_port_range_accepts_well_formed_input() {
        assert_eq!(parse_port_range("20000-20100").unwrap(), (20000, 20100));
    }

    #[test]
    fn parse_port_range_rejects_inverted_range() {
        assert!(parse_port_range("20100-20000").is_err());
    }
}
