//! Client runtime configuration: one control channel, a desired set of
//! tunnels to (re)open on every connect (`spec.md` §4.10).

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::routing::RouteTable;
use sellia_proto::{BasicAuthPair, TunnelKind};

/// One tunnel the client wants open. Re-sent as a fresh `tunnel_open` on
/// every (re)connect; the server is the source of truth for the assigned
/// subdomain otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSpec {
    pub kind: TunnelKind,
    pub local_port: u16,
    #[serde(default)]
    pub requested_subdomain: Option<String>,
    #[serde(default)]
    pub basic_auth: Option<BasicAuthPair>,
    /// Path-routing table for `http` tunnels; `tcp` tunnels ignore this and
    /// dial `local_port` directly.
    #[serde(default)]
    pub routes: RouteTable,
}

impl TunnelSpec {
    pub fn http(local_port: u16) -> Self {
        Self {
            kind: TunnelKind::Http,
            local_port,
            requested_subdomain: None,
            basic_auth: None,
            routes: RouteTable::default(),
        }
    }

    pub fn tcp(local_port: u16) -> Self {
        Self {
            kind: TunnelKind::Tcp,
            local_port,
            requested_subdomain: None,
            basic_auth: None,
            routes: RouteTable::default(),
        }
    }
}

/// Top-level client configuration, loadable from TOML by `sellia-cli`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub server_url: String,
    pub credential: String,
    #[serde(default = "default_local_host")]
    pub local_host: String,
    #[serde(default)]
    pub tunnels: Vec<TunnelSpec>,
    #[serde(with = "duration_secs", default = "default_ping_interval")]
    pub ping_interval: Duration,
    #[serde(with = "duration_secs", default = "default_backoff_step")]
    pub backoff_step: Duration,
    #[serde(with = "duration_secs", default = "default_backoff_max")]
    pub backoff_max: Duration,
}

fn default_local_host() -> String {
    "127.0.0.1".to_string()
}

fn default_ping_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_backoff_step() -> Duration {
    Duration::from_secs(1)
}

fn default_backoff_max() -> Duration {
    Duration::from_secs(30)
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:8080/ws".to_string(),
            credential: String::new(),
            local_host: default_local_host(),
            tunnels: Vec::new(),
            ping_interval: default_ping_interval(),
            backoff_step: default_backoff_step(),
            backoff_max: default_backoff_max(),
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
