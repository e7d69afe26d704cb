//! TCP Ingress: allocates a public port per `tcp` tunnel from a configured
//! range, binds a listener, and bridges each accepted connection through
//! the owning tunnel's control channel (`spec.md` §4.9).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use sellia_gateway::{ConnectionManager, PendingRequest, PendingSink, PendingStore, TcpEvent, TunnelPortProvisioner};
use sellia_proto::Message;
use sellia_registry::TunnelRegistry;

/// Byte size of each chunk pumped across a bridged TCP connection.
/// `spec.md` §4.9 step 4 caps this at 64 KiB.
const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct TcpIngressConfig {
    pub bind_host: String,
    pub port_range: (u16, u16),
    pub open_timeout: Duration,
}

impl Default for TcpIngressConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            port_range: (20000, 20100),
            open_timeout: Duration::from_secs(10),
        }
    }
}

struct BoundListener {
    port: u16,
    accept_task: JoinHandle<()>,
    closed: Arc<AtomicBool>,
}

/// One listener per live `tcp` tunnel, keyed by tunnel id. Implements
/// [`TunnelPortProvisioner`] so `sellia-gateway` can provision and release
/// ports without depending on this crate's listener machinery directly.
///
/// Holds the three gateway collaborators it actually needs (not the gateway
/// itself), since the gateway is constructed with this provisioner already
/// wired in via `ControlChannelGateway::new` — holding the gateway back
/// would make the two types construct each other.
pub struct TcpIngress {
    registry: Arc<TunnelRegistry>,
    connections: Arc<ConnectionManager>,
    pending: Arc<PendingStore>,
    config: TcpIngressConfig,
    listeners: DashMap<String, BoundListener>,
}

impl TcpIngress {
    pub fn new(
        registry: Arc<TunnelRegistry>,
        connections: Arc<ConnectionManager>,
        pending: Arc<PendingStore>,
        config: TcpIngressConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            connections,
            pending,
            config,
            listeners: DashMap::new(),
        })
    }

    async fn bind_in_range(&self) -> Result<TcpListener, String> {
        let (start, end) = self.config.port_range;
        for port in start..=end {
            let addr: SocketAddr = format!("{}:{port}", self.config.bind_host)
                .parse()
                .map_err(|err| format!("invalid bind address: {err}"))?;
            if let Ok(listener) = TcpListener::bind(addr).await {
                return Ok(listener);
            }
        }
        Err(format!("no free port in range {start}-{end}"))
    }
}

#[async_trait]
impl TunnelPortProvisioner for TcpIngress {
    async fn provision(&self, tunnel_id: &str) -> Result<u16, String> {
        let listener = self.bind_in_range().await?;
        let port = listener
            .local_addr()
            .map_err(|err| err.to_string())?
            .port();

        let closed = Arc::new(AtomicBool::new(false));
        let registry = self.registry.clone();
        let connections = self.connections.clone();
        let pending = self.pending.clone();
        let config = self.config.clone();
        let task_tunnel_id = tunnel_id.to_string();
        let task_closed = closed.clone();
        let accept_task = tokio::spawn(async move {
            accept_loop(listener, registry, connections, pending, config, task_tunnel_id, task_closed).await;
        });

        self.listeners.insert(
            tunnel_id.to_string(),
            BoundListener {
                port,
                accept_task,
                closed,
            },
        );
        info!(tunnel_id, port, "tcp ingress listener bound");
        Ok(port)
    }

    async fn release(&self, tunnel_id: &str) {
        if let Some((_, listener)) = self.listeners.remove(tunnel_id) {
            listener.closed.store(true, Ordering::Release);
            listener.accept_task.abort();
            debug!(tunnel_id, port = listener.port, "tcp ingress listener released");
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    registry: Arc<TunnelRegistry>,
    connections: Arc<ConnectionManager>,
    pending: Arc<PendingStore>,
    config: TcpIngressConfig,
    tunnel_id: String,
    closed: Arc<AtomicBool>,
) {
    loop {
        let (socket, remote_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(tunnel_id, %err, "tcp ingress accept failed");
                continue;
            }
        };
        if closed.load(Ordering::Acquire) {
            return;
        }

        let registry = registry.clone();
        let connections = connections.clone();
        let pending = pending.clone();
        let config = config.clone();
        let tunnel_id = tunnel_id.clone();
        tokio::spawn(async move {
            handle_connection(registry, connections, pending, &config, &tunnel_id, socket, remote_addr).await;
        });
    }
}

async fn handle_connection(
    registry: Arc<TunnelRegistry>,
    connections: Arc<ConnectionManager>,
    pending: Arc<PendingStore>,
    config: &TcpIngressConfig,
    tunnel_id: &str,
    mut socket: TcpStream,
    remote_addr: SocketAddr,
) {
    let Some(tunnel) = registry.lookup_by_id(tunnel_id) else {
        debug!(tunnel_id, "tcp tunnel no longer registered; dropping connection");
        return;
    };
    let Some(connection) = connections.lookup(&tunnel.client_id) else {
        debug!(tunnel_id, "tcp tunnel client disconnected; dropping connection");
        return;
    };

    let connection_id = Uuid::new_v4().to_string();
    let (tx, mut rx) = mpsc::channel::<TcpEvent>(64);
    let pending_request = Arc::new(PendingRequest::new(
        connection_id.clone(),
        tunnel_id.to_string(),
        PendingSink::Tcp(tx),
    ));
    pending.add(pending_request);

    if connection
        .channel
        .send(Message::TcpOpen {
            connection_id: connection_id.clone(),
            tunnel_id: tunnel_id.to_string(),
            remote_addr: remote_addr.to_string(),
        })
        .await
        .is_err()
    {
        pending.take(&connection_id);
        return;
    }

    match timeout(config.open_timeout, rx.recv()).await {
        Ok(Some(TcpEvent::OpenOk)) => {}
        Ok(Some(TcpEvent::OpenError { message })) => {
            debug!(connection_id, %message, "tcp tunnel client rejected connection");
            pending.take(&connection_id);
            return;
        }
        Ok(Some(_)) | Ok(None) => {
            pending.take(&connection_id);
            return;
        }
        Err(_) => {
            debug!(connection_id, "tcp open timed out");
            pending.take(&connection_id);
            return;
        }
    }

    let (mut read_half, mut write_half) = socket.split();
    let channel = connection.channel.clone();
    let up_connection_id = connection_id.clone();
    let upstream = async move {
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = match read_half.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) => {
                    debug!(connection_id = up_connection_id, %err, "public tcp read error");
                    break;
                }
            };
            if channel
                .send(Message::TcpData {
                    connection_id: up_connection_id.clone(),
                    data: buf[..n].to_vec(),
                })
                .await
                .is_err()
            {
                break;
            }
        }
        let _ = channel
            .send(Message::TcpClose {
                connection_id: up_connection_id.clone(),
                reason: None,
            })
            .await;
    };

    let downstream = async move {
        while let Some(event) = rx.recv().await {
            match event {
                TcpEvent::Data { data } => {
                    if write_half.write_all(&data).await.is_err() {
                        break;
                    }
                }
                TcpEvent::Close { .. } => break,
                TcpEvent::OpenOk | TcpEvent::OpenError { .. } => {}
            }
        }
        let _ = write_half.shutdown().await;
    };

    tokio::join!(upstream, downstream);
    pending.take(&connection_id);
    debug!(connection_id, "tcp bridge ended");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_a_non_empty_port_range() {
        let config = TcpIngressConfig::default();
        assert!(config.port_range.0 < config.port_range.1);
    }
}
