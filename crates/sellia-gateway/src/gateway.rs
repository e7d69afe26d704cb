//! Control-Channel Gateway: accepts client upgrades, runs the per-client
//! receive loop, and dispatches inbound protocol messages (`spec.md` §4.6).

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::WebSocket;
use chrono::Utc;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use sellia_auth::{AuthError, AuthProvider};
use sellia_proto::{BasicAuthPair, Message, RateLimitInfo, TunnelKind};
use sellia_ratelimit::{RateLimitExceeded, RateLimiterConfig, RateLimiters, Scope};
use sellia_registry::{RegistryError, Tunnel, TunnelRegistry};
use sellia_transport_websocket::ControlChannel;

use crate::connections::{ClientConnection, ConnectionManager};
use crate::pending::{HttpEvent, PendingStore, TcpEvent, WsEvent};

/// Allocates and releases the public TCP port a `tcp` tunnel listens on.
/// Injected collaborator: `sellia-ingress-tcp` supplies the real
/// implementation; the gateway only needs the lifecycle hooks. `release`
/// must be a harmless no-op for a tunnel id it never provisioned, since the
/// gateway calls it unconditionally on tunnel teardown regardless of kind.
#[async_trait]
pub trait TunnelPortProvisioner: Send + Sync {
    async fn provision(&self, tunnel_id: &str) -> Result<u16, String>;
    async fn release(&self, tunnel_id: &str);
}

/// Tunable timeouts and identity the gateway needs to answer `tunnel_open`
/// and report `auth_ok` limits. Defaults match `spec.md` §5's timeout table.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_domain: String,
    pub use_https: bool,
    pub auth_timeout: Duration,
    pub heartbeat_period: Duration,
    pub stale_threshold: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_domain: "localhost".to_string(),
            use_https: false,
            auth_timeout: Duration::from_secs(10),
            heartbeat_period: Duration::from_secs(30),
            stale_threshold: Duration::from_secs(60),
        }
    }
}

/// Accepts control-channel upgrades and owns the receive loop and
/// heartbeat sweep for every connected client. One instance per server;
/// shared via `Arc` with every per-connection task.
pub struct ControlChannelGateway {
    config: GatewayConfig,
    auth: Arc<dyn AuthProvider>,
    registry: Arc<TunnelRegistry>,
    connections: Arc<ConnectionManager>,
    pending: Arc<PendingStore>,
    rate_limits: Arc<RateLimiters>,
    rate_limit_config: RateLimiterConfig,
    tcp_ports: Option<Arc<dyn TunnelPortProvisioner>>,
}

impl ControlChannelGateway {
    pub fn new(
        config: GatewayConfig,
        auth: Arc<dyn AuthProvider>,
        registry: Arc<TunnelRegistry>,
        rate_limit_config: RateLimiterConfig,
        tcp_ports: Option<Arc<dyn TunnelPortProvisioner>>,
    ) -> Arc<Self> {
        Self::with_shared_state(
            config,
            auth,
            registry,
            Arc::new(ConnectionManager::new()),
            Arc::new(PendingStore::new()),
            rate_limit_config,
            tcp_ports,
        )
    }

    /// Like [`Self::new`], but takes an already-constructed
    /// [`ConnectionManager`] and [`PendingStore`] instead of making fresh
    /// ones. Lets a caller hand the same instances to a collaborator that
    /// must exist before the gateway does, e.g. `sellia-ingress-tcp`'s
    /// `TcpIngress`, which the gateway in turn needs as its
    /// [`TunnelPortProvisioner`].
    pub fn with_shared_state(
        config: GatewayConfig,
        auth: Arc<dyn AuthProvider>,
        registry: Arc<TunnelRegistry>,
        connections: Arc<ConnectionManager>,
        pending: Arc<PendingStore>,
        rate_limit_config: RateLimiterConfig,
        tcp_ports: Option<Arc<dyn TunnelPortProvisioner>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            auth,
            registry,
            connections,
            pending,
            rate_limits: Arc::new(RateLimiters::new(rate_limit_config)),
            rate_limit_config,
            tcp_ports,
        })
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn registry(&self) -> &Arc<TunnelRegistry> {
        &self.registry
    }

    pub fn pending(&self) -> &Arc<PendingStore> {
        &self.pending
    }

    /// `spec.md` §4.6 upgrade-flow step 1: applied by the HTTP handler
    /// before calling `WebSocketUpgrade::on_upgrade`, since axum has
    /// already accepted the TCP connection by the time this crate sees it.
    pub fn check_connection_rate_limit(&self, source_ip: &str) -> Result<(), RateLimitExceeded> {
        self.rate_limits.check(Scope::Connection, source_ip)
    }

    /// `spec.md` §4.7 step 5: applied once per inbound public request,
    /// keyed by the tunnel id.
    pub fn check_request_rate_limit(&self, tunnel_id: &str) -> Result<(), RateLimitExceeded> {
        self.rate_limits.check(Scope::Request, tunnel_id)
    }

    /// Spawns the writer/reader tasks for `ws` and the per-connection
    /// receive-loop task. Fire-and-forget: the caller's HTTP handler
    /// returns as soon as the upgrade is handed off.
    pub fn accept(self: &Arc<Self>, ws: WebSocket) {
        let connection_id = Uuid::new_v4().to_string();
        let (channel, inbound) = sellia_transport_websocket::server::spawn(connection_id.clone(), ws);
        let gateway = self.clone();
        tokio::spawn(async move {
            gateway.run_connection(channel, inbound).await;
        });
    }

    /// Spawns the global heartbeat sweep. One sweep task serves every
    /// connection rather than one timer per connection, since `spec.md`
    /// §4.6 describes a single periodic pass over the connection table.
    pub fn spawn_heartbeat(self: &Arc<Self>) {
        let gateway = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(gateway.config.heartbeat_period);
            loop {
                tick.tick().await;
                gateway.sweep_once().await;
            }
        });
    }

    async fn sweep_once(&self) {
        let stale_ms = self.config.stale_threshold.as_millis() as i64;
        for connection in self.connections.iter() {
            if connection.idle_for_ms() > stale_ms {
                info!(connection_id = %connection.id, "closing stale connection");
                connection.channel.close();
                self.cleanup_connection(&connection).await;
                continue;
            }
            let ping = Message::Ping {
                timestamp_ms: Utc::now().timestamp_millis() as u64,
            };
            let _ = connection.channel.try_send(ping);
        }
        self.rate_limits.retain_recent();
    }

    async fn run_connection(self: Arc<Self>, channel: ControlChannel, mut inbound: mpsc::Receiver<Message>) {
        let connection_id = channel.id().to_string();

        let first = match timeout(self.config.auth_timeout, inbound.recv()).await {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                debug!(connection_id = %connection_id, "peer disconnected before auth");
                return;
            }
            Err(_) => {
                let _ = channel
                    .send(Message::AuthError {
                        reason: "timeout".to_string(),
                    })
                    .await;
                channel.close();
                return;
            }
        };

        let credential = match first {
            Message::Auth { credential } => credential,
            other => {
                warn!(connection_id = %connection_id, tag = other.tag(), "expected auth as first message");
                let _ = channel
                    .send(Message::AuthError {
                        reason: "expected auth".to_string(),
                    })
                    .await;
                channel.close();
                return;
            }
        };

        let account_id = match self.auth.validate(&credential).await {
            Ok(account_id) => account_id,
            Err(err) => {
                let reason = match err {
                    AuthError::Invalid => "invalid credential",
                    AuthError::Timeout => "timeout",
                };
                let _ = channel
                    .send(Message::AuthError {
                        reason: reason.to_string(),
                    })
                    .await;
                channel.close();
                return;
            }
        };

        let connection = self.connections.register(account_id.clone(), channel.clone());
        let limits = vec![
            ("connection".to_string(), rate_limit_info(self.rate_limit_config.connection)),
            ("tunnel".to_string(), rate_limit_info(self.rate_limit_config.tunnel)),
            ("request".to_string(), rate_limit_info(self.rate_limit_config.request)),
        ];
        if channel
            .send(Message::AuthOk {
                account_id: account_id.clone(),
                limits,
            })
            .await
            .is_err()
        {
            self.cleanup_connection(&connection).await;
            return;
        }

        debug!(connection_id = %connection.id, %account_id, "client authenticated");

        while let Some(msg) = inbound.recv().await {
            connection.touch();
            let tag = msg.tag();
            let outcome = AssertUnwindSafe(self.handle_message(&connection, msg)).catch_unwind().await;
            if outcome.is_err() {
                error!(connection_id = %connection.id, tag, "handler panicked; connection unaffected");
            }
        }

        self.cleanup_connection(&connection).await;
    }

    async fn handle_message(&self, connection: &Arc<ClientConnection>, msg: Message) {
        match msg {
            Message::Ping { timestamp_ms } => {
                let _ = connection.channel.send(Message::Pong { timestamp_ms }).await;
            }
            Message::Pong { .. } => {}
            Message::TunnelOpen {
                kind,
                local_port: _,
                requested_subdomain,
                basic_auth,
            } => {
                self.handle_tunnel_open(connection, kind, requested_subdomain, basic_auth).await;
            }
            Message::TunnelClose { tunnel_id, .. } => {
                self.teardown_tunnel(&tunnel_id).await;
            }
            Message::ResponseStart {
                request_id,
                status,
                headers,
            } => {
                if let Some(request) = self.pending.get(&request_id) {
                    request.deliver_http(HttpEvent::ResponseStart { status, headers });
                }
            }
            Message::ResponseBody { request_id, chunk } => {
                if let Some(request) = self.pending.get(&request_id) {
                    request.deliver_http(HttpEvent::ResponseBody { chunk });
                }
            }
            Message::ResponseEnd { request_id } => {
                if let Some(request) = self.pending.take(&request_id) {
                    request.deliver_http(HttpEvent::ResponseEnd);
                }
            }
            Message::WsUpgradeOk { request_id, headers } => {
                if let Some(request) = self.pending.get(&request_id) {
                    request.deliver_ws(WsEvent::UpgradeOk { headers });
                }
            }
            Message::WsUpgradeError { request_id, status } => {
                if let Some(request) = self.pending.take(&request_id) {
                    request.deliver_ws(WsEvent::UpgradeError { status });
                }
            }
            Message::WsFrame {
                request_id,
                opcode,
                payload,
                fin,
            } => {
                if let Some(request) = self.pending.get(&request_id) {
                    request.deliver_ws(WsEvent::Frame { opcode, payload, fin });
                }
            }
            Message::WsClose { request_id, code, reason } => {
                if let Some(request) = self.pending.take(&request_id) {
                    request.deliver_ws(WsEvent::Close { code, reason });
                }
            }
            Message::TcpOpenOk { connection_id } => {
                if let Some(request) = self.pending.get(&connection_id) {
                    request.deliver_tcp(TcpEvent::OpenOk);
                }
            }
            Message::TcpOpenError { connection_id, message } => {
                if let Some(request) = self.pending.take(&connection_id) {
                    request.deliver_tcp(TcpEvent::OpenError { message });
                }
            }
            Message::TcpData { connection_id, data } => {
                if let Some(request) = self.pending.get(&connection_id) {
                    request.deliver_tcp(TcpEvent::Data { data });
                }
            }
            Message::TcpClose { connection_id, reason } => {
                if let Some(request) = self.pending.take(&connection_id) {
                    request.deliver_tcp(TcpEvent::Close { reason });
                }
            }
            other => {
                warn!(connection_id = %connection.id, tag = other.tag(), "unexpected message from client");
            }
        }
    }

    async fn handle_tunnel_open(
        &self,
        connection: &Arc<ClientConnection>,
        kind: TunnelKind,
        requested_subdomain: Option<String>,
        basic_auth: Option<BasicAuthPair>,
    ) {
        if let Err(RateLimitExceeded { .. }) = self.rate_limits.check(Scope::Tunnel, &connection.id) {
            self.reject_tunnel_open(connection, "rate limit").await;
            return;
        }

        if let Some(pair) = &basic_auth {
            if pair.username.is_empty() {
                self.reject_tunnel_open(connection, "basic auth username must not be empty").await;
                return;
            }
        }

        let subdomain = match requested_subdomain {
            Some(name) => match self.registry.validate(&name) {
                Ok(normalized) => normalized,
                Err(reason) => {
                    self.reject_tunnel_open(connection, &reason).await;
                    return;
                }
            },
            None => match self.registry.generate_unique() {
                Ok(name) => name,
                Err(RegistryError::Exhausted) => {
                    self.reject_tunnel_open(connection, "could not allocate a unique subdomain").await;
                    return;
                }
                Err(other) => {
                    self.reject_tunnel_open(connection, &other.to_string()).await;
                    return;
                }
            },
        };

        let tunnel_id = Uuid::new_v4().to_string();
        let mut allocated_port = None;
        if matches!(kind, TunnelKind::Tcp) {
            match &self.tcp_ports {
                Some(provisioner) => match provisioner.provision(&tunnel_id).await {
                    Ok(port) => allocated_port = Some(port),
                    Err(reason) => {
                        self.reject_tunnel_open(connection, &reason).await;
                        return;
                    }
                },
                None => {
                    self.reject_tunnel_open(connection, "tcp tunnels are not enabled on this server").await;
                    return;
                }
            }
        }

        let tunnel = Tunnel {
            id: tunnel_id.clone(),
            subdomain: subdomain.clone(),
            client_id: connection.id.clone(),
            basic_auth,
            created_at: Utc::now(),
        };

        if let Err(err) = self.registry.register(tunnel) {
            if let Some(provisioner) = &self.tcp_ports {
                if allocated_port.is_some() {
                    provisioner.release(&tunnel_id).await;
                }
            }
            self.reject_tunnel_open(connection, &err.to_string()).await;
            return;
        }

        let public_url = self.public_url(&subdomain, kind, allocated_port);
        let _ = connection
            .channel
            .send(Message::TunnelReady {
                tunnel_id,
                public_url,
                subdomain,
            })
            .await;
    }

    async fn reject_tunnel_open(&self, connection: &Arc<ClientConnection>, reason: &str) {
        let _ = connection
            .channel
            .send(Message::TunnelClose {
                tunnel_id: String::new(),
                reason: Some(reason.to_string()),
            })
            .await;
    }

    fn public_url(&self, subdomain: &str, kind: TunnelKind, allocated_port: Option<u16>) -> String {
        match kind {
            TunnelKind::Http => {
                let scheme = if self.config.use_https { "https" } else { "http" };
                format!("{scheme}://{subdomain}.{}", self.config.base_domain)
            }
            TunnelKind::Tcp => {
                let host = self.config.base_domain.split(':').next().unwrap_or(&self.config.base_domain);
                let port = allocated_port.unwrap_or(0);
                format!("tcp://{host}:{port}")
            }
        }
    }

    /// Unregisters a single tunnel (client-initiated `tunnel_close`) and
    /// fails every pending request it owned, per `spec.md` §4.6.
    async fn teardown_tunnel(&self, tunnel_id: &str) {
        self.registry.unregister(tunnel_id);
        self.pending.remove_by_tunnel(tunnel_id);
        if let Some(provisioner) = &self.tcp_ports {
            provisioner.release(tunnel_id).await;
        }
    }

    /// Runs on connection close (clean disconnect, stale eviction, or
    /// auth/write failure): unregisters the connection, releases every
    /// tunnel it owned, fails their pending requests, and releases TCP
    /// listeners. Idempotent.
    async fn cleanup_connection(&self, connection: &Arc<ClientConnection>) {
        self.connections.unregister(&connection.id);
        let owned = self.registry.unregister_client(&connection.id);
        for tunnel in owned {
            self.pending.remove_by_tunnel(&tunnel.id);
            if let Some(provisioner) = &self.tcp_ports {
                provisioner.release(&tunnel.id).await;
            }
        }
        debug!(connection_id = %connection.id, "connection cleaned up");
    }
}

fn rate_limit_info(limits: sellia_ratelimit::ScopeLimits) -> RateLimitInfo {
    RateLimitInfo {
        capacity: limits.capacity,
        refill_per_sec: limits.refill_per_sec,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pending::{PendingRequest, PendingSink};
    use sellia_auth::MasterCredentialAuth;
    use sellia_registry::ReservedSubdomainSource;

    fn gateway() -> Arc<ControlChannelGateway> {
        ControlChannelGateway::new(
            GatewayConfig::default(),
            Arc::new(MasterCredentialAuth::new("secret", "acct-1")),
            Arc::new(TunnelRegistry::new(Arc::new(ReservedSubdomainSource::new()))),
            RateLimiterConfig::default(),
            None,
        )
    }

    fn connected(gateway: &Arc<ControlChannelGateway>) -> (Arc<ClientConnection>, mpsc::Receiver<Message>) {
        let (channel, rx) = ControlChannel::for_testing("conn-1");
        let connection = gateway.connections.register("acct-1".to_string(), channel);
        (connection, rx)
    }

    #[tokio::test]
    async fn tunnel_open_with_explicit_subdomain_succeeds() {
        let gateway = gateway();
        let (connection, mut rx) = connected(&gateway);

        gateway
            .handle_tunnel_open(&connection, TunnelKind::Http, Some("myapp".to_string()), None)
            .await;

        match rx.recv().await.unwrap() {
            Message::TunnelReady { subdomain, public_url, .. } => {
                assert_eq!(subdomain, "myapp");
                assert_eq!(public_url, "http://myapp.localhost");
            }
            other => panic!("expected tunnel_ready, got {other:?}"),
        }
        assert!(gateway.registry.lookup_by_subdomain("myapp").is_some());
    }

    #[tokio::test]
    async fn tunnel_open_rejects_reserved_subdomain() {
        let gateway = gateway();
        let (connection, mut rx) = connected(&gateway);

        gateway
            .handle_tunnel_open(&connection, TunnelKind::Http, Some("admin".to_string()), None)
            .await;

        match rx.recv().await.unwrap() {
            Message::TunnelClose { tunnel_id, reason } => {
                assert!(tunnel_id.is_empty());
                assert!(reason.unwrap().contains("reserved"));
            }
            other => panic!("expected tunnel_close, got {other:?}"),
        }
        assert!(gateway.registry.lookup_by_subdomain("admin").is_none());
    }

    #[tokio::test]
    async fn tunnel_open_without_tcp_provisioner_is_rejected() {
        let gateway = gateway();
        let (connection, mut rx) = connected(&gateway);

        gateway
            .handle_tunnel_open(&connection, TunnelKind::Tcp, Some("raw".to_string()), None)
            .await;

        match rx.recv().await.unwrap() {
            Message::TunnelClose { reason, .. } => {
                assert!(reason.unwrap().contains("not enabled"));
            }
            other => panic!("expected tunnel_close, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn teardown_tunnel_removes_registration_and_pending_requests() {
        let gateway = gateway();
        let (connection, mut rx) = connected(&gateway);

        gateway
            .handle_tunnel_open(&connection, TunnelKind::Http, Some("myapp".to_string()), None)
            .await;
        let tunnel_id = match rx.recv().await.unwrap() {
            Message::TunnelReady { tunnel_id, .. } => tunnel_id,
            other => panic!("expected tunnel_ready, got {other:?}"),
        };

        let (http_tx, mut http_rx) = mpsc::channel(4);
        gateway.pending.add(Arc::new(PendingRequest::new(
            "req-1".to_string(),
            tunnel_id.clone(),
            PendingSink::Http(http_tx),
        )));

        gateway.teardown_tunnel(&tunnel_id).await;

        assert!(gateway.registry.lookup_by_subdomain("myapp").is_none());
        assert!(gateway.pending.get("req-1").is_none());
        match http_rx.recv().await.unwrap() {
            HttpEvent::GatewayError { status, .. } => assert_eq!(status, 502),
            other => panic!("expected GatewayError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cleanup_connection_releases_owned_tunnels() {
        let gateway = gateway();
        let (connection, mut rx) = connected(&gateway);

        gateway
            .handle_tunnel_open(&connection, TunnelKind::Http, Some("myapp".to_string()), None)
            .await;
        let _ = rx.recv().await.unwrap();

        gateway.cleanup_connection(&connection).await;

        assert!(gateway.registry.lookup_by_subdomain("myapp").is_none());
        assert!(gateway.connections.lookup(&connection.id).is_none());
    }
}
