//! Client runtime: dials the server, authenticates, opens the configured
//! tunnels, and bridges inbound protocol traffic to local services
//! (`spec.md` §4.10).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use http_body_util::{BodyExt, Full};
use hyper::Request;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use sellia_proto::{HeaderList, Message, TunnelKind, WsOpcode};
use sellia_transport_websocket::ControlChannel;

use crate::backoff::Backoff;
use crate::config::{ClientConfig, TunnelSpec};
use crate::dial::LocalDialer;

const AUTH_TIMEOUT: Duration = Duration::from_secs(10);
const TUNNEL_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything the runtime needs to know about one live tunnel to route
/// inbound traffic for it.
#[derive(Clone)]
struct LiveTunnel {
    spec: TunnelSpec,
    public_url: String,
}

enum HttpBodyChunk {
    Data(Vec<u8>),
    End,
}

enum WsInbound {
    Frame { opcode: WsOpcode, payload: Vec<u8>, fin: bool },
    Close,
}

enum TcpInbound {
    Data(Vec<u8>),
    Close,
}

/// Drives one logical client session: connect, authenticate, open tunnels,
/// reconnect with backoff on any disconnect. Runs until cancelled; callers
/// typically `tokio::spawn` this and hold the `JoinHandle`.
pub struct ClientRuntime {
    config: ClientConfig,
    dialer: Arc<LocalDialer>,
}

impl ClientRuntime {
    pub fn new(config: ClientConfig) -> Self {
        let dialer = Arc::new(LocalDialer::new(config.local_host.clone()));
        Self { config, dialer }
    }

    /// Connects, runs until the connection drops, then reconnects with
    /// backoff. Never returns under normal operation.
    pub async fn run(&self) {
        let mut backoff = Backoff::new(self.config.backoff_step, self.config.backoff_max);

        loop {
            let delay = backoff.next_delay();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            match self.run_once(&mut backoff).await {
                Ok(()) => debug!("control channel closed cleanly"),
                Err(err) => warn!(%err, "control channel session ended"),
            }
        }
    }

    async fn run_once(&self, backoff: &mut Backoff) -> Result<(), String> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(&self.config.server_url)
            .await
            .map_err(|err| format!("failed to connect to {}: {err}", self.config.server_url))?;

        let connection_id = uuid::Uuid::new_v4().to_string();
        let (channel, mut inbound) = sellia_transport_websocket::client::spawn(connection_id, ws_stream);

        channel
            .send(Message::Auth {
                credential: self.config.credential.clone(),
            })
            .await
            .map_err(|_| "channel closed before auth could be sent".to_string())?;

        match timeout(AUTH_TIMEOUT, inbound.recv()).await {
            Ok(Some(Message::AuthOk { account_id, .. })) => {
                info!(%account_id, "authenticated");
                backoff.reset();
            }
            Ok(Some(Message::AuthError { reason })) => {
                return Err(format!("authentication rejected: {reason}"));
            }
            Ok(Some(other)) => return Err(format!("expected auth_ok, got {}", other.tag())),
            Ok(None) => return Err("connection closed before auth reply".to_string()),
            Err(_) => return Err("timed out waiting for auth reply".to_string()),
        }

        let mut live: HashMap<String, LiveTunnel> = HashMap::new();
        for spec in &self.config.tunnels {
            match self.open_tunnel(&channel, &mut inbound, spec).await {
                Ok((tunnel_id, public_url)) => {
                    info!(%tunnel_id, %public_url, "tunnel open");
                    live.insert(
                        tunnel_id,
                        LiveTunnel {
                            spec: spec.clone(),
                            public_url,
                        },
                    );
                }
                Err(reason) => {
                    warn!(%reason, local_port = spec.local_port, "tunnel open rejected");
                }
            }
        }

        self.serve(channel, inbound, live).await;
        Ok(())
    }

    async fn open_tunnel(
        &self,
        channel: &ControlChannel,
        inbound: &mut mpsc::Receiver<Message>,
        spec: &TunnelSpec,
    ) -> Result<(String, String), String> {
        channel
            .send(Message::TunnelOpen {
                kind: spec.kind,
                local_port: spec.local_port,
                requested_subdomain: spec.requested_subdomain.clone(),
                basic_auth: spec.basic_auth.clone(),
            })
            .await
            .map_err(|_| "channel closed while opening tunnel".to_string())?;

        loop {
            match timeout(TUNNEL_OPEN_TIMEOUT, inbound.recv()).await {
                Ok(Some(Message::TunnelReady {
                    tunnel_id,
                    public_url,
                    ..
                })) => return Ok((tunnel_id, public_url)),
                Ok(Some(Message::TunnelClose { reason, .. })) => {
                    return Err(reason.unwrap_or_else(|| "rejected".to_string()));
                }
                Ok(Some(Message::Ping { timestamp_ms })) => {
                    let _ = channel.send(Message::Pong { timestamp_ms }).await;
                }
                Ok(Some(other)) => {
                    debug!(tag = other.tag(), "ignoring unrelated message during tunnel setup");
                }
                Ok(None) => return Err("channel closed while opening tunnel".to_string()),
                Err(_) => return Err("timed out waiting for tunnel_ready".to_string()),
            }
        }
    }

    async fn serve(
        &self,
        channel: ControlChannel,
        mut inbound: mpsc::Receiver<Message>,
        live: HashMap<String, LiveTunnel>,
    ) {
        let live = Arc::new(live);
        let http_chunks: Arc<DashMap<String, mpsc::Sender<HttpBodyChunk>>> = Arc::new(DashMap::new());
        let ws_inbound: Arc<DashMap<String, mpsc::Sender<WsInbound>>> = Arc::new(DashMap::new());
        let tcp_inbound: Arc<DashMap<String, mpsc::Sender<TcpInbound>>> = Arc::new(DashMap::new());

        let mut ping_tick = tokio::time::interval(self.config.ping_interval);
        ping_tick.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                _ = ping_tick.tick() => {
                    let timestamp_ms = chrono_timestamp_ms();
                    if channel.send(Message::Ping { timestamp_ms }).await.is_err() {
                        return;
                    }
                }
                msg = inbound.recv() => {
                    let Some(msg) = msg else { return };
                    self.dispatch(&channel, msg, &live, &http_chunks, &ws_inbound, &tcp_inbound).await;
                }
            }
        }
    }

    async fn dispatch(
        &self,
        channel: &ControlChannel,
        msg: Message,
        live: &Arc<HashMap<String, LiveTunnel>>,
        http_chunks: &Arc<DashMap<String, mpsc::Sender<HttpBodyChunk>>>,
        ws_inbound: &Arc<DashMap<String, mpsc::Sender<WsInbound>>>,
        tcp_inbound: &Arc<DashMap<String, mpsc::Sender<TcpInbound>>>,
    ) {
        match msg {
            Message::Ping { timestamp_ms } => {
                let _ = channel.send(Message::Pong { timestamp_ms }).await;
            }
            Message::Pong { .. } => {}
            Message::TunnelClose { tunnel_id, reason } => {
                info!(%tunnel_id, ?reason, "tunnel closed by server");
            }
            Message::RequestStart {
                request_id,
                tunnel_id,
                method,
                path,
                headers,
            } => {
                let Some(tunnel) = live.get(&tunnel_id).cloned() else {
                    warn!(%tunnel_id, "request_start for unknown tunnel");
                    return;
                };
                let (tx, rx) = mpsc::channel(32);
                http_chunks.insert(request_id.clone(), tx);
                let channel = channel.clone();
                let dialer = self.dialer.clone();
                let http_chunks = http_chunks.clone();
                tokio::spawn(async move {
                    handle_http_request(channel, dialer, tunnel, request_id.clone(), method, path, headers, rx).await;
                    http_chunks.remove(&request_id);
                });
            }
            Message::RequestBody {
                request_id,
                chunk,
                is_final,
            } => {
                if let Some(tx) = http_chunks.get(&request_id) {
                    if !chunk.is_empty() {
                        let _ = tx.send(HttpBodyChunk::Data(chunk)).await;
                    }
                    if is_final {
                        let _ = tx.send(HttpBodyChunk::End).await;
                    }
                }
            }
            Message::WsUpgrade {
                request_id,
                tunnel_id,
                path,
                headers,
            } => {
                let Some(tunnel) = live.get(&tunnel_id).cloned() else {
                    let _ = channel
                        .send(Message::WsUpgradeError {
                            request_id,
                            status: 502,
                        })
                        .await;
                    return;
                };
                let (tx, rx) = mpsc::channel(64);
                ws_inbound.insert(request_id.clone(), tx);
                let channel = channel.clone();
                let dialer = self.dialer.clone();
                let ws_inbound = ws_inbound.clone();
                tokio::spawn(async move {
                    handle_ws_bridge(channel, dialer, tunnel, request_id.clone(), path, headers, rx).await;
                    ws_inbound.remove(&request_id);
                });
            }
            Message::WsFrame {
                request_id,
                opcode,
                payload,
                fin,
            } => {
                if let Some(tx) = ws_inbound.get(&request_id) {
                    let _ = tx.send(WsInbound::Frame { opcode, payload, fin }).await;
                }
            }
            Message::WsClose { request_id, .. } => {
                if let Some((_, tx)) = ws_inbound.remove(&request_id) {
                    let _ = tx.send(WsInbound::Close).await;
                }
            }
            Message::TcpOpen {
                connection_id,
                tunnel_id,
                remote_addr,
            } => {
                let Some(tunnel) = live.get(&tunnel_id).cloned() else {
                    let _ = channel
                        .send(Message::TcpOpenError {
                            connection_id,
                            message: "unknown tunnel".to_string(),
                        })
                        .await;
                    return;
                };
                let (tx, rx) = mpsc::channel(64);
                tcp_inbound.insert(connection_id.clone(), tx);
                let channel = channel.clone();
                let dialer = self.dialer.clone();
                let tcp_inbound = tcp_inbound.clone();
                tokio::spawn(async move {
                    handle_tcp_bridge(channel, dialer, tunnel, connection_id.clone(), remote_addr, rx).await;
                    tcp_inbound.remove(&connection_id);
                });
            }
            Message::TcpData { connection_id, data } => {
                if let Some(tx) = tcp_inbound.get(&connection_id) {
                    let _ = tx.send(TcpInbound::Data(data)).await;
                }
            }
            Message::TcpClose { connection_id, .. } => {
                if let Some((_, tx)) = tcp_inbound.remove(&connection_id) {
                    let _ = tx.send(TcpInbound::Close).await;
                }
            }
            other => {
                debug!(tag = other.tag(), "ignoring message not expected on the client side");
            }
        }
    }
}

fn resolve_path(tunnel: &LiveTunnel, path: &str) -> Option<String> {
    let routes = &tunnel.spec.routes;
    if routes.rules.is_empty() && routes.fallback.is_none() {
        return Some(path.to_string());
    }
    routes.resolve(path).map(str::to_string)
}

async fn handle_http_request(
    channel: ControlChannel,
    dialer: Arc<LocalDialer>,
    tunnel: LiveTunnel,
    request_id: String,
    method: String,
    path: String,
    headers: HeaderList,
    mut body_rx: mpsc::Receiver<HttpBodyChunk>,
) {
    let mut body = Vec::new();
    while let Some(chunk) = body_rx.recv().await {
        match chunk {
            HttpBodyChunk::Data(bytes) => body.extend_from_slice(&bytes),
            HttpBodyChunk::End => break,
        }
    }

    let Some(target_path) = resolve_path(&tunnel, &path) else {
        send_http_error(&channel, &request_id, 502, "no route matched").await;
        return;
    };

    let mut builder = Request::builder().method(method.as_str()).uri(target_path);
    for (name, value) in &headers {
        builder = builder.header(name, value);
    }
    let request = match builder.body(Full::new(Bytes::from(body))) {
        Ok(request) => request,
        Err(err) => {
            send_http_error(&channel, &request_id, 502, &err.to_string()).await;
            return;
        }
    };

    let response = match dialer.send_http(tunnel.spec.local_port, request).await {
        Ok(response) => response,
        Err(err) => {
            send_http_error(&channel, &request_id, 502, &err.to_string()).await;
            return;
        }
    };

    let status = response.status().as_u16();
    let response_headers: HeaderList = response
        .headers()
        .iter()
        .map(|(name, value)| (name.to_string(), value.to_str().unwrap_or("").to_string()))
        .collect();

    if channel
        .send(Message::ResponseStart {
            request_id: request_id.clone(),
            status,
            headers: response_headers,
        })
        .await
        .is_err()
    {
        return;
    }

    let body_bytes = match response.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            debug!(%err, "failed to read local response body");
            let _ = channel.send(Message::ResponseEnd { request_id }).await;
            return;
        }
    };

    if !body_bytes.is_empty() {
        let _ = channel
            .send(Message::ResponseBody {
                request_id: request_id.clone(),
                chunk: body_bytes.to_vec(),
            })
            .await;
    }
    let _ = channel.send(Message::ResponseEnd { request_id }).await;
}

async fn send_http_error(channel: &ControlChannel, request_id: &str, status: u16, message: &str) {
    let _ = channel
        .send(Message::ResponseStart {
            request_id: request_id.to_string(),
            status,
            headers: vec![("content-type".to_string(), "text/plain".to_string())],
        })
        .await;
    let _ = channel
        .send(Message::ResponseBody {
            request_id: request_id.to_string(),
            chunk: message.as_bytes().to_vec(),
        })
        .await;
    let _ = channel
        .send(Message::ResponseEnd {
            request_id: request_id.to_string(),
        })
        .await;
}

async fn handle_ws_bridge(
    channel: ControlChannel,
    dialer: Arc<LocalDialer>,
    tunnel: LiveTunnel,
    request_id: String,
    path: String,
    headers: HeaderList,
    mut from_server: mpsc::Receiver<WsInbound>,
) {
    let (local_ws, response) = match dialer.dial_ws(tunnel.spec.local_port, &path, &headers).await {
        Ok(pair) => pair,
        Err(err) => {
            warn!(%err, %request_id, "local websocket dial failed");
            let _ = channel
                .send(Message::WsUpgradeError {
                    request_id,
                    status: 502,
                })
                .await;
            return;
        }
    };

    let response_headers: HeaderList = response
        .headers()
        .iter()
        .map(|(name, value)| (name.to_string(), value.to_str().unwrap_or("").to_string()))
        .collect();
    if channel
        .send(Message::WsUpgradeOk {
            request_id: request_id.clone(),
            headers: response_headers,
        })
        .await
        .is_err()
    {
        return;
    }

    let (mut local_sink, mut local_stream) = local_ws.split();

    let to_server = {
        let channel = channel.clone();
        let request_id = request_id.clone();
        async move {
            while let Some(frame) = local_stream.next().await {
                let Ok(frame) = frame else { break };
                let (opcode, payload) = match frame {
                    WsMessage::Text(text) => (WsOpcode::Text, text.into_bytes()),
                    WsMessage::Binary(bytes) => (WsOpcode::Binary, bytes),
                    WsMessage::Ping(bytes) => (WsOpcode::Ping, bytes),
                    WsMessage::Pong(bytes) => (WsOpcode::Pong, bytes),
                    WsMessage::Close(_) => break,
                    WsMessage::Frame(_) => continue,
                };
                if channel
                    .send(Message::WsFrame {
                        request_id: request_id.clone(),
                        opcode,
                        payload,
                        fin: true,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            let _ = channel
                .send(Message::WsClose {
                    request_id: request_id.clone(),
                    code: None,
                    reason: None,
                })
                .await;
        }
    };

    let from_server_direction = async move {
        while let Some(event) = from_server.recv().await {
            let outgoing = match event {
                WsInbound::Frame { opcode, payload, .. } => match opcode {
                    WsOpcode::Text => WsMessage::Text(String::from_utf8_lossy(&payload).into_owned()),
                    WsOpcode::Binary => WsMessage::Binary(payload),
                    WsOpcode::Ping => WsMessage::Ping(payload),
                    WsOpcode::Pong => WsMessage::Pong(payload),
                    WsOpcode::Close => break,
                },
                WsInbound::Close => break,
            };
            if local_sink.send(outgoing).await.is_err() {
                break;
            }
        }
        let _ = local_sink.close().await;
    };

    tokio::join!(to_server, from_server_direction);
}

async fn handle_tcp_bridge(
    channel: ControlChannel,
    dialer: Arc<LocalDialer>,
    tunnel: LiveTunnel,
    connection_id: String,
    remote_addr: String,
    mut from_server: mpsc::Receiver<TcpInbound>,
) {
    let mut stream = match dialer.dial_tcp(tunnel.spec.local_port).await {
        Ok(stream) => stream,
        Err(err) => {
            warn!(%err, %remote_addr, "local tcp dial failed");
            let _ = channel
                .send(Message::TcpOpenError {
                    connection_id,
                    message: err.to_string(),
                })
                .await;
            return;
        }
    };

    if channel
        .send(Message::TcpOpenOk {
            connection_id: connection_id.clone(),
        })
        .await
        .is_err()
    {
        return;
    }

    let (mut read_half, mut write_half) = stream.split();

    let upstream = {
        let channel = channel.clone();
        let connection_id = connection_id.clone();
        async move {
            let mut buf = [0u8; 64 * 1024];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if channel
                            .send(Message::TcpData {
                                connection_id: connection_id.clone(),
                                data: buf[..n].to_vec(),
                            })
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
            let _ = channel
                .send(Message::TcpClose {
                    connection_id: connection_id.clone(),
                    reason: None,
                })
                .await;
        }
    };

    let downstream = async move {
        while let Some(event) = from_server.recv().await {
            match event {
                TcpInbound::Data(data) => {
                    if write_half.write_all(&data).await.is_err() {
                        break;
                    }
                }
                TcpInbound::Close => break,
            }
        }
        let _ = write_half.shutdown().await;
    };

    tokio::join!(upstream, downstream);
}

fn chrono_timestamp_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::{RouteRule, RouteTable};

    fn tunnel_with_routes(routes: RouteTable) -> LiveTunnel {
        LiveTunnel {
            spec: TunnelSpec {
                kind: TunnelKind::Http,
                local_port: 3000,
                requested_subdomain: None,
                basic_auth: None,
                routes,
            },
            public_url: "http://acme.localhost".to_string(),
        }
    }

    #[test]
    fn resolve_path_passes_through_with_no_routes_configured() {
        let tunnel = tunnel_with_routes(RouteTable::default());
        assert_eq!(resolve_path(&tunnel, "/anything"), Some("/anything".to_string()));
    }

    #[test]
    fn resolve_path_uses_fallback_when_no_rule_matches() {
        let tunnel = tunnel_with_routes(RouteTable {
            rules: vec![RouteRule {
                pattern: "/api/*".to_string(),
                target: "/backend/api".to_string(),
            }],
            fallback: Some("/backend/default".to_string()),
        });
        assert_eq!(resolve_path(&tunnel, "/other"), Some("/backend/default".to_string()));
    }

    #[test]
    fn resolve_path_rejects_when_rules_exist_and_nothing_matches() {
        let tunnel = tunnel_with_routes(RouteTable {
            rules: vec![RouteRule {
                pattern: "/api/*".to_string(),
                target: "/backend/api".to_string(),
            }],
            fallback: None,
        });
        assert_eq!(resolve_path(&tunnel, "/other"), None);
    }
}
