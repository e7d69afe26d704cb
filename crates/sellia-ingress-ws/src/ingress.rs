//! WebSocket Ingress: resolves a tunnel, negotiates the upgrade with the
//! tunnel client, then bridges frames in both directions (`spec.md` §4.8).

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::http::{header, HeaderMap, HeaderValue, Response, StatusCode};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;
use uuid::Uuid;

use sellia_gateway::{ControlChannelGateway, PendingRequest, PendingSink, WsEvent};
use sellia_http_auth::AuthOutcome;
use sellia_proto::Message;

use crate::frame;

/// `spec.md` §4.8 defaults to a 30 s upgrade timeout, same table entry as
/// the HTTP ingress's first-byte timeout.
#[derive(Debug, Clone)]
pub struct WsIngressConfig {
    pub base_domain: String,
    pub upgrade_timeout: Duration,
}

impl Default for WsIngressConfig {
    fn default() -> Self {
        Self {
            base_domain: "localhost".to_string(),
            upgrade_timeout: Duration::from_secs(30),
        }
    }
}

/// Resolves the tunnel, negotiates the upgrade with the client over the
/// control channel, and on success completes the upgrade and spawns the
/// frame bridge. On any failure before the upgrade completes, returns a
/// plain HTTP error response instead of switching protocols.
pub async fn handle(
    gateway: Arc<ControlChannelGateway>,
    config: &WsIngressConfig,
    source_ip: IpAddr,
    host_header: &str,
    path: String,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> axum::response::Response {
    let Some(subdomain) = sellia_ingress_http::extract_subdomain(host_header, &config.base_domain) else {
        return text_response(StatusCode::BAD_REQUEST, "malformed host");
    };

    let Some(tunnel) = gateway.registry().lookup_by_subdomain(&subdomain) else {
        return text_response(StatusCode::NOT_FOUND, "no such tunnel");
    };

    let wire_headers = sellia_ingress_http::headers::to_wire(&headers);
    if sellia_http_auth::check(tunnel.basic_auth.as_ref(), &wire_headers) == AuthOutcome::Unauthorized {
        let mut response = text_response(StatusCode::UNAUTHORIZED, "authentication required");
        let realm = tunnel.subdomain.replace('"', "\\\"");
        if let Ok(value) = HeaderValue::from_str(&format!("Basic realm=\"{realm}\"")) {
            response.headers_mut().insert(header::WWW_AUTHENTICATE, value);
        }
        return response;
    }

    let Some(connection) = gateway.connections().lookup(&tunnel.client_id) else {
        return text_response(StatusCode::BAD_GATEWAY, "tunnel client disconnected");
    };

    let request_id = Uuid::new_v4().to_string();
    let (tx, mut rx) = mpsc::channel::<WsEvent>(64);
    let pending = Arc::new(PendingRequest::new(
        request_id.clone(),
        tunnel.id.clone(),
        PendingSink::Ws(tx),
    ));
    gateway.pending().add(pending);

    if connection
        .channel
        .send(Message::WsUpgrade {
            request_id: request_id.clone(),
            tunnel_id: tunnel.id.clone(),
            path,
            headers: wire_headers,
        })
        .await
        .is_err()
    {
        gateway.pending().take(&request_id);
        return text_response(StatusCode::BAD_GATEWAY, "tunnel client disconnected");
    }

    let first_event = match timeout(config.upgrade_timeout, rx.recv()).await {
        Ok(Some(event)) => event,
        Ok(None) => {
            gateway.pending().take(&request_id);
            return text_response(StatusCode::BAD_GATEWAY, "tunnel client disconnected");
        }
        Err(_) => {
            gateway.pending().take(&request_id);
            return text_response(StatusCode::GATEWAY_TIMEOUT, "upgrade timed out");
        }
    };

    let response_headers = match first_event {
        WsEvent::UpgradeOk { headers } => headers,
        WsEvent::UpgradeError { status } => {
            gateway.pending().take(&request_id);
            return text_response(status_or_502(status), "upgrade rejected by tunnel client");
        }
        _ => {
            gateway.pending().take(&request_id);
            return text_response(StatusCode::BAD_GATEWAY, "unexpected protocol message");
        }
    };

    let mut ws = ws;
    if let Some((_, protocol)) = response_headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("sec-websocket-protocol"))
    {
        ws = ws.protocols([protocol.clone()]);
    }

    let channel = connection.channel.clone();
    let pending_store = gateway.pending().clone();
    let bridge_request_id = request_id.clone();
    ws.on_upgrade(move |socket| async move {
        bridge(channel, pending_store, bridge_request_id, socket, rx).await;
    })
    .into_response()
}

/// Runs the two-direction frame bridge for one upgraded public socket. Each
/// direction is its own loop over its own half of the split socket, so
/// writes into the control channel and writes into the public socket are
/// each serialized by a single owner, matching `spec.md` §5's
/// single-writer invariant.
async fn bridge(
    channel: sellia_transport_websocket::ControlChannel,
    pending: Arc<sellia_gateway::PendingStore>,
    request_id: String,
    socket: WebSocket,
    mut from_client: mpsc::Receiver<WsEvent>,
) {
    let (mut public_sink, mut public_stream) = socket.split();

    let to_client = async {
        while let Some(frame) = public_stream.next().await {
            match frame {
                Ok(WsMessage::Close(close_frame)) => {
                    let (code, reason) = close_frame
                        .map(|f| (Some(f.code), Some(f.reason.to_string())))
                        .unwrap_or((None, None));
                    let _ = channel
                        .send(Message::WsClose {
                            request_id: request_id.clone(),
                            code,
                            reason,
                        })
                        .await;
                    return;
                }
                Ok(msg) => {
                    if let Some((opcode, payload)) = frame::to_wire(msg) {
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
                            return;
                        }
                    }
                }
                Err(err) => {
                    debug!(request_id, %err, "public websocket read error");
                    break;
                }
            }
        }
        let _ = channel
            .send(Message::WsClose {
                request_id: request_id.clone(),
                code: None,
                reason: None,
            })
            .await;
    };

    let from_client_direction = async {
        while let Some(event) = from_client.recv().await {
            match event {
                WsEvent::Frame { opcode, payload, .. } => {
                    if public_sink.send(frame::from_wire(opcode, payload)).await.is_err() {
                        break;
                    }
                }
                WsEvent::Close { .. } => break,
                WsEvent::UpgradeOk { .. } | WsEvent::UpgradeError { .. } => {}
            }
        }
        let _ = public_sink.close().await;
    };

    tokio::join!(to_client, from_client_direction);
    pending.take(&request_id);
    debug!(request_id, "websocket bridge ended");
}

fn status_or_502(status: u16) -> StatusCode {
    StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY)
}

fn text_response(status: StatusCode, message: &str) -> axum::response::Response {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(axum::body::Body::from(message.to_string()))
        .unwrap_or_else(|_| {
            let mut r = axum::response::Response::new(axum::body::Body::empty());
            *r.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            r
        })
        .into_response()
}
