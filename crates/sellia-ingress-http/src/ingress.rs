//! HTTP Ingress: terminates public HTTP, resolves to a tunnel, and proxies
//! through the control channel (`spec.md` §4.7).

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Request, Response, StatusCode};
use bytes::Bytes;
use futures::stream;
use http_body_util::BodyExt;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::warn;
use uuid::Uuid;

use sellia_gateway::{ControlChannelGateway, HttpEvent, PendingRequest, PendingSink};
use sellia_http_auth::AuthOutcome;
use sellia_proto::Message;

use crate::headers::{from_wire, inject_forwarded, to_wire};
use crate::host::extract_subdomain;

/// Config the binary wires up from its `bind_host`/`base_domain`/`use_https`
/// settings (`spec.md` §6). Timeouts default to `spec.md` §5's table.
#[derive(Debug, Clone)]
pub struct HttpIngressConfig {
    pub base_domain: String,
    pub use_https: bool,
    pub first_byte_timeout: Duration,
    pub total_timeout: Duration,
}

impl Default for HttpIngressConfig {
    fn default() -> Self {
        Self {
            base_domain: "localhost".to_string(),
            use_https: false,
            first_byte_timeout: Duration::from_secs(30),
            total_timeout: Duration::from_secs(300),
        }
    }
}

/// Whether `headers` asks for a WebSocket upgrade. The server's router
/// calls this before dispatching to this crate's [`handle`] so it can hand
/// the request to `sellia-ingress-ws` instead (`spec.md` §4.7 step 4).
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

/// Proxies one public HTTP request through the tunnel's control channel and
/// streams the reply back. Never buffers an entire body in memory.
pub async fn handle(
    gateway: Arc<ControlChannelGateway>,
    config: &HttpIngressConfig,
    source_ip: IpAddr,
    req: Request<Body>,
) -> Response<Body> {
    let host_header = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let Some(subdomain) = extract_subdomain(&host_header, &config.base_domain) else {
        return text_response(StatusCode::BAD_REQUEST, "malformed host");
    };

    let Some(tunnel) = gateway.registry().lookup_by_subdomain(&subdomain) else {
        return text_response(StatusCode::NOT_FOUND, "no such tunnel");
    };

    let mut request_headers = to_wire(req.headers());
    if sellia_http_auth::check(tunnel.basic_auth.as_ref(), &request_headers) == AuthOutcome::Unauthorized {
        let mut response = text_response(StatusCode::UNAUTHORIZED, "authentication required");
        let realm = tunnel.subdomain.replace('"', "\\\"");
        if let Ok(value) = HeaderValue::from_str(&format!("Basic realm=\"{realm}\"")) {
            response.headers_mut().insert(header::WWW_AUTHENTICATE, value);
        }
        return response;
    }

    if gateway.check_request_rate_limit(&tunnel.id).is_err() {
        return text_response(StatusCode::TOO_MANY_REQUESTS, "rate limited");
    }

    let Some(connection) = gateway.connections().lookup(&tunnel.client_id) else {
        return text_response(StatusCode::BAD_GATEWAY, "tunnel client disconnected");
    };

    let request_id = Uuid::new_v4().to_string();
    let (tx, mut rx) = mpsc::channel::<HttpEvent>(64);
    let pending = Arc::new(PendingRequest::new(
        request_id.clone(),
        tunnel.id.clone(),
        PendingSink::Http(tx),
    ));
    gateway.pending().add(pending);

    let method = req.method().to_string();
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let proto = if config.use_https { "https" } else { "http" };
    inject_forwarded(&mut request_headers, &source_ip.to_string(), proto, &host_header);

    if connection
        .channel
        .send(Message::RequestStart {
            request_id: request_id.clone(),
            tunnel_id: tunnel.id.clone(),
            method,
            path,
            headers: request_headers,
        })
        .await
        .is_err()
    {
        gateway.pending().take(&request_id);
        return text_response(StatusCode::BAD_GATEWAY, "tunnel client disconnected");
    }

    let mut body = req.into_body();
    loop {
        match body.frame().await {
            Some(Ok(frame)) => {
                if let Ok(data) = frame.into_data() {
                    let _ = connection
                        .channel
                        .send(Message::RequestBody {
                            request_id: request_id.clone(),
                            chunk: data.to_vec(),
                            is_final: false,
                        })
                        .await;
                }
            }
            Some(Err(err)) => {
                warn!(%err, request_id, "error reading public request body");
                break;
            }
            None => break,
        }
    }
    // Always emit an explicit empty final chunk, even for a bodyless
    // request, so the client-side framing never has to infer "no body"
    // from absence alone.
    let _ = connection
        .channel
        .send(Message::RequestBody {
            request_id: request_id.clone(),
            chunk: Vec::new(),
            is_final: true,
        })
        .await;

    let first_event = match timeout(config.first_byte_timeout, rx.recv()).await {
        Ok(Some(event)) => event,
        Ok(None) => {
            gateway.pending().take(&request_id);
            return text_response(StatusCode::BAD_GATEWAY, "tunnel client disconnected");
        }
        Err(_) => {
            gateway.pending().take(&request_id);
            return text_response(StatusCode::GATEWAY_TIMEOUT, "upstream timed out");
        }
    };

    let (status, response_headers) = match first_event {
        HttpEvent::ResponseStart { status, headers } => (status, headers),
        HttpEvent::GatewayError { status, message } => {
            gateway.pending().take(&request_id);
            return text_response(status_or_502(status), &message);
        }
        _ => {
            gateway.pending().take(&request_id);
            return text_response(StatusCode::BAD_GATEWAY, "unexpected protocol message");
        }
    };

    let total_timeout = config.total_timeout;
    let body_stream = stream::unfold(rx, move |mut rx| async move {
        match timeout(total_timeout, rx.recv()).await {
            Ok(Some(HttpEvent::ResponseBody { chunk })) => {
                Some((Ok::<Bytes, std::io::Error>(Bytes::from(chunk)), rx))
            }
            _ => None,
        }
    });

    let mut response = Response::new(Body::from_stream(body_stream));
    *response.status_mut() = status_or_502(status);
    *response.headers_mut() = from_wire(&response_headers);
    response
}

fn status_or_502(status: u16) -> StatusCode {
    StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY)
}

fn text_response(status: StatusCode, message: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from(message.to_string()))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}
