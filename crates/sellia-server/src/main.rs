//! Sellia tunnel server: the public-facing exit node. Runs the
//! control-channel gateway and the HTTP/WebSocket/TCP ingress crates behind
//! one `axum` listener (`spec.md` §4).

mod config;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, FromRequest, State};
use axum::http::{header, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::{Cli, ServerSettings};
use sellia_auth::{AuthProvider, MasterCredentialAuth};
use sellia_gateway::{ConnectionManager, ControlChannelGateway, GatewayConfig, PendingStore};
use sellia_ingress_http::HttpIngressConfig;
use sellia_ingress_tcp::{TcpIngress, TcpIngressConfig};
use sellia_ingress_ws::WsIngressConfig;
use sellia_ratelimit::RateLimiterConfig;
use sellia_registry::{ReservedSubdomainSource, TunnelRegistry};

#[derive(Clone)]
struct AppState {
    gateway: Arc<ControlChannelGateway>,
    base_domain: String,
    http_config: HttpIngressConfig,
    ws_config: WsIngressConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let log_level = cli.log_level.clone();
    let settings = ServerSettings::resolve(cli)?;
    init_logging(&log_level)?;

    info!(bind_addr = %settings.bind_addr, base_domain = %settings.base_domain, "starting sellia-server");

    let auth: Arc<dyn AuthProvider> = Arc::new(MasterCredentialAuth::new(
        settings.master_credential.clone(),
        "default",
    ));
    let registry = Arc::new(TunnelRegistry::new(Arc::new(ReservedSubdomainSource::new())));

    let gateway_config = GatewayConfig {
        base_domain: settings.base_domain.clone(),
        use_https: settings.use_https,
        ..GatewayConfig::default()
    };

    let gateway = if let Some((start, end)) = settings.tcp_port_range {
        info!(start, end, "raw tcp tunnels enabled");
        // `TcpIngress` provisions ports for the gateway, but the gateway also
        // drives `TcpIngress`'s accept loop lookups, so neither can be built
        // from the other. Share the connection/pending state both need
        // instead, built once up front.
        let connections = Arc::new(ConnectionManager::new());
        let pending = Arc::new(PendingStore::new());
        let tcp_ingress = TcpIngress::new(
            registry.clone(),
            connections.clone(),
            pending.clone(),
            TcpIngressConfig {
                port_range: (start, end),
                ..TcpIngressConfig::default()
            },
        );
        ControlChannelGateway::with_shared_state(
            gateway_config,
            auth,
            registry,
            connections,
            pending,
            RateLimiterConfig::default(),
            Some(tcp_ingress as Arc<dyn sellia_gateway::TunnelPortProvisioner>),
        )
    } else {
        ControlChannelGateway::new(gateway_config, auth, registry, RateLimiterConfig::default(), None)
    };

    gateway.spawn_heartbeat();

    let state = AppState {
        gateway,
        base_domain: settings.base_domain.clone(),
        http_config: HttpIngressConfig {
            base_domain: settings.base_domain.clone(),
            use_https: settings.use_https,
            ..HttpIngressConfig::default()
        },
        ws_config: WsIngressConfig {
            base_domain: settings.base_domain.clone(),
            ..WsIngressConfig::default()
        },
    };

    let app = Router::new()
        .fallback(root_handler)
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(settings.bind_addr).await?;
    info!("listening on {}", settings.bind_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

fn host_matches_base(host_header: &str, base_domain: &str) -> bool {
    let host = host_header.split(':').next().unwrap_or(host_header);
    let base = base_domain.split(':').next().unwrap_or(base_domain);
    host == base
}

async fn root_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request<Body>,
) -> Response {
    let headers = req.headers().clone();
    let host_header = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let path = req.uri().path().to_string();
    let is_root = host_matches_base(&host_header, &state.base_domain);

    if is_root && path == "/health" && req.method() == axum::http::Method::GET {
        return (StatusCode::OK, "ok").into_response();
    }

    if is_root && path == "/ws" && sellia_ingress_http::is_websocket_upgrade(&headers) {
        if state
            .gateway
            .check_connection_rate_limit(&addr.ip().to_string())
            .is_err()
        {
            return StatusCode::TOO_MANY_REQUESTS.into_response();
        }
        return match axum::extract::ws::WebSocketUpgrade::from_request(req, &state).await {
            Ok(ws) => ws.on_upgrade(move |socket| async move {
                state.gateway.accept(socket);
            }),
            Err(rejection) => rejection.into_response(),
        };
    }

    if sellia_ingress_http::is_websocket_upgrade(&headers) {
        sellia_ingress_ws::handle(
            state.gateway.clone(),
            &state.ws_config,
            addr.ip(),
            &host_header,
            path,
            headers,
            match axum::extract::ws::WebSocketUpgrade::from_request(req, &state).await {
                Ok(ws) => ws,
                Err(rejection) => return rejection.into_response(),
            },
        )
        .await
    } else {
        sellia_ingress_http::handle(state.gateway.clone(), &state.http_config, addr.ip(), req).await
    }
}

fn init_logging(log_level: &str) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|err| {
            error!(%err, "failed to install tracing subscriber");
            anyhow::anyhow!(err)
        })
}
