//! In-process gateway round-trip: a fake client speaks the wire protocol
//! directly against a real `axum` listener, exercising the same upgrade and
//! auth path `sellia-server` wires up, per `spec.md` §8 scenarios 1 and 3.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use sellia_auth::MasterCredentialAuth;
use sellia_gateway::{ControlChannelGateway, GatewayConfig};
use sellia_proto::{decode, encode, Message, TunnelKind};
use sellia_ratelimit::RateLimiterConfig;
use sellia_registry::{ReservedSubdomainSource, TunnelRegistry};

async fn upgrade(State(gateway): State<Arc<ControlChannelGateway>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| async move { gateway.accept(socket) })
}

async fn spawn_server(base_domain: &str) -> (SocketAddr, Arc<ControlChannelGateway>) {
    let gateway = ControlChannelGateway::new(
        GatewayConfig {
            base_domain: base_domain.to_string(),
            ..GatewayConfig::default()
        },
        Arc::new(MasterCredentialAuth::new("s3cret", "acct-1")),
        Arc::new(TunnelRegistry::new(Arc::new(ReservedSubdomainSource::new()))),
        RateLimiterConfig::default(),
        None,
    );

    let app = Router::new().route("/ws", get(upgrade)).with_state(gateway.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service()).await.unwrap();
    });

    (addr, gateway)
}

async fn recv(
    stream: &mut tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
) -> Message {
    loop {
        match stream.next().await.expect("stream ended").unwrap() {
            WsMessage::Binary(bytes) => return decode(&bytes).expect("malformed frame"),
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

async fn send(
    stream: &mut tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    msg: Message,
) {
    stream.send(WsMessage::Binary(encode(&msg).unwrap())).await.unwrap();
}

/// `spec.md` §8 scenario 1: a client that authenticates and opens an
/// explicit subdomain gets back a `tunnel_ready` naming that subdomain.
#[tokio::test(flavor = "multi_thread")]
async fn authenticate_and_open_named_tunnel() {
    let (addr, gateway) = spawn_server("sellia.test").await;

    let url = format!("ws://{addr}/ws");
    let (mut client, _) = timeout(Duration::from_secs(5), tokio_tungstenite::connect_async(&url))
        .await
        .expect("connect timed out")
        .expect("connect failed");

    send(&mut client, Message::Auth { credential: "s3cret".to_string() }).await;
    match recv(&mut client).await {
        Message::AuthOk { account_id, .. } => assert_eq!(account_id, "acct-1"),
        other => panic!("expected auth_ok, got {other:?}"),
    }

    send(
        &mut client,
        Message::TunnelOpen {
            kind: TunnelKind::Http,
            local_port: 8080,
            requested_subdomain: Some("demo".to_string()),
            basic_auth: None,
        },
    )
    .await;

    match recv(&mut client).await {
        Message::TunnelReady { subdomain, public_url, .. } => {
            assert_eq!(subdomain, "demo");
            assert_eq!(public_url, "http://demo.sellia.test");
        }
        other => panic!("expected tunnel_ready, got {other:?}"),
    }

    assert!(gateway.registry().lookup_by_subdomain("demo").is_some());
}

/// `spec.md` §8 testable property: "after `unregister_client(C)`, no tunnel
/// owned by C is reachable" — here triggered by the client's own disconnect
/// rather than a direct call, which is how the gateway actually invokes it.
#[tokio::test(flavor = "multi_thread")]
async fn disconnect_releases_owned_tunnels() {
    let (addr, gateway) = spawn_server("sellia.test").await;

    let url = format!("ws://{addr}/ws");
    let (mut client, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    send(&mut client, Message::Auth { credential: "s3cret".to_string() }).await;
    let _ = recv(&mut client).await;

    send(
        &mut client,
        Message::TunnelOpen {
            kind: TunnelKind::Http,
            local_port: 8080,
            requested_subdomain: Some("gone-soon".to_string()),
            basic_auth: None,
        },
    )
    .await;
    let _ = recv(&mut client).await;
    assert!(gateway.registry().lookup_by_subdomain("gone-soon").is_some());

    client.close(None).await.unwrap();
    drop(client);

    for _ in 0..50 {
        if gateway.registry().lookup_by_subdomain("gone-soon").is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert!(gateway.registry().lookup_by_subdomain("gone-soon").is_none());
}

/// `spec.md` §4.6 upgrade-flow step 1: a bad credential gets `auth_error`
/// and the channel closes instead of the client ever receiving `auth_ok`.
#[tokio::test(flavor = "multi_thread")]
async fn wrong_credential_is_rejected() {
    let (addr, _gateway) = spawn_server("sellia.test").await;

    let url = format!("ws://{addr}/ws");
    let (mut client, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    send(&mut client, Message::Auth { credential: "wrong".to_string() }).await;
    match recv(&mut client).await {
        Message::AuthError { reason } => assert_eq!(reason, "invalid credential"),
        other => panic!("expected auth_error, got {other:?}"),
    }
}
