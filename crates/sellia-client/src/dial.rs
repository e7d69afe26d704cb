//! Local-target dialing: forwards a public request to whatever is running
//! on `127.0.0.1:<port>` (or another configured `local_host`).
//!
//! HTTP connections are pooled per port the same way the control channel
//! itself is framed: one task drives the connection, callers borrow a
//! sender and return it when done. WebSocket and raw TCP targets dial
//! fresh every time — there is nothing to pool for a single bridged
//! stream.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::Request;
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::handshake::client::{generate_key, Request as WsRequest};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

const MAX_POOL_SIZE: usize = 10;

#[derive(Debug, Error)]
pub enum DialError {
    #[error("failed to connect to local target {0}: {1}")]
    Connect(String, std::io::Error),
    #[error("http handshake with local target failed: {0}")]
    Handshake(#[from] hyper::Error),
    #[error("local websocket handshake failed: {0}")]
    WsHandshake(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

struct PooledConnection {
    sender: http1::SendRequest<Full<Bytes>>,
    #[allow(dead_code)]
    created_at: Instant,
}

/// Dials `local_host:local_port` on behalf of whichever tunnel owns that
/// port. One `LocalDialer` serves every tunnel a client runtime has open;
/// the HTTP pool is keyed by port since a single process can forward
/// several tunnels to several local services.
pub struct LocalDialer {
    local_host: String,
    http_pools: dashmap::DashMap<u16, Arc<Mutex<Vec<PooledConnection>>>>,
}

impl LocalDialer {
    pub fn new(local_host: impl Into<String>) -> Self {
        Self {
            local_host: local_host.into(),
            http_pools: dashmap::DashMap::new(),
        }
    }

    fn target(&self, port: u16) -> String {
        format!("{}:{}", self.local_host, port)
    }

    fn pool_for(&self, port: u16) -> Arc<Mutex<Vec<PooledConnection>>> {
        self.http_pools
            .entry(port)
            .or_insert_with(|| Arc::new(Mutex::new(Vec::with_capacity(MAX_POOL_SIZE))))
            .clone()
    }

    async fn get_connection(&self, port: u16) -> Result<http1::SendRequest<Full<Bytes>>, DialError> {
        let pool = self.pool_for(port);
        {
            let mut guard = pool.lock().await;
            while let Some(conn) = guard.pop() {
                if conn.sender.is_ready() {
                    return Ok(conn.sender);
                }
            }
        }

        let target = self.target(port);
        let stream = TcpStream::connect(&target)
            .await
            .map_err(|err| DialError::Connect(target.clone(), err))?;
        let io = TokioIo::new(stream);
        let (sender, conn) = http1::handshake(io).await?;
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                debug!(%err, "local http connection closed");
            }
        });
        Ok(sender)
    }

    async fn return_connection(&self, port: u16, sender: http1::SendRequest<Full<Bytes>>) {
        if !sender.is_ready() {
            return;
        }
        let pool = self.pool_for(port);
        let mut guard = pool.lock().await;
        if guard.len() < MAX_POOL_SIZE {
            guard.push(PooledConnection {
                sender,
                created_at: Instant::now(),
            });
        }
    }

    /// Sends one HTTP request to the local target, returning the raw
    /// response. Pools the connection for reuse on success.
    pub async fn send_http(
        &self,
        port: u16,
        request: Request<Full<Bytes>>,
    ) -> Result<hyper::Response<Incoming>, DialError> {
        let mut sender = self.get_connection(port).await?;
        let response = sender.send_request(request).await?;
        self.return_connection(port, sender).await;
        Ok(response)
    }

    /// Opens a plain TCP connection to the local target, for `tcp` tunnels.
    pub async fn dial_tcp(&self, port: u16) -> Result<TcpStream, DialError> {
        let target = self.target(port);
        TcpStream::connect(&target)
            .await
            .map_err(|err| DialError::Connect(target, err))
    }

    /// Opens a WebSocket connection to the local target at `path`, carrying
    /// the public peer's original headers (notably `sec-websocket-protocol`)
    /// so the local service sees the same negotiation the public client
    /// asked for.
    pub async fn dial_ws(
        &self,
        port: u16,
        path: &str,
        headers: &[(String, String)],
    ) -> Result<(WebSocketStream<MaybeTlsStream<TcpStream>>, hyper::http::Response<()>), DialError> {
        let target = self.target(port);
        let stream = TcpStream::connect(&target)
            .await
            .map_err(|err| DialError::Connect(target.clone(), err))?;

        let mut builder = WsRequest::builder()
            .method("GET")
            .uri(format!("ws://{target}{path}"))
            .header("Host", &target)
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header("Sec-WebSocket-Key", generate_key());

        for (name, value) in headers {
            if name.eq_ignore_ascii_case("sec-websocket-protocol") {
                builder = builder.header("Sec-WebSocket-Protocol", value);
            }
        }

        let request = builder
            .body(())
            .map_err(|err| DialError::InvalidRequest(err.to_string()))?;

        let (ws_stream, response) =
            tokio_tungstenite::client_async(request, MaybeTlsStream::Plain(stream)).await?;
        Ok((ws_stream, response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_joins_host_and_port() {
        let dialer = LocalDialer::new("127.0.0.1");
        assert_eq!(dialer.target(8080), "127.0.0.1:8080");
    }
}
