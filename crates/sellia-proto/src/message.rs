//! Control-channel message variants.
//!
//! `Message` is the single tagged union carried over the control channel in
//! both directions. Every frame on the wire is exactly one `Message`, encoded
//! with [`crate::codec`]. Field names here double as the MessagePack map keys,
//! so renaming a field is a wire-format change.

use serde::{Deserialize, Serialize};

/// WebSocket opcode, mirrored here so `sellia-proto` has no dependency on any
/// particular WebSocket crate (server and client use different ones).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WsOpcode {
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

/// The kind of tunnel requested in `tunnel_open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelKind {
    Http,
    Tcp,
}

/// A single HTTP header as a `(name, value)` pair. Kept as a `Vec` rather than
/// a map so duplicate headers (e.g. repeated `Set-Cookie`) round-trip.
pub type HeaderList = Vec<(String, String)>;

/// Basic-auth credentials attached to an `http` tunnel at `tunnel_open` time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicAuthPair {
    pub username: String,
    pub password: String,
}

/// The control-channel wire message. One variant per protocol tag; the tag
/// string is the enum variant name in `snake_case` (via serde), so `encode`
/// always writes the tag first and `decode` dispatches on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Message {
    // --- Handshake -------------------------------------------------------
    /// C→S: present a credential to authenticate the control channel.
    Auth { credential: String },
    /// S→C: authentication accepted.
    AuthOk {
        account_id: String,
        limits: Vec<(String, RateLimitInfo)>,
    },
    /// S→C: authentication rejected; channel will be closed.
    AuthError { reason: String },

    // --- Tunnel lifecycle --------------------------------------------------
    /// C→S: request a new tunnel.
    TunnelOpen {
        kind: TunnelKind,
        local_port: u16,
        #[serde(default)]
        requested_subdomain: Option<String>,
        #[serde(default)]
        basic_auth: Option<BasicAuthPair>,
    },
    /// S→C: tunnel created.
    TunnelReady {
        tunnel_id: String,
        public_url: String,
        subdomain: String,
    },
    /// Both: close an existing tunnel.
    TunnelClose {
        tunnel_id: String,
        #[serde(default)]
        reason: Option<String>,
    },

    // --- Buffered HTTP -------------------------------------------------
    /// S→C: begin an HTTP request.
    RequestStart {
        request_id: String,
        tunnel_id: String,
        method: String,
        path: String,
        headers: HeaderList,
    },
    /// S→C: a chunk of the request body.
    RequestBody {
        request_id: String,
        #[serde(with = "serde_bytes")]
        chunk: Vec<u8>,
        #[serde(rename = "final")]
        is_final: bool,
    },
    /// C→S: begin the HTTP response.
    ResponseStart {
        request_id: String,
        status: u16,
        headers: HeaderList,
    },
    /// C→S: a chunk of the response body.
    ResponseBody {
        request_id: String,
        #[serde(with = "serde_bytes")]
        chunk: Vec<u8>,
    },
    /// C→S: the response is complete.
    ResponseEnd { request_id: String },

    // --- WebSocket passthrough ------------------------------------------
    /// S→C: a public peer wants to upgrade to WebSocket.
    WsUpgrade {
        request_id: String,
        tunnel_id: String,
        path: String,
        headers: HeaderList,
    },
    /// C→S: client's local service accepted the upgrade.
    WsUpgradeOk {
        request_id: String,
        headers: HeaderList,
    },
    /// C→S: client's local service rejected the upgrade.
    WsUpgradeError { request_id: String, status: u16 },
    /// Both: a single WebSocket frame.
    WsFrame {
        request_id: String,
        opcode: WsOpcode,
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
        fin: bool,
    },
    /// Both: the WebSocket stream is closing.
    WsClose {
        request_id: String,
        #[serde(default)]
        code: Option<u16>,
        #[serde(default)]
        reason: Option<String>,
    },

    // --- Raw TCP ---------------------------------------------------------
    /// S→C: a new public TCP connection arrived.
    TcpOpen {
        connection_id: String,
        tunnel_id: String,
        remote_addr: String,
    },
    /// C→S: the client dialed the local target successfully.
    TcpOpenOk { connection_id: String },
    /// C→S: the client failed to dial the local target.
    TcpOpenError {
        connection_id: String,
        message: String,
    },
    /// Both: a chunk of raw bytes on a TCP connection.
    TcpData {
        connection_id: String,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    /// Both: a TCP connection closed.
    TcpClose {
        connection_id: String,
        #[serde(default)]
        reason: Option<String>,
    },

    // --- Keepalive ---------------------------------------------------------
    /// Both: heartbeat request.
    Ping { timestamp_ms: u64 },
    /// Both: heartbeat reply, echoing the timestamp.
    Pong { timestamp_ms: u64 },
}

/// The rate limits reported to a client in `auth_ok`, one entry per scope.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitInfo {
    pub capacity: u32,
    pub refill_per_sec: f64,
}

impl Message {
    /// The wire tag for this message, used in log lines (`debug!(tag = msg.tag())`).
    pub fn tag(&self) -> &'static str {
        match self {
            Message::Auth { .. } => "auth",
            Message::AuthOk { .. } => "auth_ok",
            Message::AuthError { .. } => "auth_error",
            Message::TunnelOpen { .. } => "tunnel_open",
            Message::TunnelReady { .. } => "tunnel_ready",
            Message::TunnelClose { .. } => "tunnel_close",
            Message::RequestStart { .. } => "request_start",
            Message::RequestBody { .. } => "request_body",
            Message::ResponseStart { .. } => "response_start",
            Message::ResponseBody { .. } => "response_body",
            Message::ResponseEnd { .. } => "response_end",
            Message::WsUpgrade { .. } => "ws_upgrade",
            Message::WsUpgradeOk { .. } => "ws_upgrade_ok",
            Message::WsUpgradeError { .. } => "ws_upgrade_error",
            Message::WsFrame { .. } => "ws_frame",
            Message::WsClose { .. } => "ws_close",
            Message::TcpOpen { .. } => "tcp_open",
            Message::TcpOpenOk { .. } => "tcp_open_ok",
            Message::TcpOpenError { .. } => "tcp_open_error",
            Message::TcpData { .. } => "tcp_data",
            Message::TcpClose { .. } => "tcp_close",
            Message::Ping { .. } => "ping",
            Message::Pong { .. } => "pong",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;

    fn roundtrip(msg: Message) {
        let bytes = codec::encode(&msg).unwrap();
        let decoded = codec::decode(&bytes).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn roundtrips_every_variant_family() {
        roundtrip(Message::Auth {
            credential: "tok".into(),
        });
        roundtrip(Message::AuthOk {
            account_id: "acct-1".into(),
            limits: vec![(
                "connection".into(),
                RateLimitInfo {
                    capacity: 10,
                    refill_per_sec: 1.0,
                },
            )],
        });
        roundtrip(Message::AuthError {
            reason: "bad token".into(),
        });
        roundtrip(Message::TunnelOpen {
            kind: TunnelKind::Http,
            local_port: 8080,
            requested_subdomain: Some("myapp".into()),
            basic_auth: Some(BasicAuthPair {
                username: "u".into(),
                password: "p".into(),
            }),
        });
        roundtrip(Message::TunnelReady {
            tunnel_id: "t1".into(),
            public_url: "https://myapp.example.com".into(),
            subdomain: "myapp".into(),
        });
        roundtrip(Message::TunnelClose {
            tunnel_id: "t1".into(),
            reason: Some("rate limit".into()),
        });
        roundtrip(Message::RequestStart {
            request_id: "r1".into(),
            tunnel_id: "t1".into(),
            method: "GET".into(),
            path: "/".into(),
            headers: vec![("host".into(), "myapp.example.com".into())],
        });
        roundtrip(Message::RequestBody {
            request_id: "r1".into(),
            chunk: vec![1, 2, 3],
            is_final: true,
        });
        roundtrip(Message::ResponseStart {
            request_id: "r1".into(),
            status: 200,
            headers: vec![],
        });
        roundtrip(Message::ResponseBody {
            request_id: "r1".into(),
            chunk: b"hello".to_vec(),
        });
        roundtrip(Message::ResponseEnd {
            request_id: "r1".into(),
        });
        roundtrip(Message::WsUpgrade {
            request_id: "r2".into(),
            tunnel_id: "t1".into(),
            path: "/ws".into(),
            headers: vec![],
        });
        roundtrip(Message::WsUpgradeOk {
            request_id: "r2".into(),
            headers: vec![("sec-websocket-protocol".into(), "vite-hmr".into())],
        });
        roundtrip(Message::WsUpgradeError {
            request_id: "r2".into(),
            status: 502,
        });
        roundtrip(Message::WsFrame {
            request_id: "r2".into(),
            opcode: WsOpcode::Text,
            payload: b"ping".to_vec(),
            fin: true,
        });
        roundtrip(Message::WsClose {
            request_id: "r2".into(),
            code: Some(1000),
            reason: None,
        });
        roundtrip(Message::TcpOpen {
            connection_id: "c1".into(),
            tunnel_id: "t1".into(),
            remote_addr: "203.0.113.1:5555".into(),
        });
        roundtrip(Message::TcpOpenOk {
            connection_id: "c1".into(),
        });
        roundtrip(Message::TcpOpenError {
            connection_id: "c1".into(),
            message: "connection refused".into(),
        });
        roundtrip(Message::TcpData {
            connection_id: "c1".into(),
            data: vec![9, 9, 9],
        });
        roundtrip(Message::TcpClose {
            connection_id: "c1".into(),
            reason: None,
        });
        roundtrip(Message::Ping { timestamp_ms: 42 });
        roundtrip(Message::Pong { timestamp_ms: 42 });
    }

    #[test]
    fn tag_matches_variant() {
        assert_eq!(Message::Ping { timestamp_ms: 0 }.tag(), "ping");
        assert_eq!(
            Message::TunnelClose {
                tunnel_id: "x".into(),
                reason: None
            }
            .tag(),
            "tunnel_close"
        );
    }
}
