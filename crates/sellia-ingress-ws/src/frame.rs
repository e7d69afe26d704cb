//! Conversion between `axum`'s WebSocket message type and the wire
//! protocol's opcode-tagged frame (`spec.md` §4.8).

use axum::extract::ws::Message as WsMessage;
use sellia_proto::WsOpcode;

/// Converts an inbound public-socket message into the `(opcode, payload)`
/// pair carried on `ws_frame`, or `None` for a close frame (handled
/// separately via `ws_close` so its code/reason survive the trip).
pub fn to_wire(msg: WsMessage) -> Option<(WsOpcode, Vec<u8>)> {
    match msg {
        WsMessage::Text(text) => Some((WsOpcode::Text, text.into_bytes())),
        WsMessage::Binary(bytes) => Some((WsOpcode::Binary, bytes)),
        WsMessage::Ping(bytes) => Some((WsOpcode::Ping, bytes)),
        WsMessage::Pong(bytes) => Some((WsOpcode::Pong, bytes)),
        WsMessage::Close(_) => None,
    }
}

/// Converts a `ws_frame` from the client back into an outbound public
/// message. `axum` reassembles fragmented frames into complete messages,
/// so there is no per-frame `fin = false` case to represent here.
pub fn from_wire(opcode: WsOpcode, payload: Vec<u8>) -> WsMessage {
    match opcode {
        WsOpcode::Text => WsMessage::Text(String::from_utf8_lossy(&payload).into_owned()),
        WsOpcode::Binary => WsMessage::Binary(payload),
        WsOpcode::Ping => WsMessage::Ping(payload),
        WsOpcode::Pong => WsMessage::Pong(payload),
        WsOpcode::Close => WsMessage::Close(None),
    }
}
