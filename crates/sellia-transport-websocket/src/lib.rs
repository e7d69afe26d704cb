//! Framing of the control-channel protocol over a single WebSocket
//! connection, server- and client-side.
//!
//! TLS termination is assumed to happen in front of this process (a
//! reverse proxy or load balancer), so this crate speaks plain `ws://`
//! upgrades. Each connection gets exactly one writer task that owns the
//! sink — `spec.md` §5's single-writer-per-control-channel invariant —
//! and a reader task that decodes frames into [`sellia_proto::Message`]
//! values delivered over an `mpsc` channel.

mod channel;
pub mod client;
pub mod server;

pub use channel::{ChannelClosed, ControlChannel};
