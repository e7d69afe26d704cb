//! Control-channel wire protocol for sellia.
//!
//! Defines the [`Message`] tagged union carried over the persistent
//! control channel between a client and the server, and the codec that
//! serializes a single message to one self-describing binary frame.

pub mod codec;
pub mod message;

pub use codec::{decode, encode, CodecError, MAX_FRAME_SIZE};
pub use message::{
    BasicAuthPair, HeaderList, Message, RateLimitInfo, TunnelKind, WsOpcode,
};

/// Protocol version. Bumped on any wire-incompatible change to [`Message`].
pub const PROTOCOL_VERSION: u32 = 1;
