//! Encode/decode [`Message`] to and from the wire's self-describing binary
//! frames (MessagePack maps, one frame per WebSocket binary message).

use crate::message::Message;
use thiserror::Error;

/// A single frame must not exceed this size; oversize frames are rejected
/// before we even attempt to decode them.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame exceeds maximum size of {MAX_FRAME_SIZE} bytes ({0} bytes)")]
    FrameTooLarge(usize),

    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] rmp_serde::decode::Error),

    #[error("failed to encode message: {0}")]
    EncodeFailed(#[from] rmp_serde::encode::Error),
}

/// Serialize a [`Message`] into a self-contained binary frame.
///
/// Deterministic: the tag (the enum's variant name) is always written first
/// by `rmp_serde`'s externally-tagged enum representation, and fields appear
/// in declaration order. No fields beyond what `Message` declares are ever
/// written.
pub fn encode(msg: &Message) -> Result<Vec<u8>, CodecError> {
    let bytes = rmp_serde::to_vec_named(msg)?;
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(bytes.len()));
    }
    Ok(bytes)
}

/// Deserialize a single frame back into a [`Message`].
///
/// Frames larger than [`MAX_FRAME_SIZE`] are rejected without attempting to
/// parse them (a transport that somehow delivered an oversize frame is
/// already misbehaving). Frames that don't decode to any known variant, or
/// are truncated/corrupt, surface as [`CodecError::MalformedFrame`] — the
/// caller (the control-channel gateway) closes the channel rather than
/// trying to recover mid-stream.
pub fn decode(bytes: &[u8]) -> Result<Message, CodecError> {
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(bytes.len()));
    }
    let msg = rmp_serde::from_slice(bytes)?;
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversize_frame_is_rejected_before_decode() {
        let huge = vec![0u8; MAX_FRAME_SIZE + 1];
        match decode(&huge) {
            Err(CodecError::FrameTooLarge(n)) => assert_eq!(n, huge.len()),
            other => panic!("expected FrameTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn garbage_bytes_are_malformed_not_a_panic() {
        let garbage = vec![0xFF, 0x00, 0x01, 0xDE, 0xAD];
        assert!(matches!(decode(&garbage), Err(CodecError::MalformedFrame(_))));
    }

    #[test]
    fn encode_then_decode_is_identity() {
        let msg = Message::Ping { timestamp_ms: 1234 };
        let bytes = encode(&msg).unwrap();
        assert_eq!(decode(&bytes).unwrap(), msg);
    }
}
