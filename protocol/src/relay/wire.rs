//! # Relay wire format
//!
//! Length-prefixed frames on TCP: `[u32 big-endian length][body]`. The
//! body is one of two schemas — a [`StatusMessage`] (server to client,
//! broadcast on membership change) or a [`RelayMessage`] (bidirectional;
//! the server rewrites `endpoint_id` to the true source when forwarding).
//!
//! The first client frame after connect MUST be a `Relay` whose payload
//! decodes as a [`JoinRequest`]; the server answers with a `Status`
//! carrying the post-join network size.
//!
//! Frames longer than [`MAX_FRAME_LENGTH`] are a protocol violation and
//! kill the connection — the length prefix is attacker-controlled input
//! and is never used to size an allocation before the check.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::MAX_FRAME_LENGTH;
use crate::ids::OverlayId;

/// Length of the frame header (the u32 length prefix).
pub const FRAME_HEADER_LENGTH: usize = 4;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors produced by the frame codec.
#[derive(Debug, Error)]
pub enum WireError {
    /// Socket-level failure.
    #[error("transport i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer announced a frame longer than [`MAX_FRAME_LENGTH`].
    #[error("frame of {length} bytes exceeds the {MAX_FRAME_LENGTH} byte limit")]
    FrameTooLarge {
        /// Announced body length.
        length: usize,
    },

    /// The frame body did not decode as any known schema.
    #[error("frame body decode failed: {0}")]
    Codec(#[from] bincode::Error),
}

// ---------------------------------------------------------------------------
// Frame schemas
// ---------------------------------------------------------------------------

/// Membership notification, server to client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMessage {
    /// Number of endpoints currently joined to the relay.
    pub network_size: u32,
}

/// A unicast envelope.
///
/// Client to server: `endpoint_id` is the destination. Server to client:
/// `endpoint_id` has been rewritten to the true source, so a receiver can
/// trust it regardless of what the sender claimed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayMessage {
    /// Destination (outbound) or verified source (inbound).
    pub endpoint_id: OverlayId,
    /// Opaque application payload.
    pub payload: Vec<u8>,
}

/// One frame on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// Membership notification.
    Status(StatusMessage),
    /// Unicast envelope.
    Relay(RelayMessage),
}

/// Payload of the mandatory first client frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    /// The overlay id this connection answers to.
    pub id: OverlayId,
}

impl JoinRequest {
    /// Serializes the join payload.
    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).expect("join serialization is infallible")
    }

    /// Deserializes a join payload.
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        Ok(bincode::deserialize(payload)?)
    }

    /// The join frame itself: a `Relay` addressed at the joining id.
    pub fn into_frame(self) -> Frame {
        Frame::Relay(RelayMessage {
            endpoint_id: self.id,
            payload: self.encode(),
        })
    }
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Serializes a frame to its on-wire bytes (header + body).
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, WireError> {
    let body = bincode::serialize(frame)?;
    if body.len() > MAX_FRAME_LENGTH {
        return Err(WireError::FrameTooLarge { length: body.len() });
    }
    let mut bytes = Vec::with_capacity(FRAME_HEADER_LENGTH + body.len());
    bytes.extend_from_slice(&(body.len() as u32).to_be_bytes());
    bytes.extend_from_slice(&body);
    Ok(bytes)
}

/// Writes one frame to an async writer.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode_frame(frame)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame from an async reader.
///
/// Returns `WireError::Io` with `UnexpectedEof` when the peer closed the
/// connection cleanly between frames.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_LENGTH];
    reader.read_exact(&mut header).await?;
    let length = u32::from_be_bytes(header) as usize;
    if length > MAX_FRAME_LENGTH {
        return Err(WireError::FrameTooLarge { length });
    }
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;
    Ok(bincode::deserialize(&body)?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::BROKER_ID;
    use std::io::Cursor;

    #[tokio::test]
    async fn status_frame_roundtrip() {
        let frame = Frame::Status(StatusMessage { network_size: 7 });
        let bytes = encode_frame(&frame).unwrap();

        let mut cursor = Cursor::new(bytes);
        let decoded = read_frame(&mut cursor).await.unwrap();
        assert_eq!(decoded, frame);
    }

    #[tokio::test]
    async fn relay_frame_roundtrip() {
        let frame = Frame::Relay(RelayMessage {
            endpoint_id: BROKER_ID,
            payload: b"order book entry".to_vec(),
        });
        let bytes = encode_frame(&frame).unwrap();

        let mut cursor = Cursor::new(bytes);
        let decoded = read_frame(&mut cursor).await.unwrap();
        assert_eq!(decoded, frame);
    }

    #[tokio::test]
    async fn multiple_frames_stream() {
        let first = Frame::Status(StatusMessage { network_size: 1 });
        let second = Frame::Status(StatusMessage { network_size: 2 });
        let mut bytes = encode_frame(&first).unwrap();
        bytes.extend(encode_frame(&second).unwrap());

        let mut cursor = Cursor::new(bytes);
        assert_eq!(read_frame(&mut cursor).await.unwrap(), first);
        assert_eq!(read_frame(&mut cursor).await.unwrap(), second);
        assert!(read_frame(&mut cursor).await.is_err()); // clean EOF
    }

    #[tokio::test]
    async fn oversized_header_rejected_before_allocation() {
        let mut bytes = (u32::MAX).to_be_bytes().to_vec();
        bytes.extend_from_slice(&[0u8; 16]);
        let mut cursor = Cursor::new(bytes);
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(err, WireError::FrameTooLarge { .. }));
    }

    #[test]
    fn oversized_payload_rejected_on_encode() {
        let frame = Frame::Relay(RelayMessage {
            endpoint_id: BROKER_ID,
            payload: vec![0u8; MAX_FRAME_LENGTH + 1],
        });
        assert!(matches!(
            encode_frame(&frame),
            Err(WireError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn join_request_roundtrip() {
        let join = JoinRequest { id: BROKER_ID };
        let frame = join.into_frame();
        let Frame::Relay(message) = &frame else {
            panic!("join must be a relay frame");
        };
        assert_eq!(JoinRequest::decode(&message.payload).unwrap(), join);
    }

    #[test]
    fn garbage_payload_is_not_a_join() {
        assert!(JoinRequest::decode(b"not a join").is_err());
    }
}
