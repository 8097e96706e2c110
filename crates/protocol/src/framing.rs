//! Frame codec for length-prefixed RLP messages.
//!
//! # Frame Format
//!
//! Each frame consists of:
//! - 2 bytes: payload length (big-endian)
//! - N bytes: RLP encoding of one [`Envelope`]
//!
//! The length prefix caps a single payload at 65535 bytes.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{ProtocolError, Result};
use crate::messages::{ChannelRef, Command, Envelope, MAX_REQUEST_ID};
use crate::rlp::Item;

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 2;

/// Maximum payload size representable by the length prefix.
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Encoder and decoder for frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl FrameCodec {
    /// Create a new frame codec.
    pub fn new() -> Self {
        Self
    }

    /// Encode an envelope into a complete frame.
    pub fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        let item = envelope.to_item();
        let payload_len = item.encoded_len();
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let mut output = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload_len);
        output.extend_from_slice(&(payload_len as u16).to_be_bytes());
        item.encode_into(&mut output);
        Ok(output.to_vec())
    }

    /// Decode one frame from the start of `data`.
    ///
    /// Returns the decoded envelope and the number of bytes consumed, or
    /// `None` if `data` does not yet hold a complete frame.
    pub fn try_decode(&self, data: &[u8]) -> Result<Option<(Envelope, usize)>> {
        let Some(payload_len) = peek_length(data) else {
            return Ok(None);
        };
        let frame_len = LENGTH_PREFIX_SIZE + payload_len;
        if data.len() < frame_len {
            return Ok(None);
        }

        let envelope = decode_payload(&data[LENGTH_PREFIX_SIZE..frame_len])?;
        Ok(Some((envelope, frame_len)))
    }
}

/// Encode an envelope into a complete frame.
pub fn encode_frame(envelope: &Envelope) -> Result<Vec<u8>> {
    FrameCodec.encode(envelope)
}

/// Decode one frame from the start of `data`. See [`FrameCodec::try_decode`].
pub fn try_decode_frame(data: &[u8]) -> Result<Option<(Envelope, usize)>> {
    FrameCodec.try_decode(data)
}

/// Largest `portsend` payload on `channel_ref` that still fits in one frame,
/// whatever the request id.
pub fn max_port_send_payload(channel_ref: &ChannelRef) -> usize {
    // Between 256 and 65535 bytes every RLP length header is 3 bytes long, so
    // the envelope overhead measured here holds up to the frame limit.
    const SAMPLE: usize = 1024;
    let command = Command::PortSend {
        channel_ref: channel_ref.clone(),
        data: Bytes::from(vec![0u8; SAMPLE]),
    };
    let encoded = Envelope::request(MAX_REQUEST_ID, command.to_items())
        .to_item()
        .encoded_len();
    MAX_PAYLOAD_SIZE.saturating_sub(encoded - SAMPLE)
}

fn peek_length(data: &[u8]) -> Option<usize> {
    match data {
        [hi, lo, ..] => Some(usize::from(u16::from_be_bytes([*hi, *lo]))),
        _ => None,
    }
}

fn decode_payload(payload: &[u8]) -> Result<Envelope> {
    let item = Item::decode(payload)?;
    Envelope::from_item(item)
}

/// Streaming decoder that reassembles frames from arbitrary byte chunks.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Returns the next complete frame, if one is buffered.
    ///
    /// A frame whose payload fails to decode is consumed and reported as an
    /// error, so the caller can log it and keep reading the frames after it.
    pub fn next_frame(&mut self) -> Option<Result<Envelope>> {
        let payload_len = peek_length(&self.buffer)?;
        let frame_len = LENGTH_PREFIX_SIZE + payload_len;
        if self.buffer.len() < frame_len {
            return None;
        }

        self.buffer.advance(LENGTH_PREFIX_SIZE);
        let payload = self.buffer.split_to(payload_len);
        Some(decode_payload(&payload))
    }

    /// Number of bytes held that do not yet form a complete frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}
