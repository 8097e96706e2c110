//! # Diode Protocol Library
//!
//! Wire format, message definitions and identity primitives for the Diode
//! device-networking protocol. Everything in this crate is pure: no I/O, no
//! runtime.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │     Commands / Replies / Unsolicited    │  messages
//! ├─────────────────────────────────────────┤
//! │       Envelope [id, [tag, ...]]         │  RLP encoded
//! ├─────────────────────────────────────────┤
//! │              Framing                    │  u16 length prefix
//! ├─────────────────────────────────────────┤
//! │        Transport (TLS 1.2 stream)       │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{Command, Envelope, FrameCodec, FrameDecoder};
//!
//! let codec = FrameCodec::new();
//! let frame = codec
//!     .encode(&Envelope::request(1, Command::Ping.to_items()))
//!     .unwrap();
//!
//! let mut decoder = FrameDecoder::new();
//! decoder.extend(&frame);
//! let envelope = decoder.next_frame().unwrap().unwrap();
//! assert_eq!(envelope.tag(), Some("ping"));
//! ```
//!
//! ## Modules
//!
//! - [`rlp`]: RLP items and their encoding
//! - [`framing`]: Length-prefixed frame codec
//! - [`messages`]: Envelopes, commands, replies and unsolicited messages
//! - [`identity`]: Addresses, client identity and signatures
//! - [`ticket`]: Usage tickets and epoch arithmetic
//! - [`error`]: Error types

pub mod error;
pub mod framing;
pub mod identity;
pub mod messages;
pub mod rlp;
pub mod ticket;

pub use error::{ProtocolError, Result};
pub use framing::{
    encode_frame, max_port_send_payload, try_decode_frame, FrameCodec, FrameDecoder,
    LENGTH_PREFIX_SIZE, MAX_PAYLOAD_SIZE,
};
pub use identity::{keccak256, recover_signer, Address, ClientIdentity, SIGNATURE_LENGTH};
pub use messages::{
    parse_reason, ChannelRef, Command, Envelope, Reply, Unsolicited, MAX_REQUEST_ID, STATUS_OK,
    TAG_ERROR, TAG_RESPONSE,
};
pub use rlp::Item;
pub use ticket::{
    block_timestamp, epoch_expiry, epoch_for_timestamp, SignedTicket, Ticket,
    EPOCH_DURATION_SECS, TICKET_COMMAND,
};
