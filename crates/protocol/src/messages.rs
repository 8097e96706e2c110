//! Protocol message definitions.
//!
//! Every frame carries one [`Envelope`]: `[id, [tag, ...args]]`. Outbound
//! commands put a request id in `id`; replies echo it back. Messages the remote
//! originates on its own (channel data, channel close, channel open requests)
//! carry a channel ref or session id in `id` instead and are decoded once,
//! here, into the closed [`Unsolicited`] enum.

use std::fmt;

use bytes::Bytes;

use crate::error::{ProtocolError, Result};
use crate::identity::Address;
use crate::rlp::Item;

/// Largest request id before the counter wraps (2^53 - 1).
pub const MAX_REQUEST_ID: u64 = (1 << 53) - 1;

/// Reply tag for a successful response.
pub const TAG_RESPONSE: &str = "response";
/// Reply tag for an error response.
pub const TAG_ERROR: &str = "error";
/// Status value for a successful port operation.
pub const STATUS_OK: &str = "ok";

/// Opaque identifier of one virtual channel, assigned by the remote side.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ChannelRef(Bytes);

impl ChannelRef {
    /// Creates a channel ref from raw bytes.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Returns the raw bytes of this ref.
    pub fn as_bytes(&self) -> &Bytes {
        &self.0
    }

    /// Returns this ref as an RLP item.
    pub fn to_item(&self) -> Item {
        Item::Bytes(self.0.clone())
    }

    fn from_item(item: Option<&Item>, context: &str) -> Result<Self> {
        item.and_then(Item::as_bytes)
            .map(|b| Self(b.clone()))
            .ok_or_else(|| {
                ProtocolError::Deserialization(format!("{}: missing channel ref", context))
            })
    }
}

impl fmt::Display for ChannelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

impl fmt::Debug for ChannelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelRef({})", self)
    }
}

/// One wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Request id, or channel ref / session id for remote-originated messages.
    pub id: Item,
    /// Tag followed by arguments.
    pub body: Vec<Item>,
}

impl Envelope {
    /// Creates an envelope for an outbound request.
    pub fn request(request_id: u64, body: Vec<Item>) -> Self {
        Self {
            id: Item::uint(request_id),
            body,
        }
    }

    /// Creates an envelope addressed by a remote-supplied session id.
    pub fn with_session(session_id: Bytes, body: Vec<Item>) -> Self {
        Self {
            id: Item::Bytes(session_id),
            body,
        }
    }

    /// Returns the id as a request id, if it is an integer.
    pub fn request_id(&self) -> Option<u64> {
        self.id.as_uint()
    }

    /// Returns the first body element as text.
    pub fn tag(&self) -> Option<&str> {
        self.body.first().and_then(Item::as_str)
    }

    /// Converts to the `[id, body]` RLP item.
    pub fn to_item(&self) -> Item {
        Item::List(vec![self.id.clone(), Item::List(self.body.clone())])
    }

    /// Parses an `[id, [tag, ...]]` RLP item.
    ///
    /// Extra trailing elements after the body are ignored.
    pub fn from_item(item: Item) -> Result<Self> {
        let mut parts = match item {
            Item::List(parts) if parts.len() >= 2 => parts.into_iter(),
            other => {
                return Err(ProtocolError::Deserialization(format!(
                    "envelope must be a list of at least two items, got {}",
                    other
                )))
            }
        };
        let id = parts.next().unwrap_or(Item::List(Vec::new()));
        let body = match parts.next() {
            Some(Item::List(body)) => body,
            Some(other) => {
                return Err(ProtocolError::Deserialization(format!(
                    "envelope body must be a list, got {}",
                    other
                )))
            }
            None => Vec::new(),
        };
        Ok(Self { id, body })
    }
}

/// Outbound commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Liveness check.
    Ping,
    /// Current peak block number.
    GetBlockPeak,
    /// Header of the block at the given index.
    GetBlockHeader(u64),
    /// Full block at the given index.
    GetBlock(u64),
    /// Open a virtual channel to a port on a remote device.
    PortOpen {
        device_id: Address,
        port: u16,
        flags: String,
    },
    /// Send data over a virtual channel.
    PortSend { channel_ref: ChannelRef, data: Bytes },
    /// Close a virtual channel.
    PortClose { channel_ref: ChannelRef },
    /// Pre-encoded command body, e.g. a signed ticket.
    Raw(Vec<Item>),
}

impl Command {
    /// Wire name of the command.
    pub fn name(&self) -> &str {
        match self {
            Command::Ping => "ping",
            Command::GetBlockPeak => "getblockpeak",
            Command::GetBlockHeader(_) => "getblockheader",
            Command::GetBlock(_) => "getblock",
            Command::PortOpen { .. } => "portopen",
            Command::PortSend { .. } => "portsend",
            Command::PortClose { .. } => "portclose",
            Command::Raw(items) => items.first().and_then(Item::as_str).unwrap_or("raw"),
        }
    }

    /// Returns the command as an envelope body: `[name, ...args]`.
    pub fn to_items(&self) -> Vec<Item> {
        let name = Item::text(self.name());
        match self {
            Command::Ping | Command::GetBlockPeak => vec![name],
            Command::GetBlockHeader(index) | Command::GetBlock(index) => {
                vec![name, Item::uint(*index)]
            }
            Command::PortOpen {
                device_id,
                port,
                flags,
            } => vec![
                name,
                Item::from(&device_id.as_bytes()[..]),
                Item::uint(u64::from(*port)),
                Item::text(flags),
            ],
            Command::PortSend { channel_ref, data } => {
                vec![name, channel_ref.to_item(), Item::Bytes(data.clone())]
            }
            Command::PortClose { channel_ref } => vec![name, channel_ref.to_item()],
            Command::Raw(items) => items.clone(),
        }
    }
}

/// A successful reply to a request: the tag and the values following it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Reply tag, normally `"response"`.
    pub tag: String,
    /// Values following the tag.
    pub values: Vec<Item>,
}

impl Reply {
    /// Returns the status word of the reply.
    ///
    /// For `"response"` replies this is the first value; for any other tag the
    /// tag itself is the status.
    pub fn status(&self) -> Option<&str> {
        if self.tag == TAG_RESPONSE {
            self.values.first().and_then(Item::as_str)
        } else {
            Some(self.tag.as_str())
        }
    }

    /// Values following the status word.
    pub fn status_payload(&self) -> &[Item] {
        if self.tag == TAG_RESPONSE {
            self.values.get(1..).unwrap_or(&[])
        } else {
            &self.values
        }
    }

    /// First value, or an `UnexpectedResponse` error naming `what`.
    pub fn first(&self, what: &str) -> Result<&Item> {
        self.values.first().ok_or_else(|| {
            ProtocolError::UnexpectedResponse(format!("{}: reply carries no value", what))
        })
    }
}

/// Extracts a human-readable reason from the values of an `error` reply.
///
/// Two encodings exist: a bare `[reason]` and `[code, reason]`. A nested
/// `[[code, reason]]` is accepted too.
pub fn parse_reason(values: &[Item]) -> String {
    match values {
        [] => String::new(),
        [Item::List(inner), ..] => parse_reason_from_list(inner),
        [first, second, ..] if !first.is_printable() => item_text(second),
        [first, ..] => item_text(first),
    }
}

fn parse_reason_from_list(inner: &[Item]) -> String {
    match inner {
        [] => String::new(),
        [single] => item_text(single),
        [.., last] => item_text(last),
    }
}

fn item_text(item: &Item) -> String {
    match item.as_str() {
        Some(s) => s.to_string(),
        None => item.to_string(),
    }
}

/// Messages originated by the remote side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unsolicited {
    /// The remote wants to open a channel into a published port.
    PortOpen {
        session_id: Bytes,
        port_spec: String,
        channel_ref: ChannelRef,
        device_id: Bytes,
    },
    /// Data arriving on a channel (`data` or `portsend`).
    PortSend {
        session_id: Bytes,
        channel_ref: ChannelRef,
        data: Bytes,
    },
    /// The remote closed a channel.
    PortClose {
        session_id: Bytes,
        channel_ref: ChannelRef,
    },
    /// Anything else, kept for logging.
    Other { message_type: String },
}

impl Unsolicited {
    /// Decodes a remote-originated envelope.
    pub fn from_envelope(envelope: &Envelope) -> Result<Self> {
        let session_id = match &envelope.id {
            Item::Bytes(b) => b.clone(),
            Item::List(_) => Bytes::new(),
        };
        let message_type = envelope
            .tag()
            .ok_or_else(|| ProtocolError::Deserialization("message has no type".to_string()))?;
        let args = &envelope.body[1..];

        match message_type {
            "portopen" => {
                let port_spec = args
                    .first()
                    .and_then(Item::as_str)
                    .ok_or_else(|| {
                        ProtocolError::Deserialization("portopen: missing port".to_string())
                    })?
                    .to_string();
                let channel_ref = ChannelRef::from_item(args.get(1), "portopen")?;
                let device_id = args
                    .get(2)
                    .and_then(Item::as_bytes)
                    .cloned()
                    .unwrap_or_default();
                Ok(Unsolicited::PortOpen {
                    session_id,
                    port_spec,
                    channel_ref,
                    device_id,
                })
            }
            "data" | "portsend" => {
                let channel_ref = ChannelRef::from_item(args.first(), message_type)?;
                let data = args
                    .get(1)
                    .and_then(Item::as_bytes)
                    .cloned()
                    .ok_or_else(|| {
                        ProtocolError::Deserialization(format!("{}: missing data", message_type))
                    })?;
                Ok(Unsolicited::PortSend {
                    session_id,
                    channel_ref,
                    data,
                })
            }
            "portclose" => Ok(Unsolicited::PortClose {
                session_id,
                channel_ref: ChannelRef::from_item(args.first(), "portclose")?,
            }),
            other => Ok(Unsolicited::Other {
                message_type: other.to_string(),
            }),
        }
    }
}
