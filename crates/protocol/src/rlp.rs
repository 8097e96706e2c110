//! Recursive length prefix (RLP) items.
//!
//! Only what the wire protocol needs: an [`Item`] is either a byte string or a
//! list of items. Integers travel as minimal big-endian byte strings (zero is
//! the empty string) and text as UTF-8 bytes.
//!
//! # Encoding
//!
//! | First byte    | Meaning                                          |
//! |---------------|--------------------------------------------------|
//! | `0x00..=0x7f` | the byte itself                                  |
//! | `0x80..=0xb7` | string of `b - 0x80` bytes follows               |
//! | `0xb8..=0xbf` | `b - 0xb7` length bytes, then the string         |
//! | `0xc0..=0xf7` | list payload of `b - 0xc0` bytes follows         |
//! | `0xf8..=0xff` | `b - 0xf7` length bytes, then the list payload   |

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ProtocolError, Result};

/// Longest payload that still uses the short header form.
const SHORT_PAYLOAD_MAX: usize = 55;

const STRING_OFFSET: u8 = 0x80;
const LONG_STRING_OFFSET: u8 = 0xb7;
const LIST_OFFSET: u8 = 0xc0;
const LONG_LIST_OFFSET: u8 = 0xf7;

/// A decoded RLP value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Item {
    /// A byte string.
    Bytes(Bytes),
    /// A list of nested items.
    List(Vec<Item>),
}

impl Item {
    /// Creates a byte-string item.
    pub fn bytes(data: impl Into<Bytes>) -> Self {
        Item::Bytes(data.into())
    }

    /// Creates a byte-string item holding UTF-8 text.
    pub fn text(s: &str) -> Self {
        Item::Bytes(Bytes::copy_from_slice(s.as_bytes()))
    }

    /// Creates a minimal big-endian integer item.
    pub fn uint(value: u64) -> Self {
        let be = value.to_be_bytes();
        let skip = be.iter().take_while(|b| **b == 0).count();
        Item::Bytes(Bytes::copy_from_slice(&be[skip..]))
    }

    /// Creates a list item.
    pub fn list(items: Vec<Item>) -> Self {
        Item::List(items)
    }

    /// Returns the byte string, if this is one.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Item::Bytes(b) => Some(b),
            Item::List(_) => None,
        }
    }

    /// Returns the nested items, if this is a list.
    pub fn as_list(&self) -> Option<&[Item]> {
        match self {
            Item::List(items) => Some(items),
            Item::Bytes(_) => None,
        }
    }

    /// Returns the byte string as UTF-8 text.
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    /// Interprets the byte string as a big-endian unsigned integer.
    ///
    /// Accepts fixed-width encodings with leading zeros; fails for strings
    /// longer than eight bytes and for lists.
    pub fn as_uint(&self) -> Option<u64> {
        let bytes = self.as_bytes()?;
        if bytes.len() > 8 {
            return None;
        }
        Some(bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
    }

    /// Returns true for a non-empty byte string made only of printable ASCII.
    pub fn is_printable(&self) -> bool {
        match self {
            Item::Bytes(b) => !b.is_empty() && b.iter().all(|c| (0x20..=0x7e).contains(c)),
            Item::List(_) => false,
        }
    }

    /// Encodes this item into a fresh buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.to_vec()
    }

    /// Appends the encoding of this item to `dst`.
    pub fn encode_into(&self, dst: &mut BytesMut) {
        match self {
            Item::Bytes(b) if b.len() == 1 && b[0] < STRING_OFFSET => dst.put_u8(b[0]),
            Item::Bytes(b) => {
                put_header(dst, STRING_OFFSET, LONG_STRING_OFFSET, b.len());
                dst.put_slice(b);
            }
            Item::List(items) => {
                let payload_len = items.iter().map(Item::encoded_len).sum();
                put_header(dst, LIST_OFFSET, LONG_LIST_OFFSET, payload_len);
                for item in items {
                    item.encode_into(dst);
                }
            }
        }
    }

    /// Size of this item once encoded.
    pub fn encoded_len(&self) -> usize {
        match self {
            Item::Bytes(b) if b.len() == 1 && b[0] < STRING_OFFSET => 1,
            Item::Bytes(b) => header_len(b.len()) + b.len(),
            Item::List(items) => {
                let payload: usize = items.iter().map(Item::encoded_len).sum();
                header_len(payload) + payload
            }
        }
    }

    /// Decodes exactly one item spanning all of `data`.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let (item, consumed) = decode_item(data)?;
        if consumed != data.len() {
            return Err(ProtocolError::Deserialization(format!(
                "trailing data after rlp item: {} of {} bytes consumed",
                consumed,
                data.len()
            )));
        }
        Ok(item)
    }
}

impl From<&str> for Item {
    fn from(s: &str) -> Self {
        Item::text(s)
    }
}

impl From<u64> for Item {
    fn from(v: u64) -> Self {
        Item::uint(v)
    }
}

impl From<Bytes> for Item {
    fn from(b: Bytes) -> Self {
        Item::Bytes(b)
    }
}

impl From<Vec<u8>> for Item {
    fn from(v: Vec<u8>) -> Self {
        Item::Bytes(Bytes::from(v))
    }
}

impl From<&[u8]> for Item {
    fn from(v: &[u8]) -> Self {
        Item::Bytes(Bytes::copy_from_slice(v))
    }
}

impl From<Vec<Item>> for Item {
    fn from(items: Vec<Item>) -> Self {
        Item::List(items)
    }
}

/// Human-readable rendering used in logs: printable strings as text, short
/// byte strings as integers, everything else as `0x` hex.
impl fmt::Display for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Item::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Item::Bytes(b) if self.is_printable() => {
                write!(f, "\"{}\"", String::from_utf8_lossy(b))
            }
            Item::Bytes(b) if !b.is_empty() && b.len() <= 6 => {
                write!(f, "{}", self.as_uint().unwrap_or_default())
            }
            Item::Bytes(b) => write!(f, "0x{}", hex::encode(b)),
        }
    }
}

fn header_len(payload_len: usize) -> usize {
    if payload_len <= SHORT_PAYLOAD_MAX {
        1
    } else {
        1 + be_len(payload_len)
    }
}

/// Number of bytes needed for the minimal big-endian form of `n`.
fn be_len(n: usize) -> usize {
    let bits = usize::BITS - n.leading_zeros();
    bits.div_ceil(8) as usize
}

fn put_header(dst: &mut BytesMut, short_offset: u8, long_offset: u8, payload_len: usize) {
    if payload_len <= SHORT_PAYLOAD_MAX {
        dst.put_u8(short_offset + payload_len as u8);
    } else {
        let len_len = be_len(payload_len);
        dst.put_u8(long_offset + len_len as u8);
        let be = payload_len.to_be_bytes();
        dst.put_slice(&be[be.len() - len_len..]);
    }
}

/// Decodes one item from the front of `data`, returning it with the number of
/// bytes consumed.
fn decode_item(data: &[u8]) -> Result<(Item, usize)> {
    let prefix = *data
        .first()
        .ok_or_else(|| ProtocolError::Deserialization("empty rlp input".to_string()))?;

    if prefix < STRING_OFFSET {
        return Ok((Item::Bytes(Bytes::copy_from_slice(&data[..1])), 1));
    }

    let (is_list, offset, len) = match prefix {
        0x80..=0xb7 => (false, 1, (prefix - STRING_OFFSET) as usize),
        0xb8..=0xbf => {
            let len_len = (prefix - LONG_STRING_OFFSET) as usize;
            (false, 1 + len_len, read_long_len(data, len_len)?)
        }
        0xc0..=0xf7 => (true, 1, (prefix - LIST_OFFSET) as usize),
        _ => {
            let len_len = (prefix - LONG_LIST_OFFSET) as usize;
            (true, 1 + len_len, read_long_len(data, len_len)?)
        }
    };

    let end = offset
        .checked_add(len)
        .filter(|end| *end <= data.len())
        .ok_or_else(|| {
            ProtocolError::Deserialization(format!(
                "rlp item needs {} bytes, have {}",
                offset.saturating_add(len),
                data.len()
            ))
        })?;
    let payload = &data[offset..end];

    if !is_list {
        return Ok((Item::Bytes(Bytes::copy_from_slice(payload)), end));
    }

    let mut items = Vec::new();
    let mut pos = 0;
    while pos < payload.len() {
        let (item, used) = decode_item(&payload[pos..])?;
        items.push(item);
        pos += used;
    }
    Ok((Item::List(items), end))
}

fn read_long_len(data: &[u8], len_len: usize) -> Result<usize> {
    let bytes = data.get(1..1 + len_len).ok_or_else(|| {
        ProtocolError::Deserialization("truncated rlp length prefix".to_string())
    })?;
    if bytes[0] == 0 {
        return Err(ProtocolError::Deserialization(
            "non-canonical rlp length with leading zero".to_string(),
        ));
    }
    if len_len > std::mem::size_of::<usize>() {
        return Err(ProtocolError::Deserialization(format!(
            "rlp length prefix of {} bytes is too wide",
            len_len
        )));
    }
    let len = bytes.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize);
    if len <= SHORT_PAYLOAD_MAX {
        return Err(ProtocolError::Deserialization(format!(
            "non-canonical long rlp length {}",
            len
        )));
    }
    Ok(len)
}
