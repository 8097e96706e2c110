//! Usage tickets and epoch arithmetic.
//!
//! A ticket attests to the cumulative usage of one client against one server
//! within an epoch. Its digest is keccak-256 over seven 32-byte words:
//!
//! ```text
//! chain_id | epoch | fleet_contract | server_id | total_connections | total_bytes | keccak(local_address)
//! ```
//!
//! Integers are big-endian and addresses are left-padded with zeros.

use bytes::Bytes;

use crate::error::{ProtocolError, Result};
use crate::identity::{keccak256, recover_signer, Address, ClientIdentity, SIGNATURE_LENGTH};
use crate::rlp::Item;

/// Length of one epoch: 30 days in seconds.
pub const EPOCH_DURATION_SECS: u64 = 2_592_000;

/// Command name of a signed ticket.
pub const TICKET_COMMAND: &str = "ticketv2";

/// Returns the epoch containing the block timestamp `timestamp`.
pub fn epoch_for_timestamp(timestamp: u64) -> u64 {
    timestamp / EPOCH_DURATION_SECS
}

/// Returns when an epoch computed at `now` from `timestamp` stops being valid.
///
/// The remaining part of the epoch is measured from the block timestamp but
/// counted from the local clock.
pub fn epoch_expiry(timestamp: u64, now: u64) -> u64 {
    now.saturating_add(EPOCH_DURATION_SECS - timestamp % EPOCH_DURATION_SECS)
}

/// Extracts the block timestamp from a block header.
///
/// Headers are lists of `[key, value]` pairs; the `timestamp` pair is looked
/// up by key, falling back to the first pair.
pub fn block_timestamp(header: &Item) -> Result<u64> {
    let pairs = header.as_list().ok_or_else(|| {
        ProtocolError::UnexpectedResponse(format!("block header is not a list: {}", header))
    })?;
    let pair = pairs
        .iter()
        .find(|pair| {
            pair.as_list()
                .and_then(|kv| kv.first())
                .and_then(Item::as_str)
                == Some("timestamp")
        })
        .or_else(|| pairs.first())
        .and_then(Item::as_list)
        .ok_or_else(|| {
            ProtocolError::UnexpectedResponse("block header has no timestamp".to_string())
        })?;
    pair.get(1).and_then(Item::as_uint).ok_or_else(|| {
        ProtocolError::UnexpectedResponse(format!("invalid block timestamp in {}", header))
    })
}

/// Unsigned ticket contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    pub chain_id: u64,
    pub epoch: u64,
    pub fleet_contract: Address,
    pub server_id: Address,
    pub total_connections: u64,
    pub total_bytes: u64,
    pub local_address: Bytes,
}

impl Ticket {
    /// Computes the digest that gets signed.
    pub fn digest(&self) -> [u8; 32] {
        let mut buf = Vec::with_capacity(7 * 32);
        buf.extend_from_slice(&uint_word(self.chain_id));
        buf.extend_from_slice(&uint_word(self.epoch));
        buf.extend_from_slice(&self.fleet_contract.to_word());
        buf.extend_from_slice(&self.server_id.to_word());
        buf.extend_from_slice(&uint_word(self.total_connections));
        buf.extend_from_slice(&uint_word(self.total_bytes));
        buf.extend_from_slice(&keccak256(&self.local_address));
        keccak256(&buf)
    }

    /// Signs the ticket with the client identity.
    pub fn sign(self, identity: &ClientIdentity) -> Result<SignedTicket> {
        let signature = identity.sign_digest(&self.digest())?;
        Ok(SignedTicket {
            ticket: self,
            signature,
        })
    }
}

/// A ticket together with its `[recovery_id, r, s]` signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTicket {
    pub ticket: Ticket,
    pub signature: [u8; SIGNATURE_LENGTH],
}

impl SignedTicket {
    /// Returns the ticket as a command body.
    ///
    /// The server id is implied by the session and not sent.
    pub fn to_command_items(&self) -> Vec<Item> {
        let t = &self.ticket;
        vec![
            Item::text(TICKET_COMMAND),
            Item::uint(t.chain_id),
            Item::uint(t.epoch),
            Item::from(&t.fleet_contract.as_bytes()[..]),
            Item::uint(t.total_connections),
            Item::uint(t.total_bytes),
            Item::Bytes(t.local_address.clone()),
            Item::from(&self.signature[..]),
        ]
    }

    /// Recovers the address that signed this ticket.
    pub fn signer(&self) -> Result<Address> {
        recover_signer(&self.ticket.digest(), &self.signature)
    }
}

fn uint_word(value: u64) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[24..].copy_from_slice(&value.to_be_bytes());
    word
}
