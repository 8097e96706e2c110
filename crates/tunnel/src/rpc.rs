//! Typed RPC commands over a [`Connection`].

use std::sync::Arc;

use bytes::Bytes;
use protocol::error::{ProtocolError, Result};
use protocol::{
    max_port_send_payload, parse_reason, Address, ChannelRef, Command, Envelope, Item, Reply,
    STATUS_OK, TAG_ERROR, TAG_RESPONSE,
};
use tracing::{debug, trace};

use crate::connection::Connection;
use crate::correlator::ReplyHook;

/// Default channel flags for `portopen`.
pub const DEFAULT_PORT_FLAGS: &str = "rw";

/// Typed facade over the relay's command set.
#[derive(Debug, Clone)]
pub struct Rpc {
    connection: Connection,
}

impl Rpc {
    /// Wraps a connection.
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }

    /// The underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Checks that the relay is responsive.
    pub async fn ping(&self) -> Result<bool> {
        let reply = self.connection.send_command(&Command::Ping).await?;
        match reply.status() {
            Some("pong") => Ok(true),
            other => Err(unexpected("ping", other, &reply)),
        }
    }

    /// Returns the number of the latest block.
    pub async fn get_block_peak(&self) -> Result<u64> {
        let reply = self.connection.send_command(&Command::GetBlockPeak).await?;
        reply.first("getblockpeak")?.as_uint().ok_or_else(|| {
            ProtocolError::UnexpectedResponse(format!(
                "getblockpeak: invalid block number {}",
                render(&reply.values)
            ))
        })
    }

    /// Returns the header of block `index`.
    pub async fn get_block_header(&self, index: u64) -> Result<Item> {
        let reply = self
            .connection
            .send_command(&Command::GetBlockHeader(index))
            .await?;
        reply.first("getblockheader").cloned()
    }

    /// Returns block `index`.
    pub async fn get_block(&self, index: u64) -> Result<Item> {
        let reply = self
            .connection
            .send_command(&Command::GetBlock(index))
            .await?;
        reply.first("getblock").cloned()
    }

    /// Opens a virtual channel to `port` on `device_id`.
    pub async fn port_open(&self, device_id: Address, port: u16, flags: &str) -> Result<ChannelRef> {
        self.open(device_id, port, flags, None).await
    }

    /// Opens a virtual channel, calling `on_open` with its ref before any data
    /// the relay sends on it is dispatched.
    pub async fn port_open_with(
        &self,
        device_id: Address,
        port: u16,
        flags: &str,
        on_open: impl Fn(&ChannelRef) + Send + Sync + 'static,
    ) -> Result<ChannelRef> {
        let hook: ReplyHook = Arc::new(move |reply: &Reply| {
            if let Ok(channel_ref) = opened_channel(reply) {
                on_open(&channel_ref);
            }
        });
        self.open(device_id, port, flags, Some(hook)).await
    }

    async fn open(
        &self,
        device_id: Address,
        port: u16,
        flags: &str,
        hook: Option<ReplyHook>,
    ) -> Result<ChannelRef> {
        let command = Command::PortOpen {
            device_id,
            port,
            flags: flags.to_string(),
        };
        let reply = self.connection.send_command_with(&command, hook).await?;
        let channel_ref = opened_channel(&reply)?;
        debug!(channel = %channel_ref, device = %device_id, port, "port opened");
        Ok(channel_ref)
    }

    /// Sends `data` over a channel.
    ///
    /// The byte counter is advanced and a fresh ticket accepted before the
    /// data goes out; a failed renewal aborts the send. Data too large for one
    /// frame is rejected before anything is counted.
    pub async fn port_send(&self, channel_ref: &ChannelRef, data: Bytes) -> Result<()> {
        let max = max_port_send_payload(channel_ref);
        if data.len() > max {
            return Err(ProtocolError::FrameTooLarge {
                size: data.len(),
                max,
            });
        }

        let total = self.connection.signer().add_bytes(data.len() as u64);
        trace!(channel = %channel_ref, len = data.len(), total_bytes = total, "port send");
        self.connection.renew_ticket().await?;

        let reply = self
            .connection
            .send_command(&Command::PortSend {
                channel_ref: channel_ref.clone(),
                data,
            })
            .await?;
        expect_ok("portsend", &reply)
    }

    /// Closes a channel.
    pub async fn port_close(&self, channel_ref: &ChannelRef) -> Result<()> {
        let reply = self
            .connection
            .send_command(&Command::PortClose {
                channel_ref: channel_ref.clone(),
            })
            .await?;
        expect_ok("portclose", &reply)
    }

    /// Answers a relay-initiated request.
    pub async fn send_response(
        &self,
        session_id: Bytes,
        channel_ref: &ChannelRef,
        value: Item,
    ) -> Result<()> {
        let envelope = Envelope::with_session(
            session_id,
            vec![Item::text(TAG_RESPONSE), channel_ref.to_item(), value],
        );
        self.connection.send_raw(&envelope).await
    }

    /// Rejects a relay-initiated request.
    pub async fn send_error(
        &self,
        session_id: Bytes,
        channel_ref: &ChannelRef,
        reason: &str,
    ) -> Result<()> {
        let envelope = Envelope::with_session(
            session_id,
            vec![
                Item::text(TAG_RESPONSE),
                channel_ref.to_item(),
                Item::text(TAG_ERROR),
                Item::text(reason),
            ],
        );
        self.connection.send_raw(&envelope).await
    }
}

fn opened_channel(reply: &Reply) -> Result<ChannelRef> {
    match reply.status() {
        Some(STATUS_OK) => reply
            .status_payload()
            .first()
            .and_then(Item::as_bytes)
            .map(|b| ChannelRef::new(b.clone()))
            .ok_or_else(|| {
                ProtocolError::UnexpectedResponse(
                    "portopen: reply carries no channel ref".to_string(),
                )
            }),
        Some(TAG_ERROR) => Err(ProtocolError::remote(parse_reason(reply.status_payload()))),
        other => Err(unexpected("portopen", other, reply)),
    }
}

fn expect_ok(command: &str, reply: &Reply) -> Result<()> {
    match reply.status() {
        Some(STATUS_OK) => Ok(()),
        Some(TAG_ERROR) => Err(ProtocolError::remote(parse_reason(reply.status_payload()))),
        other => Err(unexpected(command, other, reply)),
    }
}

fn unexpected(command: &str, status: Option<&str>, reply: &Reply) -> ProtocolError {
    ProtocolError::UnexpectedResponse(format!(
        "{}: unknown status {:?} in reply [{}, {}]",
        command,
        status.unwrap_or(""),
        reply.tag,
        render(&reply.values)
    ))
}

fn render(items: &[Item]) -> String {
    items
        .iter()
        .map(|item| item.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(tag: &str, values: Vec<Item>) -> Reply {
        Reply {
            tag: tag.to_string(),
            values,
        }
    }

    #[test]
    fn test_expect_ok() {
        assert!(expect_ok("portsend", &reply("response", vec![Item::text("ok")])).is_ok());
        assert!(expect_ok("portsend", &reply("ok", vec![])).is_ok());
    }

    #[test]
    fn test_expect_ok_error_status() {
        let result = expect_ok(
            "portclose",
            &reply("response", vec![Item::text("error"), Item::text("no such port")]),
        );
        assert!(matches!(
            result,
            Err(ProtocolError::Remote { reason }) if reason == "no such port"
        ));
    }

    #[test]
    fn test_opened_channel() {
        let ok = reply("response", vec![Item::text("ok"), Item::bytes(vec![0xab, 0x12])]);
        assert_eq!(opened_channel(&ok).unwrap().to_string(), "ab12");

        let refused = reply("response", vec![Item::text("error"), Item::text("refused")]);
        assert!(matches!(
            opened_channel(&refused),
            Err(ProtocolError::Remote { reason }) if reason == "refused"
        ));

        let bare = reply("response", vec![Item::text("ok")]);
        assert!(matches!(
            opened_channel(&bare),
            Err(ProtocolError::UnexpectedResponse(_))
        ));
    }

    #[test]
    fn test_expect_ok_unknown_status() {
        let result = expect_ok("portsend", &reply("response", vec![Item::text("maybe")]));
        match result {
            Err(ProtocolError::UnexpectedResponse(msg)) => {
                assert!(msg.contains("portsend"));
                assert!(msg.contains("maybe"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
