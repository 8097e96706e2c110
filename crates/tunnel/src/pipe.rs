//! Bridging local byte streams to virtual channels.
//!
//! A [`Bridge`] pumps bytes between any `AsyncRead + AsyncWrite` stream and a
//! [`ChannelSink`]: local reads are sent upstream through the sink, while data
//! the relay delivers for the channel is queued with [`Bridge::deliver`] and
//! written to the local stream in order. Both directions run concurrently, so
//! a slow upstream send never stalls delivery.
//!
//! The delivery queue is bounded. A local stream that falls
//! [`INBOUND_QUEUE_CAPACITY`] chunks behind ends the bridge with
//! [`BridgeEnd::Overflow`] rather than losing bytes from the middle of it.
//!
//! The bridge never touches the channel tables. Its owner awaits the
//! [`BridgeEnd`] and performs cleanup.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use protocol::error::{ProtocolError, Result};
use protocol::ChannelRef;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::rpc::Rpc;

/// Read buffer size for local streams.
pub const BRIDGE_BUFFER_SIZE: usize = 16 * 1024;

/// Capacity of in-memory byte pipes.
pub const PIPE_CAPACITY: usize = 64 * 1024;

/// Chunks of relay data that may wait for a slow local stream.
pub const INBOUND_QUEUE_CAPACITY: usize = 256;

/// Upstream side of a virtual channel.
pub trait ChannelSink: Send + Sync {
    /// Sends one chunk of local data over the channel.
    fn send<'a>(&'a self, data: Bytes) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

/// Sends local data with `portsend`.
#[derive(Debug, Clone)]
pub struct RpcChannelSink {
    rpc: Rpc,
    channel_ref: ChannelRef,
}

impl RpcChannelSink {
    pub fn new(rpc: Rpc, channel_ref: ChannelRef) -> Self {
        Self { rpc, channel_ref }
    }
}

impl ChannelSink for RpcChannelSink {
    fn send<'a>(&'a self, data: Bytes) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(self.rpc.port_send(&self.channel_ref, data))
    }
}

/// Why a bridge stopped.
#[derive(Debug)]
pub enum BridgeEnd {
    /// The local stream reached EOF.
    LocalClosed,
    /// Reading or writing the local stream failed.
    LocalError(std::io::Error),
    /// Sending upstream failed.
    SinkFailed(ProtocolError),
    /// The remote side closed the channel and queued data was flushed.
    RemoteClosed,
    /// The local stream could not keep up with the relay.
    Overflow,
    /// The bridge was aborted.
    Aborted,
}

impl BridgeEnd {
    /// Returns true if the channel must be closed upstream.
    pub fn needs_remote_close(&self) -> bool {
        matches!(
            self,
            BridgeEnd::LocalClosed
                | BridgeEnd::LocalError(_)
                | BridgeEnd::SinkFailed(_)
                | BridgeEnd::Overflow
        )
    }
}

/// Handle to a running bridge.
#[derive(Debug)]
pub struct Bridge {
    inbound: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
    overflowed: Arc<AtomicBool>,
}

impl Bridge {
    /// Starts bridging `stream` to `sink`.
    pub fn spawn<S>(stream: S, sink: Arc<dyn ChannelSink>) -> (Self, JoinHandle<BridgeEnd>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (inbound, rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
        let cancel = CancellationToken::new();
        let overflowed = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(run_bridge(
            stream,
            sink,
            rx,
            cancel.clone(),
            Arc::clone(&overflowed),
        ));
        (
            Self {
                inbound,
                cancel,
                overflowed,
            },
            task,
        )
    }

    /// Queues data received from the relay for the local stream.
    ///
    /// Returns false if the bridge has stopped, or stops now because its
    /// queue is full.
    pub fn deliver(&self, data: Bytes) -> bool {
        match self.inbound.try_send(data) {
            Ok(()) => true,
            Err(TrySendError::Full(data)) => {
                warn!(
                    queued = INBOUND_QUEUE_CAPACITY,
                    "Local stream is not keeping up, dropping {} bytes and closing",
                    data.len()
                );
                self.overflowed.store(true, Ordering::SeqCst);
                self.cancel.cancel();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Flushes queued data, then shuts down the local stream.
    pub fn finish(self) {
        drop(self.inbound);
    }

    /// Stops the bridge immediately.
    pub fn abort(&self) {
        self.cancel.cancel();
    }
}

async fn run_bridge<S>(
    stream: S,
    sink: Arc<dyn ChannelSink>,
    mut inbound: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
    overflowed: Arc<AtomicBool>,
) -> BridgeEnd
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);

    let upstream = async {
        let mut buf = vec![0u8; BRIDGE_BUFFER_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => return BridgeEnd::LocalClosed,
                Ok(n) => {
                    trace!(len = n, "local -> channel");
                    if let Err(e) = sink.send(Bytes::copy_from_slice(&buf[..n])).await {
                        return BridgeEnd::SinkFailed(e);
                    }
                }
                Err(e) => return BridgeEnd::LocalError(e),
            }
        }
    };

    let downstream = async {
        while let Some(data) = inbound.recv().await {
            trace!(len = data.len(), "channel -> local");
            if let Err(e) = writer.write_all(&data).await {
                return BridgeEnd::LocalError(e);
            }
        }
        let _ = writer.shutdown().await;
        BridgeEnd::RemoteClosed
    };

    tokio::select! {
        _ = cancel.cancelled() => {
            if overflowed.load(Ordering::SeqCst) {
                BridgeEnd::Overflow
            } else {
                BridgeEnd::Aborted
            }
        }
        end = upstream => end,
        end = downstream => end,
    }
}
