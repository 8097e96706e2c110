//! Port publishing: exposes local services to remote devices.
//!
//! The relay asks to open a channel with an unsolicited
//! `[sessionId, ["portopen", "proto:port", ref, deviceId]]`. Published ports
//! are served over plain TCP, UDP, or TLS terminated locally on top of the
//! channel. Data arriving for a published channel carries a 4-byte
//! little-endian length header, which is stripped before delivery.
//!
//! Datagrams are never split: one too large for a single `portsend` frame is
//! dropped with a warning and the channel stays open.

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use protocol::error::{ProtocolError, Result};
use protocol::{max_port_send_payload, ChannelRef, Item, Unsolicited, STATUS_OK};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::connection::ConnectionEvent;
use crate::pipe::{
    Bridge, BridgeEnd, ChannelSink, RpcChannelSink, INBOUND_QUEUE_CAPACITY, PIPE_CAPACITY,
};
use crate::rpc::Rpc;
use crate::transport::TlsAcceptor;

/// Size of the length header on published channel data.
pub const DATA_HEADER_SIZE: usize = 4;

const MAX_DATAGRAM_SIZE: usize = 65_535;

/// Transport a published port is reached with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortProtocol {
    Tcp,
    Udp,
    Tls,
}

impl fmt::Display for PortProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortProtocol::Tcp => write!(f, "tcp"),
            PortProtocol::Udp => write!(f, "udp"),
            PortProtocol::Tls => write!(f, "tls"),
        }
    }
}

/// A parsed `protocol:port` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSpec {
    pub protocol: String,
    pub port: Option<u16>,
}

impl PortSpec {
    /// The protocol, if it is one the publisher serves.
    pub fn known_protocol(&self) -> Option<PortProtocol> {
        match self.protocol.as_str() {
            "tcp" => Some(PortProtocol::Tcp),
            "udp" => Some(PortProtocol::Udp),
            "tls" => Some(PortProtocol::Tls),
            _ => None,
        }
    }

    /// Parses `protocol:port`. A bare port means `tcp`; an unparsable port
    /// yields `port: None`.
    pub fn parse(s: &str) -> Self {
        let (protocol, port) = match s.split_once(':') {
            Some((protocol, port)) => (protocol, port),
            None => ("tcp", s),
        };
        Self {
            protocol: protocol.to_ascii_lowercase(),
            port: port.trim().parse().ok(),
        }
    }
}

/// Strips the length header from published channel data.
pub fn strip_data_header(data: &Bytes) -> Option<Bytes> {
    (data.len() >= DATA_HEADER_SIZE).then(|| data.slice(DATA_HEADER_SIZE..))
}

/// Frames a local datagram for the channel: 4-byte little-endian length, then
/// the payload.
pub fn frame_datagram(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(DATA_HEADER_SIZE + payload.len());
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// Settings of a publisher.
#[derive(Clone)]
pub struct PublishOptions {
    pub ports: Vec<u16>,
    pub local_host: String,
    /// Server side of the pinned TLS profile. `tls:` requests are rejected
    /// without it.
    pub tls: Option<TlsAcceptor>,
}

impl fmt::Debug for PublishOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublishOptions")
            .field("ports", &self.ports)
            .field("local_host", &self.local_host)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

/// A published channel's local end.
enum PublishedChannel {
    /// TCP, or the ciphertext side of a TLS pipe.
    Stream(Bridge),
    Datagram(DatagramChannel),
}

impl PublishedChannel {
    fn deliver(&self, data: Bytes) -> bool {
        match self {
            PublishedChannel::Stream(bridge) => bridge.deliver(data),
            PublishedChannel::Datagram(channel) => channel.deliver(data),
        }
    }

    fn finish(self) {
        match self {
            PublishedChannel::Stream(bridge) => bridge.finish(),
            PublishedChannel::Datagram(channel) => channel.cancel.cancel(),
        }
    }

    fn abort(&self) {
        match self {
            PublishedChannel::Stream(bridge) => bridge.abort(),
            PublishedChannel::Datagram(channel) => channel.cancel.cancel(),
        }
    }
}

struct DatagramChannel {
    outbound: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
}

impl DatagramChannel {
    /// Queues a datagram for the local service. A datagram that finds the
    /// queue full is lost, like one dropped on the wire.
    fn deliver(&self, datagram: Bytes) -> bool {
        match self.outbound.try_send(datagram) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(datagram)) => {
                warn!("Datagram queue full, dropping {} bytes", datagram.len());
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

struct Shared {
    rpc: Rpc,
    ports: HashSet<u16>,
    local_host: String,
    tls: Option<TlsAcceptor>,
    channels: DashMap<ChannelRef, PublishedChannel>,
}

impl Shared {
    fn is_published(&self, port: u16) -> bool {
        self.ports.contains(&port)
    }
}

/// Answers `portopen` requests for a set of published ports.
pub struct PortPublisher {
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl PortPublisher {
    /// Creates a publisher and starts its event dispatcher.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(rpc: Rpc, options: PublishOptions) -> Self {
        let events = rpc.connection().subscribe();
        let shared = Arc::new(Shared {
            rpc,
            ports: options.ports.into_iter().collect(),
            local_host: options.local_host,
            tls: options.tls,
            channels: DashMap::new(),
        });
        let cancel = CancellationToken::new();
        tokio::spawn(dispatch_events(events, Arc::clone(&shared), cancel.clone()));
        info!("Publishing ports {:?}", shared.ports);
        Self { shared, cancel }
    }

    /// Number of open channels.
    pub fn channel_count(&self) -> usize {
        self.shared.channels.len()
    }

    /// Token that stops the dispatcher when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stops answering requests and drops every open channel.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        drop_all(&self.shared.channels);
    }
}

impl Drop for PortPublisher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn dispatch_events(
    mut events: broadcast::Receiver<ConnectionEvent>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Ok(ConnectionEvent::Message(Unsolicited::PortOpen {
                session_id,
                port_spec,
                channel_ref,
                device_id,
            })) => {
                info!(
                    channel = %channel_ref,
                    device = %hex::encode(&device_id),
                    "portopen request for {}",
                    port_spec
                );
                tokio::spawn(open_channel(
                    Arc::clone(&shared),
                    session_id,
                    port_spec,
                    channel_ref,
                ));
            }
            Ok(ConnectionEvent::Message(Unsolicited::PortSend {
                channel_ref, data, ..
            })) => {
                let Some(channel) = shared.channels.get(&channel_ref) else {
                    debug!(channel = %channel_ref, "Data for unknown channel ignored");
                    continue;
                };
                match strip_data_header(&data) {
                    Some(payload) => {
                        trace!(channel = %channel_ref, len = payload.len(), "channel -> service");
                        if !channel.deliver(payload) {
                            debug!(channel = %channel_ref, "Data for a finished channel dropped");
                        }
                    }
                    None => warn!(
                        channel = %channel_ref,
                        "Dropping {} byte payload shorter than its header",
                        data.len()
                    ),
                }
            }
            Ok(ConnectionEvent::Message(Unsolicited::PortClose { channel_ref, .. })) => {
                if let Some((_, channel)) = shared.channels.remove(&channel_ref) {
                    info!(channel = %channel_ref, "Published channel closed by remote");
                    channel.finish();
                }
            }
            Ok(ConnectionEvent::Message(Unsolicited::Other { message_type })) => {
                debug!("Ignoring unsolicited {} message", message_type);
            }
            Ok(ConnectionEvent::Disconnected) => {
                if !shared.channels.is_empty() {
                    warn!(
                        "Connection lost, dropping {} published channels",
                        shared.channels.len()
                    );
                }
                drop_all(&shared.channels);
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Publisher lagged behind, {} events skipped", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn open_channel(
    shared: Arc<Shared>,
    session_id: Bytes,
    port_spec: String,
    channel_ref: ChannelRef,
) {
    let spec = PortSpec::parse(&port_spec);

    let port = match spec.port {
        Some(port) if shared.is_published(port) => port,
        _ => {
            warn!(channel = %channel_ref, "Port {} is not published, rejecting", port_spec);
            reject(&shared, session_id, &channel_ref, "Port is not published").await;
            return;
        }
    };

    let result = match spec.known_protocol() {
        Some(PortProtocol::Tcp) => open_tcp(&shared, port, &channel_ref).await,
        Some(PortProtocol::Udp) => open_udp(&shared, port, &channel_ref).await,
        Some(PortProtocol::Tls) => open_tls(&shared, port, &channel_ref).await,
        None => {
            let reason = format!("Unsupported protocol: {}", spec.protocol);
            warn!(channel = %channel_ref, "{}", reason);
            reject(&shared, session_id, &channel_ref, &reason).await;
            return;
        }
    };

    let task = match result {
        Ok(task) => task,
        Err(e) => {
            warn!(channel = %channel_ref, "Opening local port {} failed: {}", port, e);
            reject(&shared, session_id, &channel_ref, &e.to_string()).await;
            return;
        }
    };

    if let Err(e) = shared
        .rpc
        .send_response(session_id, &channel_ref, Item::text(STATUS_OK))
        .await
    {
        warn!(channel = %channel_ref, "Accepting portopen failed: {}", e);
        if let Some((_, channel)) = shared.channels.remove(&channel_ref) {
            channel.abort();
        }
    } else {
        info!(channel = %channel_ref, "Published channel open to {}:{}", spec.protocol, port);
    }

    watch_channel(shared, channel_ref, task).await;
}

async fn reject(shared: &Shared, session_id: Bytes, channel_ref: &ChannelRef, reason: &str) {
    if let Err(e) = shared.rpc.send_error(session_id, channel_ref, reason).await {
        debug!(channel = %channel_ref, "Sending rejection failed: {}", e);
    }
}

/// Awaits the end of a channel's local side and cleans up exactly once.
async fn watch_channel(shared: Arc<Shared>, channel_ref: ChannelRef, task: JoinHandle<BridgeEnd>) {
    let end = match task.await {
        Ok(end) => end,
        Err(e) => {
            warn!(channel = %channel_ref, "Channel task failed: {}", e);
            BridgeEnd::Aborted
        }
    };

    if shared.channels.remove(&channel_ref).is_some() {
        debug!(channel = %channel_ref, "Local service ended: {:?}", end);
        if end.needs_remote_close() {
            if let Err(e) = shared.rpc.port_close(&channel_ref).await {
                debug!(channel = %channel_ref, "portclose failed: {}", e);
            }
        }
    }
}

async fn open_tcp(
    shared: &Arc<Shared>,
    port: u16,
    channel_ref: &ChannelRef,
) -> Result<JoinHandle<BridgeEnd>> {
    let stream = TcpStream::connect((shared.local_host.as_str(), port)).await?;
    debug!(channel = %channel_ref, "Connected to local TCP service on port {}", port);

    let sink = Arc::new(RpcChannelSink::new(shared.rpc.clone(), channel_ref.clone()));
    let (bridge, task) = Bridge::spawn(stream, sink);
    shared
        .channels
        .insert(channel_ref.clone(), PublishedChannel::Stream(bridge));
    Ok(task)
}

async fn open_tls(
    shared: &Arc<Shared>,
    port: u16,
    channel_ref: &ChannelRef,
) -> Result<JoinHandle<BridgeEnd>> {
    let acceptor = shared
        .tls
        .clone()
        .ok_or_else(|| ProtocolError::Transport("TLS is not configured".to_string()))?;
    let mut local = TcpStream::connect((shared.local_host.as_str(), port)).await?;
    debug!(channel = %channel_ref, "Connected to local TCP service on port {}", port);

    // `ciphertext` carries raw TLS records to and from the channel.
    let (plaintext, ciphertext) = tokio::io::duplex(PIPE_CAPACITY);
    let sink = Arc::new(RpcChannelSink::new(shared.rpc.clone(), channel_ref.clone()));
    let (bridge, task) = Bridge::spawn(ciphertext, sink);
    shared
        .channels
        .insert(channel_ref.clone(), PublishedChannel::Stream(bridge));

    let channel = channel_ref.clone();
    tokio::spawn(async move {
        let mut tls = match acceptor.accept(plaintext).await {
            Ok(tls) => tls,
            Err(e) => {
                warn!(channel = %channel, "{}", e);
                return;
            }
        };
        match tokio::io::copy_bidirectional(&mut tls, &mut local).await {
            Ok((to_service, to_remote)) => debug!(
                channel = %channel,
                to_service, to_remote, "TLS session finished"
            ),
            Err(e) => debug!(channel = %channel, "TLS session ended: {}", e),
        }
    });
    Ok(task)
}

async fn open_udp(
    shared: &Arc<Shared>,
    port: u16,
    channel_ref: &ChannelRef,
) -> Result<JoinHandle<BridgeEnd>> {
    let target = tokio::net::lookup_host((shared.local_host.as_str(), port))
        .await?
        .next()
        .ok_or_else(|| {
            ProtocolError::Transport(format!("cannot resolve {}", shared.local_host))
        })?;
    let bind_addr: SocketAddr = if target.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        ([0u16; 8], 0).into()
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    debug!(channel = %channel_ref, "UDP socket {} relaying to {}", socket.local_addr()?, target);

    let (outbound, rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
    let cancel = CancellationToken::new();
    let sink: Arc<dyn ChannelSink> =
        Arc::new(RpcChannelSink::new(shared.rpc.clone(), channel_ref.clone()));
    let max_payload = max_port_send_payload(channel_ref).saturating_sub(DATA_HEADER_SIZE);
    let task = tokio::spawn(run_datagram(
        socket,
        target,
        sink,
        max_payload,
        rx,
        cancel.clone(),
    ));
    shared.channels.insert(
        channel_ref.clone(),
        PublishedChannel::Datagram(DatagramChannel { outbound, cancel }),
    );
    Ok(task)
}

async fn run_datagram(
    socket: UdpSocket,
    target: SocketAddr,
    sink: Arc<dyn ChannelSink>,
    max_payload: usize,
    mut outbound: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
) -> BridgeEnd {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return BridgeEnd::RemoteClosed,
            received = socket.recv_from(&mut buf) => match received {
                Ok((n, from)) if n > max_payload => {
                    warn!(%from, "Dropping {} byte datagram, channel frames carry at most {}", n, max_payload);
                }
                Ok((n, from)) => {
                    trace!(len = n, %from, "service -> channel");
                    if let Err(e) = sink.send(frame_datagram(&buf[..n])).await {
                        return BridgeEnd::SinkFailed(e);
                    }
                }
                Err(e) => return BridgeEnd::LocalError(e),
            },
            datagram = outbound.recv() => match datagram {
                Some(datagram) => {
                    if let Err(e) = socket.send_to(&datagram, target).await {
                        warn!("Sending datagram to {} failed: {}", target, e);
                    }
                }
                None => return BridgeEnd::RemoteClosed,
            },
        }
    }
}

fn drop_all(channels: &DashMap<ChannelRef, PublishedChannel>) {
    let refs: Vec<ChannelRef> = channels.iter().map(|entry| entry.key().clone()).collect();
    for channel_ref in refs {
        if let Some((_, channel)) = channels.remove(&channel_ref) {
            channel.abort();
        }
    }
}
