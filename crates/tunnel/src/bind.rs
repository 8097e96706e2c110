//! Port binding: local TCP listeners tunnelled to ports on remote devices.
//!
//! Every accepted local connection opens its own virtual channel. Local reads
//! are sent with `portsend`; `data`/`portsend` messages from the relay are
//! written back to the local socket. One binder serves any number of bindings
//! through a single channel table and a single event dispatcher.
//!
//! A channel enters the table while its `portopen` reply is routed, before the
//! dispatcher sees any later message. Data the relay sends right behind the
//! reply waits in the channel's slot until the bridge is running.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use protocol::error::Result;
use protocol::{Address, ChannelRef, Unsolicited};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{BindConfig, ConfigError};
use crate::connection::ConnectionEvent;
use crate::pipe::{Bridge, RpcChannelSink, INBOUND_QUEUE_CAPACITY};
use crate::rpc::Rpc;

/// One local port tunnelled to a remote device port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub local_port: u16,
    pub device_id: Address,
    pub remote_port: u16,
    pub flags: String,
}

impl Binding {
    /// Builds a binding from its configuration entry.
    pub fn from_config(config: &BindConfig) -> std::result::Result<Self, ConfigError> {
        Ok(Self {
            local_port: config.local_port,
            device_id: config.device_address()?,
            remote_port: config.remote_port,
            flags: config.flags.clone(),
        })
    }
}

/// A bound channel's table entry.
enum Slot {
    /// Opened upstream, bridge not started yet.
    Opening {
        queued: Vec<Bytes>,
        remote_closed: bool,
    },
    Open(Bridge),
}

impl Slot {
    fn opening() -> Self {
        Slot::Opening {
            queued: Vec::new(),
            remote_closed: false,
        }
    }

    fn abort(&self) {
        if let Slot::Open(bridge) = self {
            bridge.abort();
        }
    }
}

type ChannelTable = Arc<DashMap<ChannelRef, Slot>>;

/// Serves bindings over one connection.
pub struct PortBinder {
    rpc: Rpc,
    channels: ChannelTable,
    cancel: CancellationToken,
}

impl PortBinder {
    /// Creates a binder and starts its event dispatcher.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(rpc: Rpc) -> Self {
        let channels: ChannelTable = Arc::new(DashMap::new());
        let cancel = CancellationToken::new();
        let events = rpc.connection().subscribe();
        tokio::spawn(dispatch_events(
            events,
            Arc::clone(&channels),
            cancel.clone(),
        ));
        Self {
            rpc,
            channels,
            cancel,
        }
    }

    /// Starts listening for `binding` on the loopback interface.
    ///
    /// Returns the bound address.
    pub async fn bind(&self, binding: Binding) -> Result<SocketAddr> {
        let listener = TcpListener::bind(("127.0.0.1", binding.local_port)).await?;
        let addr = listener.local_addr()?;
        info!(
            "Listening on {} for {}:{}",
            addr, binding.device_id, binding.remote_port
        );

        tokio::spawn(accept_loop(
            listener,
            binding,
            self.rpc.clone(),
            Arc::clone(&self.channels),
            self.cancel.clone(),
        ));
        Ok(addr)
    }

    /// Number of open channels.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Token that stops every listener and the dispatcher when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stops listening and drops every open channel.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        drop_all(&self.channels);
    }
}

impl Drop for PortBinder {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    binding: Binding,
    rpc: Rpc,
    channels: ChannelTable,
    cancel: CancellationToken,
) {
    let binding = Arc::new(binding);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Listener for port {} stopped", binding.local_port);
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("Accepted {} on port {}", peer, binding.local_port);
                    tokio::spawn(serve_client(
                        stream,
                        Arc::clone(&binding),
                        rpc.clone(),
                        Arc::clone(&channels),
                    ));
                }
                Err(e) => warn!("Accept on port {} failed: {}", binding.local_port, e),
            }
        }
    }
}

async fn serve_client(stream: TcpStream, binding: Arc<Binding>, rpc: Rpc, channels: ChannelTable) {
    let table = Arc::clone(&channels);
    let opened = rpc
        .port_open_with(
            binding.device_id,
            binding.remote_port,
            &binding.flags,
            move |channel_ref| {
                table
                    .entry(channel_ref.clone())
                    .or_insert_with(Slot::opening);
            },
        )
        .await;
    let channel_ref = match opened {
        Ok(channel_ref) => channel_ref,
        Err(e) => {
            warn!(
                "Opening {}:{} failed, dropping local client: {}",
                binding.device_id, binding.remote_port, e
            );
            return;
        }
    };

    let sink = Arc::new(RpcChannelSink::new(rpc.clone(), channel_ref.clone()));
    let (bridge, task) = Bridge::spawn(stream, sink);
    match channels.entry(channel_ref.clone()) {
        Entry::Occupied(mut entry) => match entry.get_mut() {
            Slot::Opening {
                queued,
                remote_closed,
            } => {
                if !queued.is_empty() {
                    debug!(channel = %channel_ref, chunks = queued.len(), "Delivering early data");
                }
                for data in queued.drain(..) {
                    bridge.deliver(data);
                }
                if *remote_closed {
                    entry.remove();
                    bridge.finish();
                } else {
                    entry.insert(Slot::Open(bridge));
                }
            }
            Slot::Open(_) => {
                warn!(channel = %channel_ref, "Channel ref already in use, dropping local client");
                bridge.abort();
                return;
            }
        },
        Entry::Vacant(_) => {
            // Dropped by a disconnect while the open was in flight.
            debug!(channel = %channel_ref, "Channel gone before it was bridged");
            bridge.abort();
            return;
        }
    }
    info!(channel = %channel_ref, "Channel open for local port {}", binding.local_port);

    let end = match task.await {
        Ok(end) => end,
        Err(e) => {
            warn!(channel = %channel_ref, "Bridge task failed: {}", e);
            channels.remove(&channel_ref);
            return;
        }
    };

    if channels.remove(&channel_ref).is_some() {
        debug!(channel = %channel_ref, "Local side ended: {:?}", end);
        if end.needs_remote_close() {
            if let Err(e) = rpc.port_close(&channel_ref).await {
                debug!(channel = %channel_ref, "portclose failed: {}", e);
            }
        }
    }
}

async fn dispatch_events(
    mut events: broadcast::Receiver<ConnectionEvent>,
    channels: ChannelTable,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Ok(ConnectionEvent::Message(Unsolicited::PortSend {
                channel_ref, data, ..
            })) => match channels.get_mut(&channel_ref).as_deref_mut() {
                Some(Slot::Open(bridge)) => {
                    if !bridge.deliver(data) {
                        debug!(channel = %channel_ref, "Data for a finished bridge dropped");
                    }
                }
                Some(Slot::Opening { queued, .. }) => {
                    if queued.len() < INBOUND_QUEUE_CAPACITY {
                        queued.push(data);
                    } else {
                        warn!(channel = %channel_ref, "Early data queue full, dropping {} bytes", data.len());
                    }
                }
                None => debug!(channel = %channel_ref, "Data for unknown channel ignored"),
            },
            Ok(ConnectionEvent::Message(Unsolicited::PortClose { channel_ref, .. })) => {
                let removed = match channels.entry(channel_ref.clone()) {
                    Entry::Occupied(mut entry) => match entry.get_mut() {
                        Slot::Opening { remote_closed, .. } => {
                            *remote_closed = true;
                            None
                        }
                        Slot::Open(_) => Some(entry.remove()),
                    },
                    Entry::Vacant(_) => None,
                };
                if let Some(Slot::Open(bridge)) = removed {
                    info!(channel = %channel_ref, "Channel closed by remote");
                    bridge.finish();
                }
            }
            Ok(ConnectionEvent::Message(_)) => {}
            Ok(ConnectionEvent::Disconnected) => {
                if !channels.is_empty() {
                    warn!("Connection lost, dropping {} bound channels", channels.len());
                }
                drop_all(&channels);
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Binder lagged behind, {} events skipped", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn drop_all(channels: &DashMap<ChannelRef, Slot>) {
    let refs: Vec<ChannelRef> = channels.iter().map(|entry| entry.key().clone()).collect();
    for channel_ref in refs {
        if let Some((_, slot)) = channels.remove(&channel_ref) {
            slot.abort();
        }
    }
}
