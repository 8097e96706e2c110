//! Connection manager for the relay session.
//!
//! One [`Connection`] owns at most one live transport session at a time. It
//! authenticates each new session with a signed ticket, correlates replies to
//! requests, and broadcasts everything the relay sends on its own initiative as
//! [`ConnectionEvent`]s. A command issued while disconnected transparently
//! reconnects first.
//!
//! Every session is tagged with a generation number. Teardown requests carry
//! the generation they refer to, so a reader task of an old session can never
//! tear down a newer one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use protocol::error::{ProtocolError, Result};
use protocol::{
    block_timestamp, encode_frame, Address, Command, Envelope, FrameDecoder, Item, Reply,
    Unsolicited,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::correlator::{Correlator, ReplyHook};
use crate::ticket::TicketSigner;
use crate::transport::{BoxedStream, Dialer};

/// Default timeout for a single request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for dialing a session.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Capacity of the event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Read buffer size of the session reader.
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Lifecycle state of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport session.
    Disconnected,
    /// Dialing the relay.
    Connecting,
    /// Session established, initial ticket in flight.
    Authenticating,
    /// Ready for commands.
    Ready,
}

/// Events published to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A message the relay sent on its own initiative.
    Message(Unsolicited),
    /// The session ended; every channel bound to it is gone.
    Disconnected,
}

/// Tunables of a connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionOptions {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

struct SessionWriter {
    generation: u64,
    writer: WriteHalf<BoxedStream>,
}

struct Inner {
    dialer: Box<dyn Dialer>,
    signer: TicketSigner,
    correlator: Correlator,
    options: ConnectionOptions,
    state: Mutex<ConnectionState>,
    connect_lock: tokio::sync::Mutex<()>,
    writer: tokio::sync::Mutex<Option<SessionWriter>>,
    reader: Mutex<Option<(u64, JoinHandle<()>)>>,
    generation: AtomicU64,
    events: broadcast::Sender<ConnectionEvent>,
}

/// Handle to the relay connection. Cloning shares the same session.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("remote", &self.inner.dialer.describe())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Creates a disconnected connection.
    pub fn new(
        dialer: impl Dialer + 'static,
        signer: TicketSigner,
        options: ConnectionOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                dialer: Box::new(dialer),
                signer,
                correlator: Correlator::new(),
                options,
                state: Mutex::new(ConnectionState::Disconnected),
                connect_lock: tokio::sync::Mutex::new(()),
                writer: tokio::sync::Mutex::new(None),
                reader: Mutex::new(None),
                generation: AtomicU64::new(0),
                events,
            }),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Returns true once the session is authenticated.
    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// The ticket signer owned by this connection.
    pub fn signer(&self) -> &TicketSigner {
        &self.inner.signer
    }

    /// Identity of the relay of the current session.
    pub fn server_id(&self) -> Option<Address> {
        self.inner.signer.server_id()
    }

    /// Subscribes to unsolicited messages and disconnect notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Establishes and authenticates a session, unless one is already ready.
    pub async fn connect(&self) -> Result<()> {
        let _guard = self.inner.connect_lock.lock().await;
        if self.state() == ConnectionState::Ready {
            return Ok(());
        }
        Inner::establish(&self.inner).await
    }

    /// Sends a command, reconnecting first if there is no ready session.
    pub async fn send_command(&self, command: &Command) -> Result<Reply> {
        self.send_command_with(command, None).await
    }

    /// Sends a command whose successful reply also runs `on_reply`.
    ///
    /// The hook runs on the session reader as the reply is routed, before any
    /// frame received after it is dispatched to subscribers.
    ///
    /// If the session turns out to be gone when the command is written, the
    /// connection is re-established once and the command sent again.
    pub async fn send_command_with(
        &self,
        command: &Command,
        on_reply: Option<ReplyHook>,
    ) -> Result<Reply> {
        self.ensure_ready().await?;
        let in_flight = match self.inner.submit(command.to_items(), on_reply.clone()).await {
            Err(e) if e.is_connection_lost() => {
                debug!("Session lost before {} was sent ({}), reconnecting", command.name(), e);
                self.connect().await?;
                self.inner.submit(command.to_items(), on_reply).await?
            }
            submitted => submitted?,
        };
        in_flight.wait().await
    }

    /// Writes a session-addressed envelope without waiting for a reply.
    ///
    /// Used to answer requests the relay initiated, so it never reconnects:
    /// the session id is meaningless on any other session.
    pub async fn send_raw(&self, envelope: &Envelope) -> Result<()> {
        let frame = encode_frame(envelope)?;
        self.inner.write_frame(&frame).await
    }

    /// Signs a fresh ticket and waits until the relay accepts it.
    pub async fn renew_ticket(&self) -> Result<()> {
        self.ensure_ready().await?;
        self.inner.renew_ticket().await
    }

    /// Closes the session and fails every pending request.
    pub async fn close(&self) {
        let generation = self.inner.generation.load(Ordering::SeqCst);
        self.inner
            .teardown(generation, Teardown::Local, "connection closed")
            .await;
        // Requests registered without any live session.
        self.inner.correlator.fail_all("connection closed");
    }

    async fn ensure_ready(&self) -> Result<()> {
        if self.is_ready() {
            return Ok(());
        }
        debug!("Connection not ready, connecting to {}", self.inner.dialer.describe());
        self.connect().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    /// The reader task itself saw the session end.
    ReaderEnded,
    /// A caller or a failed write ended the session.
    Local,
}

impl Inner {
    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: ConnectionState) {
        let mut current = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *current != state {
            debug!("Connection state {:?} -> {:?}", *current, state);
            *current = state;
        }
    }

    async fn establish(this: &Arc<Self>) -> Result<()> {
        this.set_state(ConnectionState::Connecting);
        info!("Connecting to {}", this.dialer.describe());

        let session = match tokio::time::timeout(this.options.connect_timeout, this.dialer.dial())
            .await
        {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                this.set_state(ConnectionState::Disconnected);
                warn!("Failed to connect to {}: {}", this.dialer.describe(), e);
                return Err(e);
            }
            Err(_) => {
                this.set_state(ConnectionState::Disconnected);
                return Err(ProtocolError::Timeout(format!(
                    "connecting to {}",
                    this.dialer.describe()
                )));
            }
        };

        let server_id = match Address::from_public_key(&session.peer_public_key) {
            Ok(address) => address,
            Err(e) => {
                this.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        let (read_half, write_half) = tokio::io::split(session.stream);
        let generation = this.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *this.writer.lock().await = Some(SessionWriter {
            generation,
            writer: write_half,
        });
        let reader = tokio::spawn(read_loop(Arc::downgrade(this), generation, read_half));
        if let Some((_, stale)) = this
            .reader
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace((generation, reader))
        {
            stale.abort();
        }

        this.signer.set_server(server_id);
        this.set_state(ConnectionState::Authenticating);
        debug!(generation, server = %server_id, "Session established, authenticating");

        if let Err(e) = this.renew_ticket().await {
            warn!("Authentication with {} failed: {}", server_id, e);
            this.teardown(generation, Teardown::Local, "authentication failed")
                .await;
            return Err(e);
        }

        if !this.is_current(generation).await {
            return Err(ProtocolError::ConnectionClosed(
                "session ended during authentication".to_string(),
            ));
        }
        this.set_state(ConnectionState::Ready);
        info!("Connected to {} ({})", this.dialer.describe(), server_id);
        Ok(())
    }

    async fn is_current(&self, generation: u64) -> bool {
        self.writer
            .lock()
            .await
            .as_ref()
            .is_some_and(|w| w.generation == generation)
    }

    async fn write_frame(&self, frame: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let session = guard
            .as_mut()
            .ok_or_else(|| ProtocolError::ConnectionClosed("not connected".to_string()))?;
        let generation = session.generation;

        let written = async {
            session.writer.write_all(frame).await?;
            session.writer.flush().await
        }
        .await;
        drop(guard);

        if let Err(e) = written {
            warn!("Write to session {} failed: {}", generation, e);
            self.teardown(generation, Teardown::Local, "write failed")
                .await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Sends a correlated request on the current session.
    async fn request(&self, body: Vec<Item>) -> Result<Reply> {
        self.submit(body, None).await?.wait().await
    }

    /// Registers and writes a request, returning the handle awaiting its reply.
    async fn submit(&self, body: Vec<Item>, hook: Option<ReplyHook>) -> Result<InFlight<'_>> {
        let name = body
            .first()
            .and_then(Item::as_str)
            .unwrap_or("?")
            .to_string();
        let (id, rx) = self.correlator.begin_with(hook);
        let in_flight = InFlight {
            inner: self,
            id,
            name,
            rx,
        };

        let frame = encode_frame(&Envelope::request(id, body))?;
        trace!(
            request_id = id,
            command = %in_flight.name,
            frame = %hex::encode(&frame),
            "sending request"
        );
        self.write_frame(&frame).await?;
        Ok(in_flight)
    }

    async fn fetch_block_timestamp(&self) -> Result<u64> {
        let peak = self.request(Command::GetBlockPeak.to_items()).await?;
        let peak = peak.first("getblockpeak")?.as_uint().ok_or_else(|| {
            ProtocolError::UnexpectedResponse("getblockpeak: invalid block number".to_string())
        })?;
        let header = self.request(Command::GetBlockHeader(peak).to_items()).await?;
        block_timestamp(header.first("getblockheader")?)
    }

    async fn renew_ticket(&self) -> Result<()> {
        let _guard = self.signer.renewal_guard().await;
        let epoch = self
            .signer
            .epoch_with(|| self.fetch_block_timestamp())
            .await?;
        let ticket = self.signer.build_ticket(epoch)?;
        let reply = self.request(ticket.to_command_items()).await?;
        trace!(
            epoch,
            total_connections = ticket.ticket.total_connections,
            total_bytes = ticket.ticket.total_bytes,
            status = reply.status().unwrap_or(""),
            "ticket accepted"
        );
        Ok(())
    }

    fn dispatch(&self, envelope: Envelope) {
        let Some(envelope) = self.correlator.resolve(envelope) else {
            return;
        };
        match Unsolicited::from_envelope(&envelope) {
            Ok(message) => {
                trace!("Unsolicited message: {:?}", message);
                // No subscribers is not an error.
                let _ = self.events.send(ConnectionEvent::Message(message));
            }
            Err(e) => warn!("Dropping undecodable unsolicited message: {}", e),
        }
    }

    async fn teardown(&self, generation: u64, cause: Teardown, reason: &str) {
        let session = {
            let mut guard = self.writer.lock().await;
            match guard.as_ref() {
                Some(current) if current.generation == generation => guard.take(),
                _ => None,
            }
        };
        let Some(mut session) = session else {
            return;
        };

        let _ = session.writer.shutdown().await;
        if cause == Teardown::Local {
            let mut reader = self.reader.lock().unwrap_or_else(|e| e.into_inner());
            if reader.as_ref().is_some_and(|(g, _)| *g == generation) {
                if let Some((_, handle)) = reader.take() {
                    handle.abort();
                }
            }
        }

        self.set_state(ConnectionState::Disconnected);
        let failed = self.correlator.fail_all(reason);
        info!(
            generation,
            failed_requests = failed,
            "Disconnected from {}: {}",
            self.dialer.describe(),
            reason
        );
        let _ = self.events.send(ConnectionEvent::Disconnected);
    }
}

/// A request written to the session. Dropping it forgets the pending entry.
struct InFlight<'a> {
    inner: &'a Inner,
    id: u64,
    name: String,
    rx: oneshot::Receiver<Result<Reply>>,
}

impl InFlight<'_> {
    async fn wait(mut self) -> Result<Reply> {
        match tokio::time::timeout(self.inner.options.request_timeout, &mut self.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ProtocolError::ConnectionClosed(format!(
                "request {} ({}) was dropped",
                self.id, self.name
            ))),
            Err(_) => {
                // The reply may have been routed right as the timer fired.
                if !self.inner.correlator.remove(self.id) {
                    if let Ok(outcome) = self.rx.try_recv() {
                        return outcome;
                    }
                }
                warn!(request_id = self.id, command = %self.name, "request timed out");
                Err(ProtocolError::Timeout(format!(
                    "request {} ({})",
                    self.id, self.name
                )))
            }
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.inner.correlator.remove(self.id);
    }
}

async fn read_loop(inner: Weak<Inner>, generation: u64, mut reader: ReadHalf<BoxedStream>) {
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    let reason = loop {
        match reader.read(&mut buf).await {
            Ok(0) => break "connection closed by peer".to_string(),
            Ok(n) => {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                decoder.extend(&buf[..n]);
                while let Some(frame) = decoder.next_frame() {
                    match frame {
                        Ok(envelope) => inner.dispatch(envelope),
                        Err(e) => warn!("Skipping malformed frame: {}", e),
                    }
                }
            }
            Err(e) => break format!("read failed: {}", e),
        }
    };

    if let Some(inner) = inner.upgrade() {
        inner
            .teardown(generation, Teardown::ReaderEnded, &reason)
            .await;
    }
}
