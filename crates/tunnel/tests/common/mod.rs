//! Scripted in-memory relay shared by the integration tests.
//!
//! Every dial creates a fresh `tokio::io::duplex` pair and spawns a server task
//! that decodes frames, records every command it receives and answers requests
//! from a script, falling back to sensible defaults.

#![allow(dead_code)]

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::PKey;
use openssl::x509::{X509Builder, X509NameBuilder};
use protocol::error::{ProtocolError, Result};
use protocol::{Address, ClientIdentity, Envelope, FrameCodec, FrameDecoder, Item};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tunnel::transport::{Dialer, TransportSession};
use tunnel::{Connection, ConnectionOptions, Rpc, TicketParams, TicketSigner};

/// Timestamp of the mock chain's peak block.
pub const BLOCK_TIMESTAMP: u64 = 1_700_000_000;
/// Number of the mock chain's peak block.
pub const BLOCK_PEAK: u64 = 4_242;
/// Channel ref the mock relay assigns on `portopen`.
pub const CHANNEL_REF: [u8; 2] = [0xab, 0x12];

/// How the relay answers one command.
pub enum Script {
    /// Reply with this body.
    Reply(Vec<Item>),
    /// Reply, then send these session-addressed bodies in the same write.
    ReplyThen(Vec<Item>, Vec<Vec<Item>>),
    /// Never answer.
    Silent,
    /// Use the built-in answer.
    Default,
}

type Handler = Arc<dyn Fn(&[Item]) -> Script + Send + Sync>;

struct RelayState {
    handler: Handler,
    server_identity: ClientIdentity,
    requests: Mutex<Vec<Vec<Item>>>,
    received: mpsc::UnboundedSender<Vec<Item>>,
    session: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    dials: AtomicUsize,
    refuse: AtomicBool,
}

/// Handle to the mock relay.
pub struct MockRelay {
    state: Arc<RelayState>,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<Item>>>,
}

impl MockRelay {
    /// A relay with only the built-in answers.
    pub fn new() -> Self {
        Self::scripted(|_| Script::Default)
    }

    /// A relay consulting `handler` before the built-in answers.
    pub fn scripted(handler: impl Fn(&[Item]) -> Script + Send + Sync + 'static) -> Self {
        let (received, inbox) = mpsc::unbounded_channel();
        Self {
            state: Arc::new(RelayState {
                handler: Arc::new(handler),
                server_identity: ClientIdentity::from_secret_key_bytes(&[0x42; 32]).unwrap(),
                requests: Mutex::new(Vec::new()),
                received,
                session: Mutex::new(None),
                dials: AtomicUsize::new(0),
                refuse: AtomicBool::new(false),
            }),
            inbox: tokio::sync::Mutex::new(inbox),
        }
    }

    /// A dialer reaching this relay.
    pub fn dialer(&self) -> MockDialer {
        MockDialer {
            state: Arc::clone(&self.state),
        }
    }

    /// An RPC client on a fresh connection to this relay.
    pub fn client(&self) -> Rpc {
        self.client_with(ConnectionOptions {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
        })
    }

    pub fn client_with(&self, options: ConnectionOptions) -> Rpc {
        let signer = TicketSigner::new(
            client_identity(),
            TicketParams {
                chain_id: 15,
                fleet_contract: fleet_contract(),
            },
        );
        Rpc::new(Connection::new(self.dialer(), signer, options))
    }

    /// Address the relay presents during the handshake.
    pub fn server_address(&self) -> Address {
        self.state.server_identity.address()
    }

    /// Makes every further dial fail.
    pub fn refuse_dials(&self) {
        self.state.refuse.store(true, Ordering::SeqCst);
    }

    /// Number of dials so far.
    pub fn dials(&self) -> usize {
        self.state.dials.load(Ordering::SeqCst)
    }

    /// Number of received commands named `name`.
    pub fn count(&self, name: &str) -> usize {
        self.state
            .requests
            .lock()
            .unwrap()
            .iter()
            .filter(|body| tag(body) == Some(name))
            .count()
    }

    /// Every received command named `name`, oldest first.
    pub fn requests(&self, name: &str) -> Vec<Vec<Item>> {
        self.state
            .requests
            .lock()
            .unwrap()
            .iter()
            .filter(|body| tag(body) == Some(name))
            .cloned()
            .collect()
    }

    /// Waits for the next received message body named `name`, skipping others.
    pub async fn next_request(&self, name: &str) -> Vec<Item> {
        let mut inbox = self.inbox.lock().await;
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let body = inbox.recv().await.expect("relay inbox closed");
                if tag(&body) == Some(name) {
                    return body;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("relay never received {}", name))
    }

    /// Waits for the next received message body of any kind.
    pub async fn next_message(&self) -> Vec<Item> {
        let mut inbox = self.inbox.lock().await;
        tokio::time::timeout(Duration::from_secs(5), inbox.recv())
            .await
            .expect("relay received nothing")
            .expect("relay inbox closed")
    }

    /// Sends a relay-originated message on the current session.
    pub fn push(&self, envelope: Envelope) {
        let session = self.state.session.lock().unwrap();
        session
            .as_ref()
            .expect("no live session")
            .send(envelope)
            .expect("session task ended");
    }

    /// Pushes `[sessionId, [kind, ...args]]`.
    pub fn push_message(&self, kind: &str, args: Vec<Item>) {
        let mut body = vec![Item::text(kind)];
        body.extend(args);
        self.push(Envelope::with_session(session_id(), body));
    }

    /// Ends the current session from the relay side.
    pub fn drop_session(&self) {
        self.state.session.lock().unwrap().take();
    }
}

/// Dialer creating in-memory sessions to a [`MockRelay`].
pub struct MockDialer {
    state: Arc<RelayState>,
}

impl Dialer for MockDialer {
    fn dial<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<TransportSession>> + Send + 'a>> {
        Box::pin(async move {
            if self.state.refuse.load(Ordering::SeqCst) {
                return Err(ProtocolError::Transport("connection refused".to_string()));
            }
            self.state.dials.fetch_add(1, Ordering::SeqCst);

            let (client, server) = tokio::io::duplex(64 * 1024);
            let (outbound, rx) = mpsc::unbounded_channel();
            *self.state.session.lock().unwrap() = Some(outbound);
            tokio::spawn(serve(server, Arc::clone(&self.state), rx));

            Ok(TransportSession {
                stream: Box::new(client),
                peer_public_key: self.state.server_identity.public_key_bytes(),
            })
        })
    }

    fn describe(&self) -> String {
        "mock-relay".to_string()
    }
}

async fn serve(
    stream: DuplexStream,
    state: Arc<RelayState>,
    mut outbound: mpsc::UnboundedReceiver<Envelope>,
) {
    let codec = FrameCodec::new();
    let mut decoder = FrameDecoder::new();
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut buf = vec![0u8; 16 * 1024];

    loop {
        tokio::select! {
            read = reader.read(&mut buf) => {
                let n = match read {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                decoder.extend(&buf[..n]);
                while let Some(frame) = decoder.next_frame() {
                    let envelope = frame.expect("client sent a malformed frame");
                    state.requests.lock().unwrap().push(envelope.body.clone());
                    let _ = state.received.send(envelope.body.clone());

                    // Request ids are integers; session-addressed replies are not.
                    if envelope.request_id().is_none() {
                        continue;
                    }
                    let (body, followups) = match (state.handler)(&envelope.body) {
                        Script::Reply(body) => (body, Vec::new()),
                        Script::ReplyThen(body, followups) => (body, followups),
                        Script::Silent => continue,
                        Script::Default => match default_reply(&envelope.body) {
                            Some(body) => (body, Vec::new()),
                            None => continue,
                        },
                    };
                    let reply = Envelope { id: envelope.id.clone(), body };
                    let mut frame = codec.encode(&reply).unwrap();
                    for body in followups {
                        frame.extend(codec.encode(&Envelope::with_session(session_id(), body)).unwrap());
                    }
                    if writer.write_all(&frame).await.is_err() {
                        return;
                    }
                }
            }
            pushed = outbound.recv() => match pushed {
                Some(envelope) => {
                    let frame = codec.encode(&envelope).unwrap();
                    if writer.write_all(&frame).await.is_err() {
                        return;
                    }
                }
                None => return,
            },
        }
    }
}

fn default_reply(body: &[Item]) -> Option<Vec<Item>> {
    let response = |values: Vec<Item>| {
        let mut body = vec![Item::text("response")];
        body.extend(values);
        Some(body)
    };
    match tag(body)? {
        "ping" => response(vec![Item::text("pong")]),
        "getblockpeak" => response(vec![Item::uint(BLOCK_PEAK)]),
        "getblockheader" => response(vec![Item::list(vec![
            Item::list(vec![Item::text("number"), Item::uint(BLOCK_PEAK)]),
            Item::list(vec![Item::text("timestamp"), Item::uint(BLOCK_TIMESTAMP)]),
        ])]),
        "getblock" => {
            let index = body.get(1).and_then(Item::as_uint)?;
            response(vec![Item::list(vec![
                Item::list(vec![Item::text("number"), Item::uint(index)]),
                Item::list(vec![Item::text("transactions"), Item::list(vec![])]),
            ])])
        }
        "ticketv2" => response(vec![Item::text("thanks!")]),
        "portopen" => response(vec![Item::text("ok"), Item::bytes(CHANNEL_REF.to_vec())]),
        "portsend" | "portclose" => response(vec![Item::text("ok")]),
        "response" => None,
        _ => Some(vec![Item::text("error"), Item::text("unknown command")]),
    }
}

fn tag(body: &[Item]) -> Option<&str> {
    body.first().and_then(Item::as_str)
}

/// Identity the test clients sign with.
pub fn client_identity() -> ClientIdentity {
    ClientIdentity::from_secret_key_bytes(&[0x07; 32]).unwrap()
}

pub fn fleet_contract() -> Address {
    Address::from_bytes([0x60; 20])
}

/// Session id used for relay-originated messages. Longer than eight bytes so
/// it can never be mistaken for a request id.
pub fn session_id() -> Bytes {
    Bytes::from_static(&[0x5e; 16])
}

/// Shorthand for a `response` reply body.
pub fn response(values: Vec<Item>) -> Script {
    let mut body = vec![Item::text("response")];
    body.extend(values);
    Script::Reply(body)
}

/// Shorthand for an `error` reply body.
pub fn error(reason: &str) -> Script {
    Script::Reply(vec![Item::text("error"), Item::text(reason)])
}

/// Prefixes `payload` with the 4-byte little-endian length header.
pub fn with_header(payload: &[u8]) -> Item {
    let mut data = (payload.len() as u32).to_le_bytes().to_vec();
    data.extend_from_slice(payload);
    Item::bytes(data)
}

/// Writes a self-signed secp256k1 certificate and its key into one PEM file
/// under `dir`.
pub fn write_self_signed_pem(dir: &Path) -> PathBuf {
    let group = EcGroup::from_curve_name(Nid::SECP256K1).unwrap();
    let key = PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", "published-service").unwrap();
    let name = name.build();

    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    let serial = BigNum::from_u32(7).unwrap().to_asn1_integer().unwrap();
    builder.set_serial_number(&serial).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
    builder.set_not_after(&Asn1Time::days_from_now(1).unwrap()).unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();

    let mut pem = builder.build().to_pem().unwrap();
    pem.extend(key.private_key_to_pem_pkcs8().unwrap());
    let path = dir.join("service.pem");
    std::fs::write(&path, pem).unwrap();
    path
}

/// Polls `condition` until it holds, panicking after five seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never became true");
}
