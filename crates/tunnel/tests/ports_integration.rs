//! Integration tests for the port binder and the port publisher.
//!
//! Local services and clients are real loopback sockets; the relay is the
//! scripted in-memory relay in `common`.

mod common;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{eventually, with_header, write_self_signed_pem, MockRelay, Script, CHANNEL_REF};
use protocol::{Address, Item};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tunnel::transport::{client_handshake, TlsProfile};
use tunnel::{Binding, PortBinder, PortPublisher, PublishOptions};

const PUBLISHED_REF: [u8; 3] = [0xcd, 0x01, 0x02];

fn binding(remote_port: u16) -> Binding {
    Binding {
        local_port: 0,
        device_id: Address::from_bytes([0x53; 20]),
        remote_port,
        flags: "rw".to_string(),
    }
}

fn publish_options(ports: Vec<u16>) -> PublishOptions {
    PublishOptions {
        ports,
        local_host: "127.0.0.1".to_string(),
        tls: None,
    }
}

fn portopen(spec: &str) -> Vec<Item> {
    vec![
        Item::text(spec),
        Item::bytes(PUBLISHED_REF.to_vec()),
        Item::bytes(vec![0x11; 20]),
    ]
}

async fn read_exactly(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    buf
}

/// Collects `portsend` payloads until `len` bytes arrived.
async fn collect_sent(relay: &MockRelay, len: usize) -> Vec<u8> {
    let mut sent = Vec::new();
    while sent.len() < len {
        let request = relay.next_request("portsend").await;
        sent.extend_from_slice(request[2].as_bytes().unwrap());
    }
    sent
}

/// Carries TLS records between a test-side stream and a published channel
/// until the publisher closes the channel, returning the `portclose` body.
async fn relay_tls_records(relay: Arc<MockRelay>, mut wire: DuplexStream) -> Vec<Item> {
    let mut buf = vec![0u8; 16 * 1024];
    let mut reading = true;
    loop {
        tokio::select! {
            read = wire.read(&mut buf), if reading => match read.unwrap() {
                0 => reading = false,
                n => relay.push_message(
                    "portsend",
                    vec![Item::bytes(PUBLISHED_REF.to_vec()), with_header(&buf[..n])],
                ),
            },
            body = relay.next_message() => match body[0].as_str() {
                Some("portsend") => wire.write_all(body[2].as_bytes().unwrap()).await.unwrap(),
                Some("portclose") => return body,
                _ => {}
            },
        }
    }
}

// =============================================================================
// Port Binder Tests
// =============================================================================

#[tokio::test]
async fn test_binder_bridges_both_directions() {
    let relay = MockRelay::new();
    let rpc = relay.client();
    let binder = PortBinder::new(rpc.clone());
    let addr = binder.bind(binding(80)).await.unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"hello").await.unwrap();

    let open = relay.next_request("portopen").await;
    assert_eq!(open[2].as_uint(), Some(80));
    assert_eq!(collect_sent(&relay, 5).await, b"hello");
    assert_eq!(binder.channel_count(), 1);

    relay.push_message(
        "portsend",
        vec![Item::bytes(CHANNEL_REF.to_vec()), Item::bytes(b"world".to_vec())],
    );
    assert_eq!(read_exactly(&mut client, 5).await, b"world");

    // The relay closes the channel: the local client sees EOF.
    relay.push_message("portclose", vec![Item::bytes(CHANNEL_REF.to_vec())]);
    let mut rest = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();
    assert!(rest.is_empty());
    eventually(|| binder.channel_count() == 0).await;
    assert_eq!(relay.count("portclose"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_binder_delivers_data_sent_with_open_reply() {
    // The relay answers portopen and sends the service banner in the same
    // write, so the data frame is decoded right behind the reply.
    let next_ref = AtomicU8::new(1);
    let relay = MockRelay::scripted(move |body| match body[0].as_str() {
        Some("portopen") => {
            let channel_ref = Item::bytes(vec![0xb0, next_ref.fetch_add(1, Ordering::SeqCst)]);
            Script::ReplyThen(
                vec![Item::text("response"), Item::text("ok"), channel_ref.clone()],
                vec![vec![
                    Item::text("portsend"),
                    channel_ref,
                    Item::bytes(b"SSH-2.0-banner\r\n".to_vec()),
                ]],
            )
        }
        _ => Script::Default,
    });
    let binder = PortBinder::new(relay.client());
    let addr = binder.bind(binding(22)).await.unwrap();

    for _ in 0..20 {
        let mut client = TcpStream::connect(addr).await.unwrap();
        assert_eq!(read_exactly(&mut client, 16).await, b"SSH-2.0-banner\r\n");
    }
}

#[tokio::test]
async fn test_binder_remote_close_right_after_open() {
    let relay = MockRelay::scripted(|body| match body[0].as_str() {
        Some("portopen") => Script::ReplyThen(
            vec![Item::text("response"), Item::text("ok"), Item::bytes(CHANNEL_REF.to_vec())],
            vec![
                vec![Item::text("portsend"), Item::bytes(CHANNEL_REF.to_vec()), Item::bytes(b"bye".to_vec())],
                vec![Item::text("portclose"), Item::bytes(CHANNEL_REF.to_vec())],
            ],
        ),
        _ => Script::Default,
    });
    let binder = PortBinder::new(relay.client());
    let addr = binder.bind(binding(80)).await.unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    let mut received = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, b"bye");
    eventually(|| binder.channel_count() == 0).await;
    assert_eq!(relay.count("portclose"), 0);
}

#[tokio::test]
async fn test_binder_drops_client_when_open_fails() {
    let relay = MockRelay::scripted(|body| match body[0].as_str() {
        Some("portopen") => common::error("device offline"),
        _ => Script::Default,
    });
    let binder = PortBinder::new(relay.client());
    let addr = binder.bind(binding(22)).await.unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));
    assert_eq!(binder.channel_count(), 0);
}

#[tokio::test]
async fn test_binder_local_close_sends_portclose() {
    let relay = MockRelay::new();
    let binder = PortBinder::new(relay.client());
    let addr = binder.bind(binding(80)).await.unwrap();

    let client = TcpStream::connect(addr).await.unwrap();
    relay.next_request("portopen").await;
    eventually(|| binder.channel_count() == 1).await;

    drop(client);

    let close = relay.next_request("portclose").await;
    assert_eq!(close[1].as_bytes().unwrap().as_ref(), &CHANNEL_REF);
    eventually(|| binder.channel_count() == 0).await;
}

#[tokio::test]
async fn test_binder_connection_loss_drops_channels() {
    let relay = MockRelay::new();
    let binder = PortBinder::new(relay.client());
    let addr = binder.bind(binding(80)).await.unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    relay.next_request("portopen").await;
    eventually(|| binder.channel_count() == 1).await;

    relay.drop_session();

    // EOF or reset, but never a hang.
    let mut rest = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
        .await
        .unwrap();
    eventually(|| binder.channel_count() == 0).await;
}

#[tokio::test]
async fn test_binder_ignores_unknown_channel() {
    let relay = MockRelay::new();
    let rpc = relay.client();
    let binder = PortBinder::new(rpc.clone());
    rpc.connection().connect().await.unwrap();

    relay.push_message(
        "portsend",
        vec![Item::bytes(vec![0xde, 0xad]), Item::bytes(b"lost".to_vec())],
    );
    relay.push_message("portclose", vec![Item::bytes(vec![0xde, 0xad])]);

    // Still serving afterwards.
    assert!(rpc.ping().await.unwrap());
    assert_eq!(binder.channel_count(), 0);
}

#[tokio::test]
async fn test_binder_shutdown_stops_listening() {
    let relay = MockRelay::new();
    let binder = PortBinder::new(relay.client());
    let addr = binder.bind(binding(80)).await.unwrap();

    binder.shutdown();
    assert!(binder.shutdown_token().is_cancelled());
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(TcpStream::connect(addr).await.is_err());
}

// =============================================================================
// Port Publisher Tests
// =============================================================================

#[tokio::test]
async fn test_publish_udp_delivers_one_datagram() {
    let service = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = service.local_addr().unwrap().port();

    let relay = MockRelay::new();
    let rpc = relay.client();
    let publisher = PortPublisher::new(rpc.clone(), publish_options(vec![port]));
    rpc.connection().connect().await.unwrap();

    relay.push_message("portopen", portopen(&format!("udp:{}", port)));
    let accepted = relay.next_request("response").await;
    assert_eq!(accepted[1].as_bytes().unwrap().as_ref(), &PUBLISHED_REF);
    assert_eq!(accepted[2].as_str(), Some("ok"));
    assert_eq!(publisher.channel_count(), 1);

    relay.push_message(
        "portsend",
        vec![Item::bytes(PUBLISHED_REF.to_vec()), with_header(b"0123456789")],
    );

    let mut buf = [0u8; 1024];
    let (n, from) = tokio::time::timeout(Duration::from_secs(5), service.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 10);
    assert_eq!(&buf[..n], b"0123456789");

    // Replies from the service go back framed with a little-endian length.
    service.send_to(b"pong", from).await.unwrap();
    let sent = relay.next_request("portsend").await;
    assert_eq!(sent[1].as_bytes().unwrap().as_ref(), &PUBLISHED_REF);
    assert_eq!(sent[2].as_bytes().unwrap().as_ref(), b"\x04\x00\x00\x00pong");
}

#[tokio::test]
async fn test_publish_tcp_bridges_and_closes() {
    let service = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = service.local_addr().unwrap().port();

    let relay = MockRelay::new();
    let rpc = relay.client();
    let publisher = PortPublisher::new(rpc.clone(), publish_options(vec![port]));
    rpc.connection().connect().await.unwrap();

    // A bare port is served over TCP.
    relay.push_message("portopen", portopen(&port.to_string()));
    let (mut local, _) = tokio::time::timeout(Duration::from_secs(5), service.accept())
        .await
        .unwrap()
        .unwrap();
    let accepted = relay.next_request("response").await;
    assert_eq!(accepted[2].as_str(), Some("ok"));

    relay.push_message(
        "portsend",
        vec![Item::bytes(PUBLISHED_REF.to_vec()), with_header(b"GET /")],
    );
    assert_eq!(read_exactly(&mut local, 5).await, b"GET /");

    local.write_all(b"200 OK").await.unwrap();
    assert_eq!(collect_sent(&relay, 6).await, b"200 OK");

    drop(local);
    let close = relay.next_request("portclose").await;
    assert_eq!(close[1].as_bytes().unwrap().as_ref(), &PUBLISHED_REF);
    eventually(|| publisher.channel_count() == 0).await;
}

#[tokio::test]
async fn test_publish_remote_close_ends_local_connection() {
    let service = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = service.local_addr().unwrap().port();

    let relay = MockRelay::new();
    let rpc = relay.client();
    let publisher = PortPublisher::new(rpc.clone(), publish_options(vec![port]));
    rpc.connection().connect().await.unwrap();

    relay.push_message("portopen", portopen(&format!("tcp:{}", port)));
    let (mut local, _) = service.accept().await.unwrap();
    relay.next_request("response").await;

    relay.push_message("portclose", vec![Item::bytes(PUBLISHED_REF.to_vec())]);
    let mut rest = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), local.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();
    eventually(|| publisher.channel_count() == 0).await;
}

#[tokio::test]
async fn test_publish_rejects_unpublished_port() {
    let relay = MockRelay::new();
    let rpc = relay.client();
    let _publisher = PortPublisher::new(rpc.clone(), publish_options(vec![8080]));
    rpc.connection().connect().await.unwrap();

    relay.push_message("portopen", portopen("tcp:9999"));

    let rejected = relay.next_request("response").await;
    assert_eq!(rejected[1].as_bytes().unwrap().as_ref(), &PUBLISHED_REF);
    assert_eq!(rejected[2].as_str(), Some("error"));
    assert_eq!(rejected[3].as_str(), Some("Port is not published"));
}

#[tokio::test]
async fn test_publish_rejects_unsupported_protocol() {
    let relay = MockRelay::new();
    let rpc = relay.client();
    let _publisher = PortPublisher::new(rpc.clone(), publish_options(vec![8080]));
    rpc.connection().connect().await.unwrap();

    relay.push_message("portopen", portopen("sctp:8080"));

    let rejected = relay.next_request("response").await;
    assert_eq!(rejected[2].as_str(), Some("error"));
    assert_eq!(rejected[3].as_str(), Some("Unsupported protocol: sctp"));
}

#[tokio::test]
async fn test_publish_reports_local_dial_failure() {
    // Reserve a port, then free it so nothing listens there.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let relay = MockRelay::new();
    let rpc = relay.client();
    let publisher = PortPublisher::new(rpc.clone(), publish_options(vec![port]));
    rpc.connection().connect().await.unwrap();

    relay.push_message("portopen", portopen(&format!("tcp:{}", port)));

    let rejected = relay.next_request("response").await;
    assert_eq!(rejected[2].as_str(), Some("error"));
    assert_eq!(publisher.channel_count(), 0);
}

#[tokio::test]
async fn test_publish_drops_short_payload() {
    let service = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = service.local_addr().unwrap().port();

    let relay = MockRelay::new();
    let rpc = relay.client();
    let _publisher = PortPublisher::new(rpc.clone(), publish_options(vec![port]));
    rpc.connection().connect().await.unwrap();

    relay.push_message("portopen", portopen(&format!("udp:{}", port)));
    relay.next_request("response").await;

    relay.push_message(
        "portsend",
        vec![Item::bytes(PUBLISHED_REF.to_vec()), Item::bytes(vec![1, 2])],
    );
    relay.push_message(
        "portsend",
        vec![Item::bytes(PUBLISHED_REF.to_vec()), with_header(b"after")],
    );

    let mut buf = [0u8; 64];
    let (n, _) = tokio::time::timeout(Duration::from_secs(5), service.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"after");
}

#[tokio::test]
async fn test_publish_tls_terminates_locally() {
    let service = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = service.local_addr().unwrap().port();
    // Echoes one greeting, then closes.
    tokio::spawn(async move {
        let (mut local, _) = service.accept().await.unwrap();
        let mut buf = [0u8; 5];
        local.read_exact(&mut buf).await.unwrap();
        local.write_all(&buf).await.unwrap();
    });

    let dir = TempDir::new().unwrap();
    let profile = TlsProfile::new(write_self_signed_pem(dir.path()));
    let mut options = publish_options(vec![port]);
    options.tls = Some(profile.acceptor().unwrap());

    let relay = Arc::new(MockRelay::new());
    let rpc = relay.client();
    let publisher = PortPublisher::new(rpc.clone(), options);
    rpc.connection().connect().await.unwrap();

    relay.push_message("portopen", portopen(&format!("tls:{}", port)));
    let accepted = relay.next_request("response").await;
    assert_eq!(accepted[2].as_str(), Some("ok"));

    let (app, wire) = tokio::io::duplex(64 * 1024);
    let records = tokio::spawn(relay_tls_records(Arc::clone(&relay), wire));

    let connector = profile.connector().unwrap();
    let mut tls = tokio::time::timeout(
        Duration::from_secs(5),
        client_handshake(&connector, "localhost", app),
    )
    .await
    .unwrap()
    .unwrap();
    tls.write_all(b"hello").await.unwrap();
    let mut echoed = [0u8; 5];
    tokio::time::timeout(Duration::from_secs(5), tls.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed, b"hello");

    // The service closed: the session ends with close_notify.
    let mut rest = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), tls.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();
    assert!(rest.is_empty());
    let _ = tls.shutdown().await;

    let close = tokio::time::timeout(Duration::from_secs(10), records)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(close[1].as_bytes().unwrap().as_ref(), &PUBLISHED_REF);
    eventually(|| publisher.channel_count() == 0).await;
}

#[tokio::test]
async fn test_publish_tls_rejected_without_profile() {
    let service = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = service.local_addr().unwrap().port();

    let relay = MockRelay::new();
    let rpc = relay.client();
    let publisher = PortPublisher::new(rpc.clone(), publish_options(vec![port]));
    rpc.connection().connect().await.unwrap();

    relay.push_message("portopen", portopen(&format!("tls:{}", port)));

    let rejected = relay.next_request("response").await;
    assert_eq!(rejected[2].as_str(), Some("error"));
    assert_eq!(rejected[3].as_str(), Some("transport error: TLS is not configured"));
    assert_eq!(publisher.channel_count(), 0);
}
