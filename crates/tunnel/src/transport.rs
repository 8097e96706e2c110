//! Transport sessions to the relay.
//!
//! The connection manager only needs a byte stream and the peer's public key,
//! obtained through the [`Dialer`] trait. [`TlsDialer`] is the production
//! implementation: TLS 1.2 with the cipher suite and curve the relays accept,
//! presenting a client certificate whose key doubles as the ticket signing
//! key. Peer certificates are not chain-verified; the relay is identified by
//! the address derived from its public key instead.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use openssl::bn::BigNumContext;
use openssl::ec::PointConversionForm;
use openssl::error::ErrorStack;
use openssl::pkey::PKey;
use openssl::ssl::{
    Ssl, SslAcceptor, SslConnector, SslContextBuilder, SslFiletype, SslMethod, SslRef,
    SslVerifyMode, SslVersion,
};
use protocol::error::{ProtocolError, Result};
use protocol::ClientIdentity;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpSocket;
use tokio_openssl::SslStream;

/// The only cipher suite the relays negotiate.
pub const CIPHER_SUITE: &str = "ECDHE-ECDSA-AES256-GCM-SHA384";

/// The only key exchange curve the relays negotiate.
pub const CURVE: &str = "secp256k1";

/// A bidirectional byte stream.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Boxed byte stream handed to the connection manager.
pub type BoxedStream = Box<dyn AsyncStream>;

/// An established transport session.
pub struct TransportSession {
    /// The encrypted byte stream.
    pub stream: BoxedStream,
    /// SEC1 encoded public key of the relay.
    pub peer_public_key: Vec<u8>,
}

impl std::fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSession")
            .field("peer_public_key", &hex::encode(&self.peer_public_key))
            .finish_non_exhaustive()
    }
}

/// Opens transport sessions to the relay.
pub trait Dialer: Send + Sync {
    /// Dials a fresh session.
    fn dial<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<TransportSession>> + Send + 'a>>;

    /// Human-readable description of the remote endpoint, for logs.
    fn describe(&self) -> String;
}

fn tls_error(err: ErrorStack) -> ProtocolError {
    ProtocolError::Transport(format!("TLS setup failed: {}", err))
}

/// The pinned TLS profile and the certificate it presents.
#[derive(Debug, Clone)]
pub struct TlsProfile {
    cert_path: PathBuf,
}

impl TlsProfile {
    /// Creates a profile presenting the certificate and key in `cert_path`.
    ///
    /// The file must hold both the certificate and its private key in PEM
    /// form.
    pub fn new(cert_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: cert_path.into(),
        }
    }

    /// Path of the PEM file.
    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    fn configure(&self, builder: &mut SslContextBuilder) -> std::result::Result<(), ErrorStack> {
        builder.set_min_proto_version(Some(SslVersion::TLS1_2))?;
        builder.set_max_proto_version(Some(SslVersion::TLS1_2))?;
        builder.set_cipher_list(CIPHER_SUITE)?;
        builder.set_groups_list(CURVE)?;
        builder.set_certificate_chain_file(&self.cert_path)?;
        builder.set_private_key_file(&self.cert_path, SslFiletype::PEM)?;
        builder.check_private_key()?;
        builder.set_verify(SslVerifyMode::NONE);
        Ok(())
    }

    /// Builds a client-side connector.
    pub fn connector(&self) -> Result<SslConnector> {
        let mut builder = SslConnector::builder(SslMethod::tls_client()).map_err(tls_error)?;
        self.configure(&mut builder).map_err(tls_error)?;
        Ok(builder.build())
    }

    /// Builds a server-side acceptor.
    pub fn acceptor(&self) -> Result<TlsAcceptor> {
        let mut builder =
            SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server()).map_err(tls_error)?;
        self.configure(&mut builder).map_err(tls_error)?;
        Ok(TlsAcceptor {
            acceptor: builder.build(),
        })
    }

    /// Loads the signing identity from the private key in the PEM file.
    pub fn load_identity(&self) -> Result<ClientIdentity> {
        load_identity(&self.cert_path)
    }
}

/// Loads a client identity from the EC private key in a PEM file.
pub fn load_identity(path: &Path) -> Result<ClientIdentity> {
    let pem = std::fs::read(path).map_err(|e| {
        ProtocolError::InvalidPrivateKey(format!("cannot read {}: {}", path.display(), e))
    })?;
    let secret = PKey::private_key_from_pem(&pem)
        .and_then(|key| key.ec_key())
        .and_then(|key| key.private_key().to_vec_padded(32))
        .map_err(|e| ProtocolError::InvalidPrivateKey(e.to_string()))?;
    ClientIdentity::from_secret_key_bytes(&secret)
}

/// Returns the uncompressed EC public key of the peer's certificate.
pub fn peer_public_key(ssl: &SslRef) -> Result<Vec<u8>> {
    let cert = ssl
        .peer_certificate()
        .ok_or_else(|| ProtocolError::InvalidPublicKey("peer sent no certificate".to_string()))?;
    let extract = || -> std::result::Result<Vec<u8>, ErrorStack> {
        let key = cert.public_key()?.ec_key()?;
        let mut ctx = BigNumContext::new()?;
        key.public_key()
            .to_bytes(key.group(), PointConversionForm::UNCOMPRESSED, &mut ctx)
    };
    extract().map_err(|e| ProtocolError::InvalidPublicKey(e.to_string()))
}

/// Runs the client side of the handshake over an existing stream.
pub async fn client_handshake<S>(
    connector: &SslConnector,
    host: &str,
    stream: S,
) -> Result<SslStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ssl = connector
        .configure()
        .map_err(tls_error)?
        .verify_hostname(false)
        .into_ssl(host)
        .map_err(tls_error)?;
    let mut stream = SslStream::new(ssl, stream).map_err(tls_error)?;
    Pin::new(&mut stream)
        .connect()
        .await
        .map_err(|e| ProtocolError::Transport(format!("TLS handshake failed: {}", e)))?;
    Ok(stream)
}

/// Server side of the pinned TLS profile.
#[derive(Clone)]
pub struct TlsAcceptor {
    acceptor: SslAcceptor,
}

impl TlsAcceptor {
    /// Runs the server side of the handshake over `stream`.
    pub async fn accept<S>(&self, stream: S) -> Result<SslStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let ssl = Ssl::new(self.acceptor.context()).map_err(tls_error)?;
        let mut stream = SslStream::new(ssl, stream).map_err(tls_error)?;
        Pin::new(&mut stream)
            .accept()
            .await
            .map_err(|e| ProtocolError::Transport(format!("TLS accept failed: {}", e)))?;
        Ok(stream)
    }
}

/// Dials the relay over TCP with keepalive and runs the TLS handshake.
pub struct TlsDialer {
    host: String,
    port: u16,
    connector: SslConnector,
}

impl TlsDialer {
    /// Creates a dialer for `host:port` using `profile`.
    pub fn new(host: impl Into<String>, port: u16, profile: &TlsProfile) -> Result<Self> {
        Ok(Self {
            host: host.into(),
            port,
            connector: profile.connector()?,
        })
    }

    async fn dial_inner(&self) -> Result<TransportSession> {
        let addr = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await?
            .next()
            .ok_or_else(|| {
                ProtocolError::Transport(format!("no address found for {}", self.host))
            })?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_keepalive(true)?;
        let tcp = socket.connect(addr).await?;
        tcp.set_nodelay(true)?;
        tracing::debug!(%addr, "TCP connected, starting TLS handshake");

        let stream = client_handshake(&self.connector, &self.host, tcp).await?;
        let peer_public_key = peer_public_key(stream.ssl())?;
        tracing::debug!(
            cipher = stream.ssl().current_cipher().map(|c| c.name()).unwrap_or("none"),
            "TLS session established"
        );

        Ok(TransportSession {
            stream: Box::new(stream),
            peer_public_key,
        })
    }
}

impl Dialer for TlsDialer {
    fn dial<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<TransportSession>> + Send + 'a>> {
        Box::pin(self.dial_inner())
    }

    fn describe(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
