//! TLS over TCP, for brokers that listen with a certificate pair.

use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_rustls::rustls::crypto::{ring, CryptoProvider};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};
use tracing::debug;

use crate::error::{Error, Result};
use crate::transport::{
    BoxReader, BoxWriter, TcpTransport, TcpTransportListener, Transport, TransportListener,
};

/// Upper bound on a handshake when no connect timeout is given
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

fn tls_error(e: impl fmt::Display) -> Error {
    Error::Tls(e.to_string())
}

fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut &pem[..]).collect::<std::io::Result<Vec<_>>>()?;
    if certs.is_empty() {
        return Err(Error::Tls("no certificate in PEM input".to_string()));
    }
    Ok(certs)
}

/// Certificate pair a broker listens with.
#[derive(Clone)]
pub struct TlsServerConfig {
    config: Arc<ServerConfig>,
}

impl TlsServerConfig {
    /// Build from a PEM private key and PEM certificate chain
    pub fn from_pem(key: &[u8], cert: &[u8]) -> Result<Self> {
        let certs = parse_certs(cert)?;
        let key = rustls_pemfile::private_key(&mut &key[..])?
            .ok_or_else(|| Error::Tls("no private key in PEM input".to_string()))?;
        let config = ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .map_err(tls_error)?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(tls_error)?;
        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Read the key and certificate from PEM files
    pub fn from_files(key: impl AsRef<Path>, cert: impl AsRef<Path>) -> Result<Self> {
        Self::from_pem(&std::fs::read(key)?, &std::fs::read(cert)?)
    }
}

impl fmt::Debug for TlsServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsServerConfig").finish_non_exhaustive()
    }
}

/// Trust settings for dialling a TLS broker.
#[derive(Clone)]
pub struct TlsClientConfig {
    config: Arc<ClientConfig>,
    server_name: Option<String>,
}

impl TlsClientConfig {
    /// Trust the certificates in `pem`, usually the broker's own certificate
    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        let mut roots = RootCertStore::empty();
        for cert in parse_certs(pem)? {
            roots.add(cert).map_err(tls_error)?;
        }
        let config = ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .map_err(tls_error)?
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Self {
            config: Arc::new(config),
            server_name: None,
        })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_pem(&std::fs::read(path)?)
    }

    /// Name the broker's certificate must carry. Defaults to the dialled host.
    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }
}

impl fmt::Debug for TlsClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsClientConfig")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

/// Host part of `host:port` or `[v6]:port`
fn host_of(addr: &str) -> &str {
    if let Some(rest) = addr.strip_prefix('[') {
        return rest.split_once(']').map_or(rest, |(host, _)| host);
    }
    addr.rsplit_once(':').map_or(addr, |(host, _)| host)
}

/// TLS transport over TCP
pub struct TlsTransport {
    stream: TlsStream<TcpStream>,
    peer: String,
}

impl TlsTransport {
    /// Connect to `addr` and run the client handshake
    pub async fn connect(
        addr: &str,
        tls: &TlsClientConfig,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let name = tls.server_name.as_deref().unwrap_or_else(|| host_of(addr));
        let server_name = ServerName::try_from(name.to_string()).map_err(tls_error)?;

        let mut builder = TcpTransport::builder().address(addr);
        if let Some(timeout) = timeout {
            builder = builder.connect_timeout(timeout);
        }
        let tcp = builder.connect().await?;

        let connector = TlsConnector::from(tls.config.clone());
        let handshake = connector.connect(server_name, tcp.into_stream());
        let stream = tokio::time::timeout(timeout.unwrap_or(HANDSHAKE_TIMEOUT), handshake)
            .await
            .map_err(|_| Error::Tls("handshake timed out".to_string()))?
            .map_err(tls_error)?;

        Ok(Self {
            stream: stream.into(),
            peer: format!("tls://{}", addr),
        })
    }
}

impl Transport for TlsTransport {
    fn split(self: Box<Self>) -> (BoxReader, BoxWriter) {
        let (read, write) = tokio::io::split(self.stream);
        (Box::new(read), Box::new(write))
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}

/// TLS listener. Handshakes run off the accept path, so a slow client never
/// holds up the next one.
pub struct TlsTransportListener {
    local_addr: Option<SocketAddr>,
    incoming: Mutex<mpsc::Receiver<Result<TlsTransport>>>,
    task: JoinHandle<()>,
}

impl TlsTransportListener {
    /// Bind to a local address
    pub async fn bind(addr: impl Into<String>, tls: &TlsServerConfig) -> Result<Self> {
        let listener = TcpTransportListener::bind(addr).await?;
        let local_addr = listener.local_addr().ok();
        let acceptor = TlsAcceptor::from(tls.config.clone());
        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(handshake_loop(listener, acceptor, tx));
        Ok(Self {
            local_addr,
            incoming: Mutex::new(rx),
            task,
        })
    }
}

async fn handshake_loop(
    listener: TcpTransportListener,
    acceptor: TlsAcceptor,
    tx: mpsc::Sender<Result<TlsTransport>>,
) {
    loop {
        let accepted = tokio::select! {
            _ = tx.closed() => break,
            accepted = listener.accept() => accepted,
        };
        let (tcp, addr) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                if tx.send(Err(e)).await.is_err() {
                    break;
                }
                continue;
            }
        };

        let acceptor = acceptor.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let handshake = acceptor.accept(tcp.into_stream());
            match tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake).await {
                Ok(Ok(stream)) => {
                    let transport = TlsTransport {
                        stream: stream.into(),
                        peer: format!("tls://{}", addr),
                    };
                    let _ = tx.send(Ok(transport)).await;
                }
                Ok(Err(e)) => debug!(%addr, error = %e, "TLS handshake failed"),
                Err(_) => debug!(%addr, "TLS handshake timed out"),
            }
        });
    }
}

#[async_trait::async_trait]
impl TransportListener for TlsTransportListener {
    async fn accept(&self) -> Result<Box<dyn Transport>> {
        let transport = self
            .incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or(Error::ConnectionClosed)??;
        Ok(Box::new(transport))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    async fn close(&mut self) -> Result<()> {
        self.task.abort();
        Ok(())
    }
}

impl Drop for TlsTransportListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}
