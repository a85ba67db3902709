use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;

pub mod address;
pub mod frame;
pub mod tcp;
pub mod tls;
pub mod unix;

pub use self::address::{Address, DEFAULT_PORT};
pub use self::frame::{FrameReader, FrameWriter, MAX_FRAME_LEN};
pub use self::tcp::{TcpTransport, TcpTransportBuilder, TcpTransportListener};
pub use self::tls::{TlsClientConfig, TlsServerConfig, TlsTransport, TlsTransportListener};
pub use self::unix::{UnixTransport, UnixTransportBuilder, UnixTransportListener};

pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A connected byte stream that can be split into independent halves.
///
/// Each transport instance represents a single connection.
pub trait Transport: Send {
    /// Split into read and write halves so both directions can run concurrently
    fn split(self: Box<Self>) -> (BoxReader, BoxWriter);

    /// Human readable description of the remote end, for logs
    fn peer(&self) -> String;
}

/// Accepts incoming transports
#[async_trait::async_trait]
pub trait TransportListener: Send + Sync {
    /// Accept the next incoming connection
    async fn accept(&self) -> Result<Box<dyn Transport>>;

    /// Local socket address, for listeners bound to one
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Close the listener
    async fn close(&mut self) -> Result<()>;
}
