use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::transport::{
    TcpTransport, TcpTransportListener, TlsClientConfig, TlsServerConfig, TlsTransport,
    TlsTransportListener, Transport, TransportListener, UnixTransport, UnixTransportListener,
};

/// Port a broker listens on when none is given.
pub const DEFAULT_PORT: u16 = 61610;

/// Where a broker listens or a client connects.
///
/// Parses `host`, `host:port`, `tcp://host:port` and `unix:/path`. IPv6 hosts
/// go in brackets when a port follows (`[::1]:5000`). A bare host gets
/// [`DEFAULT_PORT`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Tcp(String),
    Unix(PathBuf),
}

impl Address {
    pub fn tcp(host: &str, port: u16) -> Self {
        if host.contains(':') && !host.starts_with('[') {
            Address::Tcp(format!("[{}]:{}", host, port))
        } else {
            Address::Tcp(format!("{}:{}", host, port))
        }
    }

    /// Open a transport to this address
    pub async fn connect(&self, timeout: Option<Duration>) -> Result<Box<dyn Transport>> {
        match self {
            Address::Tcp(addr) => {
                let mut builder = TcpTransport::builder().address(addr.clone());
                if let Some(timeout) = timeout {
                    builder = builder.connect_timeout(timeout);
                }
                Ok(Box::new(builder.connect().await?))
            }
            Address::Unix(path) => {
                let mut builder = UnixTransport::builder().path(path);
                if let Some(timeout) = timeout {
                    builder = builder.connect_timeout(timeout);
                }
                Ok(Box::new(builder.connect().await?))
            }
        }
    }

    /// Open a TLS transport to this address
    pub async fn connect_tls(
        &self,
        tls: &TlsClientConfig,
        timeout: Option<Duration>,
    ) -> Result<Box<dyn Transport>> {
        match self {
            Address::Tcp(addr) => Ok(Box::new(TlsTransport::connect(addr, tls, timeout).await?)),
            Address::Unix(_) => Err(Error::Tls("TLS needs a TCP address".to_string())),
        }
    }

    /// Bind a listener on this address
    pub async fn bind(&self) -> Result<Box<dyn TransportListener>> {
        match self {
            Address::Tcp(addr) => Ok(Box::new(TcpTransportListener::bind(addr.clone()).await?)),
            Address::Unix(path) => Ok(Box::new(UnixTransportListener::bind(path).await?)),
        }
    }

    /// Bind a TLS listener on this address
    pub async fn bind_tls(&self, tls: &TlsServerConfig) -> Result<Box<dyn TransportListener>> {
        match self {
            Address::Tcp(addr) => Ok(Box::new(TlsTransportListener::bind(addr.clone(), tls).await?)),
            Address::Unix(_) => Err(Error::Tls("TLS needs a TCP address".to_string())),
        }
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(Error::Custom("Empty unix socket path".to_string()));
            }
            return Ok(Address::Unix(PathBuf::from(path)));
        }
        let rest = s.strip_prefix("tcp://").unwrap_or(s);
        if rest.is_empty() {
            return Err(Error::Custom("Empty address".to_string()));
        }
        let port = |port: &str| {
            port.parse::<u16>()
                .map_err(|_| Error::Custom(format!("Invalid port in address: {}", s)))
        };
        if let Some(bracketed) = rest.strip_prefix('[') {
            let (host, tail) = bracketed
                .split_once(']')
                .ok_or_else(|| Error::Custom(format!("Unclosed bracket in address: {}", s)))?;
            let port = match tail {
                "" => DEFAULT_PORT,
                tail => match tail.strip_prefix(':') {
                    Some(tail) => port(tail)?,
                    None => return Err(Error::Custom(format!("Invalid address: {}", s))),
                },
            };
            return Ok(Address::tcp(host, port));
        }
        match rest.split_once(':') {
            // More than one colon is a bare IPv6 host
            Some((_, tail)) if tail.contains(':') => Ok(Address::tcp(rest, DEFAULT_PORT)),
            Some(("", _)) => Err(Error::Custom(format!("Missing host in address: {}", s))),
            Some((host, tail)) => Ok(Address::tcp(host, port(tail)?)),
            None => Ok(Address::tcp(rest, DEFAULT_PORT)),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Tcp(addr) => write!(f, "tcp://{}", addr),
            Address::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}
