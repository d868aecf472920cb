//! Byte-stream transports for coordinator connections.
//!
//! A worker reaches its coordinator over TCP in a cluster and over a Unix
//! socket when both run on one host (tests, single-node deployments). The
//! multiplexer only sees [`Connection`]s and [`Listener`]s.

mod socket;
mod tcp;
mod unix;

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

pub use socket::Socket;
pub use tcp::{TcpConnection, TcpListener};
pub use unix::{UnixConnection, UnixListener};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Not a `tcp://host:port` or `unix:///path` endpoint.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Nothing is listening at the endpoint.
    #[error("connection refused by {0}")]
    Refused(String),

    /// The Unix socket file does not exist.
    #[error("no socket at {}", .0.display())]
    MissingSocket(PathBuf),

    #[error("timed out after {timeout:?} connecting to {endpoint}")]
    ConnectTimeout { endpoint: String, timeout: Duration },
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Classifies a failed connect: a refusal is worth reporting by name.
fn connect_error(endpoint: String, e: std::io::Error) -> TransportError {
    if e.kind() == ErrorKind::ConnectionRefused {
        TransportError::Refused(endpoint)
    } else {
        TransportError::Io(e)
    }
}

/// Where a coordinator listens.
///
/// Written `tcp://host:port` (the scheme may be omitted) or
/// `unix:///path/to/socket`. In configuration files it is a tagged table:
/// `{ type = "tcp", addr = "10.0.0.1:19998" }`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Transport {
    Unix { path: PathBuf },
    Tcp { addr: SocketAddr },
}

impl Transport {
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self::Unix { path: path.into() }
    }

    pub const fn tcp(addr: SocketAddr) -> Self {
        Self::Tcp { addr }
    }

    /// Starts listening at this endpoint.
    pub async fn bind(&self) -> Result<Box<dyn Listener>> {
        let listener: Box<dyn Listener> = match self {
            Self::Unix { path } => Box::new(UnixListener::bind(path.clone())?),
            Self::Tcp { addr } => Box::new(TcpListener::bind(*addr).await?),
        };
        Ok(listener)
    }

    /// Opens a connection to this endpoint.
    pub async fn connect(&self) -> Result<Box<dyn Connection>> {
        let connection: Box<dyn Connection> = match self {
            Self::Unix { path } => Box::new(unix::connect(path).await?),
            Self::Tcp { addr } => Box::new(tcp::connect(*addr).await?),
        };
        Ok(connection)
    }

    /// Like [`connect`](Self::connect), giving up after `timeout`.
    pub async fn connect_timeout(&self, timeout: Duration) -> Result<Box<dyn Connection>> {
        match tokio::time::timeout(timeout, self.connect()).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::ConnectTimeout {
                endpoint: self.to_string(),
                timeout,
            }),
        }
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unix { path } => write!(f, "unix://{}", path.display()),
            Self::Tcp { addr } => write!(f, "tcp://{addr}"),
        }
    }
}

impl FromStr for Transport {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || TransportError::InvalidEndpoint(s.to_owned());
        match s.split_once("://") {
            Some(("unix", "")) => Err(invalid()),
            Some(("unix", path)) => Ok(Self::unix(path)),
            Some(("tcp", addr)) => addr.parse().map(Self::tcp).map_err(|_| invalid()),
            Some(_) => Err(invalid()),
            None => s.parse().map(Self::tcp).map_err(|_| invalid()),
        }
    }
}

/// Accepts incoming connections.
#[async_trait]
pub trait Listener: Send + Sync {
    async fn accept(&self) -> Result<Box<dyn Connection>>;

    /// The bound address, e.g. `127.0.0.1:40123` or `unix:///run/c.sock`.
    fn local_addr(&self) -> Result<String>;
}

/// A bidirectional byte stream to a peer.
pub trait Connection: AsyncRead + AsyncWrite + Send + Sync + Unpin {
    /// Peer endpoint for logs.
    fn peer(&self) -> String;
}
