//! Coordinator connections over TCP.

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::TcpStream;

use super::socket::Socket;
use super::{connect_error, Connection, Listener, Result};

/// A TCP connection with Nagle's algorithm disabled.
///
/// Control-plane frames are small: handshake steps and heartbeats should
/// leave immediately.
pub type TcpConnection = Socket<TcpStream>;

impl TcpConnection {
    /// Returns whether Nagle's algorithm is disabled.
    pub fn nodelay(&self) -> Result<bool> {
        Ok(self.stream().nodelay()?)
    }
}

pub(super) async fn connect(addr: SocketAddr) -> Result<TcpConnection> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| connect_error(format!("tcp://{addr}"), e))?;
    wrap(stream, addr)
}

fn wrap(stream: TcpStream, peer: SocketAddr) -> Result<TcpConnection> {
    stream.set_nodelay(true)?;
    Ok(Socket::new(stream, format!("tcp://{peer}")))
}

/// Accepts coordinator-side TCP connections.
#[derive(Debug)]
pub struct TcpListener {
    inner: tokio::net::TcpListener,
}

impl TcpListener {
    /// Binds to `addr`. Port 0 picks a free port; see
    /// [`Listener::local_addr`].
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let inner = tokio::net::TcpListener::bind(addr).await?;
        Ok(Self { inner })
    }
}

#[async_trait]
impl Listener for TcpListener {
    async fn accept(&self) -> Result<Box<dyn Connection>> {
        let (stream, peer) = self.inner.accept().await?;
        Ok(Box::new(wrap(stream, peer)?))
    }

    fn local_addr(&self) -> Result<String> {
        Ok(self.inner.local_addr()?.to_string())
    }
}
