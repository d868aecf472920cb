use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::Connection;

/// An established stream tagged with the endpoint on the other side.
///
/// TCP and Unix sockets share this wrapper; only connection setup differs.
#[derive(Debug)]
pub struct Socket<S> {
    stream: S,
    peer: String,
}

impl<S> Socket<S> {
    pub(super) fn new(stream: S, peer: String) -> Self {
        Self { stream, peer }
    }

    pub(super) fn stream(&self) -> &S {
        &self.stream
    }
}

impl<S> Connection for Socket<S>
where
    S: AsyncRead + AsyncWrite + Send + Sync + Unpin,
{
    fn peer(&self) -> String {
        self.peer.clone()
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Socket<S> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Socket<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}
