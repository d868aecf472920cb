//! Coordinator connections over a Unix domain socket, for a worker and
//! coordinator sharing a host.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::net::UnixStream;
use tracing::debug;

use super::socket::Socket;
use super::{connect_error, Connection, Listener, Result, TransportError};

pub type UnixConnection = Socket<UnixStream>;

fn endpoint(path: &Path) -> String {
    format!("unix://{}", path.display())
}

pub(super) async fn connect(path: &Path) -> Result<UnixConnection> {
    match UnixStream::connect(path).await {
        Ok(stream) => Ok(Socket::new(stream, endpoint(path))),
        Err(e) if e.kind() == ErrorKind::NotFound => Err(TransportError::MissingSocket(path.to_path_buf())),
        Err(e) => Err(connect_error(endpoint(path), e)),
    }
}

/// Accepts connections on a socket file, which is removed again on drop.
#[derive(Debug)]
pub struct UnixListener {
    inner: tokio::net::UnixListener,
    path: PathBuf,
}

impl UnixListener {
    /// Binds `path`, replacing a socket left behind by an earlier process and
    /// creating missing parent directories.
    pub fn bind(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "removed stale socket"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let inner = tokio::net::UnixListener::bind(&path)?;
        Ok(Self { inner, path })
    }
}

impl Drop for UnixListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[async_trait]
impl Listener for UnixListener {
    async fn accept(&self) -> Result<Box<dyn Connection>> {
        let (stream, _) = self.inner.accept().await?;
        Ok(Box::new(Socket::new(stream, endpoint(&self.path))))
    }

    fn local_addr(&self) -> Result<String> {
        Ok(endpoint(&self.path))
    }
}
