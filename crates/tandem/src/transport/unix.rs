//! Unix domain socket transport.

use std::io;
use std::path::{Path, PathBuf};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::net::{UnixListener, UnixStream};

use super::{BoxedStream, ConnectionIdentity, Connector, Listener, PeerInfo};

/// Dials a socket path.
#[derive(Debug, Clone)]
pub struct UnixConnector {
    path: PathBuf,
}

impl UnixConnector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Connector for UnixConnector {
    fn identity(&self) -> ConnectionIdentity {
        ConnectionIdentity::unix(&self.path)
    }

    fn connect(&self) -> BoxFuture<'_, io::Result<BoxedStream>> {
        async move {
            let stream = UnixStream::connect(&self.path).await?;
            Ok(Box::new(stream) as BoxedStream)
        }
        .boxed()
    }
}

/// A bound socket path. The file is removed when the acceptor is dropped.
#[derive(Debug)]
pub struct UnixAcceptor {
    listener: UnixListener,
    path: PathBuf,
    next_peer: std::sync::atomic::AtomicU64,
}

impl UnixAcceptor {
    /// Bind `path`, replacing a stale socket file if one is there.
    pub fn bind(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        match std::fs::remove_file(&path) {
            Ok(()) => tracing::debug!(path = %path.display(), "removed stale socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        let listener = UnixListener::bind(&path)?;
        tracing::info!(path = %path.display(), "unix listener bound");
        Ok(Self {
            listener,
            path,
            next_peer: std::sync::atomic::AtomicU64::new(1),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn connector(&self) -> UnixConnector {
        UnixConnector::new(self.path.clone())
    }
}

impl Listener for UnixAcceptor {
    fn local_identity(&self) -> ConnectionIdentity {
        ConnectionIdentity::unix(&self.path)
    }

    fn accept(&self) -> BoxFuture<'_, io::Result<(BoxedStream, PeerInfo)>> {
        async move {
            let (stream, _addr) = self.listener.accept().await?;
            // Unnamed client sockets have no address worth reporting.
            let n = self
                .next_peer
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            let peer = PeerInfo {
                remote: format!("{}#{n}", self.path.display()),
                local: self.local_identity(),
            };
            Ok((Box::new(stream) as BoxedStream, peer))
        }
        .boxed()
    }
}

impl Drop for UnixAcceptor {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
