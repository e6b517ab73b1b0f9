//! TCP transport.

use std::io;
use std::net::SocketAddr;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

use super::{BoxedStream, ConnectionIdentity, Connector, Listener, PeerInfo};

/// Dials `addr` over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

impl Connector for TcpConnector {
    fn identity(&self) -> ConnectionIdentity {
        ConnectionIdentity::tcp(&self.addr)
    }

    fn connect(&self) -> BoxFuture<'_, io::Result<BoxedStream>> {
        async move {
            let stream = TcpStream::connect(self.addr.as_str()).await?;
            stream.set_nodelay(true)?;
            tracing::debug!(addr = %self.addr, "tcp connected");
            Ok(Box::new(stream) as BoxedStream)
        }
        .boxed()
    }
}

/// A bound TCP listener.
#[derive(Debug)]
pub struct TcpAcceptor {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl TcpAcceptor {
    pub async fn bind(addr: impl ToSocketAddrs) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(%local_addr, "tcp listener bound");
        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// A connector that dials this listener.
    pub fn connector(&self) -> TcpConnector {
        TcpConnector::new(self.local_addr.to_string())
    }
}

impl Listener for TcpAcceptor {
    fn local_identity(&self) -> ConnectionIdentity {
        ConnectionIdentity::tcp(self.local_addr)
    }

    fn accept(&self) -> BoxFuture<'_, io::Result<(BoxedStream, PeerInfo)>> {
        async move {
            let (stream, remote) = self.listener.accept().await?;
            stream.set_nodelay(true)?;
            let peer = PeerInfo {
                remote: remote.to_string(),
                local: self.local_identity(),
            };
            Ok((Box::new(stream) as BoxedStream, peer))
        }
        .boxed()
    }
}
