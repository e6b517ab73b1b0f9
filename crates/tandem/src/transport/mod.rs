//! Transports: how byte streams are dialed and accepted.
//!
//! tandem itself only needs a duplex byte stream. A [`Connector`] produces
//! one on demand for a client; a [`Listener`] hands them to a
//! [`Server`](crate::Server) as peers arrive.

use std::fmt;
use std::io;
use std::sync::Arc;

use futures::future::BoxFuture;
pub use tandem_core::{BoxedStream, IoStream};
use tandem_core::ConnectionId;

pub mod mem;
pub mod tcp;
#[cfg(unix)]
pub mod unix;

/// The key the [`ConnectionRegistry`](crate::ConnectionRegistry) uses to
/// share one physical connection between clients.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionIdentity(Arc<str>);

impl ConnectionIdentity {
    pub fn new(identity: impl AsRef<str>) -> Self {
        Self(Arc::from(identity.as_ref()))
    }

    pub fn tcp(addr: impl fmt::Display) -> Self {
        Self::new(format!("tcp://{addr}"))
    }

    pub fn unix(path: impl AsRef<std::path::Path>) -> Self {
        Self::new(format!("unix://{}", path.as_ref().display()))
    }

    pub fn memory(name: &str) -> Self {
        Self::new(format!("mem://{name}"))
    }

    /// The identity of a client riding an already-open connection.
    pub fn attached(connection: ConnectionId) -> Self {
        Self::new(format!("attached://{connection}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ConnectionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionIdentity({})", self.0)
    }
}

/// Who is on the other end of an accepted stream.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// Transport-specific description of the remote side.
    pub remote: String,
    /// The listener that accepted it.
    pub local: ConnectionIdentity,
}

/// Dials a fixed target.
pub trait Connector: Send + Sync + 'static {
    /// The target this connector dials. Connectors with equal identities share
    /// a connection.
    fn identity(&self) -> ConnectionIdentity;

    fn connect(&self) -> BoxFuture<'_, io::Result<BoxedStream>>;
}

/// Accepts inbound streams. Shared between a listener's accept tasks.
pub trait Listener: Send + Sync + 'static {
    fn local_identity(&self) -> ConnectionIdentity;

    fn accept(&self) -> BoxFuture<'_, io::Result<(BoxedStream, PeerInfo)>>;
}

impl<T: Connector + ?Sized> Connector for Arc<T> {
    fn identity(&self) -> ConnectionIdentity {
        (**self).identity()
    }

    fn connect(&self) -> BoxFuture<'_, io::Result<BoxedStream>> {
        (**self).connect()
    }
}

impl<T: Listener + ?Sized> Listener for Arc<T> {
    fn local_identity(&self) -> ConnectionIdentity {
        (**self).local_identity()
    }

    fn accept(&self) -> BoxFuture<'_, io::Result<(BoxedStream, PeerInfo)>> {
        (**self).accept()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identities_compare_by_target() {
        assert_eq!(
            ConnectionIdentity::tcp("127.0.0.1:9000"),
            ConnectionIdentity::new("tcp://127.0.0.1:9000")
        );
        assert_ne!(ConnectionIdentity::memory("a"), ConnectionIdentity::memory("b"));
        assert_eq!(ConnectionIdentity::unix("/tmp/x.sock").as_str(), "unix:///tmp/x.sock");
    }
}
