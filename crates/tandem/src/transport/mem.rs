//! In-process transport.
//!
//! This is the reference transport: streams are `tokio::io::duplex` pairs,
//! so everything above the byte stream behaves exactly as it does over a
//! socket. Tests use it; so can applications that want two tandem peers in
//! one process.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use super::{BoxedStream, ConnectionIdentity, Connector, Listener, PeerInfo};

/// Bytes buffered in each direction of an in-process stream.
const DUPLEX_BUFFER: usize = 64 * 1024;

/// Streams waiting to be accepted by a listener.
const ACCEPT_BACKLOG: usize = 64;

/// A connected pair of in-process streams.
pub fn pair() -> (DuplexStream, DuplexStream) {
    tokio::io::duplex(DUPLEX_BUFFER)
}

type Incoming = (DuplexStream, String);

/// A namespace of in-process listeners.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

#[derive(Default)]
struct NetworkInner {
    listeners: Mutex<HashMap<String, mpsc::Sender<Incoming>>>,
    next_peer: AtomicU64,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start listening on `name`. Fails with `AddrInUse` if it is taken.
    pub fn listen(&self, name: &str) -> io::Result<MemoryListener> {
        let mut listeners = self.inner.listeners.lock();
        if listeners.get(name).is_some_and(|tx| !tx.is_closed()) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("memory listener {name:?} already exists"),
            ));
        }
        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        listeners.insert(name.to_string(), tx);
        Ok(MemoryListener {
            name: name.to_string(),
            incoming: tokio::sync::Mutex::new(rx),
            network: self.clone(),
        })
    }

    pub fn connector(&self, name: &str) -> MemoryConnector {
        MemoryConnector {
            name: name.to_string(),
            network: self.clone(),
        }
    }

    async fn connect(&self, name: &str) -> io::Result<DuplexStream> {
        let tx = self.inner.listeners.lock().get(name).cloned();
        let Some(tx) = tx else {
            return Err(refused(name));
        };
        let (local, remote) = pair();
        let peer = format!("mem-peer-{}", self.inner.next_peer.fetch_add(1, Ordering::Relaxed));
        tx.send((remote, peer)).await.map_err(|_| refused(name))?;
        Ok(local)
    }
}

fn refused(name: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::ConnectionRefused,
        format!("no memory listener named {name:?}"),
    )
}

/// Dials a named [`MemoryListener`].
#[derive(Clone)]
pub struct MemoryConnector {
    name: String,
    network: MemoryNetwork,
}

impl Connector for MemoryConnector {
    fn identity(&self) -> ConnectionIdentity {
        ConnectionIdentity::memory(&self.name)
    }

    fn connect(&self) -> BoxFuture<'_, io::Result<BoxedStream>> {
        async move {
            let stream = self.network.connect(&self.name).await?;
            Ok(Box::new(stream) as BoxedStream)
        }
        .boxed()
    }
}

/// Accepts in-process streams. Unregisters its name when dropped.
pub struct MemoryListener {
    name: String,
    incoming: tokio::sync::Mutex<mpsc::Receiver<Incoming>>,
    network: MemoryNetwork,
}

impl MemoryListener {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connector(&self) -> MemoryConnector {
        self.network.connector(&self.name)
    }
}

impl Listener for MemoryListener {
    fn local_identity(&self) -> ConnectionIdentity {
        ConnectionIdentity::memory(&self.name)
    }

    fn accept(&self) -> BoxFuture<'_, io::Result<(BoxedStream, PeerInfo)>> {
        async move {
            let next = self.incoming.lock().await.recv().await;
            let Some((stream, remote)) = next else {
                return Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "memory listener closed",
                ));
            };
            let peer = PeerInfo {
                remote,
                local: self.local_identity(),
            };
            Ok((Box::new(stream) as BoxedStream, peer))
        }
        .boxed()
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.network.inner.listeners.lock().remove(&self.name);
    }
}
