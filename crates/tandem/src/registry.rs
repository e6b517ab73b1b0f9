//! Connection sharing.
//!
//! Every client that targets the same [`ConnectionIdentity`] shares one
//! [`ConnectionHandle`], and through it one physical connection. The handle's
//! connect lock serializes the "is it up, or do I dial" decision, so
//! concurrent first calls produce a single dial. The lock is never held
//! while a call is in progress.
//!
//! When a connection closes, its identity is removed from the registry, but
//! only if the entry still points at that connection. A handle removed this
//! way is retired; anyone still holding it looks the identity up again.
//!
//! The registry owns its connections. When the last clone of a registry is
//! dropped (the factory and every client built from it), all of its
//! connections are closed.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tandem_core::{Connection, ConnectionConfig, RpcError};

use crate::router::Router;
use crate::transport::{ConnectionIdentity, Connector};

/// How to open a connection to one target.
pub struct Dialer {
    identity: ConnectionIdentity,
    connector: Arc<dyn Connector>,
    config: ConnectionConfig,
    inbound: Option<Router>,
    connect_timeout: Duration,
}

impl Dialer {
    pub fn new(connector: impl Connector, config: ConnectionConfig) -> Self {
        Self {
            identity: connector.identity(),
            connector: Arc::new(connector),
            config,
            inbound: None,
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Serve `router` on dialed connections, so the peer can call back.
    pub fn with_inbound(mut self, router: Router) -> Self {
        self.inbound = Some(router);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn identity(&self) -> &ConnectionIdentity {
        &self.identity
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Open a new connection. Does not consult any registry.
    pub async fn dial(&self) -> Result<Connection, RpcError> {
        tracing::debug!(identity = %self.identity, "dialing");
        let stream = match tokio::time::timeout(self.connect_timeout, self.connector.connect()).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                tracing::debug!(identity = %self.identity, error = %source, "dial failed");
                return Err(self.connect_error(source));
            }
            Err(_) => {
                let source = io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no connection within {:?}", self.connect_timeout),
                );
                return Err(self.connect_error(source));
            }
        };
        let handler = self.inbound.as_ref().map(Router::handler);
        Ok(Connection::start(
            stream,
            self.identity.to_string(),
            self.config.clone(),
            handler,
        ))
    }

    fn connect_error(&self, source: io::Error) -> RpcError {
        RpcError::Connect {
            identity: self.identity.to_string(),
            source,
        }
    }
}

impl std::fmt::Debug for Dialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dialer")
            .field("identity", &self.identity)
            .field("connect_timeout", &self.connect_timeout)
            .field("serves_callbacks", &self.inbound.is_some())
            .finish_non_exhaustive()
    }
}

/// One identity's slot in the registry.
pub struct ConnectionHandle {
    identity: ConnectionIdentity,
    slot: Mutex<Option<Connection>>,
    connect_lock: tokio::sync::Mutex<()>,
    retired: AtomicBool,
}

impl ConnectionHandle {
    fn new(identity: ConnectionIdentity) -> Self {
        Self {
            identity,
            slot: Mutex::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
            retired: AtomicBool::new(false),
        }
    }

    pub fn identity(&self) -> &ConnectionIdentity {
        &self.identity
    }

    /// The connection, if it is still usable.
    pub fn current(&self) -> Option<Connection> {
        self.slot.lock().as_ref().filter(|c| usable(c)).cloned()
    }

    fn holds(&self, connection: &Connection) -> bool {
        self.slot
            .lock()
            .as_ref()
            .is_some_and(|c| c.same_as(connection))
    }

    /// `Ok(None)` means the handle was retired and the caller should look the
    /// identity up again.
    async fn connect(
        self: &Arc<Self>,
        registry: &ConnectionRegistry,
        dialer: &Dialer,
    ) -> Result<Option<Connection>, RpcError> {
        if let Some(connection) = self.current() {
            return Ok(Some(connection));
        }

        let _guard = self.connect_lock.lock().await;
        if self.retired.load(Ordering::Acquire) {
            return Ok(None);
        }
        if let Some(connection) = self.current() {
            return Ok(Some(connection));
        }

        let connection = match dialer.dial().await {
            Ok(connection) => connection,
            Err(e) => {
                registry.inner.remove_if_empty(self);
                return Err(e);
            }
        };
        *self.slot.lock() = Some(connection.clone());
        tracing::info!(
            identity = %self.identity,
            connection = %connection.id(),
            "connected"
        );

        let handle = Arc::downgrade(self);
        let registry = Arc::downgrade(&registry.inner);
        let watched = connection.clone();
        tokio::spawn(async move {
            watched.closed().await;
            let (Some(handle), Some(registry)) = (Weak::upgrade(&handle), Weak::upgrade(&registry))
            else {
                return;
            };
            // Wait out any dial in progress so it cannot land in a retired handle.
            let _guard = handle.connect_lock.lock().await;
            registry.remove_if_current(&handle, &watched);
        });

        Ok(Some(connection))
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("identity", &self.identity)
            .field("connection", &self.slot.lock().as_ref().map(Connection::id))
            .field("retired", &self.retired.load(Ordering::Relaxed))
            .finish()
    }
}

fn usable(connection: &Connection) -> bool {
    // A draining table means the connection is on its way down, even if the
    // state has not flipped yet.
    connection.is_open() && !connection.correlation().is_closed()
}

#[derive(Default)]
struct RegistryInner {
    handles: Mutex<HashMap<ConnectionIdentity, Arc<ConnectionHandle>>>,
}

impl RegistryInner {
    fn close_all(&self) {
        let handles: Vec<_> = self.handles.lock().drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.retired.store(true, Ordering::Release);
            if let Some(connection) = handle.slot.lock().take() {
                connection.close();
            }
        }
    }

    fn remove_if_current(&self, handle: &Arc<ConnectionHandle>, closed: &Connection) {
        let mut handles = self.handles.lock();
        let current = handles
            .get(&handle.identity)
            .is_some_and(|h| Arc::ptr_eq(h, handle) && h.holds(closed));
        if current {
            handle.retired.store(true, Ordering::Release);
            handles.remove(&handle.identity);
            tracing::debug!(
                identity = %handle.identity,
                connection = %closed.id(),
                "removed closed connection"
            );
        }
    }

    /// Drop a handle whose dial failed, so unreachable targets leave no entry.
    /// Called with the handle's connect lock held.
    fn remove_if_empty(&self, handle: &Arc<ConnectionHandle>) {
        let mut handles = self.handles.lock();
        let empty = handles
            .get(&handle.identity)
            .is_some_and(|h| Arc::ptr_eq(h, handle) && h.slot.lock().is_none());
        if empty {
            handle.retired.store(true, Ordering::Release);
            handles.remove(&handle.identity);
        }
    }
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        self.close_all();
    }
}

/// Shared physical connections, keyed by identity. Cheap to clone.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, identity: &ConnectionIdentity) -> Arc<ConnectionHandle> {
        self.inner
            .handles
            .lock()
            .entry(identity.clone())
            .or_insert_with(|| Arc::new(ConnectionHandle::new(identity.clone())))
            .clone()
    }

    /// The live connection for `identity`, if there is one.
    pub fn get(&self, identity: &ConnectionIdentity) -> Option<Connection> {
        let handle = self.inner.handles.lock().get(identity).cloned()?;
        handle.current()
    }

    /// A live connection to the dialer's target, reusing one if possible.
    pub async fn connect(&self, dialer: &Dialer) -> Result<Connection, RpcError> {
        loop {
            let handle = self.get_or_create(dialer.identity());
            if let Some(connection) = handle.connect(self, dialer).await? {
                return Ok(connection);
            }
        }
    }

    /// Number of identities with an entry.
    pub fn len(&self) -> usize {
        self.inner.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Identities with an entry, sorted.
    pub fn identities(&self) -> Vec<ConnectionIdentity> {
        let mut identities: Vec<_> = self.inner.handles.lock().keys().cloned().collect();
        identities.sort();
        identities
    }

    /// Close every connection and forget every identity.
    pub fn close_all(&self) {
        self.inner.close_all();
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("identities", &self.identities())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use futures::FutureExt;
    use futures::future::BoxFuture;
    use tandem_core::BoxedStream;

    use super::*;

    /// Hands out one end of a fresh duplex pair per dial and keeps the other.
    struct CountingConnector {
        dials: Arc<AtomicUsize>,
        peers: Arc<Mutex<Vec<tokio::io::DuplexStream>>>,
        delay: Duration,
    }

    impl Connector for CountingConnector {
        fn identity(&self) -> ConnectionIdentity {
            ConnectionIdentity::memory("counting")
        }

        fn connect(&self) -> BoxFuture<'_, io::Result<BoxedStream>> {
            async move {
                tokio::time::sleep(self.delay).await;
                self.dials.fetch_add(1, Ordering::SeqCst);
                let (local, remote) = tokio::io::duplex(1024);
                self.peers.lock().push(remote);
                Ok(Box::new(local) as BoxedStream)
            }
            .boxed()
        }
    }

    fn dialer(delay: Duration) -> (Dialer, Arc<AtomicUsize>, Arc<Mutex<Vec<tokio::io::DuplexStream>>>) {
        let dials = Arc::new(AtomicUsize::new(0));
        let peers = Arc::new(Mutex::new(Vec::new()));
        let connector = CountingConnector {
            dials: dials.clone(),
            peers: peers.clone(),
            delay,
        };
        (
            Dialer::new(connector, ConnectionConfig::default()),
            dials,
            peers,
        )
    }

    #[tokio::test]
    async fn concurrent_first_calls_dial_once() {
        let registry = ConnectionRegistry::new();
        let (dialer, dials, _peers) = dialer(Duration::from_millis(20));

        let (a, b, c) = tokio::join!(
            registry.connect(&dialer),
            registry.connect(&dialer),
            registry.connect(&dialer)
        );
        let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());
        assert!(a.same_as(&b) && b.same_as(&c));
        assert_eq!(dials.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn closed_connections_are_removed_and_redialed() {
        let registry = ConnectionRegistry::new();
        let (dialer, dials, peers) = dialer(Duration::ZERO);

        let first = registry.connect(&dialer).await.unwrap();
        peers.lock().clear();
        first.closed().await;

        tokio::time::timeout(Duration::from_secs(1), async {
            while !registry.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("closed entry should be removed");

        let second = registry.connect(&dialer).await.unwrap();
        assert!(!second.same_as(&first));
        assert_eq!(dials.load(Ordering::SeqCst), 2);
        assert!(registry.get(dialer.identity()).is_some());
    }

    #[tokio::test]
    async fn stale_close_does_not_evict_newer_connection() {
        let registry = ConnectionRegistry::new();
        let (dialer, _dials, _peers) = dialer(Duration::ZERO);

        let first = registry.connect(&dialer).await.unwrap();
        let handle = registry.get_or_create(dialer.identity());
        // Pretend a newer connection already replaced the first one.
        let (newer, _newer_peer) = tokio::io::duplex(1024);
        let newer = Connection::start(newer, "newer", ConnectionConfig::default(), None);
        *handle.slot.lock() = Some(newer.clone());

        registry.inner.remove_if_current(&handle, &first);
        assert_eq!(registry.len(), 1);
        assert!(registry.get(dialer.identity()).unwrap().same_as(&newer));
    }

    #[tokio::test]
    async fn dial_failures_name_the_target() {
        struct Refusing;
        impl Connector for Refusing {
            fn identity(&self) -> ConnectionIdentity {
                ConnectionIdentity::tcp("127.0.0.1:1")
            }
            fn connect(&self) -> BoxFuture<'_, io::Result<BoxedStream>> {
                async { Err(io::Error::from(io::ErrorKind::ConnectionRefused)) }.boxed()
            }
        }

        let registry = ConnectionRegistry::new();
        let dialer = Dialer::new(Refusing, ConnectionConfig::default());
        match registry.connect(&dialer).await {
            Err(RpcError::Connect { identity, source }) => {
                assert_eq!(identity, "tcp://127.0.0.1:1");
                assert_eq!(source.kind(), io::ErrorKind::ConnectionRefused);
            }
            other => panic!("expected a connect error, got {other:?}"),
        }
        assert!(registry.is_empty(), "failed dial left {registry:?}");
        assert!(registry.get(dialer.identity()).is_none());
    }

    #[tokio::test]
    async fn dropping_the_registry_closes_its_connections() {
        let registry = ConnectionRegistry::new();
        let (dialer, _dials, _peers) = dialer(Duration::ZERO);
        let connection = registry.connect(&dialer).await.unwrap();
        let clone = registry.clone();

        drop(registry);
        assert!(connection.is_open(), "a clone still owns the connection");

        drop(clone);
        tokio::time::timeout(Duration::from_secs(1), connection.closed())
            .await
            .expect("last owner gone, connection should close");
    }

    #[tokio::test]
    async fn close_all_empties_the_registry() {
        let registry = ConnectionRegistry::new();
        let (dialer, _dials, _peers) = dialer(Duration::ZERO);
        let connection = registry.connect(&dialer).await.unwrap();

        registry.close_all();
        assert!(registry.is_empty());
        connection.closed().await;
    }
}
