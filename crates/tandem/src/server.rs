//! Accepting peers.
//!
//! A [`Server`] runs a fixed number of accept tasks per listener. Each
//! accepted stream is checked against the [`AcceptPolicy`], then becomes a
//! [`Connection`] served by the server's [`Router`]. Slow handshakes on one
//! accept task never hold up the others, and established connections are
//! unaffected by accepting.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tandem_core::{BoxedStream, CancelToken, Connection, ConnectionConfig, ConnectionId};
use tokio::task::JoinHandle;

use crate::client::ServiceClient;
use crate::router::Router;
use crate::transport::{ConnectionIdentity, Listener, PeerInfo};

const DEFAULT_ACCEPT_TASKS: usize = 4;
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Decides whether an accepted peer may proceed.
///
/// A rejected stream is closed before any frame is read.
pub trait AcceptPolicy: Send + Sync + 'static {
    fn accept(&self, peer: &PeerInfo) -> bool;
}

impl<F> AcceptPolicy for F
where
    F: Fn(&PeerInfo) -> bool + Send + Sync + 'static,
{
    fn accept(&self, peer: &PeerInfo) -> bool {
        self(peer)
    }
}

/// One listener and how to serve what it accepts.
pub struct ListenerConfig {
    listener: Arc<dyn Listener>,
    accept_tasks: usize,
    connection: ConnectionConfig,
}

impl ListenerConfig {
    pub fn new(listener: impl Listener) -> Self {
        Self {
            listener: Arc::new(listener),
            accept_tasks: DEFAULT_ACCEPT_TASKS,
            connection: ConnectionConfig::from_env(),
        }
    }

    /// Number of concurrent accept tasks. At least one.
    pub fn with_accept_tasks(mut self, tasks: usize) -> Self {
        self.accept_tasks = tasks.max(1);
        self
    }

    pub fn with_connection_config(mut self, config: ConnectionConfig) -> Self {
        self.connection = config;
        self
    }
}

impl std::fmt::Debug for ListenerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerConfig")
            .field("listener", &self.listener.local_identity())
            .field("accept_tasks", &self.accept_tasks)
            .field("connection", &self.connection)
            .finish()
    }
}

pub struct ServerBuilder {
    router: Router,
    listeners: Vec<ListenerConfig>,
    policy: Option<Arc<dyn AcceptPolicy>>,
}

impl ServerBuilder {
    pub fn listener(mut self, listener: ListenerConfig) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn accept_policy(mut self, policy: impl AcceptPolicy) -> Self {
        self.policy = Some(Arc::new(policy));
        self
    }

    /// Start accepting. Must be called from within a Tokio runtime.
    pub fn start(self) -> Server {
        let inner = Arc::new(ServerInner {
            router: self.router,
            policy: self.policy,
            connections: Mutex::new(HashMap::new()),
            shutdown: CancelToken::new(),
        });

        let mut tasks = Vec::new();
        let mut local = Vec::new();
        for config in self.listeners {
            let identity = config.listener.local_identity();
            tracing::info!(listener = %identity, accept_tasks = config.accept_tasks, "listening");
            for task in 0..config.accept_tasks {
                tasks.push(tokio::spawn(accept_loop(
                    inner.clone(),
                    config.listener.clone(),
                    config.connection.clone(),
                    task,
                )));
            }
            local.push(identity);
        }

        Server {
            inner,
            local,
            tasks: Mutex::new(tasks),
        }
    }
}

struct ServerInner {
    router: Router,
    policy: Option<Arc<dyn AcceptPolicy>>,
    connections: Mutex<HashMap<ConnectionId, Connection>>,
    shutdown: CancelToken,
}

impl ServerInner {
    fn admit(self: &Arc<Self>, stream: BoxedStream, peer: PeerInfo, config: &ConnectionConfig) {
        let admitted = self.policy.as_ref().is_none_or(|policy| policy.accept(&peer));
        if !admitted {
            tracing::info!(peer = %peer.remote, listener = %peer.local, "peer rejected by accept policy");
            drop(stream);
            return;
        }

        let connection = Connection::start(
            stream,
            peer.remote.clone(),
            config.clone(),
            Some(self.router.handler()),
        );
        self.connections
            .lock()
            .insert(connection.id(), connection.clone());
        tracing::info!(
            connection = %connection.id(),
            peer = %peer.remote,
            listener = %peer.local,
            "accepted connection"
        );

        let server: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            connection.closed().await;
            if let Some(server) = server.upgrade() {
                server.connections.lock().remove(&connection.id());
            }
        });
    }
}

async fn accept_loop(
    server: Arc<ServerInner>,
    listener: Arc<dyn Listener>,
    config: ConnectionConfig,
    task: usize,
) {
    let identity = listener.local_identity();
    tracing::debug!(listener = %identity, task, "accept task started");
    loop {
        let accepted = tokio::select! {
            biased;
            _ = server.shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => server.admit(stream, peer, &config),
            Err(e) => {
                tracing::error!(listener = %identity, task, error = %e, "accept failed");
                tokio::select! {
                    _ = server.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => {}
                }
            }
        }
    }
    tracing::debug!(listener = %identity, task, "accept task stopped");
}

/// A running set of listeners.
///
/// Dropping the server stops accepting; established connections stay up
/// until [`stop`](Self::stop) or [`close_connections`](Self::close_connections).
pub struct Server {
    inner: Arc<ServerInner>,
    local: Vec<ConnectionIdentity>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Server {
    pub fn builder(router: Router) -> ServerBuilder {
        ServerBuilder {
            router,
            listeners: Vec::new(),
            policy: None,
        }
    }

    /// Start serving `router` on every listener.
    pub fn start(router: Router, listeners: impl IntoIterator<Item = ListenerConfig>) -> Server {
        let mut builder = Self::builder(router);
        builder.listeners.extend(listeners);
        builder.start()
    }

    pub fn router(&self) -> &Router {
        &self.inner.router
    }

    /// Identities of the listeners, in the order given.
    pub fn local_identities(&self) -> &[ConnectionIdentity] {
        &self.local
    }

    /// Accepted connections that are still open, oldest first.
    pub fn connections(&self) -> Vec<Connection> {
        let mut connections: Vec<_> = self.inner.connections.lock().values().cloned().collect();
        connections.sort_by_key(Connection::id);
        connections
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.lock().len()
    }

    /// A client that calls the peer on an accepted connection.
    pub fn callback_client(&self, connection: ConnectionId) -> Option<ServiceClient> {
        let connection = self.inner.connections.lock().get(&connection).cloned()?;
        Some(ServiceClient::attached(
            connection,
            self.inner.router.callback_options().clone(),
        ))
    }

    pub fn close_connections(&self) {
        let connections: Vec<_> = self.inner.connections.lock().drain().map(|(_, c)| c).collect();
        for connection in connections {
            connection.close();
        }
    }

    /// Stop accepting, wait for the accept tasks to finish, and close every
    /// accepted connection.
    pub async fn stop(&self) {
        self.inner.shutdown.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "accept task ended abnormally");
            }
        }
        self.close_connections();
        tracing::info!("server stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("listeners", &self.local)
            .field("connections", &self.connection_count())
            .finish()
    }
}
