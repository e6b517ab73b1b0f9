use tandem_core::ConnectionConfig;

use crate::client::{ClientOptions, ServiceClient};
use crate::proxy::Proxy;
use crate::registry::{ConnectionRegistry, Dialer};
use crate::router::Router;
use crate::transport::Connector;

/// Creates clients that share one [`ConnectionRegistry`].
///
/// Two clients (or proxies for two different contracts) built from the same
/// factory for the same target ride the same physical connection.
#[derive(Debug, Clone)]
pub struct ClientFactory {
    registry: ConnectionRegistry,
    config: ConnectionConfig,
    options: ClientOptions,
    callbacks: Option<Router>,
}

impl Default for ClientFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientFactory {
    /// A factory configured from the environment.
    pub fn new() -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            config: ConnectionConfig::from_env(),
            options: ClientOptions::from_env(),
            callbacks: None,
        }
    }

    pub fn with_connection_config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    /// Serve `router` on every connection this factory dials, so peers can
    /// call back into this process.
    pub fn with_callbacks(mut self, router: Router) -> Self {
        self.callbacks = Some(router);
        self
    }

    pub fn client(&self, connector: impl Connector) -> ServiceClient {
        let mut dialer = Dialer::new(connector, self.config.clone())
            .with_connect_timeout(self.options.connect_timeout);
        if let Some(router) = &self.callbacks {
            dialer = dialer.with_inbound(router.clone());
        }
        ServiceClient::dial(self.registry.clone(), dialer, self.options.clone())
    }

    pub fn proxy<P: Proxy>(&self, connector: impl Connector) -> P {
        P::new(self.client(connector))
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Close every connection this factory opened.
    pub fn close(&self) {
        self.registry.close_all();
    }
}
