//! What a handler knows about the call it is serving.

use std::sync::Arc;

use tandem_core::{CancelToken, Connection, Encoding};

use crate::client::{ClientOptions, ServiceClient};
use crate::proxy::Proxy;

/// Per-invocation context handed to every handler.
///
/// Cheap to clone. The cancellation token fires when the caller cancels, when
/// the router's deadline for this call passes, or when the connection closes.
#[derive(Clone)]
pub struct CallContext {
    info: Arc<CallInfo>,
}

struct CallInfo {
    request_id: u64,
    endpoint: Arc<str>,
    method: Arc<str>,
    trace_id: Option<String>,
    token: CancelToken,
    connection: Connection,
    callback_contract: Option<Arc<str>>,
    callback_options: ClientOptions,
}

impl CallContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        request_id: u64,
        endpoint: Arc<str>,
        method: Arc<str>,
        trace_id: Option<String>,
        token: CancelToken,
        connection: Connection,
        callback_contract: Option<Arc<str>>,
        callback_options: ClientOptions,
    ) -> Self {
        Self {
            info: Arc::new(CallInfo {
                request_id,
                endpoint,
                method,
                trace_id,
                token,
                connection,
                callback_contract,
                callback_options,
            }),
        }
    }

    /// The caller's id for this request, unique on this connection.
    pub fn request_id(&self) -> u64 {
        self.info.request_id
    }

    pub fn endpoint(&self) -> &str {
        &self.info.endpoint
    }

    pub fn method(&self) -> &str {
        &self.info.method
    }

    pub fn trace_id(&self) -> Option<&str> {
        self.info.trace_id.as_deref()
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.info.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.info.token.is_cancelled()
    }

    /// Resolves when this call should stop.
    pub async fn cancelled(&self) {
        self.info.token.cancelled().await
    }

    /// The connection the request arrived on.
    pub fn connection(&self) -> &Connection {
        &self.info.connection
    }

    pub fn encoding(&self) -> Encoding {
        self.info.connection.encoding()
    }

    /// A client that calls back to the peer over the same connection.
    pub fn callback_client(&self) -> ServiceClient {
        ServiceClient::attached(
            self.info.connection.clone(),
            self.info.callback_options.clone(),
        )
    }

    /// A typed callback proxy. Targets the endpoint's declared callback
    /// contract, or the proxy's own endpoint name if none was declared.
    pub fn callback<P: Proxy>(&self) -> P {
        let client = self.callback_client();
        match &self.info.callback_contract {
            Some(contract) => P::with_endpoint(client, contract),
            None => P::new(client),
        }
    }
}

impl std::fmt::Debug for CallContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallContext")
            .field("request_id", &self.info.request_id)
            .field("endpoint", &self.info.endpoint)
            .field("method", &self.info.method)
            .field("connection", &self.info.connection.id())
            .finish_non_exhaustive()
    }
}
