//! The outbound call engine.
//!
//! A [`ServiceClient`] turns `(endpoint, method, args)` into a request on a
//! live connection and waits for the matching response. Three things can end
//! the wait, and the first one wins:
//!
//! - the response arrives (or the connection dies, which drains it),
//! - the caller's [`CancelToken`] fires, giving [`RpcError::Cancelled`],
//! - the deadline passes, giving [`RpcError::Timeout`].
//!
//! In the last two cases the pending entry is dropped and a cancellation
//! frame is sent so the peer can stop working on it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tandem_core::{
    Body, BodySource, CancelToken, Connection, Encoding, Payload, Reply, Request, RpcError,
    cancelled_or_pending, fault,
};
use tokio::time::Instant;

use crate::params::IntoParams;
use crate::registry::{ConnectionRegistry, Dialer};
use crate::transport::ConnectionIdentity;

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    let value = std::env::var(key).ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Per-client defaults.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Applied to calls that set no timeout of their own. `None` waits forever.
    pub default_timeout: Option<Duration>,
    pub connect_timeout: Duration,
    /// Retry a call once on a fresh connection if the connection closes under it.
    pub reconnect: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            default_timeout: Some(DEFAULT_CALL_TIMEOUT),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnect: false,
        }
    }
}

impl ClientOptions {
    /// Read `TANDEM_CALL_TIMEOUT_MS` (0 disables), `TANDEM_CONNECT_TIMEOUT_MS`
    /// and `TANDEM_RECONNECT`, keeping defaults for anything absent or invalid.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            default_timeout: match env_parse::<u64>("TANDEM_CALL_TIMEOUT_MS") {
                Some(0) => None,
                Some(ms) => Some(Duration::from_millis(ms)),
                None => defaults.default_timeout,
            },
            connect_timeout: env_parse::<u64>("TANDEM_CONNECT_TIMEOUT_MS")
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.connect_timeout),
            reconnect: env_flag("TANDEM_RECONNECT").unwrap_or(defaults.reconnect),
        }
    }

    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, reconnect: bool) -> Self {
        self.reconnect = reconnect;
        self
    }
}

/// Options for a single call.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Overrides the client's default timeout.
    pub timeout: Option<Duration>,
    pub cancel: Option<CancelToken>,
    pub trace_id: Option<String>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }
}

#[derive(Clone)]
enum Target {
    /// Dial through the registry, sharing connections by identity.
    Dial {
        registry: ConnectionRegistry,
        dialer: Arc<Dialer>,
    },
    /// Ride an existing connection. Never redialed.
    Attached(Connection),
}

/// Makes calls to one peer.
#[derive(Clone)]
pub struct ServiceClient {
    target: Target,
    options: ClientOptions,
}

impl ServiceClient {
    /// A client that connects through `registry`, dialing with `dialer` when
    /// no live connection to its identity exists.
    pub fn dial(registry: ConnectionRegistry, dialer: Dialer, options: ClientOptions) -> Self {
        Self {
            target: Target::Dial {
                registry,
                dialer: Arc::new(dialer),
            },
            options,
        }
    }

    /// A client bound to an existing connection, as used for callbacks.
    pub fn attached(connection: Connection, options: ClientOptions) -> Self {
        Self {
            target: Target::Attached(connection),
            options,
        }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn identity(&self) -> ConnectionIdentity {
        match &self.target {
            Target::Dial { dialer, .. } => dialer.identity().clone(),
            Target::Attached(connection) => ConnectionIdentity::attached(connection.id()),
        }
    }

    pub fn encoding(&self) -> Encoding {
        match &self.target {
            Target::Dial { dialer, .. } => dialer.config().encoding,
            Target::Attached(connection) => connection.encoding(),
        }
    }

    /// A live connection to the target, dialing if needed.
    pub async fn connection(&self) -> Result<Connection, RpcError> {
        match &self.target {
            Target::Dial { registry, dialer } => registry.connect(dialer).await,
            Target::Attached(connection) if connection.is_open() => Ok(connection.clone()),
            Target::Attached(_) => Err(RpcError::ConnectionClosed),
        }
    }

    /// Call a two-way method and decode its result.
    pub async fn call<A, R>(
        &self,
        endpoint: &str,
        method: &str,
        args: A,
        options: CallOptions,
    ) -> Result<R, RpcError>
    where
        A: IntoParams,
        R: DeserializeOwned,
    {
        let params = args.into_params(self.encoding())?;
        let data = self.call_raw(endpoint, method, params, options).await?;
        decode_data(self.encoding(), data)
    }

    /// Call with pre-encoded parameters and return the raw result payload.
    pub async fn call_raw(
        &self,
        endpoint: &str,
        method: &str,
        params: Vec<Payload>,
        options: CallOptions,
    ) -> Result<Option<Payload>, RpcError> {
        let deadline = self.deadline(&options);
        let reply = self
            .with_reconnect(|connection| {
                self.exchange(connection, endpoint, method, params.clone(), None, &options, deadline)
            })
            .await?;
        Ok(reply.response.data)
    }

    /// Send a one-way request. Returns once it is written; the peer sends nothing back.
    pub async fn call_one_way<A>(
        &self,
        endpoint: &str,
        method: &str,
        args: A,
        options: CallOptions,
    ) -> Result<(), RpcError>
    where
        A: IntoParams,
    {
        let params = args.into_params(self.encoding())?;
        if options.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            return Err(RpcError::Cancelled);
        }
        self.with_reconnect(|connection| {
            let params = params.clone();
            let trace_id = options.trace_id.clone();
            async move {
                let request = Request {
                    id: connection.correlation().next_id(),
                    endpoint: endpoint.to_string(),
                    method_name: method.to_string(),
                    parameters: params,
                    timeout_in_seconds: 0.0,
                    trace_id,
                    stream_length: None,
                };
                connection.send_request(&request, None).await
            }
        })
        .await
    }

    /// Call a method that takes a raw body after its arguments.
    ///
    /// Never retried: the body cannot be replayed.
    pub async fn upload<A, R>(
        &self,
        endpoint: &str,
        method: &str,
        args: A,
        body: BodySource,
        options: CallOptions,
    ) -> Result<R, RpcError>
    where
        A: IntoParams,
        R: DeserializeOwned,
    {
        let params = args.into_params(self.encoding())?;
        let deadline = self.deadline(&options);
        let connection = self.connection().await?;
        let reply = self
            .exchange(connection, endpoint, method, params, Some(body), &options, deadline)
            .await?;
        decode_data(self.encoding(), reply.response.data)
    }

    /// Call a method whose response is followed by a raw body.
    pub async fn download<A>(
        &self,
        endpoint: &str,
        method: &str,
        args: A,
        options: CallOptions,
    ) -> Result<Body, RpcError>
    where
        A: IntoParams,
    {
        let params = args.into_params(self.encoding())?;
        let deadline = self.deadline(&options);
        let reply = self
            .with_reconnect(|connection| {
                self.exchange(connection, endpoint, method, params.clone(), None, &options, deadline)
            })
            .await?;
        Ok(reply.body.unwrap_or_else(Body::empty))
    }

    fn deadline(&self, options: &CallOptions) -> Option<Instant> {
        options
            .timeout
            .or(self.options.default_timeout)
            .map(|timeout| Instant::now() + timeout)
    }

    fn can_reconnect(&self) -> bool {
        self.options.reconnect && matches!(self.target, Target::Dial { .. })
    }

    async fn with_reconnect<T, F, Fut>(&self, attempt: F) -> Result<T, RpcError>
    where
        F: Fn(Connection) -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        let connection = self.connection().await?;
        match attempt(connection).await {
            Err(RpcError::ConnectionClosed) if self.can_reconnect() => {
                tracing::info!(identity = %self.identity(), "connection closed mid-call; retrying once");
                let connection = self.connection().await?;
                attempt(connection).await
            }
            result => result,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn exchange(
        &self,
        connection: Connection,
        endpoint: &str,
        method: &str,
        params: Vec<Payload>,
        body: Option<BodySource>,
        options: &CallOptions,
        deadline: Option<Instant>,
    ) -> Result<Reply, RpcError> {
        let cancel = options.cancel.as_ref();
        if cancel.is_some_and(CancelToken::is_cancelled) {
            return Err(RpcError::Cancelled);
        }

        let table = connection.correlation();
        let id = table.next_id();
        let pending = table.register(id)?;
        let mut guard = PendingGuard {
            connection: connection.clone(),
            id,
            armed: true,
        };

        let request = Request {
            id,
            endpoint: endpoint.to_string(),
            method_name: method.to_string(),
            parameters: params,
            timeout_in_seconds: deadline.map(remaining_seconds).unwrap_or(0.0),
            trace_id: options.trace_id.clone(),
            stream_length: body.as_ref().map(BodySource::len),
        };

        let settled = tokio::select! {
            biased;
            reply = async {
                connection.send_request(&request, body).await?;
                pending.await
            } => Settled::Reply(reply),
            _ = cancelled_or_pending(cancel) => Settled::Cancelled,
            _ = sleep_until(deadline) => Settled::TimedOut,
        };

        match settled {
            Settled::Reply(Ok(reply)) => {
                guard.armed = false;
                into_result(reply, endpoint, method)
            }
            Settled::Reply(Err(e)) => {
                // Closed connection or a request that never went out: there is
                // nobody to tell.
                guard.armed = false;
                table.forget(id);
                Err(e)
            }
            Settled::Cancelled => {
                tracing::debug!(request_id = id, endpoint, method, "call cancelled by caller");
                Err(RpcError::Cancelled)
            }
            Settled::TimedOut => {
                tracing::debug!(request_id = id, endpoint, method, "call timed out");
                Err(RpcError::Timeout {
                    endpoint: endpoint.to_string(),
                    method: method.to_string(),
                })
            }
        }
    }
}

impl std::fmt::Debug for ServiceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceClient")
            .field("identity", &self.identity())
            .field("options", &self.options)
            .finish()
    }
}

enum Settled {
    Reply(Result<Reply, RpcError>),
    Cancelled,
    TimedOut,
}

/// Abandons a call that stopped waiting: drops its pending entry and tells
/// the peer to stop. Runs on every exit path that did not see a reply,
/// including the calling future being dropped.
struct PendingGuard {
    connection: Connection,
    id: u64,
    armed: bool,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.connection.correlation().forget(self.id);
        if !self.connection.is_open() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let connection = self.connection.clone();
        let id = self.id;
        runtime.spawn(async move {
            if let Err(e) = connection.send_cancellation(id).await {
                tracing::debug!(request_id = id, error = %e, "could not send cancellation");
            }
        });
    }
}

fn remaining_seconds(deadline: Instant) -> f64 {
    // Never 0 on the wire: that would read as "no timeout".
    deadline
        .saturating_duration_since(Instant::now())
        .as_secs_f64()
        .max(0.001)
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn into_result(reply: Reply, endpoint: &str, method: &str) -> Result<Reply, RpcError> {
    let Some(error) = &reply.response.error else {
        return Ok(reply);
    };
    if error.is_type(fault::TIMEOUT) {
        return Err(RpcError::Timeout {
            endpoint: endpoint.to_string(),
            method: method.to_string(),
        });
    }
    if error.is_type(fault::CANCELLED) {
        return Err(RpcError::Cancelled);
    }
    Err(RpcError::Remote(error.clone()))
}

fn decode_data<R: DeserializeOwned>(encoding: Encoding, data: Option<Payload>) -> Result<R, RpcError> {
    let value = match data {
        Some(data) => encoding.decode(data.as_bytes())?,
        None => encoding.decode_absent()?,
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use tandem_core::{
        ConnectionConfig, ErrorInfo, Frame, FrameType, Response, read_frame, write_frame,
    };
    use tokio::io::DuplexStream;

    use super::*;

    fn attached() -> (ServiceClient, DuplexStream) {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let connection = Connection::start(local, "raw-peer", ConnectionConfig::default(), None);
        (
            ServiceClient::attached(connection, ClientOptions::default()),
            remote,
        )
    }

    async fn read_request(peer: &mut DuplexStream) -> Request {
        let frame = read_frame(peer, 1 << 20).await.unwrap();
        assert_eq!(frame.frame_type, FrameType::Request);
        Encoding::Json.decode(&frame.payload).unwrap()
    }

    async fn respond(peer: &mut DuplexStream, response: &Response) {
        let frame = Frame::new(FrameType::Response, Encoding::Json.encode(response).unwrap());
        write_frame(peer, &frame).await.unwrap();
    }

    #[tokio::test]
    async fn call_sends_request_and_decodes_response() {
        let (client, mut peer) = attached();
        let call = tokio::spawn(async move {
            client
                .call::<_, i32>("IMath", "Sum", (1, 2), CallOptions::new().with_timeout(Duration::from_secs(5)))
                .await
        });

        let request = read_request(&mut peer).await;
        assert_eq!(request.id, 0);
        assert_eq!(request.endpoint, "IMath");
        assert_eq!(request.method_name, "Sum");
        assert_eq!(request.parameters, vec![Payload::from("1"), Payload::from("2")]);
        assert!(request.timeout_in_seconds > 4.0 && request.timeout_in_seconds <= 5.0);

        respond(&mut peer, &Response::success(0, Some(Payload::from("3")))).await;
        assert_eq!(call.await.unwrap().unwrap(), 3);
    }

    #[tokio::test]
    async fn no_timeout_is_zero_on_the_wire() {
        let (client, mut peer) = attached();
        let client = ServiceClient {
            options: ClientOptions::default().with_default_timeout(None),
            ..client
        };
        let call = tokio::spawn(async move {
            client.call::<_, ()>("IMath", "Nothing", (), CallOptions::new()).await
        });

        let request = read_request(&mut peer).await;
        assert_eq!(request.timeout_in_seconds, 0.0);
        respond(&mut peer, &Response::success(request.id, None)).await;
        call.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn remote_faults_keep_their_chain() {
        let (client, mut peer) = attached();
        let call = tokio::spawn(async move {
            client.call::<_, i32>("IMath", "Fail", (), CallOptions::new()).await
        });

        let request = read_request(&mut peer).await;
        let error = ErrorInfo::new("app::Outer", "outer").with_inner(ErrorInfo::new("app::Inner", "inner"));
        respond(&mut peer, &Response::failure(request.id, error.clone())).await;

        match call.await.unwrap() {
            Err(RpcError::Remote(info)) => assert_eq!(info, error),
            other => panic!("expected a remote fault, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_sends_cancellation() {
        let (client, mut peer) = attached();
        let options = CallOptions::new().with_timeout(Duration::from_millis(50));
        let call = tokio::spawn(async move {
            client.call::<_, i32>("IMath", "Slow", (), options).await
        });

        let request = read_request(&mut peer).await;
        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, RpcError::Timeout { ref method, .. } if method == "Slow"), "{err:?}");

        let frame = read_frame(&mut peer, 1 << 20).await.unwrap();
        assert_eq!(frame.frame_type, FrameType::Cancellation);
        let cancel: tandem_core::Cancellation = Encoding::Json.decode(&frame.payload).unwrap();
        assert_eq!(cancel.request_id, request.id);
    }

    #[tokio::test]
    async fn caller_cancel_beats_timeout() {
        let (client, mut peer) = attached();
        let token = CancelToken::new();
        let options = CallOptions::new()
            .with_timeout(Duration::from_secs(5))
            .with_cancel(token.clone());
        let call = tokio::spawn(async move {
            client.call::<_, i32>("IMath", "Slow", (), options).await
        });

        let _ = read_request(&mut peer).await;
        token.cancel();
        assert!(matches!(call.await.unwrap(), Err(RpcError::Cancelled)));
    }

    #[tokio::test]
    async fn already_cancelled_sends_nothing() {
        let (client, _peer) = attached();
        let token = CancelToken::new();
        token.cancel();
        let err = client
            .call::<_, i32>("IMath", "Sum", (1, 2), CallOptions::new().with_cancel(token))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Cancelled));
        let connection = client.connection().await.unwrap();
        assert!(connection.correlation().is_empty());
    }

    #[tokio::test]
    async fn server_side_timeout_maps_to_timeout() {
        let (client, mut peer) = attached();
        let call = tokio::spawn(async move {
            client.call::<_, i32>("IMath", "Slow", (), CallOptions::new()).await
        });
        let request = read_request(&mut peer).await;
        let error = ErrorInfo::new(fault::TIMEOUT, "IMath.Slow did not finish");
        respond(&mut peer, &Response::failure(request.id, error)).await;
        assert!(matches!(call.await.unwrap(), Err(RpcError::Timeout { .. })));
    }

    #[tokio::test]
    async fn attached_clients_do_not_reconnect() {
        let (client, peer) = attached();
        let client = ServiceClient {
            options: ClientOptions::default().with_reconnect(true),
            ..client
        };
        let call = tokio::spawn({
            let client = client.clone();
            async move { client.call::<_, i32>("IMath", "Slow", (), CallOptions::new()).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(peer);

        assert!(matches!(call.await.unwrap(), Err(RpcError::ConnectionClosed)));
        assert!(matches!(client.connection().await, Err(RpcError::ConnectionClosed)));
    }

    #[test]
    fn option_builders() {
        let options = ClientOptions::default()
            .with_default_timeout(None)
            .with_connect_timeout(Duration::from_secs(1))
            .with_reconnect(true);
        assert!(options.default_timeout.is_none());
        assert_eq!(options.connect_timeout, Duration::from_secs(1));
        assert!(options.reconnect);

        let call = CallOptions::new().with_trace_id("abc");
        assert_eq!(call.trace_id.as_deref(), Some("abc"));
        assert!(call.timeout.is_none());
    }
}
