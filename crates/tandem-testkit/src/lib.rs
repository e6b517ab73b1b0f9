//! Conformance scenarios for tandem transports.
//!
//! Every scenario starts a real [`Server`] on a listener supplied by a
//! [`TransportFactory`], dials it through a [`ClientFactory`], and drives the
//! full stack: framing, correlation, routing, cancellation, callbacks and raw
//! bodies. A transport passes when every scenario passes over it.
//!
//! # Usage
//!
//! ```ignore
//! use tandem_testkit::{TestError, TransportFactory};
//!
//! struct MemFactory;
//!
//! impl TransportFactory for MemFactory {
//!     async fn bind() -> Result<Bound, TestError> {
//!         let listener = MemoryNetwork::new().listen("svc")?;
//!         let connector = listener.connector();
//!         Ok(Bound::new(listener, connector))
//!     }
//! }
//!
//! #[tokio::test]
//! async fn happy_path() {
//!     tandem_testkit::run_happy_path::<MemFactory>().await;
//! }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tandem::fault;
use tandem::prelude::*;
use tandem::{
    ConfigError, ConnectionConfig, Connector, Encoding, ErrorInfo, Listener, ServiceClient,
};

// ============================================================================
// Errors
// ============================================================================

/// Error type for scenario failures.
#[derive(Debug)]
pub enum TestError {
    Setup(String),
    Config(ConfigError),
    Rpc(RpcError),
    Io(std::io::Error),
    Assertion(String),
}

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestError::Setup(msg) => write!(f, "setup error: {}", msg),
            TestError::Config(e) => write!(f, "configuration error: {}", e),
            TestError::Rpc(e) => write!(f, "RPC error: {}", e),
            TestError::Io(e) => write!(f, "I/O error: {}", e),
            TestError::Assertion(msg) => write!(f, "assertion failed: {}", msg),
        }
    }
}

impl std::error::Error for TestError {}

impl From<RpcError> for TestError {
    fn from(e: RpcError) -> Self {
        TestError::Rpc(e)
    }
}

impl From<ConfigError> for TestError {
    fn from(e: ConfigError) -> Self {
        TestError::Config(e)
    }
}

impl From<std::io::Error> for TestError {
    fn from(e: std::io::Error) -> Self {
        TestError::Io(e)
    }
}

fn check(condition: bool, msg: impl FnOnce() -> String) -> Result<(), TestError> {
    if condition {
        Ok(())
    } else {
        Err(TestError::Assertion(msg()))
    }
}

// ============================================================================
// Transport factory
// ============================================================================

/// A listener and a connector that dials it.
pub struct Bound {
    pub listener: Arc<dyn Listener>,
    pub connector: Arc<dyn Connector>,
}

impl Bound {
    pub fn new(listener: impl Listener, connector: impl Connector) -> Self {
        Self {
            listener: Arc::new(listener),
            connector: Arc::new(connector),
        }
    }
}

/// Binds a fresh listener for one scenario.
pub trait TransportFactory: Send + Sync + 'static {
    fn bind() -> impl Future<Output = Result<Bound, TestError>> + Send;
}

// ============================================================================
// Test services
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

#[derive(Debug, thiserror::Error)]
#[error("operation failed: {message}")]
pub struct OperationFailed {
    message: String,
    #[source]
    source: StorageUnavailable,
}

#[derive(Debug, thiserror::Error)]
#[error("storage unavailable")]
pub struct StorageUnavailable;

/// State behind the `IMath` endpoint, shared with the scenarios so they can
/// observe what the server saw.
#[derive(Default)]
pub struct MathService {
    logged: Mutex<Vec<String>>,
    stored: Mutex<HashMap<String, Bytes>>,
    cancellations: AtomicUsize,
    hangups: AtomicUsize,
}

impl MathService {
    pub fn logged(&self) -> Vec<String> {
        self.logged.lock().clone()
    }

    /// Number of `Slow` calls that saw their token fire.
    pub fn cancellations(&self) -> usize {
        self.cancellations.load(Ordering::SeqCst)
    }

    pub fn hangups(&self) -> usize {
        self.hangups.load(Ordering::SeqCst)
    }

    async fn slow(&self, ctx: CallContext) -> Result<(), Fault> {
        ctx.cancelled().await;
        self.cancellations.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(request_id = ctx.request_id(), "slow call abandoned");
        Err(Fault::msg("abandoned"))
    }

    fn fail(&self, message: String) -> Result<(), Fault> {
        Err(OperationFailed {
            message,
            source: StorageUnavailable,
        }
        .into())
    }

    fn hang_up(&self, ctx: &CallContext) {
        self.hangups.fetch_add(1, Ordering::SeqCst);
        ctx.connection().close();
    }

    async fn store(&self, name: String, body: Body) -> Result<u64, Fault> {
        let bytes = body.to_bytes().await?;
        let len = bytes.len() as u64;
        self.stored.lock().insert(name, bytes);
        Ok(len)
    }

    fn fetch(&self, name: &str) -> Result<BodySource, Fault> {
        match self.stored.lock().get(name) {
            Some(bytes) => Ok(BodySource::from_bytes(bytes.clone())),
            None => Err(Fault::new("NotFound", format!("nothing stored as {name:?}"))),
        }
    }
}

pub fn math_endpoint(math: Arc<MathService>) -> Result<Endpoint, ConfigError> {
    Endpoint::builder("IMath", math)
        .rpc("Sum", |_svc, _ctx, (a, b): (i32, i32)| async move { Ok(a + b) })
        .rpc("Delayed", |_svc, _ctx, (ms, value): (u64, i32)| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(value)
        })
        .rpc("Mirror", |_svc, _ctx, (p,): (Point,)| async move {
            Ok(Point { x: p.y, y: p.x })
        })
        .rpc("TraceId", |_svc, ctx: CallContext, (): ()| async move {
            Ok(ctx.trace_id().map(str::to_string))
        })
        .rpc("Slow", |svc: Arc<MathService>, ctx, (): ()| async move {
            svc.slow(ctx).await
        })
        .rpc("Fail", |svc: Arc<MathService>, _ctx, (message,): (String,)| async move {
            svc.fail(message)
        })
        .rpc("Hangup", |svc: Arc<MathService>, ctx: CallContext, (): ()| async move {
            svc.hang_up(&ctx);
            Ok(())
        })
        .oneway("Log", |svc: Arc<MathService>, _ctx, (line,): (String,)| async move {
            svc.logged.lock().push(line);
            Ok(())
        })
        .upload("Store", |svc: Arc<MathService>, _ctx, (name,): (String,), body| async move {
            svc.store(name, body).await
        })
        .download("Fetch", |svc: Arc<MathService>, _ctx, (name,): (String,)| async move {
            svc.fetch(&name)
        })
        .download("Blob", |_svc, _ctx, (len,): (usize,)| async move {
            Ok(BodySource::from_bytes(vec![0x5a; len]))
        })
        .build()
}

tandem::proxy! {
    /// Client for `IMath`.
    pub struct MathProxy for "IMath" {
        rpc "Sum" => fn sum(a: i32, b: i32) -> i32;
        rpc "Delayed" => fn delayed(ms: u64, value: i32) -> i32;
        rpc "Mirror" => fn mirror(p: Point) -> Point;
        rpc "TraceId" => fn trace_id() -> Option<String>;
        rpc "Slow" => fn slow();
        rpc "Fail" => fn fail(message: String);
        rpc "Hangup" => fn hang_up();
        oneway "Log" => fn log(line: String);
        upload "Store" => fn store(name: String) -> u64;
        download "Fetch" => fn fetch(name: String);
        download "Blob" => fn blob(len: usize);
    }
}

pub struct Greeter;

pub fn greeter_endpoint() -> Result<Endpoint, ConfigError> {
    Endpoint::builder("IGreeter", Arc::new(Greeter))
        .callback_contract("IGreeterCallback")
        .rpc("Greet", |_svc, ctx: CallContext, (name,): (String,)| async move {
            let callback: GreeterCallbackProxy = ctx.callback();
            let decorated = callback.decorate(name).await?;
            Ok::<_, Fault>(format!("Hello, {decorated}"))
        })
        .build()
}

tandem::proxy! {
    pub struct GreeterProxy for "IGreeter" {
        rpc "Greet" => fn greet(name: String) -> String;
    }
}

pub struct Decorator;

/// The callback side of `IGreeter`, served by the calling client.
pub fn callback_endpoint() -> Result<Endpoint, ConfigError> {
    Endpoint::builder("IGreeterCallback", Arc::new(Decorator))
        .rpc("Decorate", |_svc, _ctx, (name,): (String,)| async move {
            Ok(format!("*{name}*"))
        })
        .build()
}

tandem::proxy! {
    pub struct GreeterCallbackProxy for "IGreeterCallback" {
        rpc "Decorate" => fn decorate(name: String) -> String;
    }
}

// ============================================================================
// Harness
// ============================================================================

const WAIT: Duration = Duration::from_secs(5);

/// A server with the test services, and a client factory pointed at it.
pub struct Harness {
    pub server: Server,
    pub factory: ClientFactory,
    pub connector: Arc<dyn Connector>,
    pub math: Arc<MathService>,
}

impl Harness {
    pub async fn start<F: TransportFactory>() -> Result<Self, TestError> {
        Self::start_with::<F>(ConnectionConfig::default(), default_options()).await
    }

    pub async fn start_with<F: TransportFactory>(
        config: ConnectionConfig,
        options: ClientOptions,
    ) -> Result<Self, TestError> {
        let Bound {
            listener,
            connector,
        } = F::bind().await?;

        let math = Arc::new(MathService::default());
        let router = Router::builder()
            .endpoint(math_endpoint(math.clone())?)
            .endpoint(greeter_endpoint()?)
            .build()?;
        let server = Server::start(
            router,
            [ListenerConfig::new(listener).with_connection_config(config.clone())],
        );

        let callbacks = Router::builder().endpoint(callback_endpoint()?).build()?;
        let factory = ClientFactory::new()
            .with_connection_config(config)
            .with_options(options)
            .with_callbacks(callbacks);

        Ok(Self {
            server,
            factory,
            connector,
            math,
        })
    }

    pub fn math(&self) -> MathProxy {
        self.factory.proxy(self.connector.clone())
    }

    pub fn greeter(&self) -> GreeterProxy {
        self.factory.proxy(self.connector.clone())
    }

    pub fn client(&self) -> ServiceClient {
        self.factory.client(self.connector.clone())
    }

    pub async fn shutdown(self) {
        self.factory.close();
        self.server.stop().await;
    }
}

fn default_options() -> ClientOptions {
    ClientOptions::default().with_default_timeout(Some(Duration::from_secs(10)))
}

/// Poll `condition` until it holds or [`WAIT`] passes.
async fn eventually(what: &str, mut condition: impl FnMut() -> bool) -> Result<(), TestError> {
    let polled = tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    polled.map_err(|_| TestError::Assertion(format!("timed out waiting for {what}")))
}

fn expect_remote(result: Result<impl std::fmt::Debug, RpcError>) -> Result<ErrorInfo, TestError> {
    match result {
        Err(RpcError::Remote(info)) => Ok(info),
        other => Err(TestError::Assertion(format!(
            "expected a remote fault, got {other:?}"
        ))),
    }
}

macro_rules! scenario {
    ($(#[$meta:meta])* $name:ident => $inner:ident) => {
        $(#[$meta])*
        pub async fn $name<F: TransportFactory>() {
            if let Err(e) = $inner::<F>().await {
                panic!("{} failed: {}", stringify!($name), e);
            }
        }
    };
}

// ============================================================================
// Calls
// ============================================================================

scenario! {
    /// Typed calls return their results, including structured arguments.
    run_happy_path => happy_path
}

async fn happy_path<F: TransportFactory>() -> Result<(), TestError> {
    let h = Harness::start::<F>().await?;
    let math = h.math();

    let sum = math.sum(1, 2).await?;
    check(sum == 3, || format!("expected Sum(1, 2) = 3, got {sum}"))?;

    for (a, b, expected) in [(10, 20, 30), (-5, 5, 0), (i32::MAX - 1, 1, i32::MAX)] {
        let sum = math.sum(a, b).await?;
        check(sum == expected, || format!("expected Sum({a}, {b}) = {expected}, got {sum}"))?;
    }

    let mirrored = math.mirror(Point { x: 1, y: 2 }).await?;
    check(mirrored == Point { x: 2, y: 1 }, || {
        format!("expected mirrored point, got {mirrored:?}")
    })?;

    let delayed = math.delayed(20, 7).await?;
    check(delayed == 7, || format!("expected Delayed to return 7, got {delayed}"))?;

    h.shutdown().await;
    Ok(())
}

scenario! {
    /// The same calls work with postcard on both sides.
    run_postcard_encoding => postcard_encoding
}

async fn postcard_encoding<F: TransportFactory>() -> Result<(), TestError> {
    let config = ConnectionConfig::default().with_encoding(Encoding::Postcard);
    let h = Harness::start_with::<F>(config, default_options()).await?;
    let math = h.math();

    check(math.client().encoding() == Encoding::Postcard, || {
        "client should use postcard".to_string()
    })?;
    let sum = math.sum(40, 2).await?;
    check(sum == 42, || format!("expected 42, got {sum}"))?;
    let mirrored = math.mirror(Point { x: -3, y: 9 }).await?;
    check(mirrored == Point { x: 9, y: -3 }, || format!("got {mirrored:?}"))?;

    let info = expect_remote(math.fail("disk".into()).await)?;
    check(info.chain().count() == 2, || format!("expected a nested cause, got {info:?}"))?;

    h.shutdown().await;
    Ok(())
}

scenario! {
    /// Many concurrent calls on one connection each get their own response,
    /// even though they complete out of order.
    run_concurrent_calls => concurrent_calls
}

async fn concurrent_calls<F: TransportFactory>() -> Result<(), TestError> {
    let h = Harness::start::<F>().await?;
    let math = h.math();

    let calls = (0..32).map(|i: i32| {
        let math = math.clone();
        // Later calls finish first.
        let ms = (32 - i as u64) * 3;
        async move { (i, math.delayed(ms, i).await) }
    });
    for (i, result) in futures::future::join_all(calls).await {
        let value = result?;
        check(value == i, || format!("call {i} got the response for {value}"))?;
    }

    check(h.factory.registry().len() == 1, || {
        format!("expected one connection, registry has {}", h.factory.registry().len())
    })?;
    check(h.server.connection_count() == 1, || {
        format!("expected one accepted connection, got {}", h.server.connection_count())
    })?;

    h.shutdown().await;
    Ok(())
}

scenario! {
    /// A trace id set by the caller reaches the handler.
    run_trace_id => trace_id
}

async fn trace_id<F: TransportFactory>() -> Result<(), TestError> {
    let h = Harness::start::<F>().await?;
    let math = h.math();

    let none = math.trace_id().await?;
    check(none.is_none(), || format!("expected no trace id, got {none:?}"))?;

    let traced = math.with_options(CallOptions::new().with_trace_id("req-42"));
    let seen = traced.trace_id().await?;
    check(seen.as_deref() == Some("req-42"), || format!("got {seen:?}"))?;

    h.shutdown().await;
    Ok(())
}

// ============================================================================
// Faults
// ============================================================================

scenario! {
    /// A handler error arrives with its type, message and nested cause, and
    /// the connection keeps working.
    run_remote_fault_chain => remote_fault_chain
}

async fn remote_fault_chain<F: TransportFactory>() -> Result<(), TestError> {
    let h = Harness::start::<F>().await?;
    let math = h.math();

    let info = expect_remote(math.fail("quota".into()).await)?;
    check(info.error_type.ends_with("OperationFailed"), || {
        format!("unexpected error type {:?}", info.error_type)
    })?;
    check(info.message == "operation failed: quota", || {
        format!("unexpected message {:?}", info.message)
    })?;
    let chain: Vec<&str> = info.chain().map(|e| e.message.as_str()).collect();
    check(chain == ["operation failed: quota", "storage unavailable"], || {
        format!("unexpected chain {chain:?}")
    })?;

    let sum = math.sum(2, 2).await?;
    check(sum == 4, || format!("connection should survive a fault, got {sum}"))?;

    h.shutdown().await;
    Ok(())
}

scenario! {
    /// Unknown endpoints, unknown methods and unbindable arguments are
    /// answered with faults instead of closing the connection.
    run_routing_faults => routing_faults
}

async fn routing_faults<F: TransportFactory>() -> Result<(), TestError> {
    let h = Harness::start::<F>().await?;
    let client = h.client();

    let info = expect_remote(
        client
            .call::<_, i32>("INope", "Sum", (1, 2), CallOptions::new())
            .await,
    )?;
    check(info.is_type(fault::UNKNOWN_ENDPOINT), || format!("got {info:?}"))?;

    let info = expect_remote(
        client
            .call::<_, i32>("IMath", "Product", (1, 2), CallOptions::new())
            .await,
    )?;
    check(info.is_type(fault::UNKNOWN_METHOD), || format!("got {info:?}"))?;

    let info = expect_remote(
        client
            .call::<_, i32>("IMath", "Sum", ("one",), CallOptions::new())
            .await,
    )?;
    check(info.is_type(fault::INVALID_ARGUMENTS), || format!("got {info:?}"))?;

    let sum: i32 = client.call("IMath", "Sum", (1, 2), CallOptions::new()).await?;
    check(sum == 3, || format!("expected 3 after faults, got {sum}"))?;

    h.shutdown().await;
    Ok(())
}

// ============================================================================
// One-way
// ============================================================================

scenario! {
    /// One-way calls return once sent and still run on the server.
    run_one_way => one_way
}

async fn one_way<F: TransportFactory>() -> Result<(), TestError> {
    let h = Harness::start::<F>().await?;
    let math = h.math();

    math.log("first".into()).await?;
    math.log("second".into()).await?;

    let service = h.math.clone();
    eventually("both log lines", || service.logged().len() == 2).await?;
    let mut logged = h.math.logged();
    logged.sort();
    check(logged == ["first", "second"], || format!("got {logged:?}"))?;

    // A one-way call to a method the server lacks draws a routing fault,
    // which the client drops; the connection keeps working.
    math.client()
        .call_one_way("IMath", "Forget", ("x".to_string(),), CallOptions::new())
        .await?;
    let sum = math.sum(2, 2).await?;
    check(sum == 4, || format!("expected 4 after a stray fault, got {sum}"))?;

    // No response is expected, so nothing is left pending.
    let connection = math.client().connection().await?;
    check(connection.correlation().is_empty(), || {
        format!("pending calls after one-way: {:?}", connection.correlation().pending_ids())
    })?;

    h.shutdown().await;
    Ok(())
}

// ============================================================================
// Cancellation and timeouts
// ============================================================================

scenario! {
    /// Cancelling a call fails it with `Cancelled` and fires the handler's token.
    run_cancellation => cancellation
}

async fn cancellation<F: TransportFactory>() -> Result<(), TestError> {
    let h = Harness::start::<F>().await?;
    let token = CancelToken::new();
    let math = h.math().with_options(CallOptions::new().with_cancel(token.clone()));

    let router = h.server.router().clone();
    let call = tokio::spawn(async move { math.slow().await });
    eventually("the call to reach the server", || router.in_flight().len() == 1).await?;
    token.cancel();

    let result = call
        .await
        .map_err(|e| TestError::Setup(format!("call task panicked: {e}")))?;
    check(matches!(result, Err(RpcError::Cancelled)), || {
        format!("expected Cancelled, got {result:?}")
    })?;

    let service = h.math.clone();
    eventually("the handler to see cancellation", || service.cancellations() == 1).await?;
    let router = h.server.router().clone();
    eventually("in-flight work to clear", || router.in_flight().is_empty()).await?;

    h.shutdown().await;
    Ok(())
}

scenario! {
    /// A call past its deadline fails with `Timeout` and the handler is told to stop.
    run_timeout => timeout
}

async fn timeout<F: TransportFactory>() -> Result<(), TestError> {
    let h = Harness::start::<F>().await?;
    let math = h
        .math()
        .with_options(CallOptions::new().with_timeout(Duration::from_millis(100)));

    let result = math.slow().await;
    match &result {
        Err(RpcError::Timeout { endpoint, method }) => {
            check(endpoint == "IMath" && method == "Slow", || {
                format!("timeout names the wrong call: {endpoint}.{method}")
            })?;
        }
        other => {
            return Err(TestError::Assertion(format!("expected Timeout, got {other:?}")));
        }
    }

    let service = h.math.clone();
    eventually("the handler to see cancellation", || service.cancellations() == 1).await?;

    // The client default applies when the call sets none.
    let options = ClientOptions::default().with_default_timeout(Some(Duration::from_millis(50)));
    let quick: MathProxy = ClientFactory::new()
        .with_options(options)
        .proxy(h.connector.clone());
    let result = quick.slow().await;
    check(matches!(result, Err(RpcError::Timeout { .. })), || {
        format!("expected the default timeout to apply, got {result:?}")
    })?;

    h.shutdown().await;
    Ok(())
}

scenario! {
    /// An already-cancelled token wins over any deadline, and a token that
    /// fires before the deadline reports `Cancelled`.
    run_cancel_precedence => cancel_precedence
}

async fn cancel_precedence<F: TransportFactory>() -> Result<(), TestError> {
    let h = Harness::start::<F>().await?;

    let token = CancelToken::new();
    token.cancel();
    let math = h.math().with_options(
        CallOptions::new()
            .with_cancel(token)
            .with_timeout(Duration::ZERO),
    );
    let result = math.sum(1, 1).await;
    check(matches!(result, Err(RpcError::Cancelled)), || {
        format!("expected Cancelled, got {result:?}")
    })?;

    let token = CancelToken::new();
    let math = h.math().with_options(
        CallOptions::new()
            .with_cancel(token.clone())
            .with_timeout(Duration::from_secs(5)),
    );
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        token.cancel();
    });
    let result = math.slow().await;
    check(matches!(result, Err(RpcError::Cancelled)), || {
        format!("expected Cancelled, got {result:?}")
    })?;

    h.shutdown().await;
    Ok(())
}

// ============================================================================
// Connection lifecycle
// ============================================================================

scenario! {
    /// Closing the connection fails every waiting call with `ConnectionClosed`.
    run_close_drains_pending => close_drains_pending
}

async fn close_drains_pending<F: TransportFactory>() -> Result<(), TestError> {
    let h = Harness::start::<F>().await?;
    let math = h.math();

    let calls: Vec<_> = (0..3)
        .map(|_| {
            let math = math.clone();
            tokio::spawn(async move { math.slow().await })
        })
        .collect();
    let router = h.server.router().clone();
    eventually("all calls to reach the server", || router.in_flight().len() == 3).await?;

    h.server.close_connections();
    for call in calls {
        let result = call
            .await
            .map_err(|e| TestError::Setup(format!("call task panicked: {e}")))?;
        check(matches!(result, Err(RpcError::ConnectionClosed)), || {
            format!("expected ConnectionClosed, got {result:?}")
        })?;
    }

    let service = h.math.clone();
    eventually("abandoned handlers to be cancelled", || service.cancellations() == 3).await?;

    h.shutdown().await;
    Ok(())
}

scenario! {
    /// Proxies for different contracts from one factory share a connection.
    run_shared_connection => shared_connection
}

async fn shared_connection<F: TransportFactory>() -> Result<(), TestError> {
    let h = Harness::start::<F>().await?;
    let math = h.math();
    let greeter = h.greeter();

    let (sum, greeting) = tokio::join!(math.sum(1, 1), greeter.greet("Ada".into()));
    check(sum? == 2, || "unexpected sum".to_string())?;
    check(greeting? == "Hello, *Ada*", || "unexpected greeting".to_string())?;

    check(h.factory.registry().len() == 1, || {
        format!("expected one registry entry, got {}", h.factory.registry().len())
    })?;
    check(h.server.connection_count() == 1, || {
        format!("expected one connection, got {}", h.server.connection_count())
    })?;

    h.shutdown().await;
    Ok(())
}

scenario! {
    /// After the server drops a connection, the next call dials a new one.
    run_redial_after_close => redial_after_close
}

async fn redial_after_close<F: TransportFactory>() -> Result<(), TestError> {
    let h = Harness::start::<F>().await?;
    let math = h.math();

    math.sum(1, 1).await?;
    let first = math.client().connection().await?;
    h.server.close_connections();
    first.closed().await;

    let identity = math.client().identity();
    let registry = h.factory.registry().clone();
    eventually("the closed connection to leave the registry", || {
        registry.get(&identity).is_none()
    })
    .await?;

    let sum = math.sum(2, 3).await?;
    check(sum == 5, || format!("expected 5 on a new connection, got {sum}"))?;
    let second = math.client().connection().await?;
    check(!second.same_as(&first), || "expected a new connection".to_string())?;

    h.shutdown().await;
    Ok(())
}

scenario! {
    /// Dropping the factory and its clients closes the connections they owned.
    run_dropped_factory => dropped_factory
}

async fn dropped_factory<F: TransportFactory>() -> Result<(), TestError> {
    let Harness {
        server,
        factory,
        connector,
        ..
    } = Harness::start::<F>().await?;
    let math: MathProxy = factory.proxy(connector.clone());
    let client = factory.client(connector);

    math.sum(1, 2).await?;
    client.connection().await?;
    check(server.connection_count() == 1, || {
        format!("expected one connection, got {}", server.connection_count())
    })?;

    drop(math);
    check(server.connection_count() == 1, || {
        "the factory still owns the connection".to_string()
    })?;

    drop(factory);
    drop(client);
    eventually("the server to see the connection go away", || {
        server.connection_count() == 0
    })
    .await?;

    server.stop().await;
    Ok(())
}

scenario! {
    /// With reconnect enabled, a call cut off by a closing connection is
    /// retried once on a new one.
    run_reconnect => reconnect
}

async fn reconnect<F: TransportFactory>() -> Result<(), TestError> {
    let options = default_options().with_reconnect(true);
    let h = Harness::start_with::<F>(ConnectionConfig::default(), options).await?;
    let math = h.math();

    let call = tokio::spawn(async move { math.delayed(300, 11).await });
    let router = h.server.router().clone();
    eventually("the call to reach the server", || router.in_flight().len() == 1).await?;
    h.server.close_connections();

    let result = call
        .await
        .map_err(|e| TestError::Setup(format!("call task panicked: {e}")))?;
    check(matches!(result, Ok(11)), || format!("expected a retried result, got {result:?}"))?;

    h.shutdown().await;
    Ok(())
}

scenario! {
    /// Reconnect retries at most once.
    run_reconnect_is_bounded => reconnect_is_bounded
}

async fn reconnect_is_bounded<F: TransportFactory>() -> Result<(), TestError> {
    let options = default_options().with_reconnect(true);
    let h = Harness::start_with::<F>(ConnectionConfig::default(), options).await?;

    let result = h.math().hang_up().await;
    check(matches!(result, Err(RpcError::ConnectionClosed)), || {
        format!("expected ConnectionClosed, got {result:?}")
    })?;
    check(h.math.hangups() == 2, || {
        format!("expected one retry, handler ran {} times", h.math.hangups())
    })?;

    h.shutdown().await;
    Ok(())
}

// ============================================================================
// Callbacks
// ============================================================================

scenario! {
    /// A handler calls back into the client over the connection the request
    /// arrived on.
    run_callback => callback
}

async fn callback<F: TransportFactory>() -> Result<(), TestError> {
    let h = Harness::start::<F>().await?;
    let greeter = h.greeter();

    let greeting = greeter.greet("Grace".into()).await?;
    check(greeting == "Hello, *Grace*", || format!("got {greeting:?}"))?;

    // The server can also reach the client directly.
    let connection = h
        .server
        .connections()
        .into_iter()
        .next()
        .ok_or_else(|| TestError::Setup("no accepted connection".into()))?;
    let client = h
        .server
        .callback_client(connection.id())
        .ok_or_else(|| TestError::Setup("connection not tracked".into()))?;
    let decorated: String = client
        .call("IGreeterCallback", "Decorate", ("x",), CallOptions::new())
        .await?;
    check(decorated == "*x*", || format!("got {decorated:?}"))?;

    h.shutdown().await;
    Ok(())
}

// ============================================================================
// Bodies
// ============================================================================

scenario! {
    /// Raw bodies travel in both directions after their envelopes.
    run_bodies => bodies
}

async fn bodies<F: TransportFactory>() -> Result<(), TestError> {
    let h = Harness::start::<F>().await?;
    let math = h.math();

    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let stored = math
        .store("blob".into(), BodySource::from_bytes(payload.clone()))
        .await?;
    check(stored == payload.len() as u64, || format!("server stored {stored} bytes"))?;

    let body = math.fetch("blob".into()).await?;
    check(body.len() == payload.len() as u64, || format!("announced {} bytes", body.len()))?;
    let fetched = body.to_bytes().await?;
    check(fetched[..] == payload[..], || "downloaded body differs".to_string())?;

    let empty = math.store("empty".into(), BodySource::from_bytes(Vec::new())).await?;
    check(empty == 0, || format!("expected an empty upload, got {empty}"))?;

    let info = expect_remote(math.fetch("missing".into()).await)?;
    check(info.is_type("NotFound"), || format!("got {info:?}"))?;

    h.shutdown().await;
    Ok(())
}

scenario! {
    /// Dropping a download body unread leaves the connection usable.
    run_dropped_download => dropped_download
}

async fn dropped_download<F: TransportFactory>() -> Result<(), TestError> {
    let h = Harness::start::<F>().await?;
    let math = h.math();

    let body = math.blob(1 << 20).await?;
    check(body.len() == 1 << 20, || format!("announced {} bytes", body.len()))?;
    drop(body);

    let sum = math.sum(20, 22).await?;
    check(sum == 42, || format!("expected 42 after a dropped body, got {sum}"))?;

    h.shutdown().await;
    Ok(())
}

/// Run every scenario in sequence.
pub async fn run_all<F: TransportFactory>() {
    run_happy_path::<F>().await;
    run_postcard_encoding::<F>().await;
    run_concurrent_calls::<F>().await;
    run_trace_id::<F>().await;
    run_remote_fault_chain::<F>().await;
    run_routing_faults::<F>().await;
    run_one_way::<F>().await;
    run_cancellation::<F>().await;
    run_timeout::<F>().await;
    run_cancel_precedence::<F>().await;
    run_close_drains_pending::<F>().await;
    run_shared_connection::<F>().await;
    run_redial_after_close::<F>().await;
    run_dropped_factory::<F>().await;
    run_reconnect::<F>().await;
    run_reconnect_is_bounded::<F>().await;
    run_callback::<F>().await;
    run_bodies::<F>().await;
    run_dropped_download::<F>().await;
}
