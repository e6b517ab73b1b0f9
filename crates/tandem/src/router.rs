//! Inbound request dispatch.
//!
//! The [`Router`] is a connection's [`InboundHandler`]. For each request it
//! looks up the endpoint and method, registers a cancellation token under
//! `(connection, request id)`, and hands the invocation to the endpoint's
//! scheduler. A separate task waits for whichever comes first: the result,
//! the token, or the deadline. That wait decides what goes back on the wire:
//!
//! | first to happen | response                    |
//! |-----------------|-----------------------------|
//! | handler result  | `Data`, or `Error` from the fault |
//! | token fired     | `Error` of type `tandem::Cancelled` |
//! | deadline passed | `Error` of type `tandem::Timeout`   |
//!
//! One-way methods never produce a response, whatever happens. Routing
//! faults are the exception: nothing on the wire marks a request as one-way,
//! so an unknown endpoint or method is answered even if the caller meant a
//! one-way call. Callers never register one-way ids, so they drop the reply.
//!
//! The deadline is advisory. When it passes the router stops waiting and
//! fires the token, but the handler keeps running until it notices.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tandem_core::{
    Body, CancelToken, Connection, ConnectionId, ErrorInfo, InboundHandler, Request, Response,
    fault,
};
use tokio::sync::oneshot;
use tracing::Instrument;

use crate::client::ClientOptions;
use crate::context::CallContext;
use crate::error::ConfigError;
use crate::fault::Fault;
use crate::scheduler::{Scheduler, TokioScheduler};
use crate::service::{Endpoint, Invocation, MethodDescriptor, Outcome};

type InFlightKey = (ConnectionId, u64);

/// Routes inbound requests to endpoints. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

struct RouterInner {
    endpoints: HashMap<String, Arc<Endpoint>>,
    in_flight: Mutex<HashMap<InFlightKey, CancelToken>>,
    scheduler: Arc<dyn Scheduler>,
    callback_options: ClientOptions,
}

#[derive(Default)]
pub struct RouterBuilder {
    endpoints: Vec<Endpoint>,
    scheduler: Option<Arc<dyn Scheduler>>,
    callback_options: Option<ClientOptions>,
}

impl RouterBuilder {
    pub fn endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    /// Scheduler for endpoints that do not name their own.
    pub fn scheduler(mut self, scheduler: impl Scheduler) -> Self {
        self.scheduler = Some(Arc::new(scheduler));
        self
    }

    /// Options for clients handlers create with [`CallContext::callback_client`].
    pub fn callback_options(mut self, options: ClientOptions) -> Self {
        self.callback_options = Some(options);
        self
    }

    pub fn build(self) -> Result<Router, ConfigError> {
        let mut endpoints = HashMap::with_capacity(self.endpoints.len());
        for endpoint in self.endpoints {
            let name = endpoint.name().to_string();
            if endpoints.contains_key(&name) {
                return Err(ConfigError::DuplicateEndpoint(name));
            }
            endpoints.insert(name, Arc::new(endpoint));
        }
        Ok(Router {
            inner: Arc::new(RouterInner {
                endpoints,
                in_flight: Mutex::new(HashMap::new()),
                scheduler: self.scheduler.unwrap_or_else(default_scheduler),
                callback_options: self.callback_options.unwrap_or_default(),
            }),
        })
    }
}

impl Router {
    pub fn builder() -> RouterBuilder {
        RouterBuilder::default()
    }

    /// A router with no endpoints. Every request is answered with an
    /// unknown-endpoint fault.
    pub fn empty() -> Self {
        Router {
            inner: Arc::new(RouterInner {
                endpoints: HashMap::new(),
                in_flight: Mutex::new(HashMap::new()),
                scheduler: default_scheduler(),
                callback_options: ClientOptions::default(),
            }),
        }
    }

    pub fn endpoint(&self, name: &str) -> Option<&Endpoint> {
        self.inner.endpoints.get(name).map(|e| e.as_ref())
    }

    /// Registered endpoint names, sorted.
    pub fn endpoint_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.inner.endpoints.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Requests currently being handled, sorted.
    pub fn in_flight(&self) -> Vec<(ConnectionId, u64)> {
        let mut keys: Vec<_> = self.inner.in_flight.lock().keys().copied().collect();
        keys.sort_unstable();
        keys
    }

    pub(crate) fn callback_options(&self) -> &ClientOptions {
        &self.inner.callback_options
    }

    /// This router as a connection handler.
    pub fn handler(&self) -> Arc<dyn InboundHandler> {
        Arc::new(self.clone())
    }

    fn remove_in_flight(&self, key: InFlightKey, token: &CancelToken) {
        let mut in_flight = self.inner.in_flight.lock();
        // A reused id may have replaced our entry; leave that one alone.
        if in_flight.get(&key).is_some_and(|t| t.same_as(token)) {
            in_flight.remove(&key);
        }
    }

    async fn dispatch(
        self,
        connection: Connection,
        endpoint: Arc<Endpoint>,
        method: MethodDescriptor,
        request: Request,
        body: Option<Body>,
        token: CancelToken,
    ) {
        let request_id = request.id;
        let key = (connection.id(), request_id);
        let kind = method.kind();
        let deadline = effective_timeout(request.timeout_in_seconds, endpoint.default_timeout());

        let ctx = CallContext::new(
            request_id,
            endpoint.shared_name(),
            method.shared_name(),
            request.trace_id,
            token.clone(),
            connection.clone(),
            endpoint.shared_callback_contract(),
            self.inner.callback_options.clone(),
        );
        let invocation = Invocation {
            ctx,
            params: request.parameters,
            body,
        };

        let (done, result) = oneshot::channel();
        let work = AssertUnwindSafe(method.invoke(invocation))
            .catch_unwind()
            .map(move |caught| {
                let result = caught.unwrap_or_else(|panic| Err(Fault::from_panic(panic)));
                let _ = done.send(result);
            })
            .in_current_span()
            .boxed();
        let scheduler = endpoint
            .scheduler()
            .cloned()
            .unwrap_or_else(|| self.inner.scheduler.clone());
        scheduler.schedule(work, token.clone());

        let settled = tokio::select! {
            biased;
            // A handler that returns because its token fired still counts as cancelled.
            result = result => match result {
                _ if token.is_cancelled() => Settled::Cancelled,
                Ok(result) => Settled::Finished(result),
                Err(_) => Settled::Dropped,
            },
            _ = token.cancelled() => Settled::Cancelled,
            _ = sleep_until_deadline(deadline) => Settled::TimedOut,
        };
        self.remove_in_flight(key, &token);

        let response = match settled {
            Settled::Finished(Ok(outcome)) => {
                tracing::debug!("handler finished");
                Reply::Success(outcome)
            }
            Settled::Finished(Err(fault)) => {
                tracing::debug!(fault = %fault, "handler failed");
                Reply::Failure(fault.into_info())
            }
            Settled::Cancelled => {
                tracing::debug!("call cancelled");
                Reply::Failure(ErrorInfo::new(fault::CANCELLED, "the call was cancelled"))
            }
            Settled::TimedOut => {
                token.cancel();
                tracing::debug!(?deadline, "call timed out");
                Reply::Failure(ErrorInfo::new(
                    fault::TIMEOUT,
                    format!(
                        "{}.{} did not finish within {:?}",
                        endpoint.name(),
                        method.name(),
                        deadline.unwrap_or_default()
                    ),
                ))
            }
            Settled::Dropped => {
                tracing::warn!("scheduler dropped the invocation");
                Reply::Failure(ErrorInfo::new(
                    fault::NOT_SCHEDULED,
                    "the scheduler dropped the invocation",
                ))
            }
        };

        if kind.is_one_way() {
            if let Reply::Failure(info) = &response {
                tracing::debug!(error = %info, "one-way call failed; nothing is sent back");
            }
            return;
        }

        let (response, body) = match response {
            Reply::Success(Outcome { data, body }) => {
                let mut response = Response::success(request_id, data);
                response.stream_length = body.as_ref().map(|b| b.len());
                (response, body)
            }
            Reply::Failure(info) => (Response::failure(request_id, info), None),
        };
        if let Err(e) = connection.send_response(&response, body).await {
            tracing::debug!(error = %e, "could not send response");
        }
    }
}

impl InboundHandler for Router {
    fn on_request(&self, connection: &Connection, request: Request, body: Option<Body>) {
        let Some(endpoint) = self.inner.endpoints.get(&request.endpoint).cloned() else {
            tracing::warn!(
                connection = %connection.id(),
                request_id = request.id,
                endpoint = %request.endpoint,
                "request for unknown endpoint"
            );
            let info = ErrorInfo::new(
                fault::UNKNOWN_ENDPOINT,
                format!("no endpoint named {:?}", request.endpoint),
            );
            reply_fault(connection, request.id, info);
            return;
        };
        let Some(method) = endpoint.method(&request.method_name).cloned() else {
            tracing::warn!(
                connection = %connection.id(),
                request_id = request.id,
                endpoint = %request.endpoint,
                method = %request.method_name,
                "request for unknown method"
            );
            let info = ErrorInfo::new(
                fault::UNKNOWN_METHOD,
                format!(
                    "endpoint {:?} has no method {:?}",
                    request.endpoint, request.method_name
                ),
            );
            reply_fault(connection, request.id, info);
            return;
        };

        // Registered before the loop reads the next frame, so a cancellation
        // right behind this request always finds its token.
        let token = CancelToken::new();
        let key = (connection.id(), request.id);
        if self.inner.in_flight.lock().insert(key, token.clone()).is_some() {
            tracing::warn!(
                connection = %connection.id(),
                request_id = request.id,
                "request id reused while still in flight"
            );
        }

        let span = tracing::debug_span!(
            "dispatch",
            connection = %connection.id(),
            request_id = request.id,
            endpoint = %request.endpoint,
            method = %request.method_name,
            trace_id = request.trace_id.as_deref().unwrap_or(""),
        );
        let task = self
            .clone()
            .dispatch(connection.clone(), endpoint, method, request, body, token);
        tokio::spawn(task.instrument(span));
    }

    fn on_cancel(&self, connection: &Connection, request_id: u64) {
        let token = self
            .inner
            .in_flight
            .lock()
            .get(&(connection.id(), request_id))
            .cloned();
        match token {
            Some(token) => {
                token.cancel();
                tracing::debug!(connection = %connection.id(), request_id, "request cancelled by peer");
            }
            None => {
                tracing::debug!(
                    connection = %connection.id(),
                    request_id,
                    "cancellation for a request that is not running"
                );
            }
        }
    }

    fn on_closed(&self, connection: ConnectionId) {
        let mut abandoned = Vec::new();
        self.inner.in_flight.lock().retain(|(conn, _), token| {
            if *conn == connection {
                abandoned.push(token.clone());
                false
            } else {
                true
            }
        });
        if !abandoned.is_empty() {
            tracing::debug!(%connection, count = abandoned.len(), "abandoning in-flight requests");
        }
        for token in abandoned {
            token.cancel();
        }
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("endpoints", &self.endpoint_names())
            .field("in_flight", &self.inner.in_flight.lock().len())
            .finish_non_exhaustive()
    }
}

fn default_scheduler() -> Arc<dyn Scheduler> {
    Arc::new(TokioScheduler)
}

enum Settled {
    Finished(Result<Outcome, Fault>),
    Cancelled,
    TimedOut,
    Dropped,
}

enum Reply {
    Success(Outcome),
    Failure(ErrorInfo),
}

fn reply_fault(connection: &Connection, request_id: u64, info: ErrorInfo) {
    let connection = connection.clone();
    tokio::spawn(async move {
        let response = Response::failure(request_id, info);
        if let Err(e) = connection.send_response(&response, None).await {
            tracing::debug!(request_id, error = %e, "could not send routing fault");
        }
    });
}

/// The shorter of the caller's timeout and the endpoint's. `0` (or anything
/// not a positive finite number) on the wire means the caller set none.
fn effective_timeout(wire_seconds: f64, endpoint_default: Option<Duration>) -> Option<Duration> {
    let wire = if wire_seconds > 0.0 {
        Duration::try_from_secs_f64(wire_seconds).ok()
    } else {
        None
    };
    match (wire, endpoint_default) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

async fn sleep_until_deadline(deadline: Option<Duration>) {
    match deadline {
        Some(deadline) => tokio::time::sleep(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use tandem_core::{
        ConnectionConfig, Encoding, Frame, FrameType, Payload, read_frame, write_frame,
    };
    use tokio::io::DuplexStream;

    use super::*;
    use crate::scheduler::{LimitedScheduler, RuntimeScheduler};

    struct Svc {
        saw_cancel: AtomicBool,
    }

    fn router(svc: Arc<Svc>) -> Router {
        let endpoint = Endpoint::builder("IMath", svc)
            .rpc("Sum", |_svc: Arc<Svc>, _ctx, (a, b): (i32, i32)| async move { Ok(a + b) })
            .rpc("Slow", |svc: Arc<Svc>, ctx: CallContext, (): ()| async move {
                ctx.cancelled().await;
                svc.saw_cancel.store(true, Ordering::SeqCst);
                Ok(0)
            })
            .rpc("Panic", |_svc: Arc<Svc>, _ctx, (): ()| async move {
                if true {
                    panic!("handler blew up");
                }
                Ok(0)
            })
            .oneway("Log", |_svc: Arc<Svc>, _ctx, (_line,): (String,)| async move {
                Err(Fault::msg("one-way failures stay local"))
            })
            .build()
            .unwrap();
        Router::builder().endpoint(endpoint).build().unwrap()
    }

    fn serve(router: &Router) -> (Connection, DuplexStream) {
        let (server, client) = tokio::io::duplex(64 * 1024);
        let connection = Connection::start(
            server,
            "raw-peer",
            ConnectionConfig::default(),
            Some(router.handler()),
        );
        (connection, client)
    }

    fn request(id: u64, method: &str, params: &[&str], timeout: f64) -> Frame {
        request_to("IMath", id, method, params, timeout)
    }

    fn request_to(endpoint: &str, id: u64, method: &str, params: &[&str], timeout: f64) -> Frame {
        let request = Request {
            id,
            endpoint: endpoint.into(),
            method_name: method.into(),
            parameters: params.iter().map(|p| Payload::from(*p)).collect(),
            timeout_in_seconds: timeout,
            trace_id: None,
            stream_length: None,
        };
        Frame::new(FrameType::Request, Encoding::Json.encode(&request).unwrap())
    }

    fn cancellation(request_id: u64) -> Frame {
        let cancel = tandem_core::Cancellation { request_id };
        Frame::new(FrameType::Cancellation, Encoding::Json.encode(&cancel).unwrap())
    }

    async fn read_response(peer: &mut DuplexStream) -> Response {
        let frame = read_frame(peer, 1 << 20).await.unwrap();
        assert_eq!(frame.frame_type, FrameType::Response);
        Encoding::Json.decode(&frame.payload).unwrap()
    }

    fn svc() -> Arc<Svc> {
        Arc::new(Svc {
            saw_cancel: AtomicBool::new(false),
        })
    }

    #[tokio::test]
    async fn dispatches_to_handler() {
        let router = router(svc());
        let (_conn, mut peer) = serve(&router);

        write_frame(&mut peer, &request(0, "Sum", &["1", "2"], 5.0)).await.unwrap();
        let response = read_response(&mut peer).await;
        assert_eq!(response.request_id, 0);
        assert_eq!(response.data, Some(Payload::from("3")));
        assert!(response.error.is_none());
    }

    #[tokio::test]
    async fn unknown_endpoint_and_method_are_faults() {
        let router = router(svc());
        let (_conn, mut peer) = serve(&router);

        let mut frame = request(7, "Sum", &["1", "2"], 0.0);
        let mut req: Request = Encoding::Json.decode(&frame.payload).unwrap();
        req.endpoint = "INope".into();
        frame = Frame::new(FrameType::Request, Encoding::Json.encode(&req).unwrap());
        write_frame(&mut peer, &frame).await.unwrap();
        let response = read_response(&mut peer).await;
        assert_eq!(response.request_id, 7);
        assert!(response.error.unwrap().is_type(fault::UNKNOWN_ENDPOINT));

        write_frame(&mut peer, &request(8, "Divide", &[], 0.0)).await.unwrap();
        let response = read_response(&mut peer).await;
        assert!(response.error.unwrap().is_type(fault::UNKNOWN_METHOD));
    }

    #[tokio::test]
    async fn bad_arguments_do_not_kill_the_connection() {
        let router = router(svc());
        let (conn, mut peer) = serve(&router);

        write_frame(&mut peer, &request(1, "Sum", &["1"], 0.0)).await.unwrap();
        let response = read_response(&mut peer).await;
        assert!(response.error.unwrap().is_type(fault::INVALID_ARGUMENTS));

        write_frame(&mut peer, &request(2, "Panic", &[], 0.0)).await.unwrap();
        let response = read_response(&mut peer).await;
        let error = response.error.unwrap();
        assert!(error.is_type(fault::PANIC));
        assert!(error.message.contains("handler blew up"));

        assert!(conn.is_open());
        write_frame(&mut peer, &request(3, "Sum", &["2", "2"], 0.0)).await.unwrap();
        assert_eq!(read_response(&mut peer).await.data, Some(Payload::from("4")));
    }

    #[tokio::test]
    async fn peer_cancellation_reaches_the_handler() {
        let svc = svc();
        let router = router(svc.clone());
        let (_conn, mut peer) = serve(&router);

        write_frame(&mut peer, &request(1, "Slow", &[], 0.0)).await.unwrap();
        write_frame(&mut peer, &cancellation(1)).await.unwrap();

        let response = read_response(&mut peer).await;
        assert_eq!(response.request_id, 1);
        assert!(response.error.unwrap().is_type(fault::CANCELLED));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(svc.saw_cancel.load(Ordering::SeqCst));
        assert!(router.in_flight().is_empty());
    }

    #[tokio::test]
    async fn wire_timeout_is_reported_as_timeout() {
        let svc = svc();
        let router = router(svc.clone());
        let (_conn, mut peer) = serve(&router);

        write_frame(&mut peer, &request(4, "Slow", &[], 0.05)).await.unwrap();
        let response = read_response(&mut peer).await;
        let error = response.error.unwrap();
        assert!(error.is_type(fault::TIMEOUT), "{error}");
        assert!(error.message.contains("IMath.Slow"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(svc.saw_cancel.load(Ordering::SeqCst), "timeout should fire the token");
    }

    #[tokio::test]
    async fn one_way_sends_nothing_back() {
        let router = router(svc());
        let (_conn, mut peer) = serve(&router);

        write_frame(&mut peer, &request(0, "Log", &["\"hello\""], 0.0)).await.unwrap();
        write_frame(&mut peer, &request(1, "Sum", &["1", "1"], 0.0)).await.unwrap();
        let response = read_response(&mut peer).await;
        assert_eq!(response.request_id, 1, "the one-way call must not be answered");
    }

    #[tokio::test]
    async fn closing_abandons_in_flight_work() {
        let svc = svc();
        let router = router(svc.clone());
        let (conn, mut peer) = serve(&router);

        write_frame(&mut peer, &request(1, "Slow", &[], 0.0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(router.in_flight(), vec![(conn.id(), 1)]);

        drop(peer);
        conn.closed().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(svc.saw_cancel.load(Ordering::SeqCst));
        assert!(router.in_flight().is_empty());
    }

    #[derive(Default)]
    struct Queue {
        started: AtomicUsize,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    fn queue_router(queue: Arc<Queue>) -> Router {
        let endpoint = Endpoint::builder("IQueue", queue)
            .scheduler(LimitedScheduler::new(1))
            .rpc("Hold", |queue: Arc<Queue>, _ctx, (ms,): (u64,)| async move {
                queue.started.fetch_add(1, Ordering::SeqCst);
                let now = queue.running.fetch_add(1, Ordering::SeqCst) + 1;
                queue.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                queue.running.fetch_sub(1, Ordering::SeqCst);
                Ok(ms)
            })
            .build()
            .unwrap();
        Router::builder().endpoint(endpoint).build().unwrap()
    }

    #[tokio::test]
    async fn endpoint_scheduler_serializes_calls() {
        let queue = Arc::new(Queue::default());
        let router = queue_router(queue.clone());
        let (_conn, mut peer) = serve(&router);

        write_frame(&mut peer, &request_to("IQueue", 1, "Hold", &["30"], 0.0)).await.unwrap();
        write_frame(&mut peer, &request_to("IQueue", 2, "Hold", &["30"], 0.0)).await.unwrap();

        let mut answered = vec![
            read_response(&mut peer).await.request_id,
            read_response(&mut peer).await.request_id,
        ];
        answered.sort_unstable();
        assert_eq!(answered, [1, 2]);
        assert_eq!(queue.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn queued_call_cancelled_by_peer_never_runs() {
        let queue = Arc::new(Queue::default());
        let router = queue_router(queue.clone());
        let (_conn, mut peer) = serve(&router);

        write_frame(&mut peer, &request_to("IQueue", 1, "Hold", &["200"], 0.0)).await.unwrap();
        write_frame(&mut peer, &request_to("IQueue", 2, "Hold", &["0"], 0.0)).await.unwrap();
        write_frame(&mut peer, &cancellation(2)).await.unwrap();

        let response = read_response(&mut peer).await;
        assert_eq!(response.request_id, 2);
        assert!(response.error.unwrap().is_type(fault::CANCELLED));

        let response = read_response(&mut peer).await;
        assert_eq!(response.request_id, 1);
        assert_eq!(response.data, Some(Payload::from("200")));
        assert_eq!(queue.started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn endpoint_default_timeout_applies_without_a_wire_timeout() {
        let svc = svc();
        let endpoint = Endpoint::builder("ISlow", svc.clone())
            .default_timeout(Duration::from_millis(50))
            .rpc("Slow", |svc: Arc<Svc>, ctx: CallContext, (): ()| async move {
                ctx.cancelled().await;
                svc.saw_cancel.store(true, Ordering::SeqCst);
                Ok(0)
            })
            .build()
            .unwrap();
        let router = Router::builder().endpoint(endpoint).build().unwrap();
        let (_conn, mut peer) = serve(&router);

        write_frame(&mut peer, &request_to("ISlow", 1, "Slow", &[], 0.0)).await.unwrap();
        let error = read_response(&mut peer).await.error.unwrap();
        assert!(error.is_type(fault::TIMEOUT), "{error}");

        // A longer caller timeout does not extend the endpoint's.
        let started = tokio::time::Instant::now();
        write_frame(&mut peer, &request_to("ISlow", 2, "Slow", &[], 30.0)).await.unwrap();
        let error = read_response(&mut peer).await.error.unwrap();
        assert!(error.is_type(fault::TIMEOUT), "{error}");
        assert!(started.elapsed() < Duration::from_secs(5));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(svc.saw_cancel.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn handlers_run_on_the_configured_runtime() {
        let handlers = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("tandem-handlers")
            .enable_all()
            .build()
            .unwrap();

        let thread_name = |_svc: Arc<Svc>, _ctx: CallContext, (): ()| async move {
            Ok::<_, Fault>(std::thread::current().name().unwrap_or_default().to_string())
        };
        let remote = Endpoint::builder("IRemote", svc())
            .rpc("Thread", thread_name)
            .build()
            .unwrap();
        let local = Endpoint::builder("ILocal", svc())
            .scheduler(TokioScheduler)
            .rpc("Thread", thread_name)
            .build()
            .unwrap();
        let router = Router::builder()
            .scheduler(RuntimeScheduler::new(handlers.handle().clone()))
            .endpoint(remote)
            .endpoint(local)
            .build()
            .unwrap();
        let (_conn, mut peer) = serve(&router);

        write_frame(&mut peer, &request_to("IRemote", 1, "Thread", &[], 0.0)).await.unwrap();
        let response = read_response(&mut peer).await;
        assert_eq!(response.data, Some(Payload::from("\"tandem-handlers\"")));

        write_frame(&mut peer, &request_to("ILocal", 2, "Thread", &[], 0.0)).await.unwrap();
        let response = read_response(&mut peer).await;
        assert_ne!(response.data, Some(Payload::from("\"tandem-handlers\"")));

        handlers.shutdown_background();
    }

    #[tokio::test]
    async fn one_way_to_an_unknown_method_is_answered() {
        // Nothing on the wire marks a request as one-way, so a routing fault
        // is sent back even when the caller meant a one-way call.
        let router = router(svc());
        let (_conn, mut peer) = serve(&router);

        write_frame(&mut peer, &request(5, "Forget", &["\"x\""], 0.0)).await.unwrap();
        let response = read_response(&mut peer).await;
        assert_eq!(response.request_id, 5);
        assert!(response.error.unwrap().is_type(fault::UNKNOWN_METHOD));
    }

    #[test]
    fn duplicate_endpoints_are_rejected() {
        let build = || Endpoint::builder("IMath", svc()).build().unwrap();
        let err = Router::builder()
            .endpoint(build())
            .endpoint(build())
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::DuplicateEndpoint("IMath".into()));
    }

    #[test]
    fn effective_timeout_takes_the_shorter() {
        let five = Some(Duration::from_secs(5));
        assert_eq!(effective_timeout(0.0, None), None);
        assert_eq!(effective_timeout(0.0, five), five);
        assert_eq!(effective_timeout(2.0, five), Some(Duration::from_secs(2)));
        assert_eq!(effective_timeout(9.0, five), five);
        assert_eq!(effective_timeout(f64::NAN, None), None);
        assert_eq!(effective_timeout(f64::INFINITY, None), None);
    }
}
