//! Connection: one duplex stream, one receive loop, one serialized write path.
//!
//! # Architecture
//!
//! ```text
//!                  ┌──────────────────────────────────────┐
//!                  │              Connection              │
//!                  ├──────────────────────────────────────┤
//!   send_*() ────► │ write queue ──► writer task ──► tx   │
//!                  │                                      │
//!   rx ──────────► │ receive loop                         │
//!                  │   Response     ──► CorrelationTable  │
//!                  │   Request      ──► InboundHandler    │
//!                  │   Cancellation ──► InboundHandler    │
//!                  └──────────────────────────────────────┘
//! ```
//!
//! Only the receive loop reads from the stream. Every write goes through a
//! single writer task, so frames (and any raw body that follows one) never
//! interleave, and a caller that gives up halfway through a send cannot leave
//! a partial frame behind.
//!
//! Any read failure closes the connection: pending calls are drained with
//! [`RpcError::ConnectionClosed`], the inbound handler is told to abandon work
//! for this connection, and [`Connection::closed`] resolves.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch};

use crate::body::relay;
use crate::error::fault;
use crate::frame::read_frame;
use crate::{
    Body, BodySource, Cancellation, ConnectionConfig, CorrelationTable, Encoding, ErrorInfo,
    Frame, FrameError, FrameType, Reply, Request, Response, RpcError,
};

/// Frames queued for the writer task before senders start waiting.
const WRITE_QUEUE_CAPACITY: usize = 64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection number, used in logs and as a routing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

/// Receives the frames a connection cannot handle itself.
///
/// Called from the receive loop, so implementations must hand real work off
/// to another task and return promptly.
pub trait InboundHandler: Send + Sync + 'static {
    /// A request arrived. `body` is present when it declared a `StreamLength`.
    fn on_request(&self, connection: &Connection, request: Request, body: Option<Body>);

    /// The peer asked to abandon `request_id`.
    fn on_cancel(&self, connection: &Connection, request_id: u64);

    /// The connection closed; abandon everything tied to it.
    fn on_closed(&self, connection: ConnectionId);
}

/// Anything a connection can run over.
pub trait IoStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> IoStream for T {}

/// A type-erased [`IoStream`].
pub type BoxedStream = Box<dyn IoStream>;

type BoxedReader = ReadHalf<BoxedStream>;
type BoxedWriter = WriteHalf<BoxedStream>;

struct WriteJob {
    frame: Bytes,
    body: Option<BodySource>,
    done: oneshot::Sender<Result<(), RpcError>>,
}

struct Inner {
    id: ConnectionId,
    peer: String,
    config: ConnectionConfig,
    table: CorrelationTable,
    state: watch::Sender<ConnectionState>,
    writes: mpsc::Sender<WriteJob>,
    handler: Option<Arc<dyn InboundHandler>>,
    close_reason: Mutex<Option<String>>,
}

/// A live (or closed) connection. Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Take ownership of `stream` and start the receive loop and writer task.
    ///
    /// `peer` is a label for logs. Without a `handler`, inbound requests are
    /// answered with an unknown-endpoint fault and cancellations are ignored.
    /// Must be called from within a Tokio runtime.
    pub fn start<S>(
        stream: S,
        peer: impl Into<String>,
        config: ConnectionConfig,
        handler: Option<Arc<dyn InboundHandler>>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let stream: BoxedStream = Box::new(stream);
        let (reader, writer) = tokio::io::split(stream);
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let (writes, jobs) = mpsc::channel(WRITE_QUEUE_CAPACITY);

        let connection = Connection {
            inner: Arc::new(Inner {
                id: ConnectionId::next(),
                peer: peer.into(),
                table: CorrelationTable::new(config.max_pending),
                config,
                state,
                writes,
                handler,
                close_reason: Mutex::new(None),
            }),
        };

        tokio::spawn(connection.clone().write_loop(writer, jobs));
        connection.inner.state.send_replace(ConnectionState::Open);
        tokio::spawn(connection.clone().receive_loop(reader));

        tracing::debug!(
            connection = %connection.inner.id,
            peer = %connection.inner.peer,
            "connection open"
        );
        connection
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn encoding(&self) -> Encoding {
        self.inner.config.encoding
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Outbound calls waiting for a response on this connection.
    pub fn correlation(&self) -> &CorrelationTable {
        &self.inner.table
    }

    /// Why the connection closed, once it has.
    pub fn close_reason(&self) -> Option<String> {
        self.inner.close_reason.lock().clone()
    }

    /// True if both handles refer to the same connection.
    pub fn same_as(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        let mut state = self.inner.state.subscribe();
        while *state.borrow_and_update() != ConnectionState::Closed {
            if state.changed().await.is_err() {
                return;
            }
        }
    }

    /// Close the connection. Pending calls fail with [`RpcError::ConnectionClosed`].
    pub fn close(&self) {
        self.close_with("closed locally");
    }

    fn close_with(&self, reason: &str) {
        {
            let mut slot = self.inner.close_reason.lock();
            if slot.is_some() {
                return;
            }
            *slot = Some(reason.to_string());
        }
        self.inner.table.drain_all(reason);
        self.inner.state.send_replace(ConnectionState::Closed);
        if let Some(handler) = &self.inner.handler {
            handler.on_closed(self.inner.id);
        }
        tracing::debug!(
            connection = %self.inner.id,
            peer = %self.inner.peer,
            reason,
            "connection closed"
        );
    }

    /// Send an already-built frame.
    pub async fn send_frame(&self, frame: Frame) -> Result<(), RpcError> {
        self.check_outgoing(frame.payload.len())?;
        self.enqueue(frame.to_bytes(), None).await
    }

    /// Send a request, followed by `body` if given.
    ///
    /// `request.stream_length` must match the body's length.
    pub async fn send_request(
        &self,
        request: &Request,
        body: Option<BodySource>,
    ) -> Result<(), RpcError> {
        check_stream_length(request.stream_length, body.as_ref())?;
        let payload = self.encoding().encode(request)?;
        self.check_outgoing(payload.len())?;
        tracing::debug!(
            connection = %self.inner.id,
            request_id = request.id,
            endpoint = %request.endpoint,
            method = %request.method_name,
            payload_len = payload.len(),
            "sending request"
        );
        self.enqueue(Frame::new(FrameType::Request, payload).to_bytes(), body)
            .await
    }

    /// Send a response, followed by `body` if given.
    pub async fn send_response(
        &self,
        response: &Response,
        body: Option<BodySource>,
    ) -> Result<(), RpcError> {
        check_stream_length(response.stream_length, body.as_ref())?;
        let payload = self.encoding().encode(response)?;
        self.check_outgoing(payload.len())?;
        self.enqueue(Frame::new(FrameType::Response, payload).to_bytes(), body)
            .await
    }

    /// Ask the peer to abandon `request_id`.
    pub async fn send_cancellation(&self, request_id: u64) -> Result<(), RpcError> {
        let payload = self.encoding().encode(&Cancellation { request_id })?;
        tracing::debug!(connection = %self.inner.id, request_id, "sending cancellation");
        self.enqueue(Frame::new(FrameType::Cancellation, payload).to_bytes(), None)
            .await
    }

    fn check_outgoing(&self, payload_len: usize) -> Result<(), RpcError> {
        let max = self.inner.config.max_payload_bytes();
        if payload_len > max {
            return Err(RpcError::Protocol(format!(
                "outgoing message of {payload_len} bytes exceeds the {max} byte limit"
            )));
        }
        Ok(())
    }

    async fn enqueue(&self, frame: Bytes, body: Option<BodySource>) -> Result<(), RpcError> {
        if !self.is_open() {
            return Err(RpcError::ConnectionClosed);
        }
        let (done, written) = oneshot::channel();
        self.inner
            .writes
            .send(WriteJob { frame, body, done })
            .await
            .map_err(|_| RpcError::ConnectionClosed)?;
        written.await.unwrap_or(Err(RpcError::ConnectionClosed))
    }

    async fn write_loop(self, mut writer: BoxedWriter, mut jobs: mpsc::Receiver<WriteJob>) {
        let chunk_size = self.inner.config.body_chunk_size;
        loop {
            let job = tokio::select! {
                biased;
                _ = self.closed() => break,
                job = jobs.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            let result = write_job(&mut writer, job.frame, job.body, chunk_size).await;
            let failure = result.as_ref().err().map(|e| e.to_string());
            let _ = job.done.send(result);

            if let Some(reason) = failure {
                tracing::warn!(connection = %self.inner.id, reason = %reason, "write failed; closing");
                self.close_with(&reason);
                break;
            }
        }

        // Fail anything still queued, then let the peer see EOF.
        jobs.close();
        while let Ok(job) = jobs.try_recv() {
            let _ = job.done.send(Err(RpcError::ConnectionClosed));
        }
        let _ = writer.shutdown().await;
    }

    async fn receive_loop(self, mut reader: BoxedReader) {
        let reason = loop {
            let step = async {
                let frame = self.read_next(&mut reader).await?;
                self.handle_frame(frame, &mut reader).await
            };
            let outcome = tokio::select! {
                biased;
                _ = self.closed() => break None,
                outcome = step => outcome,
            };
            if let Err(reason) = outcome {
                break Some(reason);
            }
        };

        if let Some(reason) = reason {
            self.close_with(&reason);
        }
    }

    async fn read_next(&self, reader: &mut BoxedReader) -> Result<Frame, String> {
        let max = self.inner.config.max_payload_bytes();
        let read = match self.inner.config.idle_timeout {
            Some(idle) => match tokio::time::timeout(idle, read_frame(reader, max)).await {
                Ok(read) => read,
                Err(_) => {
                    tracing::debug!(connection = %self.inner.id, ?idle, "idle timeout");
                    return Err("idle timeout".into());
                }
            },
            None => read_frame(reader, max).await,
        };

        read.map_err(|e| {
            match &e {
                FrameError::Closed => {
                    tracing::debug!(connection = %self.inner.id, "peer closed the stream")
                }
                e if e.is_protocol_violation() => {
                    tracing::warn!(connection = %self.inner.id, error = %e, "protocol violation")
                }
                e => tracing::debug!(connection = %self.inner.id, error = %e, "read failed"),
            }
            e.to_string()
        })
    }

    async fn handle_frame(&self, frame: Frame, reader: &mut BoxedReader) -> Result<(), String> {
        let encoding = self.encoding();
        let chunk_size = self.inner.config.body_chunk_size;
        tracing::trace!(
            connection = %self.inner.id,
            frame_type = %frame.frame_type,
            payload_len = frame.payload.len(),
            "received frame"
        );

        match frame.frame_type {
            FrameType::Response => {
                let response: Response =
                    encoding.decode(&frame.payload).map_err(|e| self.bad_envelope(e))?;
                let request_id = response.request_id;
                let stream_length = response.stream_length;
                let (tx, body) = open_body(stream_length);

                if self.inner.table.resolve(request_id, Reply { response, body }) {
                    tracing::debug!(connection = %self.inner.id, request_id, "response delivered");
                } else {
                    tracing::debug!(
                        connection = %self.inner.id,
                        request_id,
                        "dropping response with no pending call"
                    );
                }

                if let Some(len) = stream_length {
                    relay(reader, len, chunk_size, tx)
                        .await
                        .map_err(|e| e.to_string())?;
                }
            }
            FrameType::Cancellation => {
                let cancellation: Cancellation =
                    encoding.decode(&frame.payload).map_err(|e| self.bad_envelope(e))?;
                tracing::debug!(
                    connection = %self.inner.id,
                    request_id = cancellation.request_id,
                    "cancellation received"
                );
                if let Some(handler) = &self.inner.handler {
                    handler.on_cancel(self, cancellation.request_id);
                }
            }
            FrameType::Request => {
                let request: Request =
                    encoding.decode(&frame.payload).map_err(|e| self.bad_envelope(e))?;
                let stream_length = request.stream_length;
                let (tx, body) = open_body(stream_length);

                match &self.inner.handler {
                    Some(handler) => handler.on_request(self, request, body),
                    None => self.reject_unroutable(request),
                }

                if let Some(len) = stream_length {
                    relay(reader, len, chunk_size, tx)
                        .await
                        .map_err(|e| e.to_string())?;
                }
            }
        }
        Ok(())
    }

    fn bad_envelope(&self, e: crate::DecodeError) -> String {
        tracing::warn!(connection = %self.inner.id, error = %e, "malformed envelope");
        format!("malformed envelope: {e}")
    }

    fn reject_unroutable(&self, request: Request) {
        tracing::warn!(
            connection = %self.inner.id,
            request_id = request.id,
            endpoint = %request.endpoint,
            "request on a connection that serves no endpoints"
        );
        let connection = self.clone();
        tokio::spawn(async move {
            let error = ErrorInfo::new(
                fault::UNKNOWN_ENDPOINT,
                format!("endpoint {:?} is not registered", request.endpoint),
            );
            let _ = connection
                .send_response(&Response::failure(request.id, error), None)
                .await;
        });
    }
}

fn open_body(stream_length: Option<u64>) -> (Option<mpsc::Sender<Bytes>>, Option<Body>) {
    match stream_length {
        Some(len) => {
            let (tx, body) = Body::channel(len);
            (Some(tx), Some(body))
        }
        None => (None, None),
    }
}

fn check_stream_length(declared: Option<u64>, body: Option<&BodySource>) -> Result<(), RpcError> {
    let actual = body.map(BodySource::len);
    if declared != actual {
        return Err(RpcError::Protocol(format!(
            "declared stream length {declared:?} does not match body length {actual:?}"
        )));
    }
    Ok(())
}

async fn write_job(
    writer: &mut BoxedWriter,
    frame: Bytes,
    body: Option<BodySource>,
    chunk_size: usize,
) -> Result<(), RpcError> {
    writer
        .write_all(&frame)
        .await
        .map_err(|_| RpcError::ConnectionClosed)?;
    if let Some(body) = body {
        body.write_to(writer, chunk_size).await?;
    }
    writer.flush().await.map_err(|_| RpcError::ConnectionClosed)
}
