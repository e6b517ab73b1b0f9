//! Matching responses to the calls that are waiting for them.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::{Body, Response, RpcError};

/// What a pending call is resolved with.
#[derive(Debug)]
pub struct Reply {
    pub response: Response,
    /// Present when the response declared a `StreamLength`.
    pub body: Option<Body>,
}

type Completion = oneshot::Sender<Result<Reply, RpcError>>;

struct TableState {
    pending: HashMap<u64, Completion>,
    /// Set by `drain_all`; checked under the same lock as insertion.
    closed: bool,
}

/// Outstanding outbound calls on one connection, keyed by request id.
///
/// Every entry is resolved exactly once: by a response, by cancellation, or
/// by [`drain_all`](Self::drain_all) when the connection goes away.
pub struct CorrelationTable {
    next_id: AtomicU64,
    state: Mutex<TableState>,
    max_pending: usize,
}

impl CorrelationTable {
    pub fn new(max_pending: usize) -> Self {
        Self {
            next_id: AtomicU64::new(0),
            state: Mutex::new(TableState {
                pending: HashMap::new(),
                closed: false,
            }),
            max_pending,
        }
    }

    /// Allocate the next request id. Ids start at 0 and increase by one.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Start waiting for the response to `id`.
    pub fn register(&self, id: u64) -> Result<PendingCall, RpcError> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock();
        if state.closed {
            return Err(RpcError::ConnectionClosed);
        }
        if state.pending.len() >= self.max_pending {
            tracing::warn!(
                request_id = id,
                pending_len = state.pending.len(),
                max_pending = self.max_pending,
                "too many pending calls; refusing new call"
            );
            return Err(RpcError::ResourceExhausted {
                limit: self.max_pending,
            });
        }
        if state.pending.contains_key(&id) {
            return Err(RpcError::Protocol(format!(
                "request id {id} is already outstanding"
            )));
        }
        state.pending.insert(id, tx);
        tracing::trace!(request_id = id, pending_len = state.pending.len(), "registered pending call");
        Ok(PendingCall { id, rx })
    }

    /// Complete the call waiting on `id`. Returns false if nothing was waiting.
    pub fn resolve(&self, id: u64, reply: Reply) -> bool {
        let waiter = self.state.lock().pending.remove(&id);
        match waiter {
            Some(tx) => {
                // The caller may have stopped listening already; that still
                // counts as resolved.
                let _ = tx.send(Ok(reply));
                true
            }
            None => false,
        }
    }

    /// Resolve `id` as [`RpcError::Cancelled`]. Returns false if nothing was waiting.
    pub fn cancel(&self, id: u64) -> bool {
        let waiter = self.state.lock().pending.remove(&id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(Err(RpcError::Cancelled));
                true
            }
            None => false,
        }
    }

    /// Drop the entry for `id` without resolving it.
    pub fn forget(&self, id: u64) -> bool {
        self.state.lock().pending.remove(&id).is_some()
    }

    /// Refuse new entries and fail everything outstanding with
    /// [`RpcError::ConnectionClosed`]. Safe to call more than once.
    pub fn drain_all(&self, reason: &str) {
        let drained: Vec<(u64, Completion)> = {
            let mut state = self.state.lock();
            state.closed = true;
            state.pending.drain().collect()
        };
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), reason, "draining pending calls");
        }
        for (_, tx) in drained {
            let _ = tx.send(Err(RpcError::ConnectionClosed));
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Outstanding request ids, sorted.
    pub fn pending_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.state.lock().pending.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

impl std::fmt::Debug for CorrelationTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationTable")
            .field("pending", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A registered call. Resolves to the reply or the reason there is none.
#[derive(Debug)]
pub struct PendingCall {
    id: u64,
    rx: oneshot::Receiver<Result<Reply, RpcError>>,
}

impl PendingCall {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Future for PendingCall {
    type Output = Result<Reply, RpcError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // Sender gone without a value: the table was dropped with us in it.
            Poll::Ready(Err(_)) => Poll::Ready(Err(RpcError::ConnectionClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}
