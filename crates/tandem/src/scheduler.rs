//! Where handler invocations run.

use std::sync::Arc;

use futures::future::BoxFuture;
use tandem_core::CancelToken;
use tokio::sync::Semaphore;

/// Runs handler invocations for an endpoint.
///
/// `token` is the request's cancellation token. A scheduler may drop work
/// whose token has already fired; the router then reports the request as
/// cancelled.
pub trait Scheduler: Send + Sync + 'static {
    fn schedule(&self, work: BoxFuture<'static, ()>, token: CancelToken);
}

/// Spawns onto the ambient Tokio runtime. The default.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn schedule(&self, work: BoxFuture<'static, ()>, _token: CancelToken) {
        tokio::spawn(work);
    }
}

/// Spawns onto a specific runtime, keeping an endpoint's handlers off the
/// runtime that drives connection I/O.
#[derive(Debug, Clone)]
pub struct RuntimeScheduler {
    handle: tokio::runtime::Handle,
}

impl RuntimeScheduler {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }
}

impl Scheduler for RuntimeScheduler {
    fn schedule(&self, work: BoxFuture<'static, ()>, _token: CancelToken) {
        self.handle.spawn(work);
    }
}

/// Runs at most `limit` invocations at once; the rest wait for a slot.
///
/// Work whose token fires while it is still waiting is dropped unrun.
#[derive(Debug, Clone)]
pub struct LimitedScheduler {
    permits: Arc<Semaphore>,
}

impl LimitedScheduler {
    pub fn new(limit: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(limit.max(1))),
        }
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

impl Scheduler for LimitedScheduler {
    fn schedule(&self, work: BoxFuture<'static, ()>, token: CancelToken) {
        let permits = self.permits.clone();
        tokio::spawn(async move {
            let permit = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    tracing::debug!("work cancelled while waiting for a scheduler slot");
                    return;
                }
                permit = permits.acquire_owned() => permit,
            };
            let Ok(_permit) = permit else {
                return;
            };
            work.await;
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures::FutureExt;
    use tokio::sync::oneshot;

    use super::*;

    #[tokio::test]
    async fn tokio_scheduler_runs_work() {
        let (tx, rx) = oneshot::channel();
        TokioScheduler.schedule(
            async move {
                let _ = tx.send(42);
            }
            .boxed(),
            CancelToken::new(),
        );
        assert_eq!(rx.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn limited_scheduler_caps_concurrency() {
        let scheduler = LimitedScheduler::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut done = Vec::new();

        for _ in 0..6 {
            let (tx, rx) = oneshot::channel::<()>();
            done.push(rx);
            let running = running.clone();
            let peak = peak.clone();
            scheduler.schedule(
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    let _ = tx.send(());
                }
                .boxed(),
                CancelToken::new(),
            );
        }
        for rx in done {
            rx.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn limited_scheduler_drops_cancelled_waiters() {
        let scheduler = LimitedScheduler::new(1);
        let (block_tx, block_rx) = oneshot::channel::<()>();
        scheduler.schedule(
            async move {
                let _ = block_rx.await;
            }
            .boxed(),
            CancelToken::new(),
        );

        let token = CancelToken::new();
        let (tx, rx) = oneshot::channel::<()>();
        scheduler.schedule(
            async move {
                let _ = tx.send(());
            }
            .boxed(),
            token.clone(),
        );
        token.cancel();

        assert!(rx.await.is_err(), "cancelled work must not run");
        let _ = block_tx.send(());
    }
}
