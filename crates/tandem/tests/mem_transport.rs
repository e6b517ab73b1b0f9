//! Conformance scenarios over the in-process transport.

use std::sync::Once;

use tandem::transport::mem::MemoryNetwork;
use tandem_testkit::{Bound, TestError, TransportFactory};

static INIT: Once = Once::new();

fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive(tracing::Level::DEBUG.into()),
            )
            .with_test_writer()
            .init();
    });
}

struct MemFactory;

impl TransportFactory for MemFactory {
    async fn bind() -> Result<Bound, TestError> {
        let listener = MemoryNetwork::new().listen("math")?;
        let connector = listener.connector();
        Ok(Bound::new(listener, connector))
    }
}

#[tokio::test]
async fn happy_path() {
    init_tracing();
    tandem_testkit::run_happy_path::<MemFactory>().await;
}

#[tokio::test]
async fn postcard_encoding() {
    init_tracing();
    tandem_testkit::run_postcard_encoding::<MemFactory>().await;
}

#[tokio::test]
async fn concurrent_calls() {
    init_tracing();
    tandem_testkit::run_concurrent_calls::<MemFactory>().await;
}

#[tokio::test]
async fn trace_id() {
    tandem_testkit::run_trace_id::<MemFactory>().await;
}

#[tokio::test]
async fn remote_fault_chain() {
    init_tracing();
    tandem_testkit::run_remote_fault_chain::<MemFactory>().await;
}

#[tokio::test]
async fn routing_faults() {
    init_tracing();
    tandem_testkit::run_routing_faults::<MemFactory>().await;
}

#[tokio::test]
async fn one_way() {
    tandem_testkit::run_one_way::<MemFactory>().await;
}

#[tokio::test]
async fn cancellation() {
    init_tracing();
    tandem_testkit::run_cancellation::<MemFactory>().await;
}

#[tokio::test]
async fn timeout() {
    init_tracing();
    tandem_testkit::run_timeout::<MemFactory>().await;
}

#[tokio::test]
async fn cancel_precedence() {
    tandem_testkit::run_cancel_precedence::<MemFactory>().await;
}

#[tokio::test]
async fn close_drains_pending() {
    init_tracing();
    tandem_testkit::run_close_drains_pending::<MemFactory>().await;
}

#[tokio::test]
async fn shared_connection() {
    tandem_testkit::run_shared_connection::<MemFactory>().await;
}

#[tokio::test]
async fn redial_after_close() {
    init_tracing();
    tandem_testkit::run_redial_after_close::<MemFactory>().await;
}

#[tokio::test]
async fn dropped_factory() {
    init_tracing();
    tandem_testkit::run_dropped_factory::<MemFactory>().await;
}

#[tokio::test]
async fn reconnect() {
    init_tracing();
    tandem_testkit::run_reconnect::<MemFactory>().await;
}

#[tokio::test]
async fn reconnect_is_bounded() {
    tandem_testkit::run_reconnect_is_bounded::<MemFactory>().await;
}

#[tokio::test]
async fn callback() {
    init_tracing();
    tandem_testkit::run_callback::<MemFactory>().await;
}

#[tokio::test]
async fn bodies() {
    tandem_testkit::run_bodies::<MemFactory>().await;
}

#[tokio::test]
async fn dropped_download() {
    tandem_testkit::run_dropped_download::<MemFactory>().await;
}

// Scenarios on a multi-threaded runtime, where handlers and the receive loop
// really run in parallel.

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_calls_multi_thread() {
    init_tracing();
    tandem_testkit::run_concurrent_calls::<MemFactory>().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancellation_multi_thread() {
    tandem_testkit::run_cancellation::<MemFactory>().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reconnect_multi_thread() {
    tandem_testkit::run_reconnect::<MemFactory>().await;
}
