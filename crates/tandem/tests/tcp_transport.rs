//! Conformance scenarios over loopback TCP.

use std::sync::Once;

use tandem::transport::tcp::TcpAcceptor;
use tandem_testkit::{Bound, TestError, TransportFactory};

static INIT: Once = Once::new();

fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .init();
    });
}

struct TcpFactory;

impl TransportFactory for TcpFactory {
    async fn bind() -> Result<Bound, TestError> {
        let acceptor = TcpAcceptor::bind("127.0.0.1:0").await?;
        let connector = acceptor.connector();
        Ok(Bound::new(acceptor, connector))
    }
}

macro_rules! conformance {
    ($($name:ident => $scenario:ident),* $(,)?) => {
        $(
            #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
            async fn $name() {
                init_tracing();
                tandem_testkit::$scenario::<TcpFactory>().await;
            }
        )*
    };
}

conformance! {
    happy_path => run_happy_path,
    postcard_encoding => run_postcard_encoding,
    concurrent_calls => run_concurrent_calls,
    remote_fault_chain => run_remote_fault_chain,
    routing_faults => run_routing_faults,
    one_way => run_one_way,
    cancellation => run_cancellation,
    timeout => run_timeout,
    close_drains_pending => run_close_drains_pending,
    shared_connection => run_shared_connection,
    redial_after_close => run_redial_after_close,
    dropped_factory => run_dropped_factory,
    reconnect => run_reconnect,
    callback => run_callback,
    bodies => run_bodies,
    dropped_download => run_dropped_download,
}
