//! Math over tandem - Demo Binary
//!
//! One process plays both roles over loopback TCP:
//! - The **server** hosts `IMath`. `Count` reports progress by calling back
//!   into whoever called it.
//! - The **client** hosts `IProgress` for those callbacks and calls `IMath`.
//!
//! Set `MATH_DEMO_ADDR` to pick the listen address (default `127.0.0.1:0`),
//! and `RUST_LOG` to see what the runtime is doing.

use std::sync::Arc;
use std::time::Duration;

use tandem::prelude::*;
use tandem::transport::tcp::TcpAcceptor;
use tandem::ConfigError;

struct Math;

tandem::proxy! {
    pub struct MathProxy for "IMath" {
        rpc "Sum" => fn sum(a: i64, b: i64) -> i64;
        rpc "Divide" => fn divide(a: i64, b: i64) -> i64;
        rpc "Count" => fn count(to: u32) -> u32;
    }
}

tandem::proxy! {
    pub struct ProgressProxy for "IProgress" {
        rpc "Report" => fn report(done: u32, total: u32);
    }
}

#[derive(Debug)]
struct DivideByZero;

impl std::fmt::Display for DivideByZero {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "division by zero")
    }
}

impl std::error::Error for DivideByZero {}

fn math_router() -> Result<Router, ConfigError> {
    let endpoint = Endpoint::builder("IMath", Arc::new(Math))
        .callback_contract("IProgress")
        .rpc("Sum", |_svc, _ctx, (a, b): (i64, i64)| async move { Ok(a + b) })
        .rpc("Divide", |_svc, _ctx, (a, b): (i64, i64)| async move {
            if b == 0 {
                return Err(Fault::from(DivideByZero));
            }
            Ok(a / b)
        })
        .rpc("Count", |_svc, ctx: CallContext, (to,): (u32,)| async move {
            let progress: ProgressProxy = ctx.callback();
            for done in 1..=to {
                if ctx.is_cancelled() {
                    return Err(Fault::msg("count abandoned"));
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
                progress.report(done, to).await?;
            }
            Ok::<_, Fault>(to)
        })
        .build()?;
    Router::builder().endpoint(endpoint).build()
}

fn progress_router() -> Result<Router, ConfigError> {
    let endpoint = Endpoint::builder("IProgress", Arc::new(()))
        .rpc("Report", |_svc, _ctx, (done, total): (u32, u32)| async move {
            println!("  progress: {done}/{total}");
            Ok(())
        })
        .build()?;
    Router::builder().endpoint(endpoint).build()
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();
    if let Err(e) = rt.block_on(async_main()) {
        eprintln!("demo failed: {e}");
        std::process::exit(1);
    }
}

async fn async_main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Math over tandem ===\n");

    let addr = std::env::var("MATH_DEMO_ADDR").unwrap_or_else(|_| "127.0.0.1:0".to_string());
    let acceptor = TcpAcceptor::bind(addr.as_str()).await?;
    let connector = acceptor.connector();
    println!("listening on {}", acceptor.local_addr());

    // ========== SERVER SIDE ==========
    let server = Server::start(math_router()?, [ListenerConfig::new(acceptor)]);

    // ========== CLIENT SIDE ==========
    let factory = ClientFactory::new().with_callbacks(progress_router()?);
    let math: MathProxy = factory.proxy(connector);

    println!("\n--- Sum ---");
    println!("  19 + 23 = {}", math.sum(19, 23).await?);

    println!("\n--- Divide ---");
    println!("  84 / 2 = {}", math.divide(84, 2).await?);
    match math.divide(1, 0).await {
        Err(RpcError::Remote(info)) => println!("  1 / 0 failed remotely: {info}"),
        other => println!("  1 / 0 unexpectedly gave {other:?}"),
    }

    println!("\n--- Count with progress callbacks ---");
    let counted = math.count(5).await?;
    println!("  counted to {counted}");

    println!("\n--- Count with a timeout ---");
    let hurried = math.with_options(CallOptions::new().with_timeout(Duration::from_millis(50)));
    match hurried.count(100).await {
        Err(RpcError::Timeout { endpoint, method }) => {
            println!("  {endpoint}.{method} timed out as expected")
        }
        other => println!("  unexpected result {other:?}"),
    }

    factory.close();
    server.stop().await;
    println!("\n=== Demo Complete ===");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn serve() -> (Server, MathProxy, ClientFactory) {
        let acceptor = TcpAcceptor::bind("127.0.0.1:0").await.unwrap();
        let connector = acceptor.connector();
        let server = Server::start(math_router().unwrap(), [ListenerConfig::new(acceptor)]);
        let factory = ClientFactory::new().with_callbacks(progress_router().unwrap());
        let math = factory.proxy(connector);
        (server, math, factory)
    }

    #[tokio::test]
    async fn sums_over_tcp() {
        let (server, math, _factory) = serve().await;
        assert_eq!(math.sum(2, 3).await.unwrap(), 5);
        server.stop().await;
    }

    #[tokio::test]
    async fn divide_by_zero_is_a_remote_fault() {
        let (server, math, _factory) = serve().await;
        let err = math.divide(1, 0).await.unwrap_err();
        let info = err.remote().expect("remote fault");
        assert!(info.error_type.ends_with("DivideByZero"), "{info:?}");
        assert_eq!(info.message, "division by zero");
        server.stop().await;
    }

    #[tokio::test]
    async fn count_calls_back_into_the_client() {
        let (server, math, _factory) = serve().await;
        assert_eq!(math.count(3).await.unwrap(), 3);
        server.stop().await;
    }
}
