//! tandem: bidirectional RPC over a single duplex byte stream.
//!
//! Either side of a connection can call the other. Requests, responses and
//! cancellations share one stream, correlated by request id, so many calls
//! can be in flight at once and a server can call back into its client
//! without a second connection.
//!
//! # Quick Start
//!
//! Build an endpoint, serve it, and call it through a typed proxy:
//!
//! ```ignore
//! use std::sync::Arc;
//! use tandem::prelude::*;
//! use tandem::transport::tcp::TcpAcceptor;
//!
//! struct Math;
//!
//! tandem::proxy! {
//!     pub struct MathProxy for "IMath" {
//!         rpc "Sum" => fn sum(a: i32, b: i32) -> i32;
//!     }
//! }
//!
//! let endpoint = Endpoint::builder("IMath", Arc::new(Math))
//!     .rpc("Sum", |_svc: Arc<Math>, _ctx, (a, b): (i32, i32)| async move { Ok(a + b) })
//!     .build()?;
//! let router = Router::builder().endpoint(endpoint).build()?;
//!
//! let acceptor = TcpAcceptor::bind("127.0.0.1:0").await?;
//! let connector = acceptor.connector();
//! let server = Server::start(router, [ListenerConfig::new(acceptor)]);
//!
//! let factory = ClientFactory::new();
//! let math: MathProxy = factory.proxy(connector);
//! assert_eq!(math.sum(1, 2).await?, 3);
//! ```
//!
//! # Cancellation and timeouts
//!
//! Every call has a deadline (per call via [`CallOptions`], else the
//! client's default) and may carry a [`CancelToken`]. Whichever fires first
//! decides the error: [`RpcError::Timeout`] or [`RpcError::Cancelled`]. Either
//! way a cancellation frame goes to the peer, whose handler sees its
//! [`CallContext`] token fire.
//!
//! # Callbacks
//!
//! A handler reaches the caller through [`CallContext::callback`]. The
//! client side serves callbacks by giving its [`ClientFactory`] a router with
//! [`ClientFactory::with_callbacks`]. Callbacks ride the connection the
//! request came in on.
//!
//! # Error Handling
//!
//! Handlers return `Result<T, Fault>`, and `?` converts any error into a
//! [`Fault`] that keeps its type name, message and source chain. Callers get
//! it back as [`RpcError::Remote`]:
//!
//! ```ignore
//! match math.sum(1, 2).await {
//!     Ok(sum) => println!("{sum}"),
//!     Err(RpcError::Remote(info)) => {
//!         for cause in info.chain() {
//!             eprintln!("{}: {}", cause.error_type, cause.message);
//!         }
//!     }
//!     Err(e) => eprintln!("call failed: {e}"),
//! }
//! ```

#![forbid(unsafe_code)]

mod client;
mod context;
mod error;
mod factory;
pub mod fault;
mod params;
mod proxy;
mod registry;
mod router;
mod scheduler;
mod server;
mod service;
pub mod transport;

#[doc(hidden)]
pub extern crate tandem_core;

pub use tandem_core::{
    Body, BodySource, CancelToken, Connection, ConnectionConfig, ConnectionId, ConnectionState,
    CorrelationTable, DecodeError, EncodeError, Encoding, ErrorInfo, FrameError, Payload, RpcError,
};

pub use client::{CallOptions, ClientOptions, ServiceClient};
pub use context::CallContext;
pub use error::ConfigError;
pub use factory::ClientFactory;
pub use fault::Fault;
pub use params::{FromParams, IntoParams};
pub use proxy::Proxy;
pub use registry::{ConnectionHandle, ConnectionRegistry, Dialer};
pub use router::{Router, RouterBuilder};
pub use scheduler::{LimitedScheduler, RuntimeScheduler, Scheduler, TokioScheduler};
pub use server::{AcceptPolicy, ListenerConfig, Server, ServerBuilder};
pub use service::{
    Endpoint, EndpointBuilder, InstanceProvider, Invocation, MethodDescriptor, MethodKind, Outcome,
};
pub use transport::{ConnectionIdentity, Connector, Listener, PeerInfo};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::{
        Body, BodySource, CallContext, CallOptions, CancelToken, ClientFactory, ClientOptions,
        Endpoint, Fault, ListenerConfig, Proxy, Router, RpcError, Server, ServiceClient,
    };
}
