//! tandem-core: the protocol engine underneath tandem.
//!
//! This crate defines:
//! - The frame codec ([`Frame`], [`FrameType`], [`read_frame`], [`write_frame`])
//! - Wire envelopes ([`Request`], [`Response`], [`Cancellation`], [`ErrorInfo`])
//! - Payload encodings ([`Encoding`])
//! - The correlation table ([`CorrelationTable`], [`PendingCall`])
//! - Raw body relay ([`Body`], [`BodySource`])
//! - The connection ([`Connection`], [`InboundHandler`])
//! - Cooperative cancellation ([`CancelToken`])
//! - Errors ([`RpcError`], [`FrameError`])
//!
//! Endpoint routing, clients, registries and transports live in the `tandem`
//! crate.

#![forbid(unsafe_code)]

mod body;
mod cancel;
mod config;
mod connection;
mod correlation;
mod encoding;
mod error;
mod frame;
mod message;

pub use body::{Body, BodySource};
pub use cancel::{CancelToken, cancelled_or_pending};
pub use config::ConnectionConfig;
pub use connection::{
    BoxedStream, Connection, ConnectionId, ConnectionState, InboundHandler, IoStream,
};
pub use correlation::{CorrelationTable, PendingCall, Reply};
pub use encoding::Encoding;
pub use error::{DecodeError, EncodeError, FrameError, RpcError, fault};
pub use frame::{
    Frame, FrameType, HEADER_SIZE, MAX_FRAME_PAYLOAD, decode_header, encode_header, read_frame,
    read_full, write_frame,
};
pub use message::{Cancellation, ErrorInfo, Payload, Request, Response};
