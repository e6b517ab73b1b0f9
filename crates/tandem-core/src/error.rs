//! Error types.
//!
//! Two families live here:
//!
//! - [`FrameError`]: failures reading or writing the 5-byte framed wire. These
//!   are always fatal to the connection they occur on.
//! - [`RpcError`]: the tagged outcome a caller observes when a call does not
//!   produce a value. Handler failures travel inside it as
//!   [`RpcError::Remote`]; routing failures on the receiving side arrive the
//!   same way, with a [`fault`] type name describing them.

use crate::message::ErrorInfo;

/// Well-known `Type` values placed in wire error descriptors by the router.
///
/// Handler-produced faults carry the Rust type name of the error instead.
pub mod fault {
    /// The request named an endpoint nobody registered.
    pub const UNKNOWN_ENDPOINT: &str = "tandem::UnknownEndpoint";
    /// The endpoint exists but has no method with the requested name.
    pub const UNKNOWN_METHOD: &str = "tandem::UnknownMethod";
    /// Arguments could not be bound to the method's parameters.
    pub const INVALID_ARGUMENTS: &str = "tandem::InvalidArguments";
    /// The server-side deadline elapsed before the handler finished.
    pub const TIMEOUT: &str = "tandem::Timeout";
    /// The request was cancelled before the handler finished.
    pub const CANCELLED: &str = "tandem::Cancelled";
    /// The handler panicked.
    pub const PANIC: &str = "tandem::Panic";
    /// The scheduler dropped the invocation without running it.
    pub const NOT_SCHEDULED: &str = "tandem::NotScheduled";
    /// The handler's result could not be serialized.
    pub const ENCODE: &str = "tandem::Encode";
    /// Plain message faults built with `Fault::msg`.
    pub const GENERIC: &str = "tandem::Fault";
}

/// Errors raised by the frame codec.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The stream ended cleanly on a frame boundary.
    #[error("stream closed")]
    Closed,

    /// The stream ended in the middle of a header or payload.
    #[error("stream ended mid-frame after {read} of {expected} bytes")]
    EndOfStream { read: usize, expected: usize },

    /// The declared payload length exceeds the configured maximum.
    #[error("frame payload of {len} bytes exceeds the {max} byte limit")]
    MessageTooLarge { len: usize, max: usize },

    /// The first header byte is not a known frame type.
    #[error("unknown frame type {0}")]
    UnknownFrameType(u8),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FrameError {
    /// True for errors caused by a misbehaving peer rather than a dead stream.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            FrameError::MessageTooLarge { .. } | FrameError::UnknownFrameType(_)
        )
    }
}

/// Serialization failure.
#[derive(Debug, thiserror::Error)]
#[error("{encoding} encode failed: {message}")]
pub struct EncodeError {
    pub encoding: &'static str,
    pub message: String,
}

/// Deserialization failure.
#[derive(Debug, thiserror::Error)]
#[error("{encoding} decode failed: {message}")]
pub struct DecodeError {
    pub encoding: &'static str,
    pub message: String,
}

/// The outcome of a call that did not produce a value.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// The remote handler failed, or the remote router could not route the request.
    #[error("remote fault: {0}")]
    Remote(ErrorInfo),

    /// The effective deadline elapsed before a response arrived.
    #[error("call to {endpoint}.{method} timed out")]
    Timeout { endpoint: String, method: String },

    /// The caller's cancellation token fired before a response arrived.
    #[error("call cancelled")]
    Cancelled,

    /// The connection closed before the call completed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The peer broke the framing or envelope rules.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Establishing the connection failed.
    #[error("failed to connect to {identity}: {source}")]
    Connect {
        identity: String,
        #[source]
        source: std::io::Error,
    },

    /// Too many calls are already waiting on this connection.
    #[error("too many pending calls (limit {limit})")]
    ResourceExhausted { limit: usize },

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl RpcError {
    /// True when the failure means the connection is gone.
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, RpcError::ConnectionClosed)
    }

    /// The remote error descriptor, if this is a remote fault.
    pub fn remote(&self) -> Option<&ErrorInfo> {
        match self {
            RpcError::Remote(info) => Some(info),
            _ => None,
        }
    }
}

impl From<FrameError> for RpcError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::MessageTooLarge { .. } | FrameError::UnknownFrameType(_) => {
                RpcError::Protocol(e.to_string())
            }
            FrameError::Closed | FrameError::EndOfStream { .. } | FrameError::Io(_) => {
                RpcError::ConnectionClosed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_errors_classify() {
        assert!(FrameError::UnknownFrameType(9).is_protocol_violation());
        assert!(FrameError::MessageTooLarge { len: 10, max: 1 }.is_protocol_violation());
        assert!(!FrameError::Closed.is_protocol_violation());
        assert!(!FrameError::EndOfStream { read: 2, expected: 5 }.is_protocol_violation());
    }

    #[test]
    fn frame_errors_map_to_rpc_errors() {
        assert!(RpcError::from(FrameError::Closed).is_connection_closed());
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        assert!(RpcError::from(FrameError::Io(io)).is_connection_closed());
        assert!(matches!(
            RpcError::from(FrameError::UnknownFrameType(7)),
            RpcError::Protocol(_)
        ));
    }

    #[test]
    fn timeout_names_the_method() {
        let err = RpcError::Timeout {
            endpoint: "IMath".into(),
            method: "Sum".into(),
        };
        assert_eq!(err.to_string(), "call to IMath.Sum timed out");
    }
}
