//! Wire envelopes carried in frame payloads.
//!
//! Field names on the wire are PascalCase (`Id`, `Endpoint`, `MethodName`,
//! ...). Arguments and results are opaque [`Payload`]s produced by the
//! connection's [`Encoding`](crate::Encoding): with JSON they appear as JSON
//! strings holding JSON text (`"Parameters":["1","2"]`), with postcard as
//! byte arrays.

use std::fmt;

use bytes::Bytes;
use serde::de::{self, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// An encoded argument or result.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Payload(pub Bytes);

impl Payload {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(text) => write!(f, "Payload({text:?})"),
            Err(_) => write!(f, "Payload({} bytes)", self.0.len()),
        }
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Self(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<Vec<u8>> for Payload {
    fn from(v: Vec<u8>) -> Self {
        Self(Bytes::from(v))
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            let text = std::str::from_utf8(&self.0).map_err(serde::ser::Error::custom)?;
            serializer.serialize_str(text)
        } else {
            serializer.serialize_bytes(&self.0)
        }
    }
}

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct PayloadVisitor;

        impl<'de> Visitor<'de> for PayloadVisitor {
            type Value = Payload;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an encoded payload as a string or bytes")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Payload, E> {
                Ok(Payload(Bytes::copy_from_slice(v.as_bytes())))
            }

            fn visit_string<E: de::Error>(self, v: String) -> Result<Payload, E> {
                Ok(Payload(Bytes::from(v.into_bytes())))
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Payload, E> {
                Ok(Payload(Bytes::copy_from_slice(v)))
            }

            fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Payload, E> {
                Ok(Payload(Bytes::from(v)))
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Payload, A::Error> {
                let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(b) = seq.next_element::<u8>()? {
                    out.push(b);
                }
                Ok(Payload(Bytes::from(out)))
            }
        }

        if deserializer.is_human_readable() {
            deserializer.deserialize_str(PayloadVisitor)
        } else {
            deserializer.deserialize_bytes(PayloadVisitor)
        }
    }
}

/// A call from one peer to the other.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Request {
    pub id: u64,
    pub endpoint: String,
    pub method_name: String,
    pub parameters: Vec<Payload>,
    /// Zero means no explicit deadline.
    pub timeout_in_seconds: f64,
    #[serde(default)]
    pub trace_id: Option<String>,
    /// Number of raw body bytes that follow this frame on the stream.
    #[serde(default)]
    pub stream_length: Option<u64>,
}

/// The answer to a two-way [`Request`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Response {
    pub request_id: u64,
    pub data: Option<Payload>,
    pub error: Option<ErrorInfo>,
    /// Number of raw body bytes that follow this frame on the stream.
    #[serde(default)]
    pub stream_length: Option<u64>,
}

impl Response {
    pub fn success(request_id: u64, data: Option<Payload>) -> Self {
        Self {
            request_id,
            data,
            error: None,
            stream_length: None,
        }
    }

    pub fn failure(request_id: u64, error: ErrorInfo) -> Self {
        Self {
            request_id,
            data: None,
            error: Some(error),
            stream_length: None,
        }
    }
}

/// Asks the peer to abandon in-flight work for `request_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Cancellation {
    pub request_id: u64,
}

/// A serializer-agnostic description of a failure and its causes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ErrorInfo {
    pub message: String,
    #[serde(default)]
    pub stack_trace: String,
    #[serde(rename = "Type")]
    pub error_type: String,
    #[serde(default)]
    pub inner: Option<Box<ErrorInfo>>,
}

impl ErrorInfo {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack_trace: String::new(),
            error_type: error_type.into(),
            inner: None,
        }
    }

    pub fn with_inner(mut self, inner: ErrorInfo) -> Self {
        self.inner = Some(Box::new(inner));
        self
    }

    pub fn with_stack_trace(mut self, stack_trace: impl Into<String>) -> Self {
        self.stack_trace = stack_trace.into();
        self
    }

    /// This descriptor followed by each nested cause.
    pub fn chain(&self) -> impl Iterator<Item = &ErrorInfo> {
        std::iter::successors(Some(self), |e| e.inner.as_deref())
    }

    pub fn is_type(&self, error_type: &str) -> bool {
        self.error_type == error_type
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_type, self.message)
    }
}

impl std::error::Error for ErrorInfo {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}
