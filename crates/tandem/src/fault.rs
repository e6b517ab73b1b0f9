//! Handler-side failures, and the error type names the runtime itself uses.

use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::error::Error as StdError;
use std::fmt;

pub use tandem_core::fault::{
    CANCELLED, ENCODE, GENERIC, INVALID_ARGUMENTS, NOT_SCHEDULED, PANIC, TIMEOUT,
    UNKNOWN_ENDPOINT, UNKNOWN_METHOD,
};
use tandem_core::{DecodeError, ErrorInfo};

/// The error type endpoint handlers return.
///
/// Any `std::error::Error` converts into a `Fault` with `?`. The conversion
/// records the concrete type name, the message, a backtrace when
/// `RUST_BACKTRACE` enables one, and every `source()` as a nested cause. The
/// caller receives all of it as [`RpcError::Remote`](crate::RpcError::Remote).
#[derive(Debug, Clone)]
pub struct Fault {
    info: ErrorInfo,
}

impl Fault {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            info: ErrorInfo::new(error_type, message),
        }
    }

    /// A fault with just a message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(GENERIC, message)
    }

    /// Wrap a descriptor received from elsewhere, unchanged.
    pub fn from_info(info: ErrorInfo) -> Self {
        Self { info }
    }

    /// Describe `error` and its chain of sources.
    pub fn from_error(error_type: &str, error: &(dyn StdError + 'static)) -> Self {
        if let Some(info) = error.downcast_ref::<ErrorInfo>() {
            return Self::from_info(info.clone());
        }

        let mut info = ErrorInfo::new(error_type, error.to_string()).with_stack_trace(capture_stack());
        info.inner = error.source().map(|source| Box::new(describe_source(source)));
        Self { info }
    }

    pub fn with_inner(mut self, inner: Fault) -> Self {
        self.info.inner = Some(Box::new(inner.info));
        self
    }

    pub fn info(&self) -> &ErrorInfo {
        &self.info
    }

    pub fn into_info(self) -> ErrorInfo {
        self.info
    }

    pub(crate) fn invalid_arguments(e: DecodeError) -> Self {
        Self::new(INVALID_ARGUMENTS, e.to_string())
    }

    pub(crate) fn from_panic(panic: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = panic.downcast_ref::<&str>() {
            format!("panic in handler: {s}")
        } else if let Some(s) = panic.downcast_ref::<String>() {
            format!("panic in handler: {s}")
        } else {
            "panic in handler".to_string()
        };
        Self::new(PANIC, message)
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.info, f)
    }
}

impl<E> From<E> for Fault
where
    E: StdError + Send + Sync + 'static,
{
    fn from(error: E) -> Self {
        Fault::from_error(std::any::type_name::<E>(), &error)
    }
}

fn describe_source(error: &(dyn StdError + 'static)) -> ErrorInfo {
    if let Some(info) = error.downcast_ref::<ErrorInfo>() {
        return info.clone();
    }
    let mut info = ErrorInfo::new(debug_type_name(error), error.to_string());
    info.inner = error.source().map(|source| Box::new(describe_source(source)));
    info
}

/// Sources are only reachable as trait objects, so their type name comes
/// from the leading identifier of their `Debug` output.
fn debug_type_name(error: &dyn StdError) -> String {
    let debug = format!("{error:?}");
    let name: String = debug
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_' || *c == ':')
        .collect();
    if name.is_empty() {
        "error".to_string()
    } else {
        name
    }
}

fn capture_stack() -> String {
    let backtrace = Backtrace::capture();
    match backtrace.status() {
        BacktraceStatus::Captured => backtrace.to_string(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("could not load settings")]
    struct LoadError {
        #[source]
        cause: std::io::Error,
    }

    fn load() -> Result<(), Fault> {
        Err::<(), _>(LoadError {
            cause: std::io::Error::new(std::io::ErrorKind::NotFound, "settings.toml missing"),
        })?;
        Ok(())
    }

    #[test]
    fn question_mark_captures_type_and_chain() {
        let fault = load().unwrap_err();
        let info = fault.info();
        assert!(info.error_type.ends_with("LoadError"), "{}", info.error_type);
        assert_eq!(info.message, "could not load settings");

        let inner = info.inner.as_deref().expect("cause");
        assert_eq!(inner.message, "settings.toml missing");
        assert!(inner.inner.is_none());
    }

    #[test]
    fn remote_descriptors_pass_through() {
        let remote = ErrorInfo::new("peer::Boom", "boom").with_inner(ErrorInfo::new("x", "y"));
        let fault = Fault::from(remote.clone());
        assert_eq!(fault.into_info(), remote);
    }

    #[test]
    fn panics_become_faults() {
        let fault = Fault::from_panic(Box::new("kaboom"));
        assert!(fault.info().is_type(PANIC));
        assert!(fault.info().message.contains("kaboom"));

        let fault = Fault::from_panic(Box::new(String::from("owned")));
        assert!(fault.info().message.contains("owned"));
    }

    #[test]
    fn message_faults() {
        let fault = Fault::msg("nope").with_inner(Fault::new("inner::Type", "because"));
        assert_eq!(fault.to_string(), "tandem::Fault: nope");
        assert_eq!(fault.info().chain().count(), 2);
    }
}
