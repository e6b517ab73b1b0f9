//! Per-connection settings.

use std::time::Duration;

use crate::Encoding;
use crate::frame::MAX_FRAME_PAYLOAD;

const DEFAULT_MAX_MESSAGE_MB: usize = 16;
const DEFAULT_MAX_PENDING: usize = 8192;
const DEFAULT_BODY_CHUNK_SIZE: usize = 64 * 1024;

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

/// Settings for one [`Connection`](crate::Connection).
///
/// [`ConnectionConfig::from_env`] reads:
///
/// - `TANDEM_ENCODING` (`json` or `postcard`)
/// - `TANDEM_MAX_MESSAGE_MB`
/// - `TANDEM_MAX_PENDING`
/// - `TANDEM_IDLE_TIMEOUT_MS`
///
/// Absent or unparseable values fall back to the defaults.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub encoding: Encoding,
    /// Largest accepted frame payload, in megabytes.
    pub max_message_size_mb: usize,
    /// Outbound calls allowed to wait for a response at once.
    pub max_pending: usize,
    /// Close the connection when nothing arrives for this long.
    pub idle_timeout: Option<Duration>,
    /// Chunk size used when relaying raw bodies.
    pub body_chunk_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            encoding: Encoding::Json,
            max_message_size_mb: DEFAULT_MAX_MESSAGE_MB,
            max_pending: DEFAULT_MAX_PENDING,
            idle_timeout: None,
            body_chunk_size: DEFAULT_BODY_CHUNK_SIZE,
        }
    }
}

impl ConnectionConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            encoding: env_parse("TANDEM_ENCODING").unwrap_or(defaults.encoding),
            max_message_size_mb: env_parse("TANDEM_MAX_MESSAGE_MB")
                .filter(|v| *v > 0)
                .unwrap_or(defaults.max_message_size_mb),
            max_pending: env_parse("TANDEM_MAX_PENDING")
                .filter(|v| *v > 0)
                .unwrap_or(defaults.max_pending),
            idle_timeout: env_parse::<u64>("TANDEM_IDLE_TIMEOUT_MS")
                .filter(|v| *v > 0)
                .map(Duration::from_millis),
            body_chunk_size: defaults.body_chunk_size,
        }
    }

    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn with_max_message_size_mb(mut self, mb: usize) -> Self {
        self.max_message_size_mb = mb;
        self
    }

    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = Some(idle_timeout);
        self
    }

    pub fn with_body_chunk_size(mut self, size: usize) -> Self {
        self.body_chunk_size = size.max(1);
        self
    }

    /// The frame payload limit in bytes, capped at what a frame header can
    /// describe.
    pub fn max_payload_bytes(&self) -> usize {
        self.max_message_size_mb
            .saturating_mul(1024 * 1024)
            .min(MAX_FRAME_PAYLOAD)
    }
}
