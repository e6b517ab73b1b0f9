//! The 5-byte framed wire.
//!
//! ```text
//! byte 0:      frame type (0 = Request, 1 = Response, 2 = Cancellation)
//! bytes 1-4:   little-endian u32 payload length (excludes these 5 bytes)
//! bytes 5..:   payload
//! ```
//!
//! Writers always hand the transport header and payload as one buffer, so a
//! message-oriented transport sees exactly one message per frame.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::FrameError;

/// Size of the fixed frame header.
pub const HEADER_SIZE: usize = 5;

/// Discriminant in byte 0 of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Request = 0,
    Response = 1,
    Cancellation = 2,
}

impl FrameType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Request),
            1 => Some(Self::Response),
            2 => Some(Self::Cancellation),
            _ => None,
        }
    }
}

impl std::fmt::Display for FrameType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Request => write!(f, "request"),
            Self::Response => write!(f, "response"),
            Self::Cancellation => write!(f, "cancellation"),
        }
    }
}

/// One header + payload unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub payload: Bytes,
}

/// The largest payload the 32-bit length field can describe.
pub const MAX_FRAME_PAYLOAD: usize = u32::MAX as usize;

impl Frame {
    pub fn new(frame_type: FrameType, payload: impl Into<Bytes>) -> Self {
        Self {
            frame_type,
            payload: payload.into(),
        }
    }

    /// Encode the header for this frame.
    ///
    /// The payload must be at most [`MAX_FRAME_PAYLOAD`] bytes; the connection
    /// limit and [`write_frame`] both enforce that.
    pub fn header(&self) -> [u8; HEADER_SIZE] {
        debug_assert!(self.payload.len() <= MAX_FRAME_PAYLOAD);
        let len = u32::try_from(self.payload.len()).unwrap_or(u32::MAX);
        encode_header(self.frame_type, len)
    }

    /// Header and payload concatenated into a single buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_slice(&self.header());
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

pub fn encode_header(frame_type: FrameType, len: u32) -> [u8; HEADER_SIZE] {
    let len = len.to_le_bytes();
    [frame_type as u8, len[0], len[1], len[2], len[3]]
}

/// Parse a header. The length is returned unchecked.
pub fn decode_header(header: &[u8; HEADER_SIZE]) -> Result<(FrameType, usize), FrameError> {
    let frame_type =
        FrameType::from_u8(header[0]).ok_or(FrameError::UnknownFrameType(header[0]))?;
    let len = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
    Ok((frame_type, len))
}

/// Read one frame.
///
/// A stream that ends before the first header byte yields
/// [`FrameError::Closed`]; one that ends anywhere later yields
/// [`FrameError::EndOfStream`]. The payload buffer is only allocated after the
/// declared length has been checked against `max_payload`.
pub async fn read_frame<R>(reader: &mut R, max_payload: usize) -> Result<Frame, FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; HEADER_SIZE];
    let mut filled = 0;
    while filled < HEADER_SIZE {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            return Err(if filled == 0 {
                FrameError::Closed
            } else {
                FrameError::EndOfStream {
                    read: filled,
                    expected: HEADER_SIZE,
                }
            });
        }
        filled += n;
    }

    let (frame_type, len) = decode_header(&header)?;
    if len > max_payload {
        return Err(FrameError::MessageTooLarge {
            len,
            max: max_payload,
        });
    }

    let mut payload = vec![0u8; len];
    read_full(reader, &mut payload).await?;

    Ok(Frame {
        frame_type,
        payload: Bytes::from(payload),
    })
}

/// Fill `buf` completely, reporting a short stream as [`FrameError::EndOfStream`].
pub async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(FrameError::EndOfStream {
                read: filled,
                expected: buf.len(),
            });
        }
        filled += n;
    }
    Ok(())
}

/// Write one frame as a single buffer and flush.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if frame.payload.len() > MAX_FRAME_PAYLOAD {
        return Err(FrameError::MessageTooLarge {
            len: frame.payload.len(),
            max: MAX_FRAME_PAYLOAD,
        });
    }
    writer.write_all(&frame.to_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
