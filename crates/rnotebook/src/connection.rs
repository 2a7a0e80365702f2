//! Content-Length framing for the interpreter socket.
//!
//! Every message in both directions is a JSON payload preceded by a one-line
//! header giving its exact byte length:
//!
//! ```text
//! Content-Length: <n>\n<n bytes of JSON>
//! ```
//!
//! There is no trailing delimiter, so payloads may contain newlines or
//! anything else. Reads are buffered in a [`FrameDecoder`]; a single socket
//! read may carry part of a frame or several frames at once.

use bytes::{Buf, Bytes, BytesMut};
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Header prefix announcing the payload length.
pub const CONTENT_LENGTH: &str = "Content-Length:";

/// Maximum payload size: 100 MiB. Large text results are fine, runaway
/// length headers are not.
pub const MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

/// Longest header line we are willing to buffer before giving up on finding
/// its newline.
const MAX_HEADER_LEN: usize = 64;

fn invalid_data(message: impl Into<String>) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, message.into())
}

/// Encode a payload as a complete frame (header + body).
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let header = format!("{} {}\n", CONTENT_LENGTH, payload.len());
    let mut frame = Vec::with_capacity(header.len() + payload.len());
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Send a Content-Length framed payload.
pub async fn send_frame<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> std::io::Result<()> {
    writer.write_all(&encode_frame(data)).await?;
    writer.flush().await?;
    Ok(())
}

/// Send a value as a JSON-encoded frame.
pub async fn send_json_frame<W: AsyncWrite + Unpin, T: Serialize>(
    writer: &mut W,
    value: &T,
) -> anyhow::Result<()> {
    let data = serde_json::to_vec(value)?;
    send_frame(writer, &data).await?;
    Ok(())
}

fn parse_header(line: &[u8]) -> std::io::Result<usize> {
    let line = std::str::from_utf8(line).map_err(|_| invalid_data("frame header is not UTF-8"))?;
    let line = line.strip_suffix('\r').unwrap_or(line);
    let value = line
        .strip_prefix(CONTENT_LENGTH)
        .ok_or_else(|| invalid_data(format!("expected Content-Length header, got {:?}", line)))?;
    value
        .trim()
        .parse::<usize>()
        .map_err(|_| invalid_data(format!("invalid Content-Length value: {:?}", value.trim())))
}

/// Incremental decoder that reassembles frames from arbitrary read chunks.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_frame_size: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(8 * 1024),
            max_frame_size,
        }
    }

    /// Append raw bytes read from the socket.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// True when no partial frame is buffered.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Pop the next complete frame payload, or `None` if more bytes are needed.
    pub fn decode(&mut self) -> std::io::Result<Option<Bytes>> {
        let Some(newline) = self.buf.iter().position(|b| *b == b'\n') else {
            if self.buf.len() > MAX_HEADER_LEN {
                return Err(invalid_data("frame header too long"));
            }
            return Ok(None);
        };
        if newline > MAX_HEADER_LEN {
            return Err(invalid_data("frame header too long"));
        }

        let len = parse_header(&self.buf[..newline])?;
        if len > self.max_frame_size {
            return Err(invalid_data(format!(
                "frame too large: {} bytes (max {})",
                len, self.max_frame_size
            )));
        }

        let total = newline + 1 + len;
        if self.buf.len() < total {
            self.buf.reserve(total - self.buf.len());
            return Ok(None);
        }

        self.buf.advance(newline + 1);
        Ok(Some(self.buf.split_to(len).freeze()))
    }
}

/// Reader half of a framed connection.
pub struct FramedReader<R> {
    reader: R,
    decoder: FrameDecoder,
}

impl<R: AsyncRead + Unpin> FramedReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            decoder: FrameDecoder::new(),
        }
    }

    /// Receive the next frame payload.
    /// Returns `None` on clean disconnect (EOF on a frame boundary).
    pub async fn next_frame(&mut self) -> std::io::Result<Option<Bytes>> {
        loop {
            if let Some(frame) = self.decoder.decode()? {
                return Ok(Some(frame));
            }
            let n = self.reader.read_buf(self.decoder.buffer_mut()).await?;
            if n == 0 {
                if self.decoder.is_empty() {
                    return Ok(None);
                }
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed in the middle of a frame",
                ));
            }
        }
    }

    /// Receive and deserialize a JSON frame.
    /// Returns `None` on clean disconnect.
    pub async fn next_json<T: DeserializeOwned>(&mut self) -> anyhow::Result<Option<T>> {
        match self.next_frame().await? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }
}
