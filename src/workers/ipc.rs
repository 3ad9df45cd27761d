//! Content-Length framed JSON messages over a byte stream.
//!
//! Same framing as LSP: `Content-Length: N\r\n\r\n` followed by N bytes of
//! JSON. Used over a worker's stdin/stdout, so stdout must carry nothing else.

use crate::error::IpcError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frames larger than this are rejected rather than allocated.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const HEADER_PREFIX: &str = "Content-Length: ";

pub struct FrameReader<R> {
    reader: R,
    line_buffer: String,
}

impl<R: AsyncBufRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line_buffer: String::new(),
        }
    }

    /// Read the next message. `Ok(None)` on a clean EOF between frames.
    pub async fn read_frame<T: DeserializeOwned>(&mut self) -> Result<Option<T>, IpcError> {
        // Content-Lengthヘッダーを読み取り
        let content_length = loop {
            self.line_buffer.clear();
            let bytes_read = self.reader.read_line(&mut self.line_buffer).await?;
            if bytes_read == 0 {
                log::trace!("EOF reached on IPC stream");
                return Ok(None);
            }

            let header_line = self.line_buffer.trim();
            if header_line.is_empty() {
                continue;
            }

            let Some(length_str) = header_line.strip_prefix(HEADER_PREFIX) else {
                return Err(IpcError::MissingHeader(header_line.to_string()));
            };
            let length = length_str
                .trim()
                .parse::<usize>()
                .map_err(|_| IpcError::InvalidLength(length_str.to_string()))?;
            if length > MAX_FRAME_LEN {
                return Err(IpcError::FrameTooLarge(length));
            }
            break length;
        };

        // ヘッダー終端の空行をスキップ
        loop {
            self.line_buffer.clear();
            let bytes_read = self.reader.read_line(&mut self.line_buffer).await?;
            if bytes_read == 0 {
                return Err(IpcError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "EOF inside frame header",
                )));
            }
            if self.line_buffer.trim().is_empty() {
                break;
            }
        }

        let mut body = vec![0u8; content_length];
        self.reader.read_exact(&mut body).await?;
        let text = std::str::from_utf8(&body).map_err(|_| IpcError::InvalidUtf8)?;

        Ok(Some(serde_json::from_str(text)?))
    }
}

pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn write_frame<T: Serialize>(&mut self, message: &T) -> Result<(), IpcError> {
        let json = serde_json::to_string(message)?;
        let header = format!("{}{}\r\n\r\n", HEADER_PREFIX, json.len());

        self.writer.write_all(header.as_bytes()).await?;
        self.writer.write_all(json.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), IpcError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
