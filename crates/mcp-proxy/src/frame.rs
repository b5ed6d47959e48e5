//! Duplex JSON-RPC framing over arbitrary async byte streams, with
//! autodetection between length-prefixed (`Content-Length`) and
//! newline-delimited wire conventions.
//!
//! The newline half is grounded on the reader/writer task split in
//! `crates/codex/src/mcp/jsonrpc.rs` (`BufReader::lines`, one JSON value per
//! line). The header half is grounded on the `Content-Length` parsing loop in
//! `other_examples/07772324_tomatyss-taskter__src-mcp-mod.rs.rs::read_message`.
//! The autodetect rule picks the convention from the first non-whitespace
//! byte of the first successful read and pins it for the lifetime of the
//! stream: it avoids the speculative-parse-then-rewind the taskter example
//! uses, trading a small amount of duplication for bounded, deterministic
//! buffering.

use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use crate::error::McpError;

/// Which wire convention a `FrameStream` uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum StdioMode {
    #[default]
    Auto,
    Header,
    Newline,
}

/// Outcome of a single `FrameStream::read` call.
#[derive(Debug)]
pub enum Frame {
    /// A successfully decoded JSON-RPC message.
    Message(Value),
    /// The underlying stream reached EOF; the connection is done.
    Closed,
}

/// A duplex framing layer: reads and writes whole JSON-RPC messages over an
/// underlying byte stream, pinning the wire convention to whatever is
/// observed on the first successful read.
pub struct FrameStream<R, W> {
    reader: Mutex<BufReader<R>>,
    writer: Mutex<W>,
    mode: Mutex<StdioMode>,
}

impl<R, W> FrameStream<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W, preferred: StdioMode) -> Self {
        let pinned = match preferred {
            StdioMode::Auto => StdioMode::Header,
            other => other,
        };
        Self {
            reader: Mutex::new(BufReader::new(reader)),
            writer: Mutex::new(writer),
            mode: Mutex::new(pinned),
        }
    }

    /// Read one frame. Autodetects wire convention on the very first call
    /// when `preferred` was `Auto`; afterwards the detected mode is pinned.
    pub async fn read(&self) -> Result<Frame, McpError> {
        let mut reader = self.reader.lock().await;

        let first_byte = match peek_non_whitespace(&mut *reader).await? {
            Some(b) => b,
            None => return Ok(Frame::Closed),
        };

        if first_byte == b'{' || first_byte == b'[' {
            *self.mode.lock().await = StdioMode::Newline;
            return read_newline_frame(&mut *reader).await;
        }

        *self.mode.lock().await = StdioMode::Header;
        read_header_frame(&mut *reader).await
    }

    /// Write one frame, serialized by a single mutex so concurrent
    /// producers cannot interleave bytes.
    pub async fn write(&self, value: &Value) -> Result<(), McpError> {
        let body = serde_json::to_string(value)?;
        let mode = *self.mode.lock().await;
        let mut writer = self.writer.lock().await;

        match mode {
            StdioMode::Newline => {
                writer
                    .write_all(body.as_bytes())
                    .await
                    .map_err(|e| McpError::Transport(e.to_string()))?;
                writer
                    .write_all(b"\n")
                    .await
                    .map_err(|e| McpError::Transport(e.to_string()))?;
            }
            StdioMode::Header | StdioMode::Auto => {
                let header = format!("Content-Length: {}\r\n\r\n", body.len());
                writer
                    .write_all(header.as_bytes())
                    .await
                    .map_err(|e| McpError::Transport(e.to_string()))?;
                writer
                    .write_all(body.as_bytes())
                    .await
                    .map_err(|e| McpError::Transport(e.to_string()))?;
            }
        }
        writer
            .flush()
            .await
            .map_err(|e| McpError::Transport(e.to_string()))
    }
}

/// Peek the first non-whitespace byte without consuming non-whitespace
/// bytes, consuming (and discarding) any leading whitespace. Returns `None`
/// on EOF.
async fn peek_non_whitespace<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<Option<u8>, McpError> {
    loop {
        let buf = reader
            .fill_buf()
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;
        if buf.is_empty() {
            return Ok(None);
        }
        let first = buf[0];
        if first.is_ascii_whitespace() {
            reader.consume(1);
            continue;
        }
        return Ok(Some(first));
    }
}

async fn read_newline_frame<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Frame, McpError> {
    let mut line = String::new();
    let n = reader
        .read_line(&mut line)
        .await
        .map_err(|e| McpError::Transport(e.to_string()))?;
    if n == 0 {
        return Ok(Frame::Closed);
    }
    let trimmed = line.trim_end();
    if trimmed.is_empty() {
        return Ok(Frame::Closed);
    }
    let value: Value = serde_json::from_str(trimmed)?;
    Ok(Frame::Message(value))
}

async fn read_header_frame<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Frame, McpError> {
    let mut content_length: Option<usize> = None;

    loop {
        let mut line = String::new();
        let n = reader
            .read_line(&mut line)
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;
        if n == 0 {
            return Ok(Frame::Closed);
        }

        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }

        match trimmed.split_once(':') {
            Some((name, value)) if name.trim().eq_ignore_ascii_case("content-length") => {
                let len = value
                    .trim()
                    .parse::<usize>()
                    .map_err(|e| McpError::Transport(format!("bad Content-Length: {e}")))?;
                content_length = Some(len);
            }
            Some(_) => {
                tracing::warn!(header = %trimmed, "unknown MCP frame header, ignoring");
            }
            None => {
                tracing::warn!(line = %trimmed, "non-header garbage before MCP frame body, skipping");
            }
        }
    }

    let len = content_length
        .ok_or_else(|| McpError::Transport("missing Content-Length header".to_string()))?;

    let mut body = vec![0u8; len];
    tokio::io::AsyncReadExt::read_exact(reader, &mut body)
        .await
        .map_err(|e| McpError::Transport(format!("short read on frame body: {e}")))?;

    let text = std::str::from_utf8(&body)
        .map_err(|e| McpError::Transport(format!("frame body not valid UTF-8: {e}")))?;
    let value: Value = serde_json::from_str(text)?;
    Ok(Frame::Message(value))
}

/// Upper bound a single blocking read may wait before the caller considers
/// the upstream stalled. Not enforced inside `FrameStream` itself (callers
/// wrap reads in `tokio::time::timeout` at the call site, e.g. startup
/// handshake), but kept here as the single source of truth for a sane
/// default.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(20);

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn stream(input: &'static [u8]) -> FrameStream<Cursor<&'static [u8]>, Vec<u8>> {
        FrameStream::new(Cursor::new(input), Vec::new(), StdioMode::Auto)
    }

    #[tokio::test]
    async fn detects_newline_mode_from_brace() {
        let fs = stream(b"{\"jsonrpc\":\"2.0\",\"method\":\"ping\"}\n");
        match fs.read().await.unwrap() {
            Frame::Message(v) => assert_eq!(v["method"], "ping"),
            Frame::Closed => panic!("expected message"),
        }
    }

    #[tokio::test]
    async fn detects_header_mode_from_content_length() {
        let body = b"{\"jsonrpc\":\"2.0\",\"method\":\"ping\"}";
        let mut input = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
        input.extend_from_slice(body);
        let fs = FrameStream::new(Cursor::new(Box::leak(input.into_boxed_slice()) as &'static [u8]), Vec::new(), StdioMode::Auto);
        match fs.read().await.unwrap() {
            Frame::Message(v) => assert_eq!(v["method"], "ping"),
            Frame::Closed => panic!("expected message"),
        }
    }

    #[tokio::test]
    async fn eof_yields_closed() {
        let fs = stream(b"");
        assert!(matches!(fs.read().await.unwrap(), Frame::Closed));
    }

    #[tokio::test]
    async fn malformed_json_errors_without_closing() {
        let fs = stream(b"not json at all\n");
        let result = fs.read().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn write_then_pinned_mode_newline() {
        let fs = FrameStream::new(Cursor::new(&b""[..]), Vec::new(), StdioMode::Newline);
        fs.write(&serde_json::json!({"jsonrpc":"2.0","method":"ping"}))
            .await
            .unwrap();
        let written = fs.writer.lock().await;
        let text = String::from_utf8(written.clone()).unwrap();
        assert!(text.ends_with('\n'));
        assert!(!text.contains("Content-Length"));
    }

    #[tokio::test]
    async fn write_header_mode() {
        let fs = FrameStream::new(Cursor::new(&b""[..]), Vec::new(), StdioMode::Header);
        fs.write(&serde_json::json!({"jsonrpc":"2.0","method":"ping"}))
            .await
            .unwrap();
        let written = fs.writer.lock().await;
        let text = String::from_utf8(written.clone()).unwrap();
        assert!(text.starts_with("Content-Length:"));
    }
}
