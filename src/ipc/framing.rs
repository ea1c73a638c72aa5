//! Newline-delimited JSON framing for the worker's stdio pipes.
//!
//! The worker's stdout arrives in arbitrary chunks. `LineFramer` reassembles
//! them into complete lines; `parse_line` turns a line into a `Response`.
//!
//! # Wire Format
//!
//! ```text
//! {"id":1,"result":"pong"}\n
//! {"id":2,"error":"bad args"}\n
//! ```
//!
//! A line that is not valid JSON is logged and dropped. It never affects
//! the lines around it.

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::warn;

use crate::protocol::{Request, Response};

/// Reassembles `\n`-terminated lines from a byte stream.
///
/// The buffer only ever holds the unterminated tail of the stream.
#[derive(Debug, Default)]
pub struct LineFramer {
    buffer: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every line it completed, in stream order.
    ///
    /// Returned lines have their `\n` (and a trailing `\r`) removed. Invalid
    /// UTF-8 is replaced rather than rejected; such a line will then fail to
    /// parse and be dropped by `parse_line`.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let Some(last_newline) = self.buffer.iter().rposition(|&b| b == b'\n') else {
            return Vec::new();
        };

        let tail = self.buffer.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.buffer, tail);

        complete[..last_newline]
            .split(|&b| b == b'\n')
            .map(|raw| {
                let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
                String::from_utf8_lossy(raw).into_owned()
            })
            .collect()
    }

    /// Number of buffered bytes not yet terminated by `\n`.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }
}

/// Parse one framed line into a response envelope.
///
/// Blank lines yield `None` silently; malformed lines are logged and yield
/// `None`.
pub fn parse_line(line: &str) -> Option<Response> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    match serde_json::from_str::<Response>(trimmed) {
        Ok(response) => Some(response),
        Err(e) => {
            warn!(line = %trimmed, "Discarding malformed worker output: {}", e);
            None
        }
    }
}

/// Write one request envelope as a single JSON line and flush it.
///
/// # Errors
///
/// Returns the underlying I/O error if the pipe is closed or the write fails.
/// Serialization of a `Request` cannot fail for `serde_json::Value` params,
/// but is reported as `InvalidData` for completeness.
pub async fn write_message<W>(writer: &mut W, request: &Request) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(request)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    line.push(b'\n');

    writer.write_all(&line).await?;
    writer.flush().await?;

    Ok(())
}
