//! Parley wire protocol — newline-delimited UTF-8 text over TCP.
//!
//! Every frame is one line. A connection starts with a fixed handshake:
//!
//!   server → client   ENTER_USERNAME
//!   client → server   <display name>
//!   server → client   SUCCESS: <text>   |   ERROR: <reason>
//!
//! After a successful handshake the client sends chat bodies (or the exit
//! keyword) and the server sends free-form broadcast lines. The strings in
//! this module ARE the protocol; existing clients match on them verbatim.

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Handshake request sent by the server as the very first line.
pub const NAME_REQUEST: &str = "ENTER_USERNAME";

/// Prefix of a positive handshake acknowledgment.
pub const SUCCESS_PREFIX: &str = "SUCCESS:";

/// Prefix of a rejection, either at handshake time or for a single message.
pub const ERROR_PREFIX: &str = "ERROR:";

/// Case-insensitive keyword that ends a session gracefully.
pub const EXIT_KEYWORD: &str = "exit";

pub const DEFAULT_PORT: u16 = 5000;
pub const MIN_PORT: u16 = 1024;

/// Upper bound on a single line, excluding the terminator.
pub const DEFAULT_MAX_LINE_BYTES: usize = 8192;

/// Build a `SUCCESS: <text>` line.
pub fn success(text: &str) -> String {
    format!("{SUCCESS_PREFIX} {text}")
}

/// Build an `ERROR: <reason>` line.
pub fn error(reason: &str) -> String {
    format!("{ERROR_PREFIX} {reason}")
}

/// True if `line` is the exit keyword, ignoring ASCII case.
pub fn is_exit(line: &str) -> bool {
    line.eq_ignore_ascii_case(EXIT_KEYWORD)
}

/// A handshake reply as classified by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Success(String),
    Error(String),
    Other(String),
}

impl Reply {
    pub fn parse(line: &str) -> Self {
        if let Some(rest) = line.strip_prefix(SUCCESS_PREFIX) {
            Reply::Success(rest.trim().to_string())
        } else if let Some(rest) = line.strip_prefix(ERROR_PREFIX) {
            Reply::Error(rest.trim().to_string())
        } else {
            Reply::Other(line.to_string())
        }
    }
}

// ── Line I/O ──────────────────────────────────────────────────────────────────

/// Read one line, stripping the trailing `\n` or `\r\n`.
///
/// Returns `Ok(None)` on a clean EOF. A final unterminated line is still
/// returned. Invalid UTF-8 is replaced rather than rejected. A line longer
/// than `max_bytes` fails with `InvalidData`; the stream is unusable after
/// that and the caller must drop it.
pub async fn read_line<R>(reader: &mut R, max_bytes: usize) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    // +2 leaves room for the "\r\n" terminator.
    let limit = max_bytes as u64 + 2;
    let mut buf = Vec::new();
    let n = (&mut *reader).take(limit).read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Ok(None);
    }

    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
    if buf.len() > max_bytes {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("line exceeds {max_bytes} bytes"),
        ));
    }

    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

/// Write `line` followed by `\n` and flush.
pub async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut frame = Vec::with_capacity(line.len() + 1);
    frame.extend_from_slice(line.as_bytes());
    frame.push(b'\n');
    writer.write_all(&frame).await?;
    writer.flush().await
}
