//! Control channel line protocol
//!
//! Plaintext, newline-delimited. The scheduler sends a switch command naming
//! the relay endpoint:
//!
//! ```text
//! relay2:5114\n
//! ```
//!
//! and the client acknowledges by echoing the identical line once it has
//! switched.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::error::SchedulerError;

/// Longest line accepted on the control channel, newline included
pub const MAX_LINE_LEN: usize = 512;

/// Encode a switch command for `endpoint`
#[must_use]
pub fn encode_switch(endpoint: &str) -> String {
    format!("{endpoint}\n")
}

/// Validate a received switch line and return the endpoint it names.
///
/// Accepts an optional trailing `\r\n` or `\n`.
///
/// # Errors
///
/// Returns `SchedulerError::InvalidCommand` if the line is not `host:port`
/// with a numeric port.
pub fn parse_switch(line: &str) -> Result<&str, SchedulerError> {
    let endpoint = line.trim_end_matches(['\r', '\n']);
    let Some((host, port)) = endpoint.rsplit_once(':') else {
        return Err(SchedulerError::InvalidCommand(endpoint.to_string()));
    };
    if host.is_empty() || host.contains(char::is_whitespace) || port.parse::<u16>().is_err() {
        return Err(SchedulerError::InvalidCommand(endpoint.to_string()));
    }
    Ok(endpoint)
}

/// Read one line, without its terminator.
///
/// Returns `Ok(None)` on a clean end of stream.
///
/// # Errors
///
/// Returns `InvalidCommand` for an over-long or non-UTF-8 line, or the I/O
/// error.
pub async fn read_line<R>(reader: &mut R) -> Result<Option<String>, SchedulerError>
where
    R: AsyncBufRead + Unpin,
{
    let mut raw = Vec::with_capacity(64);
    let n = reader
        .take(MAX_LINE_LEN as u64)
        .read_until(b'\n', &mut raw)
        .await?;
    if n == 0 {
        return Ok(None);
    }
    if raw.last() != Some(&b'\n') {
        if n >= MAX_LINE_LEN {
            return Err(SchedulerError::InvalidCommand(format!(
                "line exceeds {MAX_LINE_LEN} bytes"
            )));
        }
        // Stream ended mid-line
        return Ok(None);
    }
    let line = String::from_utf8(raw)
        .map_err(|_| SchedulerError::InvalidCommand("line is not UTF-8".into()))?;
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}
