use std::io::{self, BufRead, Read, Write};
use thiserror::Error;

const CONTENT_LENGTH: &str = "content-length";
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;
const MAX_HEADER_LINE_BYTES: u64 = 8 * 1024;

#[derive(Debug, Error)]
pub enum McpError {
    #[error("read request: {0}")]
    Read(#[source] io::Error),

    #[error("invalid content length: {0:?}")]
    InvalidContentLength(String),

    #[error("header line exceeds {MAX_HEADER_LINE_BYTES} bytes")]
    HeaderTooLong,

    #[error("missing content length header")]
    MissingContentLength,

    #[error("encode response: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("write response: {0}")]
    Write(#[source] io::Error),
}

/// Reads one `Content-Length` framed message body; `None` once the peer has
/// closed the stream between messages.
pub fn read_frame(reader: &mut impl BufRead) -> Result<Option<Vec<u8>>, McpError> {
    let mut content_length: Option<usize> = None;
    let mut saw_header = false;
    let mut line = String::new();
    loop {
        line.clear();
        let read = (&mut *reader)
            .take(MAX_HEADER_LINE_BYTES)
            .read_line(&mut line)
            .map_err(McpError::Read)?;
        if read as u64 == MAX_HEADER_LINE_BYTES && !line.ends_with('\n') {
            return Err(McpError::HeaderTooLong);
        }
        if read == 0 {
            if !saw_header {
                return Ok(None);
            }
            return Err(McpError::Read(io::ErrorKind::UnexpectedEof.into()));
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            if saw_header {
                break;
            }
            // Stray blank line between frames.
            continue;
        }
        saw_header = true;
        let Some((key, value)) = trimmed.split_once(':') else {
            continue;
        };
        if key.trim().eq_ignore_ascii_case(CONTENT_LENGTH) {
            let value = value.trim();
            let length = value
                .parse::<usize>()
                .ok()
                .filter(|length| *length <= MAX_FRAME_BYTES)
                .ok_or_else(|| McpError::InvalidContentLength(value.to_string()))?;
            content_length = Some(length);
        }
    }

    let length = content_length.ok_or(McpError::MissingContentLength)?;
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).map_err(McpError::Read)?;
    Ok(Some(body))
}

pub fn write_frame(writer: &mut impl Write, body: &[u8]) -> Result<(), McpError> {
    write!(writer, "Content-Length: {}\r\n\r\n", body.len()).map_err(McpError::Write)?;
    writer.write_all(body).map_err(McpError::Write)?;
    writer.flush().map_err(McpError::Write)
}
