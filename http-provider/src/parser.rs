//! Streaming HTTP response parser + slicer (C5).
//!
//! Fed chunks of server plaintext as they arrive off the TLS transcript, this
//! tracks absolute byte positions for the status line, headers, and (for
//! chunked bodies) each chunk -- positions C6's redaction planner and C8's
//! validator both need, and which a typed `http::Response` would discard.

use std::ops::Range;

use anyhow::Result;

use crate::bytes::{find_double_crlf, split_lines};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortStage {
    StatusLine,
    Headers,
    Body,
}

impl std::fmt::Display for AbortStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AbortStage::StatusLine => "status line",
            AbortStage::Headers => "headers",
            AbortStage::Body => "body",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone)]
pub struct HeaderSpan {
    pub name: String,
    pub value: String,
    pub range: Range<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedResponse {
    pub status_code: u16,
    pub status_message: String,
    pub status_line_end_index: usize,
    pub headers: Vec<HeaderSpan>,
    pub header_end_idx: usize,
    pub body_start_index: usize,
    /// Chunk byte ranges relative to the full response buffer; empty for
    /// content-length or close-delimited bodies.
    pub chunks: Vec<Range<usize>>,
    pub complete: bool,
}

impl ParsedResponse {
    pub fn header(&self, name: &str) -> Option<&HeaderSpan> {
        self.headers.iter().find(|h| h.name.eq_ignore_ascii_case(name))
    }

    pub fn is_chunked(&self) -> bool {
        self.header("transfer-encoding")
            .map(|h| h.value.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
    }

    pub fn content_length(&self) -> Option<usize> {
        self.header("content-length").and_then(|h| h.value.trim().parse().ok())
    }
}

/// Incrementally parse a buffer of response bytes accumulated so far.
///
/// `data` is expected to be the *full* buffer received up to this point
/// (the caller owns re-assembly of TLS records into a flat byte stream);
/// this function is idempotent and safe to call repeatedly as more bytes
/// arrive.
pub fn parse(data: &[u8]) -> Result<ParsedResponse> {
    let mut response = ParsedResponse::default();

    let lines = split_lines(data);
    let Some(status_line) = lines.first() else {
        return Ok(response);
    };

    let status_text = String::from_utf8_lossy(&data[status_line.range.clone()]).to_string();
    let mut parts = status_text.splitn(3, ' ');
    let Some(_version) = parts.next() else {
        return Ok(response);
    };
    let Some(code_str) = parts.next() else {
        return Ok(response);
    };
    let Ok(code) = code_str.parse::<u16>() else {
        return Ok(response);
    };

    response.status_code = code;
    response.status_message = parts.next().unwrap_or("").to_string();
    response.status_line_end_index = status_line.line_end;

    let Some(header_end) = find_double_crlf(data, 0) else {
        return Ok(response);
    };
    response.header_end_idx = header_end;
    response.body_start_index = header_end + 4;

    for line in lines.iter().skip(1) {
        if line.range.start >= header_end {
            break;
        }
        let text = String::from_utf8_lossy(&data[line.range.clone()]);
        let Some((name, value)) = text.split_once(':') else {
            continue;
        };
        response.headers.push(HeaderSpan {
            name: name.trim().to_string(),
            value: value.trim().to_string(),
            range: line.range.clone(),
        });
    }

    if response.is_chunked() {
        parse_chunks(data, &mut response);
    } else if let Some(len) = response.content_length() {
        let end = response.body_start_index + len;
        response.complete = data.len() >= end;
    } else {
        // No framing information: treat as complete once the caller tells us
        // the stream ended (see `finalize_on_stream_end`).
        response.complete = false;
    }

    Ok(response)
}

fn parse_chunks(data: &[u8], response: &mut ParsedResponse) {
    let mut pos = response.body_start_index;
    loop {
        let Some(line_end_rel) = data[pos..].windows(2).position(|w| w == b"\r\n") else {
            return; // incomplete: chunk size line not fully arrived yet
        };
        let size_line = &data[pos..pos + line_end_rel];
        let size_text = String::from_utf8_lossy(size_line);
        let size_hex = size_text.split(';').next().unwrap_or("").trim();
        let Ok(size) = usize::from_str_radix(size_hex, 16) else {
            return;
        };

        let chunk_start = pos + line_end_rel + 2;
        let chunk_end = chunk_start + size;

        if size == 0 {
            // Last-chunk: require the trailing CRLF to be present to call it complete.
            response.complete = data.len() >= chunk_start + 2;
            return;
        }

        if data.len() < chunk_end + 2 {
            return; // incomplete: chunk body not fully arrived yet
        }

        response.chunks.push(chunk_start..chunk_end);
        pos = chunk_end + 2; // skip the chunk's trailing CRLF
    }
}

/// Call when the underlying stream has ended (server closed the connection)
/// to finalize a body with no explicit framing (neither chunked nor
/// content-length -- the body runs to EOF).
pub fn finalize_on_stream_end(data: &[u8], response: &mut ParsedResponse) -> Result<(), AbortStage> {
    if response.header_end_idx == 0 && response.status_line_end_index == 0 {
        return Err(AbortStage::StatusLine);
    }
    if response.body_start_index == 0 {
        return Err(AbortStage::Headers);
    }
    if !response.is_chunked() && response.content_length().is_none() {
        response.complete = data.len() >= response.body_start_index;
    }
    if response.complete {
        Ok(())
    } else {
        Err(AbortStage::Body)
    }
}
