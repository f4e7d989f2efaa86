//! `multipart/byteranges` bodies.

use crate::error::{Result, UpdaterError};
use crate::transport::{parse_content_range, ByteRange};
use bytes::Bytes;

/// One part of a multi-range answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Part {
    pub range: ByteRange,
    pub data: Bytes,
}

/// Split a `multipart/byteranges` body into its parts.
///
/// Every part must carry a `Content-Range` header and exactly as many bytes as it announces.
pub(crate) fn parse_byteranges(body: &Bytes, boundary: &str, url: &str) -> Result<Vec<Part>> {
    let delimiter = format!("--{boundary}");
    let delimiter = delimiter.as_bytes();
    let bad = |reason: &str| UpdaterError::protocol(url, format!("multipart body: {reason}"));

    let mut pos = find(body, delimiter, 0).ok_or_else(|| bad("no boundary"))?;
    let mut parts = Vec::new();
    loop {
        pos += delimiter.len();
        if body[pos..].starts_with(b"--") {
            return Ok(parts);
        }
        pos = skip_line_break(body, pos).ok_or_else(|| bad("boundary not followed by CRLF"))?;

        let (header_end, start) =
            end_of_headers(body, pos).ok_or_else(|| bad("unterminated part headers"))?;
        let headers = std::str::from_utf8(&body[pos..header_end])
            .map_err(|_| bad("part headers are not UTF-8"))?;
        let range = headers
            .lines()
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-range"))
            .and_then(|(_, value)| parse_content_range(value))
            .map(|(range, _)| range)
            .ok_or_else(|| bad("part without Content-Range"))?;

        let end = start
            .checked_add(range.len() as usize)
            .filter(|end| *end <= body.len())
            .ok_or_else(|| bad("part shorter than its Content-Range"))?;
        parts.push(Part {
            range,
            data: body.slice(start..end),
        });

        let next = skip_line_break(body, end).ok_or_else(|| bad("part not followed by CRLF"))?;
        if !body[next..].starts_with(delimiter) {
            return Err(bad("part longer than its Content-Range"));
        }
        pos = next;
    }
}

/// Position of the blank line closing the headers that start at `pos`, and of the
/// first byte after it. Lines may end with CRLF or a bare LF.
fn end_of_headers(body: &[u8], pos: usize) -> Option<(usize, usize)> {
    let mut line = pos;
    loop {
        let newline = find(body, b"\n", line)?;
        let content_end = if newline > line && body[newline - 1] == b'\r' {
            newline - 1
        } else {
            newline
        };
        if content_end == line {
            return Some((line, newline + 1));
        }
        line = newline + 1;
    }
}

fn skip_line_break(body: &[u8], pos: usize) -> Option<usize> {
    if body.get(pos..pos + 2) == Some(b"\r\n") {
        Some(pos + 2)
    } else if body.get(pos) == Some(&b'\n') {
        Some(pos + 1)
    } else {
        None
    }
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|index| index + from)
}
