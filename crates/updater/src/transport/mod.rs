//! HTTP plumbing shared by providers and downloaders.
//!
//! Everything the update engine sends over the wire is a `GET`, optionally
//! restricted to one or more byte ranges. [`HttpTransport`] is the seam
//! between the engine and the network: [`ReqwestTransport`] talks to real
//! servers, [`MemoryTransport`] serves a fixed set of files from memory.

mod client;
mod memory;

pub use client::{ReqwestTransport, ReqwestTransportBuilder};
pub use memory::{Fault, MemoryTransport, RecordedRequest};

use crate::error::{Result, UpdaterError};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::Url;
use std::fmt;

/// Half-open byte range `[start, end)` of a remote resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    /// Range of `len` bytes starting at `start`.
    pub fn from_len(start: u64, len: u64) -> Self {
        Self::new(start, start + len)
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Whether `other` lies entirely within this range.
    pub fn contains(&self, other: &ByteRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// `first-last` spec as used in a `Range` header (inclusive end).
    pub fn header_spec(&self) -> String {
        format!("{}-{}", self.start, self.end.saturating_sub(1))
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bytes {}..{}", self.start, self.end)
    }
}

/// Value of a `Range` header requesting all `ranges`.
pub fn range_header_value(ranges: &[ByteRange]) -> String {
    let specs: Vec<String> = ranges.iter().map(ByteRange::header_spec).collect();
    format!("bytes={}", specs.join(","))
}

/// A `GET` request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: Url,
    pub ranges: Vec<ByteRange>,
    pub headers: Vec<(String, String)>,
}

impl HttpRequest {
    pub fn get(url: Url) -> Self {
        Self {
            url,
            ranges: Vec::new(),
            headers: Vec::new(),
        }
    }

    /// Restrict the request to a single range.
    pub fn range(mut self, range: ByteRange) -> Self {
        self.ranges = vec![range];
        self
    }

    /// Restrict the request to several ranges.
    pub fn ranges(mut self, ranges: Vec<ByteRange>) -> Self {
        self.ranges = ranges;
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn headers(mut self, headers: impl IntoIterator<Item = (String, String)>) -> Self {
        self.headers.extend(headers);
        self
    }
}

/// Streaming response body.
pub type BodyStream = BoxStream<'static, Result<Bytes>>;

/// Response to an [`HttpRequest`].
pub struct HttpResponse {
    pub status: u16,
    /// Final URL after redirects.
    pub url: Url,
    pub content_type: Option<String>,
    pub content_range: Option<String>,
    pub content_length: Option<u64>,
    pub body: BodyStream,
}

impl fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("url", &self.url.as_str())
            .field("content_type", &self.content_type)
            .field("content_range", &self.content_range)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

impl HttpResponse {
    /// Fail on anything other than 200 or 206.
    pub fn error_for_status(self) -> Result<Self> {
        match self.status {
            200 | 206 => Ok(self),
            401 | 403 => Err(UpdaterError::Authentication {
                url: self.url.to_string(),
                status: self.status,
            }),
            status => Err(UpdaterError::HttpStatus {
                url: self.url.to_string(),
                status,
            }),
        }
    }

    /// Collect the body, refusing to buffer more than `limit` bytes.
    pub async fn bytes_limited(self, limit: u64) -> Result<Bytes> {
        let url = self.url;
        let mut body = self.body;
        let mut buf = BytesMut::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            if (buf.len() + chunk.len()) as u64 > limit {
                return Err(UpdaterError::protocol(
                    &url,
                    format!("body exceeds {limit} bytes"),
                ));
            }
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }

    /// `boundary` parameter of a `multipart/byteranges` content type.
    pub fn multipart_boundary(&self) -> Option<String> {
        let content_type = self.content_type.as_deref()?;
        let mut params = content_type.split(';');
        let mime = params.next()?.trim();
        if !mime.eq_ignore_ascii_case("multipart/byteranges") {
            return None;
        }
        params.find_map(|param| {
            let (key, value) = param.trim().split_once('=')?;
            key.eq_ignore_ascii_case("boundary")
                .then(|| value.trim().trim_matches('"').to_string())
        })
    }
}

/// Abstraction over issuing HTTP `GET` requests.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Send the request and return the response head with a streaming body.
    ///
    /// Non-2xx statuses are returned as responses, not errors.
    async fn get(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// Parse a `Content-Range` value such as `bytes 0-99/1000` into a range and optional total.
pub fn parse_content_range(value: &str) -> Option<(ByteRange, Option<u64>)> {
    let value = value.trim();
    let (unit, spec) = value.split_once(char::is_whitespace)?;
    if !unit.eq_ignore_ascii_case("bytes") {
        return None;
    }
    let (range_part, total_part) = spec.trim().split_once('/')?;
    let total = match total_part {
        "*" => None,
        total => Some(total.parse::<u64>().ok()?),
    };
    let (start, end) = range_part.split_once('-')?;
    let start: u64 = start.parse().ok()?;
    let end_inclusive: u64 = end.parse().ok()?;
    if end_inclusive < start {
        return None;
    }
    if matches!(total, Some(total) if end_inclusive >= total) {
        return None;
    }
    Some((ByteRange::new(start, end_inclusive + 1), total))
}

/// Join `path` onto `base`, keeping the base query when the path has none.
pub fn new_url_from_base(path: &str, base: &Url, add_no_cache_query: bool) -> Result<Url> {
    let mut url = base
        .join(path)
        .map_err(|err| UpdaterError::validation(format!("invalid URL {path:?}: {err}")))?;
    if url.query().is_none() {
        if let Some(query) = base.query() {
            if url.origin() == base.origin() {
                url.set_query(Some(query));
            }
        } else if add_no_cache_query {
            let nonce = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or_default();
            url.set_query(Some(&format!("noCache={nonce:x}")));
        }
    }
    Ok(url)
}

/// Parse a base URL and make sure its path ends with `/` so that joins append.
pub fn new_base_url(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw)
        .map_err(|err| UpdaterError::Config(format!("invalid base URL {raw:?}: {err}")))?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}
