use super::{ByteRange, HttpRequest, HttpResponse, HttpTransport};
use crate::error::Result;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::Url;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::warn;

const BODY_CHUNK: usize = 16 * 1024;
const MULTIPART_BOUNDARY: &str = "delta-updater-byteranges";

/// Misbehaviour injected into responses for one URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Answer ranged requests with `200` and the whole body.
    IgnoreRange,
    /// Answer the next `n` requests with `503`.
    Unavailable(u32),
    /// Flip one byte of the next ranged response that covers `offset`.
    CorruptRange { offset: u64 },
    /// Answer every request with the given status and an empty body.
    Status(u16),
}

/// A request observed by [`MemoryTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub url: Url,
    pub ranges: Vec<ByteRange>,
    pub headers: Vec<(String, String)>,
}

#[derive(Default)]
struct Inner {
    files: HashMap<String, Bytes>,
    redirects: HashMap<String, Url>,
    faults: HashMap<String, Vec<Fault>>,
    log: Vec<RecordedRequest>,
}

/// [`HttpTransport`] serving files from memory, with range and multi-range support.
///
/// URLs are matched without their query string. Useful for offline feeds and tests.
pub struct MemoryTransport {
    inner: Mutex<Inner>,
    latency: Duration,
    multi_range: bool,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn key(url: &Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.set_fragment(None);
    url.to_string()
}

/// Key of `url`, or `url` itself when it does not parse and can never be requested.
fn key_str(url: &str) -> String {
    match Url::parse(url) {
        Ok(parsed) => key(&parsed),
        Err(err) => {
            warn!("memory transport: invalid URL {:?}: {}", url, err);
            url.to_string()
        }
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            latency: Duration::ZERO,
            multi_range: true,
        }
    }

    /// Delay applied before every response.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Whether several ranges in one request are answered with `multipart/byteranges`.
    pub fn with_multi_range(mut self, enabled: bool) -> Self {
        self.multi_range = enabled;
        self
    }

    /// Serve `data` at `url`.
    pub fn insert(&self, url: &str, data: impl Into<Bytes>) {
        self.lock().files.insert(key_str(url), data.into());
    }

    /// Stop serving `url`.
    pub fn remove(&self, url: &str) {
        self.lock().files.remove(&key_str(url));
    }

    /// Redirect requests for `from` to `to`.
    ///
    /// An unparsable target is ignored.
    pub fn redirect(&self, from: &str, to: &str) {
        match Url::parse(to) {
            Ok(target) => {
                self.lock().redirects.insert(key_str(from), target);
            }
            Err(err) => warn!("memory transport: not redirecting to {:?}: {}", to, err),
        }
    }

    /// Inject a fault for `url`.
    pub fn inject(&self, url: &str, fault: Fault) {
        self.lock().faults.entry(key_str(url)).or_default().push(fault);
    }

    /// All requests seen so far.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.lock().log.clone()
    }

    /// Requests whose URL (without query) equals `url`.
    pub fn requests_for(&self, url: &str) -> Vec<RecordedRequest> {
        let wanted = key_str(url);
        self.requests()
            .into_iter()
            .filter(|r| key(&r.url) == wanted)
            .collect()
    }

    pub fn request_count(&self) -> usize {
        self.lock().log.len()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn respond(&self, request: &HttpRequest) -> HttpResponse {
        let mut inner = self.lock();
        inner.log.push(RecordedRequest {
            url: request.url.clone(),
            ranges: request.ranges.clone(),
            headers: request.headers.clone(),
        });

        let final_url = inner
            .redirects
            .get(&key(&request.url))
            .cloned()
            .unwrap_or_else(|| request.url.clone());
        let file_key = key(&final_url);

        let mut corrupt_at = None;
        let mut ignore_range = false;
        if let Some(faults) = inner.faults.get_mut(&file_key) {
            for fault in faults.iter_mut() {
                match fault {
                    Fault::Status(status) => return empty(*status, final_url),
                    Fault::Unavailable(remaining) if *remaining > 0 => {
                        *remaining -= 1;
                        return empty(503, final_url);
                    }
                    Fault::IgnoreRange => ignore_range = true,
                    _ => {}
                }
            }
            if request.ranges.len() == 1 {
                let range = request.ranges[0];
                if let Some(pos) = faults.iter().position(|f| {
                    matches!(f, Fault::CorruptRange { offset } if range.start <= *offset && *offset < range.end)
                }) {
                    if let Fault::CorruptRange { offset } = faults.remove(pos) {
                        corrupt_at = Some(offset - range.start);
                    }
                }
            }
        }

        let Some(data) = inner.files.get(&file_key).cloned() else {
            return empty(404, final_url);
        };
        drop(inner);

        let size = data.len() as u64;
        if request.ranges.is_empty()
            || ignore_range
            || (request.ranges.len() > 1 && !self.multi_range)
        {
            return body(200, final_url, None, None, data);
        }
        if request.ranges.iter().any(|r| r.start >= size || r.end > size) {
            return empty(416, final_url);
        }

        if let [range] = request.ranges.as_slice() {
            let mut part = BytesMut::from(&data[range.start as usize..range.end as usize]);
            if let Some(index) = corrupt_at {
                part[index as usize] ^= 0xff;
            }
            let content_range = format!("bytes {}/{size}", content_range_spec(range));
            return body(206, final_url, None, Some(content_range), part.freeze());
        }

        let mut out = BytesMut::new();
        for range in &request.ranges {
            out.extend_from_slice(format!("\r\n--{MULTIPART_BOUNDARY}\r\n").as_bytes());
            out.extend_from_slice(b"Content-Type: application/octet-stream\r\n");
            out.extend_from_slice(
                format!("Content-Range: bytes {}/{size}\r\n\r\n", content_range_spec(range))
                    .as_bytes(),
            );
            out.extend_from_slice(&data[range.start as usize..range.end as usize]);
        }
        out.extend_from_slice(format!("\r\n--{MULTIPART_BOUNDARY}--\r\n").as_bytes());
        let content_type = format!("multipart/byteranges; boundary={MULTIPART_BOUNDARY}");
        body(206, final_url, Some(content_type), None, out.freeze())
    }
}

fn content_range_spec(range: &ByteRange) -> String {
    format!("{}-{}", range.start, range.end - 1)
}

fn empty(status: u16, url: Url) -> HttpResponse {
    body(status, url, None, None, Bytes::new())
}

fn body(
    status: u16,
    url: Url,
    content_type: Option<String>,
    content_range: Option<String>,
    data: Bytes,
) -> HttpResponse {
    let content_length = Some(data.len() as u64);
    let chunks: Vec<Result<Bytes>> = (0..data.len())
        .step_by(BODY_CHUNK)
        .map(|start| Ok(data.slice(start..(start + BODY_CHUNK).min(data.len()))))
        .collect();
    HttpResponse {
        status,
        url,
        content_type,
        content_range,
        content_length,
        body: futures::stream::iter(chunks).boxed(),
    }
}

#[async_trait]
impl HttpTransport for MemoryTransport {
    async fn get(&self, request: HttpRequest) -> Result<HttpResponse> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        Ok(self.respond(&request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const URL: &str = "https://updates.example.com/app.bin";

    fn parse(url: &str) -> Url {
        Url::parse(url).unwrap()
    }

    fn transport() -> MemoryTransport {
        let transport = MemoryTransport::new();
        transport.insert(URL, (0u8..=255).collect::<Vec<u8>>());
        transport
    }

    #[tokio::test]
    async fn serves_single_range() {
        let transport = transport();
        let response = transport
            .get(HttpRequest::get(parse(URL)).range(ByteRange::new(10, 20)))
            .await
            .unwrap();
        assert_eq!(response.status, 206);
        assert_eq!(response.content_range.as_deref(), Some("bytes 10-19/256"));
        let bytes = response.bytes_limited(1024).await.unwrap();
        assert_eq!(&bytes[..], &(10u8..20).collect::<Vec<u8>>()[..]);
    }

    #[tokio::test]
    async fn unavailable_fault_is_consumed() {
        let transport = transport();
        transport.inject(URL, Fault::Unavailable(1));
        let first = transport.get(HttpRequest::get(parse(URL))).await.unwrap();
        assert_eq!(first.status, 503);
        let second = transport.get(HttpRequest::get(parse(URL))).await.unwrap();
        assert_eq!(second.status, 200);
        assert_eq!(transport.request_count(), 2);
    }

    #[tokio::test]
    async fn missing_file_is_404() {
        let transport = transport();
        let response = transport
            .get(HttpRequest::get(parse("https://updates.example.com/missing")))
            .await
            .unwrap();
        assert_eq!(response.status, 404);
    }

    #[tokio::test]
    async fn multi_range_answer_is_multipart() {
        let transport = transport();
        let response = transport
            .get(
                HttpRequest::get(parse(URL))
                    .ranges(vec![ByteRange::new(0, 4), ByteRange::new(100, 104)]),
            )
            .await
            .unwrap();
        assert_eq!(response.status, 206);
        assert_eq!(
            response.multipart_boundary().as_deref(),
            Some(MULTIPART_BOUNDARY)
        );
    }

    #[tokio::test]
    async fn invalid_urls_are_ignored() {
        let transport = transport();
        transport.insert("not a url", b"data".to_vec());
        transport.redirect(URL, "::");
        transport.inject("::", Fault::Status(500));
        transport.remove("");
        assert!(transport.requests_for("also not a url").is_empty());

        let response = transport.get(HttpRequest::get(parse(URL))).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.url, parse(URL));
    }

    #[tokio::test]
    async fn survives_a_poisoned_lock() {
        let transport = Arc::new(transport());
        let poisoner = Arc::clone(&transport);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.lock();
            panic!("poison the lock");
        })
        .join();
        assert!(transport.inner.is_poisoned());

        let response = transport.get(HttpRequest::get(parse(URL))).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(transport.request_count(), 1);
    }
}
