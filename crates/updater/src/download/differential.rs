//! Rebuilds a new file from the installed one plus the ranges that changed.

use super::checksum::verify_file;
use super::session::{DownloadSession, ProgressTracker, IO_CHUNK};
use super::{
    multipart, next_chunk, pause, run_blocking, DifferentialFailure, DifferentialStats,
    DownloadOptions, OldArtifact, OldBlockMap,
};
use crate::blockmap::{embedded_map_len, BlockMap, DiffPlan, Operation, PlanOptions};
use crate::blockmap::{EMBEDDED_SIZE_LEN, MAX_BLOCK_MAP_LEN};
use crate::config::RangeMode;
use crate::error::{Result, UpdaterError};
use crate::manifest::{BlockMapSource, FileDescriptor};
use crate::transport::{parse_content_range, ByteRange, HttpRequest, HttpResponse, HttpTransport};
use bytes::{Bytes, BytesMut};
use futures::stream::{self, TryStreamExt};
use reqwest::Url;
use std::fmt;
use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Upper bound of ranges in one multi-range request.
const MAX_RANGES_PER_REQUEST: usize = 256;

/// Upper bound of payload bytes requested by one multi-range request.
const MAX_BATCH_BYTES: u64 = 32 * 1024 * 1024;

pub(crate) enum DifferentialResult {
    /// The staged file is complete and verified.
    Completed(DownloadSession, DifferentialStats),
    /// Nothing usable was produced; the staged file is already gone.
    Fallback(DifferentialFailure),
}

/// One differential attempt for one file.
pub(crate) struct DifferentialDownload<'a> {
    transport: &'a dyn HttpTransport,
    options: &'a DownloadOptions,
    file: &'a FileDescriptor,
    old: &'a OldArtifact,
    cancel: &'a CancellationToken,
    requests: AtomicUsize,
}

/// Fallback for `err`, except cancellation which always propagates.
fn fall_back(
    err: UpdaterError,
    reason: impl FnOnce(UpdaterError) -> DifferentialFailure,
) -> Result<DifferentialResult> {
    if err.is_cancelled() {
        Err(err)
    } else {
        Ok(DifferentialResult::Fallback(reason(err)))
    }
}

impl<'a> DifferentialDownload<'a> {
    pub(crate) fn new(
        transport: &'a dyn HttpTransport,
        options: &'a DownloadOptions,
        file: &'a FileDescriptor,
        old: &'a OldArtifact,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            transport,
            options,
            file,
            old,
            cancel,
            requests: AtomicUsize::new(0),
        }
    }

    /// Plan and execute the download into `staging`.
    ///
    /// Only cancellation is returned as an error. Every other failure becomes a
    /// [`DifferentialResult::Fallback`] carrying the reason.
    pub(crate) async fn run(
        &self,
        staging: &Path,
        progress: Arc<ProgressTracker>,
    ) -> Result<DifferentialResult> {
        let Some(size) = self.file.size else {
            return Ok(DifferentialResult::Fallback(DifferentialFailure::UnknownSize));
        };
        let old_path = &self.old.path;
        let old_len = match tokio::fs::metadata(old_path).await {
            Ok(meta) if meta.is_file() && meta.len() > 0 => meta.len(),
            Ok(_) => {
                return Ok(DifferentialResult::Fallback(DifferentialFailure::OldFile(
                    format!("{} is empty or not a regular file", old_path.display()),
                )))
            }
            Err(err) => {
                return Ok(DifferentialResult::Fallback(DifferentialFailure::OldFile(
                    format!("{}: {err}", old_path.display()),
                )))
            }
        };
        if let Some(recorded) = &self.old.sha512 {
            match verify_file(old_path, recorded).await {
                Ok(()) => {}
                Err(UpdaterError::ChecksumMismatch { .. }) => {
                    return Ok(DifferentialResult::Fallback(DifferentialFailure::OldFileChanged))
                }
                Err(err) => return fall_back(err, |e| DifferentialFailure::OldFile(e.to_string())),
            }
        }
        if self.cancel.is_cancelled() {
            return Err(UpdaterError::Cancelled);
        }

        let old_map = match self.old_block_map().await {
            Ok(map) => map,
            Err(err) => return fall_back(err, DifferentialFailure::BlockMap),
        };
        if old_map.end() > old_len {
            return Ok(DifferentialResult::Fallback(DifferentialFailure::OldFile(
                format!(
                    "block map describes {} bytes but {} has {old_len}",
                    old_map.end(),
                    old_path.display()
                ),
            )));
        }
        let new_map = match self.new_block_map(size).await {
            Ok(map) => map,
            Err(err) => return fall_back(err, DifferentialFailure::BlockMap),
        };

        let plan = match DiffPlan::compute(
            Some(&old_map),
            &new_map,
            size,
            PlanOptions {
                realign: self.options.realign_blocks,
            },
        ) {
            Ok(plan) => plan,
            Err(err) => return fall_back(err, DifferentialFailure::Plan),
        };
        if plan.is_full_download() {
            return Ok(DifferentialResult::Fallback(DifferentialFailure::NothingToReuse));
        }
        let stats = DifferentialStats {
            operations: plan.operations().len(),
            local_bytes: plan.local_bytes(),
            remote_bytes: plan.remote_bytes(),
            requests: 0,
        };
        info!(
            "differential download of {}: {} operations, {} bytes reused, {} bytes to fetch ({:.1}% reused)",
            self.file.file_name(),
            stats.operations,
            stats.local_bytes,
            stats.remote_bytes,
            stats.reuse_percent()
        );

        let session = match DownloadSession::create(staging, size, self.cancel.clone(), progress) {
            Ok(session) => session,
            Err(err) => return fall_back(err, DifferentialFailure::LocalIo),
        };
        if let Err(err) = self.copy_local(&session, &plan).await {
            return fall_back(err, DifferentialFailure::LocalIo);
        }
        if let Err(err) = self.fetch_remote(&session, &plan).await {
            return match err {
                UpdaterError::RangeNotSupported { .. } => Ok(DifferentialResult::Fallback(
                    DifferentialFailure::RangeNotSupported(err),
                )),
                err => fall_back(err, DifferentialFailure::RangeFetch),
            };
        }
        if let Err(err) = session.sync().await {
            return fall_back(err, DifferentialFailure::LocalIo);
        }
        match session.verify(&self.file.checksum).await {
            Ok(()) => {}
            Err(err @ UpdaterError::ChecksumMismatch { .. }) => {
                return Ok(DifferentialResult::Fallback(DifferentialFailure::Verification(err)))
            }
            Err(err) => return fall_back(err, DifferentialFailure::LocalIo),
        }

        Ok(DifferentialResult::Completed(
            session,
            DifferentialStats {
                requests: self.requests.load(Ordering::SeqCst),
                ..stats
            },
        ))
    }

    async fn old_block_map(&self) -> Result<BlockMap> {
        match &self.old.block_map {
            OldBlockMap::Map(map) => Ok(map.clone()),
            OldBlockMap::Embedded => {
                let path = self.old.path.clone();
                run_blocking(move || BlockMap::read_embedded(&path)).await
            }
            OldBlockMap::File(path) => {
                let path = path.clone();
                run_blocking(move || BlockMap::read_file(&path)).await
            }
            OldBlockMap::Url(url) => self.fetch_block_map(url).await,
        }
    }

    async fn new_block_map(&self, size: u64) -> Result<BlockMap> {
        match self.file.block_map_source() {
            BlockMapSource::Sidecar(url) => self.fetch_block_map(&url).await,
            BlockMapSource::Embedded => {
                if size <= EMBEDDED_SIZE_LEN {
                    return Err(UpdaterError::InvalidBlockMap(format!(
                        "{} is too short to carry a block map",
                        self.file.url
                    )));
                }
                let suffix_start = size - EMBEDDED_SIZE_LEN;
                let suffix = self
                    .fetch_range_bytes(ByteRange::new(suffix_start, size))
                    .await?;
                let map_len = embedded_map_len(&suffix, size)?;
                let compressed = self
                    .fetch_range_bytes(ByteRange::new(suffix_start - map_len, suffix_start))
                    .await?;
                BlockMap::decode(&compressed)
            }
        }
    }

    async fn fetch_block_map(&self, url: &Url) -> Result<BlockMap> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let request = HttpRequest::get(url.clone()).headers(self.options.headers.clone());
            let fetched = match self.send(request).await {
                Ok(response) => match response.error_for_status() {
                    Ok(response) => self.collect(response, MAX_BLOCK_MAP_LEN).await,
                    Err(err) => Err(err),
                },
                Err(err) => Err(err),
            };
            match fetched {
                Ok(compressed) => {
                    debug!("fetched block map {} ({} bytes)", url, compressed.len());
                    return BlockMap::decode(&compressed);
                }
                Err(err) => self.backoff(err, attempt, url).await?,
            }
        }
    }

    /// Copy every `CopyLocal` operation before any remote bytes land.
    async fn copy_local(&self, session: &DownloadSession, plan: &DiffPlan) -> Result<()> {
        let path = self.old.path.clone();
        let source = Arc::new(run_blocking(move || Ok(File::open(&path)?)).await?);
        for op in plan.operations() {
            if let Operation::CopyLocal {
                old_offset,
                new_offset,
                length,
            } = *op
            {
                session.check_cancelled()?;
                session
                    .copy_from(Arc::clone(&source), old_offset, new_offset, length)
                    .await?;
                session.advance(length);
            }
        }
        Ok(())
    }

    async fn fetch_remote(&self, session: &DownloadSession, plan: &DiffPlan) -> Result<()> {
        let ranges = plan.remote_ranges();
        debug!(
            "fetching {} ranges of {} in {:?} mode",
            ranges.len(),
            self.file.url,
            self.options.range_mode
        );
        match self.options.range_mode {
            RangeMode::Sequential => {
                for range in ranges {
                    self.fetch_range_into(session, range).await?;
                }
                Ok(())
            }
            RangeMode::Concurrent => {
                stream::iter(ranges.into_iter().map(Ok::<_, UpdaterError>))
                    .try_for_each_concurrent(self.options.max_concurrent_ranges.max(1), |range| {
                        self.fetch_range_into(session, range)
                    })
                    .await
            }
            RangeMode::MultiRange => {
                for batch in batches(&ranges) {
                    self.fetch_batch(session, batch).await?;
                }
                Ok(())
            }
        }
    }

    async fn fetch_range_into(&self, session: &DownloadSession, range: ByteRange) -> Result<()> {
        loop {
            session.check_cancelled()?;
            let attempt = session.record_retry(range.start);
            match self.fetch_range_once(session, range).await {
                Ok(()) => {
                    session.advance(range.len());
                    return Ok(());
                }
                Err(err) => self.backoff(err, attempt, &range).await?,
            }
        }
    }

    async fn fetch_range_once(&self, session: &DownloadSession, range: ByteRange) -> Result<()> {
        let response = self.open_range(range).await?;
        let url = response.url.clone();
        let mut body = response.body;
        let mut offset = range.start;
        let mut pending = BytesMut::new();
        while let Some(chunk) = next_chunk(&mut body, self.cancel).await? {
            if offset + (pending.len() + chunk.len()) as u64 > range.end {
                return Err(UpdaterError::protocol(
                    &url,
                    format!("more bytes than requested for {range}"),
                ));
            }
            pending.extend_from_slice(&chunk);
            if pending.len() >= IO_CHUNK {
                let data = pending.split().freeze();
                let written = data.len() as u64;
                session.write_at(offset, data).await?;
                offset += written;
            }
        }
        if !pending.is_empty() {
            let data = pending.freeze();
            let written = data.len() as u64;
            session.write_at(offset, data).await?;
            offset += written;
        }
        if offset != range.end {
            return Err(UpdaterError::protocol(
                &url,
                format!("{range} ended after {} bytes", offset - range.start),
            ));
        }
        Ok(())
    }

    async fn fetch_batch(&self, session: &DownloadSession, batch: &[ByteRange]) -> Result<()> {
        if let [range] = batch {
            return self.fetch_range_into(session, *range).await;
        }
        let bytes: u64 = batch.iter().map(ByteRange::len).sum();
        let label = BatchLabel(batch);
        loop {
            session.check_cancelled()?;
            let attempt = session.record_retry(batch[0].start);
            match self.fetch_batch_once(session, batch, bytes).await {
                Ok(()) => {
                    session.advance(bytes);
                    return Ok(());
                }
                Err(err) => self.backoff(err, attempt, &label).await?,
            }
        }
    }

    async fn fetch_batch_once(
        &self,
        session: &DownloadSession,
        batch: &[ByteRange],
        bytes: u64,
    ) -> Result<()> {
        let request = HttpRequest::get(self.file.url.clone())
            .ranges(batch.to_vec())
            .headers(self.options.headers.clone());
        let response = self.send(request).await?;
        if response.status == 200 {
            return Err(UpdaterError::RangeNotSupported {
                url: response.url.to_string(),
            });
        }
        let response = response.error_for_status()?;
        let url = response.url.to_string();
        let Some(boundary) = response.multipart_boundary() else {
            return Err(UpdaterError::protocol(
                &url,
                "expected a multipart/byteranges answer",
            ));
        };
        // part headers and delimiters on top of the payload
        let limit = bytes + 1024 + 512 * batch.len() as u64;
        let body = self.collect(response, limit).await?;
        let parts = multipart::parse_byteranges(&body, &boundary, &url)?;

        if let Some(missing) = batch
            .iter()
            .find(|range| !parts.iter().any(|part| part.range.contains(range)))
        {
            return Err(UpdaterError::protocol(
                &url,
                format!("{missing} missing from multipart answer"),
            ));
        }
        for part in parts {
            if part.range.end > session.total() {
                return Err(UpdaterError::protocol(
                    &url,
                    format!("{} lies beyond the end of the file", part.range),
                ));
            }
            session.check_cancelled()?;
            session.write_at(part.range.start, part.data).await?;
        }
        Ok(())
    }

    /// Collect a small single-range answer, used for embedded block maps.
    async fn fetch_range_bytes(&self, range: ByteRange) -> Result<Bytes> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let fetched = match self.open_range(range).await {
                Ok(response) => self.collect(response, range.len()).await,
                Err(err) => Err(err),
            };
            match fetched {
                Ok(bytes) if bytes.len() as u64 == range.len() => return Ok(bytes),
                Ok(bytes) => {
                    return Err(UpdaterError::protocol(
                        &self.file.url,
                        format!("{range} answered with {} bytes", bytes.len()),
                    ))
                }
                Err(err) => self.backoff(err, attempt, &range).await?,
            }
        }
    }

    /// Issue a single-range request and validate the response head.
    async fn open_range(&self, range: ByteRange) -> Result<HttpResponse> {
        let request = HttpRequest::get(self.file.url.clone())
            .range(range)
            .headers(self.options.headers.clone());
        let response = self.send(request).await?;
        if response.status == 200 {
            return Err(UpdaterError::RangeNotSupported {
                url: response.url.to_string(),
            });
        }
        let response = response.error_for_status()?;
        if let Some(value) = &response.content_range {
            match parse_content_range(value) {
                Some((got, _)) if got == range => {}
                _ => {
                    return Err(UpdaterError::protocol(
                        &response.url,
                        format!("asked for {range}, got Content-Range {value:?}"),
                    ))
                }
            }
        }
        if let Some(len) = response.content_length {
            if len != range.len() {
                return Err(UpdaterError::protocol(
                    &response.url,
                    format!("asked for {range}, got Content-Length {len}"),
                ));
            }
        }
        Ok(response)
    }

    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        tokio::select! {
            _ = self.cancel.cancelled() => Err(UpdaterError::Cancelled),
            response = self.transport.get(request) => response,
        }
    }

    async fn collect(&self, response: HttpResponse, limit: u64) -> Result<Bytes> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(UpdaterError::Cancelled),
            body = response.bytes_limited(limit) => body,
        }
    }

    /// Wait before the next attempt, or give up with `err`.
    async fn backoff(
        &self,
        err: UpdaterError,
        attempt: u32,
        what: &(dyn fmt::Display + Sync),
    ) -> Result<()> {
        if !err.is_retryable() || attempt > self.options.max_range_retries {
            return Err(err);
        }
        warn!("attempt {} for {} failed, retrying: {}", attempt, what, err);
        pause(self.cancel, self.options.retry_delay).await
    }
}

struct BatchLabel<'a>(&'a [ByteRange]);

impl fmt::Display for BatchLabel<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.0.first(), self.0.last()) {
            (Some(first), Some(last)) => write!(
                f,
                "{} ranges between {} and {}",
                self.0.len(),
                first.start,
                last.end
            ),
            _ => f.write_str("empty batch"),
        }
    }
}

/// Split ascending ranges into multi-range requests.
fn batches(ranges: &[ByteRange]) -> Vec<&[ByteRange]> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut bytes = 0u64;
    for (index, range) in ranges.iter().enumerate() {
        let full = index - start == MAX_RANGES_PER_REQUEST || bytes + range.len() > MAX_BATCH_BYTES;
        if index > start && full {
            out.push(&ranges[start..index]);
            start = index;
            bytes = 0;
        }
        bytes += range.len();
    }
    if start < ranges.len() {
        out.push(&ranges[start..]);
    }
    out
}
