//! Downloading a release file, differentially when possible.
//!
//! [`UpdateDownloader::download`] runs at most two stages. The differential
//! stage reconstructs the new file from the installed artifact and fetches
//! only the changed ranges. If it cannot finish for any reason other than
//! cancellation, the downloader falls back once to a full download. Both
//! stages write into `<destination>.partial`, which is moved into place only
//! after the whole-file checksum matched.

mod checksum;
mod differential;
mod full;
mod multipart;
mod session;

pub use checksum::{digest_file, verify_file};
pub use session::DownloadSession;

use crate::blockmap::BlockMap;
use crate::config::{RangeMode, UpdaterConfig};
use crate::error::{Result, UpdaterError};
use crate::events::ProgressCallback;
use crate::manifest::{Checksum, FileDescriptor};
use crate::transport::{BodyStream, HttpTransport};
use bytes::Bytes;
use differential::{DifferentialDownload, DifferentialResult};
use futures::StreamExt;
use reqwest::Url;
use session::ProgressTracker;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Tuning of one downloader.
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub range_mode: RangeMode,
    pub max_concurrent_ranges: usize,
    pub max_range_retries: u32,
    pub retry_delay: Duration,
    pub realign_blocks: bool,
    /// Try the differential stage before the full download.
    pub differential: bool,
    /// Headers added to every request.
    pub headers: Vec<(String, String)>,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            range_mode: RangeMode::Concurrent,
            max_concurrent_ranges: 4,
            max_range_retries: 3,
            retry_delay: Duration::from_millis(500),
            realign_blocks: true,
            differential: true,
            headers: Vec::new(),
        }
    }
}

impl DownloadOptions {
    /// Options from the updater config; an explicit range mode overrides `provider_mode`.
    pub fn from_config(config: &UpdaterConfig, provider_mode: RangeMode) -> Self {
        Self {
            range_mode: config.range_mode.unwrap_or(provider_mode),
            max_concurrent_ranges: config.max_concurrent_ranges.max(1),
            max_range_retries: config.max_range_retries,
            retry_delay: config.retry_delay(),
            realign_blocks: config.realign_blocks,
            differential: !config.disable_differential_download,
            headers: config.header_pairs(),
        }
    }

    pub fn with_headers(mut self, headers: impl IntoIterator<Item = (String, String)>) -> Self {
        self.headers.extend(headers);
        self
    }
}

/// Where the block map of the installed artifact comes from.
#[derive(Debug, Clone)]
pub enum OldBlockMap {
    /// Trailer of the installed file itself.
    Embedded,
    /// Compressed document on disk.
    File(PathBuf),
    /// Compressed document on the update server.
    Url(Url),
    /// Already decoded.
    Map(BlockMap),
}

/// The installed artifact used as the base of a differential download.
#[derive(Debug, Clone)]
pub struct OldArtifact {
    pub path: PathBuf,
    pub block_map: OldBlockMap,
    /// Digest recorded at install time; a mismatch means the file changed on disk.
    pub sha512: Option<Checksum>,
}

impl OldArtifact {
    pub fn new(path: impl Into<PathBuf>, block_map: OldBlockMap) -> Self {
        Self {
            path: path.into(),
            block_map,
            sha512: None,
        }
    }

    /// Use `<path>.blockmap` when it exists, the file's own trailer otherwise.
    pub fn locate(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut sidecar = path.clone().into_os_string();
        sidecar.push(".blockmap");
        let sidecar = PathBuf::from(sidecar);
        let block_map = if sidecar.is_file() {
            OldBlockMap::File(sidecar)
        } else {
            OldBlockMap::Embedded
        };
        Self::new(path, block_map)
    }

    pub fn with_sha512(mut self, checksum: Checksum) -> Self {
        self.sha512 = Some(checksum);
        self
    }
}

/// What a completed differential stage did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DifferentialStats {
    pub operations: usize,
    pub local_bytes: u64,
    pub remote_bytes: u64,
    /// HTTP requests issued, block maps included.
    pub requests: usize,
}

impl DifferentialStats {
    /// Share of the new file taken from the old one.
    pub fn reuse_percent(&self) -> f64 {
        let total = self.local_bytes + self.remote_bytes;
        if total == 0 {
            0.0
        } else {
            self.local_bytes as f64 / total as f64 * 100.0
        }
    }
}

/// Why the differential stage gave up.
#[derive(Debug, thiserror::Error)]
pub enum DifferentialFailure {
    #[error("release does not declare the file size")]
    UnknownSize,
    #[error("old file unusable: {0}")]
    OldFile(String),
    #[error("old file no longer matches its recorded checksum")]
    OldFileChanged,
    #[error("block map unavailable: {0}")]
    BlockMap(UpdaterError),
    #[error("nothing in the old file can be reused")]
    NothingToReuse,
    #[error("diff plan rejected: {0}")]
    Plan(UpdaterError),
    #[error("local I/O failed: {0}")]
    LocalIo(UpdaterError),
    #[error("{0}")]
    RangeNotSupported(UpdaterError),
    #[error("range request failed: {0}")]
    RangeFetch(UpdaterError),
    #[error("assembled file failed verification: {0}")]
    Verification(UpdaterError),
}

/// Outcome of [`UpdateDownloader::download`].
#[derive(Debug, Clone)]
pub struct DownloadReport {
    /// Verified file at its destination.
    pub path: PathBuf,
    pub size: u64,
    /// Set when the differential stage produced the file.
    pub differential: Option<DifferentialStats>,
    /// Why the differential stage was abandoned, if it ran and failed.
    pub fallback_reason: Option<String>,
}

impl DownloadReport {
    pub fn is_differential(&self) -> bool {
        self.differential.is_some()
    }
}

/// Two-stage download pipeline over an [`HttpTransport`].
#[derive(Clone)]
pub struct UpdateDownloader {
    transport: Arc<dyn HttpTransport>,
    options: DownloadOptions,
}

impl UpdateDownloader {
    pub fn new(transport: Arc<dyn HttpTransport>, options: DownloadOptions) -> Self {
        Self { transport, options }
    }

    pub fn options(&self) -> &DownloadOptions {
        &self.options
    }

    /// Download `file` to `destination`.
    ///
    /// With an `old` artifact and differential downloads enabled, the
    /// differential stage runs first. Progress reported to `progress` never
    /// decreases, also across the fallback. On cancellation or failure nothing
    /// is left at `destination` or its staging path.
    pub async fn download(
        &self,
        file: &FileDescriptor,
        old: Option<&OldArtifact>,
        destination: &Path,
        cancel: &CancellationToken,
        progress: Option<ProgressCallback>,
    ) -> Result<DownloadReport> {
        let staging = staging_path(destination);
        let tracker = Arc::new(ProgressTracker::new(file.size.unwrap_or(0), progress));
        let mut fallback_reason = None;

        if let Some(old) = old.filter(|_| self.options.differential) {
            let differential =
                DifferentialDownload::new(self.transport.as_ref(), &self.options, file, old, cancel);
            match differential.run(&staging, Arc::clone(&tracker)).await? {
                DifferentialResult::Completed(session, stats) => {
                    let size = session.total();
                    let path = session.persist(destination).await?;
                    info!(
                        "assembled {} differentially with {} requests",
                        path.display(),
                        stats.requests
                    );
                    return Ok(DownloadReport {
                        path,
                        size,
                        differential: Some(stats),
                        fallback_reason: None,
                    });
                }
                DifferentialResult::Fallback(reason) => {
                    warn!(
                        "cannot download {} differentially, falling back to full download: {}",
                        file.file_name(),
                        reason
                    );
                    fallback_reason = Some(reason.to_string());
                }
            }
        }

        let session = DownloadSession::create(
            &staging,
            file.size.unwrap_or(0),
            cancel.clone(),
            tracker,
        )?;
        let size = full::download_full(self.transport.as_ref(), file, &self.options, &session).await?;
        let path = session.persist(destination).await?;
        info!("downloaded {} ({} bytes)", path.display(), size);
        Ok(DownloadReport {
            path,
            size,
            differential: None,
            fallback_reason,
        })
    }
}

/// `<destination>.partial`, the file both stages write into.
pub fn staging_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".partial");
    destination.with_file_name(name)
}

pub(crate) async fn run_blocking<T, F>(task: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|err| UpdaterError::Other(format!("task join error: {err}")))?
}

/// Next body chunk, or [`UpdaterError::Cancelled`] as soon as `cancel` fires.
pub(crate) async fn next_chunk(
    body: &mut BodyStream,
    cancel: &CancellationToken,
) -> Result<Option<Bytes>> {
    tokio::select! {
        _ = cancel.cancelled() => Err(UpdaterError::Cancelled),
        chunk = body.next() => chunk.transpose(),
    }
}

/// Sleep `delay` unless cancelled first.
pub(crate) async fn pause(cancel: &CancellationToken, delay: Duration) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(UpdaterError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}
