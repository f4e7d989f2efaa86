//! State owned by one download attempt.

use super::checksum::verify_file;
use crate::error::{Result, UpdaterError};
use crate::events::{ProgressCallback, ProgressInfo};
use crate::manifest::Checksum;
use bytes::Bytes;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::task;
use tokio_util::sync::CancellationToken;

/// Largest slice moved by one blocking read or write.
pub(crate) const IO_CHUNK: usize = 1024 * 1024;

/// Turns per-stage byte counts into monotonic progress reports.
pub(crate) struct ProgressTracker {
    total: u64,
    started: Instant,
    reported: Mutex<u64>,
    callback: Option<ProgressCallback>,
}

impl ProgressTracker {
    pub(crate) fn new(total: u64, callback: Option<ProgressCallback>) -> Self {
        Self {
            total,
            started: Instant::now(),
            reported: Mutex::new(0),
            callback,
        }
    }

    /// Report `transferred` bytes, unless an earlier report already went further.
    ///
    /// A fallback stage restarts its own count from zero; its reports stay silent
    /// until they overtake what the previous stage announced.
    pub(crate) fn report(&self, transferred: u64) {
        let Some(callback) = &self.callback else {
            return;
        };
        let mut reported = match self.reported.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if transferred <= *reported {
            return;
        }
        let delta = transferred - *reported;
        *reported = transferred;

        let elapsed = self.started.elapsed().as_secs_f64();
        let percent = if self.total == 0 {
            0.0
        } else {
            (transferred as f64 / self.total as f64 * 100.0).min(100.0)
        };
        callback(ProgressInfo {
            transferred,
            total: self.total,
            delta,
            percent,
            bytes_per_second: if elapsed > 0.0 {
                (transferred as f64 / elapsed) as u64
            } else {
                0
            },
        });
    }
}

/// Destination file and bookkeeping of one attempt.
///
/// The file is deleted when the session is dropped without [`persist`](Self::persist),
/// so a cancelled or failed attempt never leaves a file behind for the installer.
pub struct DownloadSession {
    path: PathBuf,
    file: Option<Arc<File>>,
    total: u64,
    transferred: AtomicU64,
    retries: Mutex<HashMap<u64, u32>>,
    cancel: CancellationToken,
    progress: Arc<ProgressTracker>,
    keep: bool,
}

impl DownloadSession {
    /// Create (or truncate) the destination and pre-size it to `total` bytes.
    pub(crate) fn create(
        path: &Path,
        total: u64,
        cancel: CancellationToken,
        progress: Arc<ProgressTracker>,
    ) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let session = Self {
            path: path.to_path_buf(),
            file: Some(Arc::new(file)),
            total,
            transferred: AtomicU64::new(0),
            retries: Mutex::new(HashMap::new()),
            cancel,
            progress,
            keep: false,
        };
        if total > 0 {
            // disk-full surfaces here rather than halfway through the transfer
            session.handle()?.set_len(total)?;
        }
        Ok(session)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::SeqCst)
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Fail with [`UpdaterError::Cancelled`] once cancellation was requested.
    pub(crate) fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(UpdaterError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn handle(&self) -> Result<&Arc<File>> {
        self.file
            .as_ref()
            .ok_or_else(|| UpdaterError::validation("download session already closed"))
    }

    /// Count bytes of the current stage as done and report progress.
    pub(crate) fn advance(&self, bytes: u64) {
        let now = self.transferred.fetch_add(bytes, Ordering::SeqCst) + bytes;
        self.progress.report(now);
    }

    /// Restart the byte count, e.g. when a full download is re-issued from the start.
    pub(crate) fn reset_transferred(&self) {
        self.transferred.store(0, Ordering::SeqCst);
    }

    /// Record one more attempt of the range starting at `offset`; returns the attempt count.
    pub(crate) fn record_retry(&self, offset: u64) -> u32 {
        let mut retries = match self.retries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let count = retries.entry(offset).or_insert(0);
        *count += 1;
        *count
    }

    /// Write `data` at `offset` of the destination.
    ///
    /// Callers guarantee that concurrent writes target disjoint ranges.
    pub(crate) async fn write_at(&self, offset: u64, data: Bytes) -> Result<()> {
        let file = Arc::clone(self.handle()?);
        task::spawn_blocking(move || write_all_at(&file, &data, offset))
            .await
            .map_err(|err| UpdaterError::Other(format!("task join error: {err}")))??;
        Ok(())
    }

    /// Copy `length` bytes of `source` at `source_offset` to `offset` of the destination.
    pub(crate) async fn copy_from(
        &self,
        source: Arc<File>,
        source_offset: u64,
        offset: u64,
        length: u64,
    ) -> Result<()> {
        let file = Arc::clone(self.handle()?);
        let cancel = self.cancel.clone();
        task::spawn_blocking(move || -> Result<()> {
            let mut buf = vec![0u8; IO_CHUNK.min(length as usize)];
            let mut done = 0u64;
            while done < length {
                if cancel.is_cancelled() {
                    return Err(UpdaterError::Cancelled);
                }
                let n = ((length - done) as usize).min(buf.len());
                read_exact_at(&source, &mut buf[..n], source_offset + done)?;
                write_all_at(&file, &buf[..n], offset + done)?;
                done += n as u64;
            }
            Ok(())
        })
        .await
        .map_err(|err| UpdaterError::Other(format!("task join error: {err}")))?
    }

    /// Cut the file to `len` bytes, used when the size was not known up front.
    pub(crate) async fn truncate(&self, len: u64) -> Result<()> {
        let file = Arc::clone(self.handle()?);
        task::spawn_blocking(move || file.set_len(len))
            .await
            .map_err(|err| UpdaterError::Other(format!("task join error: {err}")))??;
        Ok(())
    }

    /// Flush written data to disk.
    pub(crate) async fn sync(&self) -> Result<()> {
        let file = Arc::clone(self.handle()?);
        task::spawn_blocking(move || file.sync_all())
            .await
            .map_err(|err| UpdaterError::Other(format!("task join error: {err}")))??;
        Ok(())
    }

    /// Verify the whole staged file against `expected`, giving up on cancellation.
    pub(crate) async fn verify(&self, expected: &Checksum) -> Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(UpdaterError::Cancelled),
            verified = verify_file(&self.path, expected) => verified,
        }
    }

    /// Close the file and move it to `destination`, ending the session.
    ///
    /// A cancelled session is dropped instead, which deletes the staged file.
    pub(crate) async fn persist(mut self, destination: &Path) -> Result<PathBuf> {
        self.sync().await?;
        self.check_cancelled()?;
        self.file = None;
        if destination.exists() {
            fs::remove_file(destination)?;
        }
        fs::rename(&self.path, destination)?;
        self.keep = true;
        Ok(destination.to_path_buf())
    }
}

impl Drop for DownloadSession {
    fn drop(&mut self) {
        // close before deleting, Windows refuses to remove open files
        self.file = None;
        if !self.keep {
            if let Err(err) = fs::remove_file(&self.path) {
                if err.kind() != io::ErrorKind::NotFound {
                    tracing::warn!("failed to remove partial download {:?}: {}", self.path, err);
                }
            }
        }
    }
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_write(buf, offset)?;
        if n == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        buf = &buf[n..];
        offset += n as u64;
    }
    Ok(())
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_read(buf, offset)?;
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        buf = &mut buf[n..];
        offset += n as u64;
    }
    Ok(())
}
