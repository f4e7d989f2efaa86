//! Typed notifications emitted by the updater.

use crate::download::DifferentialStats;
use std::path::PathBuf;
use std::sync::Arc;

/// Download progress of one attempt. `transferred` never decreases within an attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressInfo {
    /// Bytes of the new file that are in place.
    pub transferred: u64,
    /// Declared size of the new file, 0 when unknown.
    pub total: u64,
    /// Bytes added since the previous report.
    pub delta: u64,
    pub percent: f64,
    pub bytes_per_second: u64,
}

/// Receiver of progress reports.
pub type ProgressCallback = Arc<dyn Fn(ProgressInfo) + Send + Sync>;

/// Event stream of an [`Updater`](crate::Updater).
///
/// For one download attempt, `DownloadProgress` events only precede the
/// terminal `UpdateDownloaded`, `UpdateCancelled`, or `Error` event.
#[derive(Debug, Clone)]
pub enum UpdaterEvent {
    CheckingForUpdate,
    UpdateAvailable {
        version: semver::Version,
        release_name: Option<String>,
    },
    UpdateNotAvailable {
        version: semver::Version,
    },
    DownloadProgress(ProgressInfo),
    UpdateDownloaded {
        version: semver::Version,
        path: PathBuf,
        is_differential: bool,
        stats: Option<DifferentialStats>,
    },
    UpdateCancelled,
    Error {
        code: &'static str,
        message: String,
    },
}
