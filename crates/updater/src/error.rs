use std::path::PathBuf;

/// Convenient result alias for updater operations.
pub type Result<T> = std::result::Result<T, UpdaterError>;

/// Errors that can occur while checking for, downloading, or installing an update.
///
/// Every variant carries a stable machine-readable code, see [`UpdaterError::code`].
#[derive(thiserror::Error, Debug)]
pub enum UpdaterError {
    /// The channel manifest is missing, unparsable, or the channel does not exist.
    #[error("unable to find latest version on {provider}: {reason}")]
    LatestVersionNotFound {
        /// Human readable description of the provider.
        provider: String,
        /// Underlying cause.
        reason: String,
    },
    /// The channel manifest parsed but its content is unusable.
    #[error("invalid update info in {file}: {reason}")]
    InvalidUpdateInfo {
        /// Name of the channel file.
        file: String,
        /// What was wrong with it.
        reason: String,
    },
    /// No file of the release matches the running platform and packaging.
    #[error("no {packaging} asset for {arch} in release {version}: {reason}")]
    NoMatchingAsset {
        /// Requested packaging tag (e.g. `AppImage`).
        packaging: String,
        /// Requested architecture.
        arch: String,
        /// Release version being inspected.
        version: String,
        /// Why selection failed (none or several candidates).
        reason: String,
    },
    /// Failed to parse or compare versions.
    #[error("version error: {0}")]
    Version(#[from] semver::Error),
    /// Network request failed before a response was received.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// Server answered with a status outside of 200/206.
    #[error("HTTP request to {url} failed with status {status}")]
    HttpStatus {
        /// Requested URL.
        url: String,
        /// Returned status code.
        status: u16,
    },
    /// Server rejected the credentials of a licensing or private backend.
    #[error("authentication failed for {url} (status {status})")]
    Authentication {
        /// Requested URL.
        url: String,
        /// Returned status code.
        status: u16,
    },
    /// A ranged request was answered with the full representation.
    #[error("server ignored the Range header for {url}")]
    RangeNotSupported {
        /// Requested URL.
        url: String,
    },
    /// The response did not have the expected shape (length, Content-Range, multipart body).
    #[error("unexpected response from {url}: {reason}")]
    Protocol {
        /// Requested URL.
        url: String,
        /// What was unexpected.
        reason: String,
    },
    /// A block map could not be decoded or is internally inconsistent.
    #[error("invalid block map: {0}")]
    InvalidBlockMap(String),
    /// The diff plan does not cover exactly the declared file size.
    #[error("diff plan covers {planned} bytes but the file declares {declared}")]
    PlanSizeMismatch {
        /// Sum of all operation lengths.
        planned: u64,
        /// Declared size of the new file.
        declared: u64,
    },
    /// The assembled or downloaded file did not match the declared checksum.
    #[error("checksum mismatch for {} (expected {expected}, got {actual})", .path.display())]
    ChecksumMismatch {
        /// File that was verified.
        path: PathBuf,
        /// Declared digest.
        expected: String,
        /// Computed digest.
        actual: String,
    },
    /// The currently installed artifact could not be located.
    #[error("old file not found: {}", .0.display())]
    OldFileNotFound(PathBuf),
    /// Failed to perform an I/O operation.
    #[error("filesystem operation failed: {0}")]
    Io(#[from] std::io::Error),
    /// The operation was cancelled through the cancellation token.
    #[error("operation cancelled")]
    Cancelled,
    /// Another check or download is already running on this updater.
    #[error("another update attempt is already in progress")]
    Busy,
    /// The requested transition is not allowed from the current state.
    #[error("cannot {action} while updater is {state}")]
    InvalidState {
        /// Requested action.
        action: &'static str,
        /// Current state description.
        state: String,
    },
    /// This installation is not eligible for self-update.
    #[error("updater is not active: {0}")]
    NotEligible(String),
    /// The installer collaborator failed.
    #[error("installer failed: {0}")]
    Install(String),
    /// Configuration could not be loaded or is inconsistent.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Generic error.
    #[error("{0}")]
    Other(String),
}

impl UpdaterError {
    /// Helper for wrapping validation failures.
    pub fn validation(msg: impl Into<String>) -> Self {
        UpdaterError::Other(msg.into())
    }

    /// Helper for protocol violations on a given URL.
    pub fn protocol(url: impl ToString, reason: impl Into<String>) -> Self {
        UpdaterError::Protocol {
            url: url.to_string(),
            reason: reason.into(),
        }
    }

    /// Stable machine-readable code of this error.
    pub fn code(&self) -> &'static str {
        match self {
            UpdaterError::LatestVersionNotFound { .. } => "ERR_UPDATER_LATEST_VERSION_NOT_FOUND",
            UpdaterError::InvalidUpdateInfo { .. } => "ERR_UPDATER_INVALID_UPDATE_INFO",
            UpdaterError::NoMatchingAsset { .. } => "ERR_UPDATER_NO_MATCHING_ASSET",
            UpdaterError::Version(_) => "ERR_UPDATER_INVALID_VERSION",
            UpdaterError::Http(_) => "ERR_UPDATER_HTTP",
            UpdaterError::HttpStatus { .. } => "ERR_UPDATER_HTTP_STATUS",
            UpdaterError::Authentication { .. } => "ERR_UPDATER_AUTHENTICATION",
            UpdaterError::RangeNotSupported { .. } => "ERR_UPDATER_RANGE_NOT_SUPPORTED",
            UpdaterError::Protocol { .. } => "ERR_UPDATER_PROTOCOL",
            UpdaterError::InvalidBlockMap(_) => "ERR_UPDATER_INVALID_BLOCKMAP",
            UpdaterError::PlanSizeMismatch { .. } => "ERR_UPDATER_PLAN_SIZE_MISMATCH",
            UpdaterError::ChecksumMismatch { .. } => "ERR_UPDATER_CHECKSUM_MISMATCH",
            UpdaterError::OldFileNotFound(_) => "ERR_UPDATER_OLD_FILE_NOT_FOUND",
            UpdaterError::Io(_) => "ERR_UPDATER_IO",
            UpdaterError::Cancelled => "ERR_UPDATER_CANCELLED",
            UpdaterError::Busy => "ERR_UPDATER_BUSY",
            UpdaterError::InvalidState { .. } => "ERR_UPDATER_INVALID_STATE",
            UpdaterError::NotEligible(_) => "ERR_UPDATER_NOT_ELIGIBLE",
            UpdaterError::Install(_) => "ERR_UPDATER_INSTALL",
            UpdaterError::Config(_) => "ERR_UPDATER_CONFIG",
            UpdaterError::Other(_) => "ERR_UPDATER_INTERNAL",
        }
    }

    /// Whether a single failed request may be re-issued.
    ///
    /// Connection failures and transient statuses (408, 429, 5xx) are retryable.
    /// Protocol violations, including a server that ignores `Range`, are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            UpdaterError::Http(err) => !err.is_builder() && !err.is_redirect(),
            UpdaterError::HttpStatus { status, .. } => {
                (500..=599).contains(status) || *status == 408 || *status == 429
            }
            UpdaterError::Io(_) => true,
            _ => false,
        }
    }

    /// Whether this error is the result of cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, UpdaterError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        let err = UpdaterError::LatestVersionNotFound {
            provider: "generic".into(),
            reason: "404".into(),
        };
        assert_eq!(err.code(), "ERR_UPDATER_LATEST_VERSION_NOT_FOUND");
        assert_eq!(UpdaterError::Cancelled.code(), "ERR_UPDATER_CANCELLED");
        assert_eq!(
            UpdaterError::PlanSizeMismatch {
                planned: 1,
                declared: 2
            }
            .code(),
            "ERR_UPDATER_PLAN_SIZE_MISMATCH"
        );
    }

    #[test]
    fn transient_statuses_are_retryable() {
        let status = |status| UpdaterError::HttpStatus {
            url: "https://example.com/a".into(),
            status,
        };
        assert!(status(503).is_retryable());
        assert!(status(429).is_retryable());
        assert!(status(408).is_retryable());
        assert!(!status(404).is_retryable());
        assert!(!status(416).is_retryable());
        assert!(!UpdaterError::RangeNotSupported {
            url: "https://example.com/a".into()
        }
        .is_retryable());
    }

    #[test]
    fn checksum_mismatch_renders_path() {
        let err = UpdaterError::ChecksumMismatch {
            path: PathBuf::from("/tmp/app.AppImage"),
            expected: "aa".into(),
            actual: "bb".into(),
        };
        assert!(err.to_string().contains("/tmp/app.AppImage"));
    }
}
