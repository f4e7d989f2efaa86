use crate::{
    config::UpdaterConfig,
    download::{DownloadOptions, OldArtifact, OldBlockMap, UpdateDownloader},
    error::{Result, UpdaterError},
    events::{ProgressCallback, ProgressInfo, UpdaterEvent},
    installer::{InstallOptions, InstallOutcome, Installer},
    manifest::{Checksum, FileDescriptor, VersionInfo},
    provider::{select_file, Provider, ProviderConfig},
    transport::HttpTransport,
};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 256;

/// Lifecycle state of an [`Updater`]. Only the updater itself moves between states.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdaterState {
    Idle,
    Checking,
    Downloading(ProgressInfo),
    /// Verified update staged at the given path.
    Downloaded(PathBuf),
    Installing,
    Failed(String),
}

impl fmt::Display for UpdaterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdaterState::Idle => f.write_str("idle"),
            UpdaterState::Checking => f.write_str("checking"),
            UpdaterState::Downloading(p) => write!(f, "downloading ({:.0}%)", p.percent),
            UpdaterState::Downloaded(path) => write!(f, "downloaded ({})", path.display()),
            UpdaterState::Installing => f.write_str("installing"),
            UpdaterState::Failed(reason) => write!(f, "failed ({reason})"),
        }
    }
}

/// A newer release and the file chosen for this installation.
#[derive(Debug, Clone)]
pub struct AvailableUpdate {
    pub info: VersionInfo,
    pub file: FileDescriptor,
}

impl AvailableUpdate {
    pub fn version(&self) -> &semver::Version {
        &self.info.version
    }
}

/// Result of [`Updater::check_for_updates`].
#[derive(Debug, Clone)]
pub struct UpdateCheckResult {
    /// Latest release published on the channel.
    pub version_info: VersionInfo,
    /// Whether that release is offered to this installation.
    pub is_update_available: bool,
    /// File selected for download, set when an update is available.
    pub file: Option<FileDescriptor>,
    /// Staged file, set when the check started an automatic download.
    pub downloaded: Option<PathBuf>,
}

/// Drives check, download, and install for one application.
///
/// All methods take `&self`; share the updater in an `Arc` to cancel from another task.
/// At most one check, download, or install runs at a time; a concurrent call fails
/// with [`UpdaterError::Busy`].
pub struct Updater {
    config: UpdaterConfig,
    provider: Arc<dyn Provider>,
    downloader: UpdateDownloader,
    installer: Arc<dyn Installer>,
    state: Arc<watch::Sender<UpdaterState>>,
    events: broadcast::Sender<UpdaterEvent>,
    attempt: tokio::sync::Mutex<()>,
    cancel: Mutex<CancellationToken>,
    available: Mutex<Option<AvailableUpdate>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Updater {
    /// Create an updater over an already built provider.
    pub fn new(
        config: UpdaterConfig,
        provider: Arc<dyn Provider>,
        transport: Arc<dyn HttpTransport>,
        installer: Arc<dyn Installer>,
    ) -> Result<Self> {
        config.validate()?;
        let options = DownloadOptions::from_config(&config, provider.range_mode())
            .with_headers(provider.request_headers());
        debug!(
            "updater for {} using {:?} range requests",
            provider.describe(),
            options.range_mode
        );
        let (state, _) = watch::channel(UpdaterState::Idle);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            downloader: UpdateDownloader::new(transport, options),
            config,
            provider,
            installer,
            state: Arc::new(state),
            events,
            attempt: tokio::sync::Mutex::new(()),
            cancel: Mutex::new(CancellationToken::new()),
            available: Mutex::new(None),
        })
    }

    /// Create an updater and its provider from configuration.
    pub fn from_provider_config(
        config: UpdaterConfig,
        provider: &ProviderConfig,
        transport: Arc<dyn HttpTransport>,
        installer: Arc<dyn Installer>,
    ) -> Result<Self> {
        let provider = provider.build(&config, Arc::clone(&transport))?;
        Self::new(config, provider, transport, installer)
    }

    pub fn config(&self) -> &UpdaterConfig {
        &self.config
    }

    /// Receive events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<UpdaterEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> UpdaterState {
        self.state.borrow().clone()
    }

    /// Observe state changes.
    pub fn watch_state(&self) -> watch::Receiver<UpdaterState> {
        self.state.subscribe()
    }

    /// Whether this installation may update itself.
    pub fn is_updater_active(&self) -> bool {
        self.config.self_update_eligible
    }

    /// Update found by the last successful check, if any.
    pub fn available_update(&self) -> Option<AvailableUpdate> {
        lock(&self.available).clone()
    }

    fn set_state(&self, state: UpdaterState) {
        debug!("updater state: {}", state);
        self.state.send_replace(state);
    }

    fn emit(&self, event: UpdaterEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn fail(&self, err: &UpdaterError) {
        error!("update attempt failed: {} ({})", err, err.code());
        self.set_state(UpdaterState::Failed(err.to_string()));
        self.emit(UpdaterEvent::Error {
            code: err.code(),
            message: err.to_string(),
        });
    }

    fn fresh_token(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *lock(&self.cancel) = token.clone();
        token
    }

    /// Ask the provider for the latest release and decide whether it is offered.
    ///
    /// Leaves the state `Idle` (or `Downloaded` when an update was already staged)
    /// unless the check fails. With `auto_download` an offered update is
    /// downloaded before returning.
    pub async fn check_for_updates(&self) -> Result<UpdateCheckResult> {
        if !self.is_updater_active() {
            return Err(UpdaterError::NotEligible(
                "installation is not eligible for self-update".into(),
            ));
        }
        let guard = self.attempt.try_lock().map_err(|_| UpdaterError::Busy)?;
        let previous = self.state();
        if previous == UpdaterState::Installing {
            return Err(UpdaterError::InvalidState {
                action: "check for updates",
                state: previous.to_string(),
            });
        }

        let cancel = self.fresh_token();
        self.set_state(UpdaterState::Checking);
        self.emit(UpdaterEvent::CheckingForUpdate);
        let checked = tokio::select! {
            _ = cancel.cancelled() => Err(UpdaterError::Cancelled),
            checked = self.resolve_update() => checked,
        };
        let mut result = match checked {
            Ok(result) => result,
            Err(err) if err.is_cancelled() => {
                self.set_state(UpdaterState::Idle);
                self.emit(UpdaterEvent::UpdateCancelled);
                return Err(err);
            }
            Err(err) => {
                self.fail(&err);
                return Err(err);
            }
        };

        self.set_state(match previous {
            UpdaterState::Downloaded(path) => UpdaterState::Downloaded(path),
            _ => UpdaterState::Idle,
        });
        let version = result.version_info.version.clone();
        match &result.file {
            Some(file) if result.is_update_available => {
                info!("update {} available: {}", version, file.url);
                *lock(&self.available) = Some(AvailableUpdate {
                    info: result.version_info.clone(),
                    file: file.clone(),
                });
                self.emit(UpdaterEvent::UpdateAvailable {
                    version,
                    release_name: result.version_info.release_name.clone(),
                });
            }
            _ => {
                info!(
                    "no update available (current {}, latest {})",
                    self.config.current_version, version
                );
                *lock(&self.available) = None;
                self.emit(UpdaterEvent::UpdateNotAvailable { version });
            }
        }
        drop(guard);

        if result.is_update_available && self.config.auto_download {
            result.downloaded = Some(self.download_update().await?);
        }
        Ok(result)
    }

    async fn resolve_update(&self) -> Result<UpdateCheckResult> {
        let info = self.provider.get_latest_version().await?;
        let not_available = |info: VersionInfo| UpdateCheckResult {
            version_info: info,
            is_update_available: false,
            file: None,
            downloaded: None,
        };

        let allow_downgrade =
            self.config.allow_downgrade && self.config.channel_override().is_some();
        if !is_update_available(
            &info.version,
            &self.config.current_version,
            self.config.allow_prerelease,
            allow_downgrade,
        ) {
            return Ok(not_available(info));
        }
        if !in_staged_rollout(info.staging_percentage, self.config.staging_user_id.as_deref()) {
            info!(
                "update {} is staged to {:?}% of installations, this one is not included",
                info.version, info.staging_percentage
            );
            return Ok(not_available(info));
        }

        let files = self.provider.resolve_files(&info).await?;
        let (packaging, excluded) = self.config.platform.default_packaging();
        let file = select_file(&files, packaging, excluded, self.config.arch, &info.version)?;
        Ok(UpdateCheckResult {
            version_info: info,
            is_update_available: true,
            file: Some(file),
            downloaded: None,
        })
    }

    /// Download the update found by the last check.
    ///
    /// Emits progress events while `Downloading`, then `UpdateDownloaded`,
    /// `UpdateCancelled`, or `Error`.
    pub async fn download_update(&self) -> Result<PathBuf> {
        let _guard = self.attempt.try_lock().map_err(|_| UpdaterError::Busy)?;
        let state = self.state();
        let update = match (&state, self.available_update()) {
            (UpdaterState::Installing, _) | (_, None) => {
                return Err(UpdaterError::InvalidState {
                    action: "download",
                    state: state.to_string(),
                })
            }
            (_, Some(update)) => update,
        };

        let cancel = self.fresh_token();
        let total = update.file.size.unwrap_or(0);
        self.set_state(UpdaterState::Downloading(ProgressInfo {
            transferred: 0,
            total,
            delta: 0,
            percent: 0.0,
            bytes_per_second: 0,
        }));

        let destination = self.config.staging_dir().join(update.file.file_name());
        let old = self.old_artifact(&update.file);
        let progress: ProgressCallback = {
            let state = Arc::clone(&self.state);
            let events = self.events.clone();
            Arc::new(move |info: ProgressInfo| {
                state.send_replace(UpdaterState::Downloading(info));
                let _ = events.send(UpdaterEvent::DownloadProgress(info));
            })
        };

        let downloaded = self
            .downloader
            .download(&update.file, old.as_ref(), &destination, &cancel, Some(progress))
            .await;
        // a cancel that raced the last steps of the download wins
        let downloaded = downloaded.and_then(|report| {
            let staged = self.state.send_if_modified(|state| {
                if cancel.is_cancelled() {
                    false
                } else {
                    *state = UpdaterState::Downloaded(report.path.clone());
                    true
                }
            });
            if staged {
                Ok(report)
            } else {
                discard(&report.path);
                Err(UpdaterError::Cancelled)
            }
        });
        match downloaded {
            Ok(report) => {
                info!(
                    "update {} ready at {} ({})",
                    update.version(),
                    report.path.display(),
                    if report.is_differential() {
                        "differential"
                    } else {
                        "full"
                    }
                );
                self.emit(UpdaterEvent::UpdateDownloaded {
                    version: update.version().clone(),
                    path: report.path.clone(),
                    is_differential: report.is_differential(),
                    stats: report.differential,
                });
                Ok(report.path)
            }
            Err(err) if err.is_cancelled() => {
                info!("download of {} cancelled", update.version());
                self.set_state(UpdaterState::Idle);
                self.emit(UpdaterEvent::UpdateCancelled);
                Err(err)
            }
            Err(err) => {
                self.fail(&err);
                Err(err)
            }
        }
    }

    fn old_artifact(&self, file: &FileDescriptor) -> Option<OldArtifact> {
        let path = self.config.installed_artifact.as_ref()?;
        let mut old = if file.is_packaging("AppImage") {
            OldArtifact::new(path, OldBlockMap::Embedded)
        } else {
            OldArtifact::locate(path)
        };
        if let Some(raw) = &self.config.installed_artifact_sha512 {
            match Checksum::parse_sha512(raw) {
                Ok(checksum) => old = old.with_sha512(checksum),
                Err(err) => warn!("ignoring recorded checksum of {}: {}", path.display(), err),
            }
        }
        Some(old)
    }

    /// Abort the running check or download and return to `Idle`.
    ///
    /// A staged download is deleted. Cancelling while idle does nothing.
    pub fn cancel(&self) {
        lock(&self.cancel).cancel();
        // running attempts move to Idle themselves once they observe the token
        let mut staged = None;
        self.state.send_if_modified(|state| match state {
            UpdaterState::Downloaded(path) => {
                staged = Some(path.clone());
                *state = UpdaterState::Idle;
                true
            }
            UpdaterState::Failed(_) => {
                *state = UpdaterState::Idle;
                true
            }
            _ => false,
        });
        if let Some(path) = staged {
            info!("discarding staged update {}", path.display());
            discard(&path);
            self.emit(UpdaterEvent::UpdateCancelled);
        }
    }

    /// Hand the staged update to the installer.
    ///
    /// The state stays `Installing` on success; the installer usually replaces
    /// the running process.
    pub async fn quit_and_install(&self, options: InstallOptions) -> Result<InstallOutcome> {
        let _guard = self.attempt.try_lock().map_err(|_| UpdaterError::Busy)?;
        let path = match self.state() {
            UpdaterState::Downloaded(path) => path,
            state => {
                return Err(UpdaterError::InvalidState {
                    action: "install",
                    state: state.to_string(),
                })
            }
        };
        self.set_state(UpdaterState::Installing);
        match self.installer.install(&path, options).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                self.fail(&err);
                Err(err)
            }
        }
    }
}

fn discard(path: &Path) {
    if let Err(err) = std::fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!("failed to remove staged update {:?}: {}", path, err);
        }
    }
}

/// Whether `latest` should be offered to an installation running `current`.
///
/// Prereleases are only offered with `allow_prerelease` or when already running
/// one. Lower versions are only offered with `allow_downgrade`.
pub fn is_update_available(
    latest: &semver::Version,
    current: &semver::Version,
    allow_prerelease: bool,
    allow_downgrade: bool,
) -> bool {
    if latest == current {
        return false;
    }
    if !latest.pre.is_empty() && !(allow_prerelease || !current.pre.is_empty()) {
        return false;
    }
    latest > current || allow_downgrade
}

/// Rollout bucket of an installation in `[0, 100)`.
pub fn staging_bucket(user_id: &str) -> f64 {
    let digest = Sha256::digest(user_id.as_bytes());
    let value = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    f64::from(value) / (f64::from(u32::MAX) + 1.0) * 100.0
}

fn in_staged_rollout(percentage: Option<f64>, user_id: Option<&str>) -> bool {
    match (percentage, user_id) {
        (Some(percentage), Some(id)) if percentage < 100.0 => staging_bucket(id) < percentage,
        _ => true,
    }
}
