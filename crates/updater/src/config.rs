//! Configuration for the updater.

use crate::error::{Result, UpdaterError};
use crate::platform::{Arch, Platform, DEFAULT_CHANNEL};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How `FetchRemote` operations of a diff plan are turned into HTTP requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RangeMode {
    /// Bounded pool of concurrent single-range requests.
    Concurrent,
    /// Batched `Range: bytes=a-b,c-d` requests answered with `multipart/byteranges`.
    MultiRange,
    /// One single-range request at a time.
    Sequential,
}

/// Configuration for the updater, resolved once at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UpdaterConfig {
    /// Version of the running application.
    pub current_version: semver::Version,
    /// Explicit channel override. `None` uses the provider's channel, then `stable`.
    pub channel: Option<String>,
    /// Offer prerelease versions to a non-prerelease install.
    pub allow_prerelease: bool,
    /// Offer lower versions when the channel was explicitly overridden.
    pub allow_downgrade: bool,
    /// Start downloading as soon as a check finds an update.
    pub auto_download: bool,
    /// Always take the full-download path.
    pub disable_differential_download: bool,
    /// Forces a range mode instead of the provider's capability.
    pub range_mode: Option<RangeMode>,
    /// Upper bound of concurrent range requests.
    pub max_concurrent_ranges: usize,
    /// Retries of one failed range before giving up on the differential attempt.
    pub max_range_retries: u32,
    /// Fixed delay between two attempts of the same range.
    pub range_retry_delay_ms: u64,
    /// Timeout applied to every HTTP request of a transport built with `ReqwestTransport::from_config`.
    pub request_timeout_secs: u64,
    /// Look up blocks by checksum after the block lists drift apart.
    pub realign_blocks: bool,
    /// Whether this installation may update itself at all.
    pub self_update_eligible: bool,
    /// Path of the running artifact, used as the old file of a differential download.
    pub installed_artifact: Option<PathBuf>,
    /// Full-file SHA-512 recorded for the installed artifact when it was installed.
    pub installed_artifact_sha512: Option<String>,
    /// Staging directory for downloads.
    pub download_dir: Option<PathBuf>,
    /// Target platform.
    pub platform: Platform,
    /// Target architecture.
    pub arch: Arch,
    /// Identifier that places this installation in a staged-rollout bucket.
    pub staging_user_id: Option<String>,
    /// Append a `noCache` query parameter to manifest requests.
    pub add_no_cache_query: bool,
    /// Extra headers sent with every request.
    pub request_headers: BTreeMap<String, String>,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            current_version: semver::Version::new(0, 0, 0),
            channel: None,
            allow_prerelease: false,
            allow_downgrade: false,
            auto_download: false,
            disable_differential_download: false,
            range_mode: None,
            max_concurrent_ranges: 4,
            max_range_retries: 3,
            range_retry_delay_ms: 500,
            request_timeout_secs: 300,
            realign_blocks: true,
            self_update_eligible: true,
            installed_artifact: None,
            installed_artifact_sha512: None,
            download_dir: None,
            platform: Platform::current(),
            arch: Arch::current(),
            staging_user_id: None,
            add_no_cache_query: false,
            request_headers: BTreeMap::new(),
        }
    }
}

impl UpdaterConfig {
    /// Create a config for the given running version.
    pub fn new(current_version: semver::Version) -> Self {
        Self {
            current_version,
            ..Self::default()
        }
    }

    /// Load a config from a JSON file; absent fields keep their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path)
            .map_err(|err| UpdaterError::Config(format!("{}: {err}", path.display())))?;
        let config: UpdaterConfig = serde_json::from_slice(&raw)
            .map_err(|err| UpdaterError::Config(format!("{}: {err}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_ranges == 0 {
            return Err(UpdaterError::Config(
                "maxConcurrentRanges must be at least 1".into(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(UpdaterError::Config(
                "requestTimeoutSecs must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Fill `installed_artifact` from the `APPIMAGE` variable set by the AppImage runtime.
    pub fn detect_installed_artifact(mut self) -> Self {
        if self.installed_artifact.is_none() {
            self.installed_artifact = std::env::var_os("APPIMAGE").map(PathBuf::from);
        }
        self
    }

    /// Set the channel override.
    pub fn channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    /// Set the installed artifact used as the differential base.
    pub fn installed_artifact(mut self, path: impl Into<PathBuf>) -> Self {
        self.installed_artifact = Some(path.into());
        self
    }

    /// Set the staging directory.
    pub fn download_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.download_dir = Some(path.into());
        self
    }

    /// Force a range mode.
    pub fn range_mode(mut self, mode: RangeMode) -> Self {
        self.range_mode = Some(mode);
        self
    }

    /// Enable/disable differential downloads.
    pub fn differential(mut self, enabled: bool) -> Self {
        self.disable_differential_download = !enabled;
        self
    }

    /// Enable/disable automatic download after a successful check.
    pub fn auto_download(mut self, enabled: bool) -> Self {
        self.auto_download = enabled;
        self
    }

    /// Set the target platform and architecture.
    pub fn target(mut self, platform: Platform, arch: Arch) -> Self {
        self.platform = platform;
        self.arch = arch;
        self
    }

    /// Set the delay between retries of one range.
    pub fn range_retry_delay(mut self, delay: Duration) -> Self {
        self.range_retry_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Channel requested by the caller, if any.
    pub fn channel_override(&self) -> Option<&str> {
        self.channel.as_deref().filter(|c| !c.is_empty())
    }

    /// Channel to use when the provider has no opinion either.
    pub fn effective_channel<'a>(&'a self, provider_channel: Option<&'a str>) -> &'a str {
        self.channel_override()
            .or(provider_channel)
            .unwrap_or(DEFAULT_CHANNEL)
    }

    /// Staging directory, defaulting to a folder in the system temp dir.
    pub fn staging_dir(&self) -> PathBuf {
        self.download_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("delta-updater"))
    }

    /// Per-request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Delay between two attempts of the same range.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.range_retry_delay_ms)
    }

    /// Extra headers as owned pairs.
    pub fn header_pairs(&self) -> Vec<(String, String)> {
        self.request_headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_defaults() {
        let config = UpdaterConfig::default();
        assert_eq!(config.max_concurrent_ranges, 4);
        assert_eq!(config.max_range_retries, 3);
        assert!(config.realign_blocks);
        assert!(config.self_update_eligible);
        assert!(!config.auto_download);
        assert_eq!(config.effective_channel(None), "stable");
        assert_eq!(config.effective_channel(Some("beta")), "beta");
    }

    #[test]
    fn test_channel_override_wins() {
        let config = UpdaterConfig::default().channel("alpha");
        assert_eq!(config.effective_channel(Some("beta")), "alpha");
    }

    #[test]
    fn test_load_from_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("updater.json");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            r#"{{"currentVersion":"1.2.0","channel":"beta","rangeMode":"multi-range","maxConcurrentRanges":8}}"#
        )
        .unwrap();

        let config = UpdaterConfig::from_json_file(&path).unwrap();
        assert_eq!(config.current_version, semver::Version::new(1, 2, 0));
        assert_eq!(config.channel_override(), Some("beta"));
        assert_eq!(config.range_mode, Some(RangeMode::MultiRange));
        assert_eq!(config.max_concurrent_ranges, 8);
        assert_eq!(config.max_range_retries, 3);
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("updater.json");
        std::fs::write(&path, r#"{"maxConcurrentRanges":0}"#).unwrap();
        let err = UpdaterConfig::from_json_file(&path).unwrap_err();
        assert_eq!(err.code(), "ERR_UPDATER_CONFIG");
    }
}
