//! Release-hosting backends.
//!
//! A [`Provider`] answers two questions: which version is the latest on the
//! configured channel, and where its files live. Each backend only knows how
//! to build its URLs; fetching and parsing the channel manifest is shared.

mod generic;
mod git_host;
mod license_server;
mod object_storage;

pub use generic::{GenericConfig, GenericProvider};
pub use git_host::{GitHostConfig, GitHostProvider};
pub use license_server::{LicenseServerConfig, LicenseServerProvider};
pub use object_storage::{ObjectStorageConfig, ObjectStorageProvider};

use crate::config::{RangeMode, UpdaterConfig};
use crate::error::{Result, UpdaterError};
use crate::manifest::{parse_update_info, FileDescriptor, VersionInfo};
use crate::platform::{channel_file_name, Arch, Platform};
use crate::transport::{new_url_from_base, HttpRequest, HttpTransport};
use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Upper bound on a channel manifest.
const MAX_MANIFEST_LEN: u64 = 1024 * 1024;

/// Source of release metadata.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Fetch and parse the channel manifest.
    ///
    /// Fails with [`UpdaterError::LatestVersionNotFound`] when the manifest is
    /// missing or unparsable.
    async fn get_latest_version(&self) -> Result<VersionInfo>;

    /// Absolute URLs for the files of `info`. May hit the network.
    async fn resolve_files(&self, info: &VersionInfo) -> Result<Vec<FileDescriptor>>;

    /// How ranges of this backend are best requested.
    fn range_mode(&self) -> RangeMode;

    /// Headers the backend needs on download requests.
    fn request_headers(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Human readable description used in errors and logs.
    fn describe(&self) -> String;
}

/// What every backend receives from the updater.
#[derive(Clone)]
pub struct ProviderRuntime {
    pub transport: Arc<dyn HttpTransport>,
    pub platform: Platform,
    pub arch: Arch,
    /// Effective channel: config override, then the backend's own, then `stable`.
    pub channel: String,
    pub headers: Vec<(String, String)>,
    pub add_no_cache_query: bool,
}

impl ProviderRuntime {
    pub fn from_config(
        config: &UpdaterConfig,
        transport: Arc<dyn HttpTransport>,
        provider_channel: Option<&str>,
    ) -> Self {
        Self {
            transport,
            platform: config.platform,
            arch: config.arch,
            channel: config.effective_channel(provider_channel).to_string(),
            headers: config.header_pairs(),
            add_no_cache_query: config.add_no_cache_query,
        }
    }

    /// Channel manifest name for this runtime, e.g. `latest-linux.yml`.
    pub fn channel_file(&self) -> String {
        channel_file_name(&self.channel, self.platform, self.arch)
    }

    /// Fetch and parse the channel manifest found under `base`.
    pub(crate) async fn fetch_channel_manifest(
        &self,
        base: &Url,
        extra_headers: Vec<(String, String)>,
        provider: &str,
    ) -> Result<VersionInfo> {
        let channel_file = self.channel_file();
        let not_found = |reason: String| UpdaterError::LatestVersionNotFound {
            provider: provider.to_string(),
            reason,
        };
        let url = new_url_from_base(&channel_file, base, self.add_no_cache_query)
            .map_err(|err| not_found(err.to_string()))?;
        tracing::debug!("fetching channel manifest {}", url);

        let request = HttpRequest::get(url)
            .headers(self.headers.clone())
            .headers(extra_headers);
        let fetched = async {
            let response = self.transport.get(request).await?.error_for_status()?;
            response.bytes_limited(MAX_MANIFEST_LEN).await
        }
        .await;
        let body = match fetched {
            Ok(body) => body,
            Err(err @ UpdaterError::Authentication { .. }) => return Err(err),
            Err(err) => {
                return Err(not_found(format!(
                    "cannot fetch {channel_file}, please ensure the release exists: {err}"
                )))
            }
        };
        let raw = String::from_utf8(body.to_vec())
            .map_err(|_| not_found(format!("{channel_file} is not UTF-8")))?;
        parse_update_info(&raw, &channel_file).map_err(|err| not_found(err.to_string()))
    }
}

/// Backend selection as found in configuration files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "kebab-case")]
pub enum ProviderConfig {
    Generic(GenericConfig),
    GitHost(GitHostConfig),
    ObjectStorage(ObjectStorageConfig),
    LicenseServer(LicenseServerConfig),
}

impl ProviderConfig {
    /// Channel configured for the backend itself.
    pub fn channel(&self) -> Option<&str> {
        match self {
            ProviderConfig::Generic(c) => c.channel.as_deref(),
            ProviderConfig::GitHost(c) => c.channel.as_deref(),
            ProviderConfig::ObjectStorage(c) => c.channel.as_deref(),
            ProviderConfig::LicenseServer(c) => c.channel.as_deref(),
        }
    }

    /// Build the backend.
    pub fn build(
        &self,
        config: &UpdaterConfig,
        transport: Arc<dyn HttpTransport>,
    ) -> Result<Arc<dyn Provider>> {
        let runtime = ProviderRuntime::from_config(config, transport, self.channel());
        Ok(match self {
            ProviderConfig::Generic(c) => Arc::new(GenericProvider::new(c.clone(), runtime)?),
            ProviderConfig::GitHost(c) => Arc::new(GitHostProvider::new(c.clone(), runtime)?),
            ProviderConfig::ObjectStorage(c) => {
                Arc::new(ObjectStorageProvider::new(c.clone(), runtime)?)
            }
            ProviderConfig::LicenseServer(c) => {
                Arc::new(LicenseServerProvider::new(c.clone(), runtime)?)
            }
        })
    }
}

/// Pick the single file matching `packaging`, narrowing by `arch` when several do.
///
/// When nothing matches, a release with exactly one file is accepted unless that
/// file has one of the `excluded` packagings.
pub fn select_file(
    files: &[FileDescriptor],
    packaging: &str,
    excluded: &[&str],
    arch: Arch,
    version: &semver::Version,
) -> Result<FileDescriptor> {
    let no_match = |reason: String| UpdaterError::NoMatchingAsset {
        packaging: packaging.to_string(),
        arch: arch.to_string(),
        version: version.to_string(),
        reason,
    };

    let mut candidates: Vec<&FileDescriptor> =
        files.iter().filter(|f| f.is_packaging(packaging)).collect();
    if candidates.is_empty() {
        match files {
            [only] if !excluded.iter().any(|tag| only.is_packaging(tag)) => candidates.push(only),
            _ => {
                return Err(no_match(format!(
                    "none of {} files has that packaging",
                    files.len()
                )))
            }
        }
    }
    if let [only] = candidates.as_slice() {
        return Ok((*only).clone());
    }

    let tagged: Vec<&FileDescriptor> = candidates
        .iter()
        .copied()
        .filter(|f| f.arch == Some(arch))
        .collect();
    let narrowed = if tagged.is_empty() {
        // untagged files are built for the default architecture
        candidates
            .iter()
            .copied()
            .filter(|f| f.arch.is_none())
            .collect()
    } else {
        tagged
    };
    match narrowed.as_slice() {
        [only] => Ok((*only).clone()),
        [] => Err(no_match(format!(
            "{} candidates, none for this architecture",
            candidates.len()
        ))),
        many => Err(no_match(format!("{} candidates remain ambiguous", many.len()))),
    }
}
