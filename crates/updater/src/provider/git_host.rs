use super::{Provider, ProviderRuntime};
use crate::config::RangeMode;
use crate::error::{Result, UpdaterError};
use crate::manifest::{resolve_files, FileDescriptor, VersionInfo};
use crate::transport::new_base_url;
use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};

const DEFAULT_HOST: &str = "https://github.com";

/// Releases published on a git hosting service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitHostConfig {
    pub owner: String,
    pub repo: String,
    /// Web host, `https://github.com` unless set.
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    /// Release tags carry a `v` before the version.
    #[serde(default = "default_true")]
    pub v_prefixed_tag: bool,
    /// Access token for private repositories.
    #[serde(default)]
    pub token: Option<String>,
}

fn default_true() -> bool {
    true
}

pub struct GitHostProvider {
    config: GitHostConfig,
    repo_base: Url,
    runtime: ProviderRuntime,
}

impl GitHostProvider {
    pub fn new(config: GitHostConfig, runtime: ProviderRuntime) -> Result<Self> {
        let host = config.host.as_deref().unwrap_or(DEFAULT_HOST);
        let repo_base = new_base_url(&format!(
            "{}/{}/{}",
            host.trim_end_matches('/'),
            config.owner,
            config.repo
        ))?;
        Ok(Self {
            config,
            repo_base,
            runtime,
        })
    }

    fn tag(&self, version: &semver::Version) -> String {
        if self.config.v_prefixed_tag {
            format!("v{version}")
        } else {
            version.to_string()
        }
    }

    fn auth_headers(&self) -> Vec<(String, String)> {
        self.config
            .token
            .iter()
            .map(|token| ("Authorization".to_string(), format!("token {token}")))
            .collect()
    }

    /// Directory holding the assets of `version`.
    pub fn release_base(&self, version: &semver::Version) -> Result<Url> {
        self.repo_base
            .join(&format!("releases/download/{}/", self.tag(version)))
            .map_err(|err| UpdaterError::Config(err.to_string()))
    }
}

#[async_trait]
impl Provider for GitHostProvider {
    async fn get_latest_version(&self) -> Result<VersionInfo> {
        let latest = self
            .repo_base
            .join("releases/latest/download/")
            .map_err(|err| UpdaterError::Config(err.to_string()))?;
        self.runtime
            .fetch_channel_manifest(&latest, self.auth_headers(), &self.describe())
            .await
    }

    async fn resolve_files(&self, info: &VersionInfo) -> Result<Vec<FileDescriptor>> {
        resolve_files(info, &self.release_base(&info.version)?)
    }

    fn range_mode(&self) -> RangeMode {
        RangeMode::Concurrent
    }

    fn request_headers(&self) -> Vec<(String, String)> {
        self.auth_headers()
    }

    fn describe(&self) -> String {
        format!(
            "GitHost (owner: {}, repo: {}, channel: {})",
            self.config.owner, self.config.repo, self.runtime.channel
        )
    }
}
