use super::{Provider, ProviderRuntime};
use crate::config::RangeMode;
use crate::error::Result;
use crate::manifest::{resolve_files, FileDescriptor, VersionInfo};
use crate::transport::new_base_url;
use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};

/// Static feed: channel manifests and artifacts under one base URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenericConfig {
    pub url: String,
    #[serde(default)]
    pub channel: Option<String>,
    /// Whether the server answers multi-range requests.
    #[serde(default = "default_true")]
    pub use_multiple_range_request: bool,
}

fn default_true() -> bool {
    true
}

impl GenericConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            channel: None,
            use_multiple_range_request: true,
        }
    }
}

pub struct GenericProvider {
    base: Url,
    multi_range: bool,
    runtime: ProviderRuntime,
}

impl GenericProvider {
    pub fn new(config: GenericConfig, runtime: ProviderRuntime) -> Result<Self> {
        Ok(Self {
            base: new_base_url(&config.url)?,
            multi_range: config.use_multiple_range_request,
            runtime,
        })
    }
}

#[async_trait]
impl Provider for GenericProvider {
    async fn get_latest_version(&self) -> Result<VersionInfo> {
        self.runtime
            .fetch_channel_manifest(&self.base, Vec::new(), &self.describe())
            .await
    }

    async fn resolve_files(&self, info: &VersionInfo) -> Result<Vec<FileDescriptor>> {
        resolve_files(info, &self.base)
    }

    fn range_mode(&self) -> RangeMode {
        if self.multi_range {
            RangeMode::MultiRange
        } else {
            RangeMode::Concurrent
        }
    }

    fn describe(&self) -> String {
        format!("Generic (url: {}, channel: {})", self.base, self.runtime.channel)
    }
}
