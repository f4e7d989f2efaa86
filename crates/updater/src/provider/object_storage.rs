use super::{Provider, ProviderRuntime};
use crate::config::RangeMode;
use crate::error::Result;
use crate::manifest::{resolve_files, FileDescriptor, VersionInfo};
use crate::transport::new_base_url;
use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};

const DEFAULT_REGION: &str = "us-east-1";

/// Bucket of an S3-compatible object store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectStorageConfig {
    pub bucket: String,
    #[serde(default)]
    pub region: Option<String>,
    /// Key prefix of the release files.
    #[serde(default)]
    pub path: Option<String>,
    /// Custom endpoint; the bucket becomes the first path segment.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
}

pub struct ObjectStorageProvider {
    base: Url,
    runtime: ProviderRuntime,
}

impl ObjectStorageProvider {
    pub fn new(config: ObjectStorageConfig, runtime: ProviderRuntime) -> Result<Self> {
        Ok(Self {
            base: new_base_url(&base_url(&config))?,
            runtime,
        })
    }
}

fn base_url(config: &ObjectStorageConfig) -> String {
    let prefix = config
        .path
        .as_deref()
        .map(|path| path.trim_matches('/'))
        .filter(|path| !path.is_empty());
    let root = match &config.endpoint {
        Some(endpoint) => format!("{}/{}", endpoint.trim_end_matches('/'), config.bucket),
        None => format!(
            "https://{}.s3.{}.amazonaws.com",
            config.bucket,
            config.region.as_deref().unwrap_or(DEFAULT_REGION)
        ),
    };
    match prefix {
        Some(prefix) => format!("{root}/{prefix}"),
        None => root,
    }
}

#[async_trait]
impl Provider for ObjectStorageProvider {
    async fn get_latest_version(&self) -> Result<VersionInfo> {
        self.runtime
            .fetch_channel_manifest(&self.base, Vec::new(), &self.describe())
            .await
    }

    async fn resolve_files(&self, info: &VersionInfo) -> Result<Vec<FileDescriptor>> {
        resolve_files(info, &self.base)
    }

    fn range_mode(&self) -> RangeMode {
        RangeMode::Concurrent
    }

    fn describe(&self) -> String {
        format!("ObjectStorage (url: {}, channel: {})", self.base, self.runtime.channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(endpoint: Option<&str>, path: Option<&str>) -> ObjectStorageConfig {
        ObjectStorageConfig {
            bucket: "releases".into(),
            region: Some("eu-west-1".into()),
            path: path.map(str::to_string),
            endpoint: endpoint.map(str::to_string),
            channel: None,
        }
    }

    #[test]
    fn virtual_hosted_and_endpoint_urls() {
        assert_eq!(
            base_url(&config(None, Some("/app/linux/"))),
            "https://releases.s3.eu-west-1.amazonaws.com/app/linux"
        );
        assert_eq!(
            base_url(&config(Some("https://minio.local:9000/"), None)),
            "https://minio.local:9000/releases"
        );
    }
}
