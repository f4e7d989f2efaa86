use super::{Provider, ProviderRuntime};
use crate::config::RangeMode;
use crate::error::Result;
use crate::manifest::{resolve_files, FileDescriptor, VersionInfo};
use crate::transport::{new_base_url, ByteRange, HttpRequest};
use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::debug;

const DEFAULT_HOST: &str = "api.keygen.sh";

/// Artifacts distributed through a licensing server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LicenseServerConfig {
    pub account: String,
    pub product: String,
    #[serde(default)]
    pub host: Option<String>,
    /// Sent as `Authorization: License <key>`.
    #[serde(default)]
    pub license_key: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
}

pub struct LicenseServerProvider {
    config: LicenseServerConfig,
    base: Url,
    runtime: ProviderRuntime,
}

impl LicenseServerProvider {
    pub fn new(config: LicenseServerConfig, runtime: ProviderRuntime) -> Result<Self> {
        let host = config.host.as_deref().unwrap_or(DEFAULT_HOST);
        let base = new_base_url(&format!(
            "https://{host}/v1/accounts/{}/artifacts?product={}",
            config.account, config.product
        ))?;
        Ok(Self {
            config,
            base,
            runtime,
        })
    }

    fn api_headers(&self) -> Vec<(String, String)> {
        let mut headers = vec![
            ("Accept".to_string(), "application/vnd.api+json".to_string()),
            ("Keygen-Version".to_string(), "1.1".to_string()),
        ];
        if let Some(key) = &self.config.license_key {
            headers.push(("Authorization".to_string(), format!("License {key}")));
        }
        headers
    }

    /// Follow the artifact URL to the short-lived location it redirects to.
    async fn signed_url(&self, url: &Url) -> Result<Url> {
        let request = HttpRequest::get(url.clone())
            .range(ByteRange::new(0, 1))
            .headers(self.runtime.headers.clone())
            .headers(self.api_headers());
        let response = self.runtime.transport.get(request).await?.error_for_status()?;
        debug!("artifact {} resolved to {}", url, response.url);
        Ok(response.url)
    }
}

#[async_trait]
impl Provider for LicenseServerProvider {
    async fn get_latest_version(&self) -> Result<VersionInfo> {
        self.runtime
            .fetch_channel_manifest(&self.base, self.api_headers(), &self.describe())
            .await
    }

    async fn resolve_files(&self, info: &VersionInfo) -> Result<Vec<FileDescriptor>> {
        let mut files = resolve_files(info, &self.base)?;
        for file in &mut files {
            file.url = self.signed_url(&file.url).await?;
            if let Some(block_map_url) = &file.block_map_url {
                file.block_map_url = Some(self.signed_url(block_map_url).await?);
            }
        }
        Ok(files)
    }

    fn range_mode(&self) -> RangeMode {
        RangeMode::Sequential
    }

    fn describe(&self) -> String {
        format!(
            "LicenseServer (account: {}, product: {}, channel: {})",
            self.config.account, self.config.product, self.runtime.channel
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpdaterConfig;
    use crate::manifest::Checksum;
    use crate::platform::{Arch, Platform};
    use crate::transport::MemoryTransport;
    use std::sync::Arc;

    fn provider(transport: Arc<MemoryTransport>, key: Option<&str>) -> LicenseServerProvider {
        let config = UpdaterConfig::new(semver::Version::new(1, 0, 0))
            .target(Platform::Linux, Arch::X64);
        LicenseServerProvider::new(
            LicenseServerConfig {
                account: "acct".into(),
                product: "prod".into(),
                host: None,
                license_key: key.map(str::to_string),
                channel: None,
            },
            ProviderRuntime::from_config(&config, transport, None),
        )
        .unwrap()
    }

    fn info() -> VersionInfo {
        VersionInfo {
            version: semver::Version::new(1, 3, 0),
            release_date: None,
            release_name: None,
            release_notes: None,
            staging_percentage: None,
            minimum_system_version: None,
            files: vec![crate::manifest::FileInfo {
                url: "App-1.3.0.AppImage".into(),
                checksum: Checksum::Sha256([0; 32]),
                size: Some(4),
                block_map_url: None,
            }],
        }
    }

    #[tokio::test]
    async fn manifest_request_carries_api_headers() {
        let transport = Arc::new(MemoryTransport::new());
        transport.insert(
            "https://api.keygen.sh/v1/accounts/acct/artifacts/latest-linux.yml",
            "version: 1.3.0\npath: App-1.3.0.AppImage\nsha512: '00000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000'\n",
        );
        let provider = provider(Arc::clone(&transport), Some("secret"));
        let info = provider.get_latest_version().await.unwrap();
        assert_eq!(info.version, semver::Version::new(1, 3, 0));

        let request = &transport.requests()[0];
        assert_eq!(request.url.query(), Some("product=prod"));
        assert!(request
            .headers
            .contains(&("Keygen-Version".to_string(), "1.1".to_string())));
        assert!(request
            .headers
            .contains(&("Authorization".to_string(), "License secret".to_string())));
        assert_eq!(provider.range_mode(), RangeMode::Sequential);
    }

    #[tokio::test]
    async fn files_resolve_to_redirect_target() {
        let transport = Arc::new(MemoryTransport::new());
        transport.redirect(
            "https://api.keygen.sh/v1/accounts/acct/artifacts/App-1.3.0.AppImage",
            "https://cdn.example.com/signed/App-1.3.0.AppImage?sig=abc",
        );
        transport.insert("https://cdn.example.com/signed/App-1.3.0.AppImage", "data");
        let files = provider(transport, None).resolve_files(&info()).await.unwrap();
        assert_eq!(files[0].url.host_str(), Some("cdn.example.com"));
        assert_eq!(files[0].url.query(), Some("sig=abc"));
    }

    #[tokio::test]
    async fn rejected_license_is_authentication_error() {
        let transport = Arc::new(MemoryTransport::new());
        transport.inject(
            "https://api.keygen.sh/v1/accounts/acct/artifacts/App-1.3.0.AppImage",
            crate::transport::Fault::Status(403),
        );
        let err = provider(transport, Some("bad"))
            .resolve_files(&info())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ERR_UPDATER_AUTHENTICATION");
    }
}
