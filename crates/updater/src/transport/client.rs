use super::{range_header_value, HttpRequest, HttpResponse, HttpTransport};
use crate::config::UpdaterConfig;
use crate::error::{Result, UpdaterError};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE};
use reqwest::Client;
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Builder for [`ReqwestTransport`].
#[derive(Default)]
pub struct ReqwestTransportBuilder {
    client: Option<Client>,
    timeout: Option<Duration>,
    user_agent: Option<String>,
}

impl ReqwestTransportBuilder {
    /// Builder taking its request timeout from `config`.
    pub fn from_config(config: &UpdaterConfig) -> Self {
        Self::default().timeout(config.request_timeout())
    }

    /// Provide a custom reqwest client instance.
    pub fn client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Timeout for a whole request, body included. Ignored when a client is supplied.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// User agent sent with every request. Ignored when a client is supplied.
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    fn effective_timeout(&self) -> Duration {
        self.timeout.unwrap_or(DEFAULT_TIMEOUT)
    }

    /// Build the transport.
    pub fn build(self) -> Result<ReqwestTransport> {
        let timeout = self.effective_timeout();
        let client = match self.client {
            Some(client) => client,
            None => Client::builder()
                .timeout(timeout)
                .user_agent(
                    self.user_agent
                        .unwrap_or_else(|| format!("delta-updater/{}", env!("CARGO_PKG_VERSION"))),
                )
                .build()?,
        };

        Ok(ReqwestTransport { client })
    }
}

/// [`HttpTransport`] backed by a reqwest client.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// Create a new builder.
    pub fn builder() -> ReqwestTransportBuilder {
        ReqwestTransportBuilder::default()
    }

    /// Transport honouring the request timeout of `config`.
    pub fn from_config(config: &UpdaterConfig) -> Result<Self> {
        ReqwestTransportBuilder::from_config(config).build()
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(&self, request: HttpRequest) -> Result<HttpResponse> {
        let mut builder = self.client.get(request.url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.ranges.is_empty() {
            builder = builder.header(RANGE, range_header_value(&request.ranges));
        }

        tracing::trace!(url = %request.url, ranges = request.ranges.len(), "GET");
        let response = builder.send().await?;

        let header = |name| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let content_type = header(CONTENT_TYPE);
        let content_range = header(CONTENT_RANGE);
        let content_length = header(CONTENT_LENGTH).and_then(|v| v.parse::<u64>().ok());

        Ok(HttpResponse {
            status: response.status().as_u16(),
            url: response.url().clone(),
            content_type,
            content_range,
            content_length,
            body: response
                .bytes_stream()
                .map_err(UpdaterError::from)
                .boxed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_accepts_custom_client() {
        let transport = ReqwestTransport::builder()
            .client(Client::new())
            .build()
            .expect("transport builds");
        let _ = transport.clone();
    }

    #[test]
    fn builder_defaults() {
        ReqwestTransport::builder()
            .timeout(Duration::from_secs(10))
            .user_agent("test-agent")
            .build()
            .expect("transport builds");
    }

    #[test]
    fn configured_request_timeout_is_applied() {
        let mut config = UpdaterConfig::new(semver::Version::new(1, 0, 0));
        config.request_timeout_secs = 42;
        let builder = ReqwestTransportBuilder::from_config(&config);
        assert_eq!(builder.effective_timeout(), Duration::from_secs(42));
        ReqwestTransport::from_config(&config).expect("transport builds");

        assert_eq!(
            ReqwestTransport::builder().effective_timeout(),
            DEFAULT_TIMEOUT
        );
    }
}
