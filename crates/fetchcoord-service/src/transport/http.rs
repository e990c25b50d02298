//! Support to fetch from HTTP sources.

use std::error::Error;

use bytes::Bytes;
use futures::future::BoxFuture;
use reqwest::{Client, RequestBuilder, StatusCode};
use url::Url;

use crate::config::{Config, FetchTimeouts};
use crate::error::FetchError;

use super::Transport;

/// Creates a [`reqwest::Client`] with the provided options.
///
/// * `timeouts` controls connection and overall download timeouts.
/// * `user_agent` is sent along with every request.
pub fn create_client(timeouts: &FetchTimeouts, user_agent: &str) -> reqwest::Result<Client> {
    reqwest::ClientBuilder::new()
        .gzip(true)
        .brotli(true)
        .deflate(true)
        .user_agent(user_agent)
        .connect_timeout(timeouts.connect)
        .timeout(timeouts.max_download)
        .pool_idle_timeout(std::time::Duration::from_secs(30))
        .build()
}

/// Transport implementation that fetches via HTTP `GET` requests.
///
/// Any non-success status is treated as a transport error, and a `204 No Content` response
/// yields no data at all.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Creates a transport using a client configured from `config`.
    pub fn new(config: &Config) -> reqwest::Result<Self> {
        let client = create_client(&config.timeouts(), &config.user_agent)?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

async fn send_request(request: RequestBuilder) -> Result<Option<Bytes>, FetchError> {
    let response = request.send().await?;
    let status = response.status();

    if status == StatusCode::NO_CONTENT {
        return Ok(None);
    }
    if !status.is_success() {
        return Err(FetchError::Transport(format!("HTTP status {status}")));
    }

    Ok(Some(response.bytes().await?))
}

impl Transport for HttpTransport {
    fn fetch(&self, url: &Url) -> BoxFuture<'static, Result<Option<Bytes>, FetchError>> {
        let request = self.client.get(url.clone());
        let url = url.clone();

        Box::pin(async move {
            tracing::debug!("Fetching `{}`", url);

            let result = send_request(request).await;

            if let Err(err) = &result {
                tracing::debug!(
                    error = err as &dyn Error,
                    url = %url,
                    "failed to fetch"
                );
            }

            result
        })
    }
}
