//! reqwest-backed [`ApiClient`].

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, trace, warn};
use url::Url;

use super::{Account, ApiClient, ApiError, Asset, Site};
use crate::config::Settings;
use crate::{Error, Result};

/// Longest upstream error body kept in an [`ApiError`].
const MAX_ERROR_BODY_CHARS: usize = 256;

pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            // Safe to ignore: can happen if another crate installed it first.
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Retry policy for transient upstream errors.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts.
    pub max_retries: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Backoff multiplier for exponential backoff.
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Calculate the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Upstream list endpoints answer either with a bare array or wrapped in `data`.
#[derive(Deserialize)]
#[serde(untagged)]
enum ListResponse<T> {
    Wrapped { data: Vec<T> },
    Bare(Vec<T>),
}

impl<T> ListResponse<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            ListResponse::Wrapped { data } => data,
            ListResponse::Bare(items) => items,
        }
    }
}

/// HTTP client for the network-management API.
pub struct HttpApiClient {
    client: reqwest::Client,
    base_url: Url,
    token: Option<String>,
    retry: RetryPolicy,
}

impl HttpApiClient {
    /// Build a client from settings.
    pub fn new(settings: &Settings) -> Result<Self> {
        install_rustls_provider();

        let base_url = Url::parse(&settings.api_base_url)
            .map_err(|e| Error::config(format!("invalid API base URL: {}", e)))?;

        let client = reqwest::Client::builder()
            .timeout(settings.api_request_timeout())
            .user_agent(concat!("netpoll-exporter/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            token: settings.api_token.clone(),
            retry: RetryPolicy::with_max_retries(settings.api_max_retries),
        })
    }

    /// Replace the retry policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn endpoint(&self, segments: &[&str]) -> std::result::Result<Url, ApiError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ApiError::Transport(format!("base URL cannot be a base: {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments.iter().filter(|s| !s.is_empty()));
        Ok(url)
    }

    async fn get<T: DeserializeOwned>(&self, url: Url) -> std::result::Result<T, ApiError> {
        let mut attempt = 0;
        loop {
            match self.get_once(&url).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.retry.max_retries => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        url = %url,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying upstream request"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn get_once<T: DeserializeOwned>(&self, url: &Url) -> std::result::Result<T, ApiError> {
        trace!(url = %url, "GET");
        let mut request = self.client.get(url.clone());
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                message: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| ApiError::Decode(e.to_string()))
    }

    async fn get_list<T: DeserializeOwned>(&self, url: Url) -> std::result::Result<Vec<T>, ApiError> {
        let response: ListResponse<T> = self.get(url).await?;
        Ok(response.into_vec())
    }
}

#[async_trait]
impl ApiClient for HttpApiClient {
    async fn list_accounts(&self) -> std::result::Result<Vec<Account>, ApiError> {
        let url = self.endpoint(&["accounts"])?;
        self.get_list(url).await
    }

    async fn list_sites(&self, account_id: &str) -> std::result::Result<Vec<Site>, ApiError> {
        let url = self.endpoint(&["accounts", account_id, "sites"])?;
        self.get_list(url).await
    }

    async fn list_assets(
        &self,
        account_id: &str,
        child_filter: Option<&str>,
    ) -> std::result::Result<Vec<Asset>, ApiError> {
        let mut url = self.endpoint(&["accounts", account_id, "assets"])?;
        if let Some(site_id) = child_filter {
            url.query_pairs_mut().append_pair("site_id", site_id);
        }
        self.get_list(url).await
    }

    async fn get_json(&self, path: &str) -> std::result::Result<serde_json::Value, ApiError> {
        let segments: Vec<&str> = path.split('/').collect();
        let url = self.endpoint(&segments)?;
        self.get(url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base: &str) -> HttpApiClient {
        let settings = Settings {
            api_base_url: base.to_string(),
            ..Settings::default()
        };
        HttpApiClient::new(&settings).unwrap()
    }

    #[test]
    fn test_retry_delay_backoff() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(10));
    }

    #[test]
    fn test_endpoint_building() {
        let client = client("https://api.example.com/v2/");
        let url = client.endpoint(&["accounts", "a 1", "sites"]).unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/v2/accounts/a%201/sites");

        let client = self::client("https://api.example.com/v2");
        let url = client.endpoint(&["accounts"]).unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/v2/accounts");
    }

    #[test]
    fn test_list_response_shapes() {
        let wrapped: ListResponse<Account> =
            serde_json::from_str(r#"{"data":[{"id":"a1","name":"Acme"}]}"#).unwrap();
        let bare: ListResponse<Account> =
            serde_json::from_str(r#"[{"id":"a1","name":"Acme"}]"#).unwrap();
        assert_eq!(wrapped.into_vec(), bare.into_vec());
    }
}
