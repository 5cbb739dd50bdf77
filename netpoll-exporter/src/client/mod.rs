//! Upstream API client boundary.
//!
//! The scheduler only sees the [`ApiClient`] trait. Any error it returns is
//! treated as a collection failure; status codes are not interpreted here.

mod http;
mod models;

use async_trait::async_trait;
use thiserror::Error;

pub use http::{HttpApiClient, RetryPolicy};
pub use models::{Account, Asset, Site};

/// Errors raised by the upstream API.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid response: {0}")]
    Decode(String),
}

impl ApiError {
    /// HTTP-like status code, when the upstream produced one.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Status { status, .. } => *status == 429 || *status >= 500,
            ApiError::Transport(_) => true,
            ApiError::Decode(_) => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Status { .. } => "UpstreamError",
            ApiError::Transport(_) => "TransportError",
            ApiError::Decode(_) => "DecodeError",
        }
    }
}

/// Asynchronous reads against the network-management API.
#[async_trait]
pub trait ApiClient: Send + Sync {
    async fn list_accounts(&self) -> Result<Vec<Account>, ApiError>;

    async fn list_sites(&self, account_id: &str) -> Result<Vec<Site>, ApiError>;

    /// Assets of an account, optionally narrowed to one site.
    async fn list_assets(
        &self,
        account_id: &str,
        child_filter: Option<&str>,
    ) -> Result<Vec<Asset>, ApiError>;

    /// Raw read for domain-specific endpoints.
    async fn get_json(&self, path: &str) -> Result<serde_json::Value, ApiError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        let throttled = ApiError::Status {
            status: 429,
            message: "slow down".to_string(),
        };
        let missing = ApiError::Status {
            status: 404,
            message: "not found".to_string(),
        };
        assert!(throttled.is_transient());
        assert!(!missing.is_transient());
        assert!(ApiError::Transport("reset".to_string()).is_transient());
        assert!(!ApiError::Decode("eof".to_string()).is_transient());
        assert_eq!(missing.status(), Some(404));
    }
}
