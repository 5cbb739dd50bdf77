//! Application settings loaded from the environment.

use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::tier::UpdateTier;
use crate::{Error, Result};

/// Default interval for the fast tier (1 minute).
const DEFAULT_FAST_INTERVAL_SECS: u64 = 60;

/// Default interval for the medium tier (5 minutes).
const DEFAULT_MEDIUM_INTERVAL_SECS: u64 = 300;

/// Default interval for the slow tier (15 minutes).
const DEFAULT_SLOW_INTERVAL_SECS: u64 = 900;

/// Default number of collectors allowed to hit the upstream API at once.
const DEFAULT_API_CONCURRENCY_LIMIT: usize = 5;

/// Default per-collector timeout.
const DEFAULT_COLLECTOR_TIMEOUT_SECS: u64 = 120;

/// Default base TTL for the shared inventory cache.
const DEFAULT_INVENTORY_CACHE_TTL_SECS: u64 = 300;

/// Settings consumed by the scheduler, the API client and the HTTP surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub fast_interval_secs: u64,
    pub medium_interval_secs: u64,
    pub slow_interval_secs: u64,
    /// Concurrency cap for one tier round.
    pub api_concurrency_limit: usize,
    pub collector_timeout_secs: u64,
    /// Collector short names to run. `None` runs every registered collector.
    pub enabled_collectors: Option<BTreeSet<String>>,
    pub inventory_cache_ttl_secs: u64,

    pub api_base_url: String,
    #[serde(skip_serializing)]
    pub api_token: Option<String>,
    pub api_request_timeout_secs: u64,
    pub api_max_retries: u32,

    pub http_bind_address: String,
    pub http_port: u16,
    pub metrics_namespace: String,

    pub log_dir: Option<String>,
    pub log_filter: Option<String>,

    /// How long tier loops get to wind down before they are cancelled.
    pub shutdown_grace_secs: u64,
    /// Upper bound on waiting for cancelled loops to acknowledge.
    pub shutdown_timeout_secs: u64,
    /// Run the initial collection one tier at a time before starting the loops.
    pub sequential_startup: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            fast_interval_secs: DEFAULT_FAST_INTERVAL_SECS,
            medium_interval_secs: DEFAULT_MEDIUM_INTERVAL_SECS,
            slow_interval_secs: DEFAULT_SLOW_INTERVAL_SECS,
            api_concurrency_limit: DEFAULT_API_CONCURRENCY_LIMIT,
            collector_timeout_secs: DEFAULT_COLLECTOR_TIMEOUT_SECS,
            enabled_collectors: None,
            inventory_cache_ttl_secs: DEFAULT_INVENTORY_CACHE_TTL_SECS,
            api_base_url: "http://localhost:8080/api/v1".to_string(),
            api_token: None,
            api_request_timeout_secs: 30,
            api_max_retries: 3,
            http_bind_address: "0.0.0.0".to_string(),
            http_port: 9180,
            metrics_namespace: "netpoll".to_string(),
            log_dir: None,
            log_filter: None,
            shutdown_grace_secs: 5,
            shutdown_timeout_secs: 10,
            sequential_startup: true,
        }
    }
}

impl Settings {
    /// Load settings from process environment variables, falling back to defaults.
    ///
    /// Call `dotenvy::dotenv()` first to pick up a `.env` file.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load settings through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mut settings = Self::default();

        parse_into(&get, "FAST_INTERVAL_SECS", &mut settings.fast_interval_secs)?;
        parse_into(&get, "MEDIUM_INTERVAL_SECS", &mut settings.medium_interval_secs)?;
        parse_into(&get, "SLOW_INTERVAL_SECS", &mut settings.slow_interval_secs)?;
        parse_into(&get, "API_CONCURRENCY_LIMIT", &mut settings.api_concurrency_limit)?;
        parse_into(&get, "COLLECTOR_TIMEOUT_SECS", &mut settings.collector_timeout_secs)?;
        parse_into(&get, "INVENTORY_CACHE_TTL_SECS", &mut settings.inventory_cache_ttl_secs)?;
        parse_into(&get, "API_REQUEST_TIMEOUT_SECS", &mut settings.api_request_timeout_secs)?;
        parse_into(&get, "API_MAX_RETRIES", &mut settings.api_max_retries)?;
        parse_into(&get, "HTTP_PORT", &mut settings.http_port)?;
        parse_into(&get, "SHUTDOWN_GRACE_SECS", &mut settings.shutdown_grace_secs)?;
        parse_into(&get, "SHUTDOWN_TIMEOUT_SECS", &mut settings.shutdown_timeout_secs)?;
        parse_into(&get, "SEQUENTIAL_STARTUP", &mut settings.sequential_startup)?;

        if let Some(names) = get("ENABLED_COLLECTORS") {
            settings.enabled_collectors = Some(
                names
                    .split(',')
                    .map(|n| n.trim().to_string())
                    .filter(|n| !n.is_empty())
                    .collect(),
            );
        }
        if let Some(url) = get("API_BASE_URL") {
            settings.api_base_url = url;
        }
        settings.api_token = get("API_TOKEN");
        if let Some(address) = get("HTTP_BIND_ADDRESS") {
            settings.http_bind_address = address;
        }
        if let Some(namespace) = get("METRICS_NAMESPACE") {
            settings.metrics_namespace = namespace;
        }
        settings.log_dir = get("LOG_DIR");
        settings.log_filter = get("LOG_FILTER");

        settings.validate()?;
        Ok(settings)
    }

    /// Reject settings the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        for tier in UpdateTier::ALL {
            if self.tier_interval(tier).is_zero() {
                return Err(Error::config(format!(
                    "interval for the {} tier must be greater than zero",
                    tier
                )));
            }
        }
        if self.api_concurrency_limit == 0 {
            return Err(Error::config("API_CONCURRENCY_LIMIT must be at least 1"));
        }
        if self.collector_timeout_secs == 0 {
            return Err(Error::config("COLLECTOR_TIMEOUT_SECS must be at least 1"));
        }
        url::Url::parse(&self.api_base_url)
            .map_err(|e| Error::config(format!("invalid API_BASE_URL: {}", e)))?;
        Ok(())
    }

    /// Configured interval of a tier.
    pub fn tier_interval(&self, tier: UpdateTier) -> Duration {
        let secs = match tier {
            UpdateTier::Fast => self.fast_interval_secs,
            UpdateTier::Medium => self.medium_interval_secs,
            UpdateTier::Slow => self.slow_interval_secs,
        };
        Duration::from_secs(secs)
    }

    pub fn collector_timeout(&self) -> Duration {
        Duration::from_secs(self.collector_timeout_secs)
    }

    pub fn inventory_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.inventory_cache_ttl_secs)
    }

    pub fn api_request_timeout(&self) -> Duration {
        Duration::from_secs(self.api_request_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Whether the operator's allow-list lets this collector run.
    pub fn is_collector_enabled(&self, name: &str) -> bool {
        match &self.enabled_collectors {
            Some(names) => names.contains(name),
            None => true,
        }
    }
}

fn parse_into<T, G>(get: &G, key: &str, target: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    if let Some(raw) = get(key) {
        *target = raw
            .parse()
            .map_err(|e| Error::config(format!("invalid value for {}: '{}' ({})", key, raw, e)))?;
    }
    Ok(())
}
