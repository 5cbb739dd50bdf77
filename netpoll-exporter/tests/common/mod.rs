//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use netpoll_exporter::client::{Account, ApiClient, ApiError, Asset, Site};
use netpoll_exporter::collector::{Collector, CollectorContext, CollectorRegistry};
use netpoll_exporter::config::Settings;
use netpoll_exporter::inventory::TieredInventory;
use netpoll_exporter::manager::CollectorManager;
use netpoll_exporter::metrics::{MetricsRegistry, SchedulingMetrics};
use netpoll_exporter::tier::UpdateTier;
use netpoll_exporter::{Error, Result};

/// Upstream stub that counts calls and answers after `latency`.
#[derive(Default)]
pub struct StubClient {
    pub latency: Duration,
    pub account_calls: AtomicUsize,
    pub site_calls: AtomicUsize,
}

impl StubClient {
    pub fn with_latency(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            latency,
            ..Default::default()
        })
    }
}

#[async_trait]
impl ApiClient for StubClient {
    async fn list_accounts(&self) -> std::result::Result<Vec<Account>, ApiError> {
        self.account_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;
        Ok(vec![Account {
            id: "a1".to_string(),
            name: "Acme".to_string(),
        }])
    }

    async fn list_sites(&self, account_id: &str) -> std::result::Result<Vec<Site>, ApiError> {
        self.site_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;
        Ok(vec![Site {
            id: "s1".to_string(),
            account_id: account_id.to_string(),
            name: "HQ".to_string(),
            online: true,
        }])
    }

    async fn list_assets(
        &self,
        _account_id: &str,
        _child_filter: Option<&str>,
    ) -> std::result::Result<Vec<Asset>, ApiError> {
        Ok(Vec::new())
    }

    async fn get_json(&self, _path: &str) -> std::result::Result<serde_json::Value, ApiError> {
        Ok(serde_json::Value::Null)
    }
}

/// What a scripted collector does on each run.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Succeed after the delay.
    Succeed(Duration),
    /// Return an upstream error.
    Fail,
    /// Panic inside `collect`.
    Panic,
    /// Sleep far past any timeout.
    Hang,
    /// Fail the first N runs, then succeed.
    FailTimes(u32),
    /// Read the shared site list through the inventory cache.
    ReadSites,
}

/// Running and peak number of concurrent collections.
#[derive(Default)]
pub struct Concurrency {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Concurrency {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Start and end instants of every run, by collector name.
pub type Timeline = Arc<Mutex<Vec<(String, UpdateTier, Instant, Instant)>>>;

pub struct ScriptedCollector {
    name: String,
    tier: UpdateTier,
    behavior: Behavior,
    runs: AtomicU32,
    completed: AtomicU32,
    concurrency: Arc<Concurrency>,
    timeline: Timeline,
    inventory: Option<TieredInventory>,
}

impl ScriptedCollector {
    pub fn runs(&self) -> u32 {
        self.runs.load(Ordering::SeqCst)
    }

    /// Runs that reached the end of `collect`.
    pub fn completed(&self) -> u32 {
        self.completed.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a Concurrency);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.exit();
    }
}

#[async_trait]
impl Collector for ScriptedCollector {
    fn name(&self) -> &str {
        &self.name
    }

    fn update_tier(&self) -> UpdateTier {
        self.tier
    }

    fn initialize_metrics(&self) -> Result<()> {
        Ok(())
    }

    async fn collect(&self) -> Result<()> {
        let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        self.concurrency.enter();
        let _in_flight = InFlight(&self.concurrency);
        let started = Instant::now();

        let result = match &self.behavior {
            Behavior::Succeed(delay) => {
                tokio::time::sleep(*delay).await;
                Ok(())
            }
            Behavior::Fail => Err(Error::from(ApiError::Status {
                status: 502,
                message: "bad gateway".to_string(),
            })),
            Behavior::Panic => panic!("collector {} exploded", self.name),
            Behavior::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
            Behavior::FailTimes(n) if run <= *n => Err(Error::other("scripted failure")),
            Behavior::FailTimes(_) => Ok(()),
            Behavior::ReadSites => match &self.inventory {
                Some(inventory) => inventory.get_sites("a1", false).await.map(|_| ()),
                None => Err(Error::other("no inventory")),
            },
        };

        self.timeline
            .lock()
            .push((self.name.clone(), self.tier, started, Instant::now()));
        self.completed.fetch_add(1, Ordering::SeqCst);
        result
    }
}

/// Builds a registry of scripted collectors and keeps handles to them.
#[derive(Default)]
pub struct Fixture {
    pub registry: CollectorRegistry,
    pub collectors: Arc<Mutex<Vec<Arc<ScriptedCollector>>>>,
    pub concurrency: Arc<Concurrency>,
    pub timeline: Timeline,
}

impl Fixture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(self, tier: UpdateTier, name: &str, behavior: Behavior) -> Self {
        self.add_as(tier, name, name, behavior)
    }

    /// Register under `registered` a collector whose `name()` is `reported`.
    pub fn add_misnamed(self, tier: UpdateTier, registered: &str, reported: &str) -> Self {
        self.add_as(tier, registered, reported, Behavior::Succeed(Duration::ZERO))
    }

    fn add_as(
        mut self,
        tier: UpdateTier,
        registered: &str,
        reported: &str,
        behavior: Behavior,
    ) -> Self {
        let name = reported.to_string();
        let collectors = self.collectors.clone();
        let concurrency = self.concurrency.clone();
        let timeline = self.timeline.clone();
        let registered = registered.to_string();

        self.registry.register(tier, registered, move |ctx: &CollectorContext| {
            let inventory = matches!(behavior, Behavior::ReadSites)
                .then(|| ctx.tiered_inventory(tier));
            let collector = Arc::new(ScriptedCollector {
                name: name.clone(),
                tier,
                behavior: behavior.clone(),
                runs: AtomicU32::new(0),
                completed: AtomicU32::new(0),
                concurrency: concurrency.clone(),
                timeline: timeline.clone(),
                inventory,
            });
            collectors.lock().push(collector.clone());
            Ok(collector as Arc<dyn Collector>)
        });
        self
    }

    /// Register a collector whose factory fails.
    pub fn add_broken(mut self, tier: UpdateTier, name: &str) -> Self {
        self.registry.register(tier, name, |_: &CollectorContext| {
            Err(Error::config("missing credentials"))
        });
        self
    }

    pub fn collector(&self, name: &str) -> Arc<ScriptedCollector> {
        self.collectors
            .lock()
            .iter()
            .find(|c| c.name == name)
            .cloned()
            .unwrap_or_else(|| panic!("no collector named {name}"))
    }
}

/// Settings with short intervals suited to paused-time tests.
pub fn test_settings() -> Settings {
    Settings {
        fast_interval_secs: 60,
        medium_interval_secs: 300,
        slow_interval_secs: 900,
        api_concurrency_limit: 5,
        collector_timeout_secs: 10,
        shutdown_grace_secs: 5,
        shutdown_timeout_secs: 10,
        sequential_startup: false,
        ..Settings::default()
    }
}

pub struct Harness {
    pub manager: Arc<CollectorManager>,
    pub metrics: Arc<MetricsRegistry>,
    pub client: Arc<StubClient>,
}

pub fn build_manager(registry: &CollectorRegistry, settings: Settings) -> Harness {
    build_manager_with_client(registry, settings, StubClient::with_latency(Duration::ZERO))
}

pub fn build_manager_with_client(
    registry: &CollectorRegistry,
    settings: Settings,
    client: Arc<StubClient>,
) -> Harness {
    let metrics = Arc::new(MetricsRegistry::new("test"));
    let scheduling = SchedulingMetrics::register(&metrics).expect("register scheduling metrics");
    let manager = Arc::new(CollectorManager::new(
        registry,
        client.clone(),
        Arc::new(settings),
        metrics.clone(),
        scheduling,
    ));
    Harness {
        manager,
        metrics,
        client,
    }
}
