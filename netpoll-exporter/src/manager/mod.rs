//! Collector manager.
//!
//! Instantiates the enabled collectors, runs one tier at a time with bounded
//! parallelism and keeps per-collector health.

mod health;

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use prometheus::IntGauge;
use task_group::TaskGroup;
use tracing::{debug, error, info, warn};

pub use health::{
    CollectorHealth, HealthRecord, HealthReport, HealthStatus, HealthTracker, SkippedCollector,
    UNHEALTHY_STREAK,
};

use crate::client::ApiClient;
use crate::collector::{Collector, CollectorContext, CollectorRegistry};
use crate::config::Settings;
use crate::inventory::InventoryCache;
use crate::metrics::{MetricSink, SchedulingMetrics};
use crate::tier::UpdateTier;
use crate::{Error, Result};

/// Pause between tiers during the initial collection.
pub const INITIAL_TIER_PAUSE: Duration = Duration::from_secs(2);

/// Holds the active-collections gauge up for one run.
struct ActiveCollection(IntGauge);

impl ActiveCollection {
    fn start(gauge: IntGauge) -> Self {
        gauge.inc();
        Self(gauge)
    }
}

impl Drop for ActiveCollection {
    fn drop(&mut self) {
        self.0.dec();
    }
}

pub struct CollectorManager {
    settings: Arc<Settings>,
    inventory: Arc<InventoryCache>,
    metrics: SchedulingMetrics,
    collectors: BTreeMap<UpdateTier, Vec<Arc<dyn Collector>>>,
    skipped: Vec<SkippedCollector>,
    config_warnings: Vec<String>,
    health: HealthTracker,
}

impl CollectorManager {
    /// Build every enabled collector in `registry`.
    ///
    /// A collector that cannot be constructed or cannot create its metrics
    /// is recorded as skipped; the others still start.
    pub fn new(
        registry: &CollectorRegistry,
        client: Arc<dyn ApiClient>,
        settings: Arc<Settings>,
        sink: Arc<dyn MetricSink>,
        metrics: SchedulingMetrics,
    ) -> Self {
        let inventory = Arc::new(
            InventoryCache::new(client.clone(), settings.inventory_cache_ttl())
                .with_request_counter(metrics.inventory_requests.clone()),
        );
        let ctx = CollectorContext {
            client,
            settings: settings.clone(),
            inventory: inventory.clone(),
            sink,
            metrics: metrics.clone(),
        };

        let health = HealthTracker::new();
        let mut collectors: BTreeMap<UpdateTier, Vec<Arc<dyn Collector>>> = BTreeMap::new();
        let mut skipped = Vec::new();

        for (tier, registrations) in registry.get_all() {
            for registration in registrations {
                let skip = |reason: String| {
                    SkippedCollector {
                        name: registration.name.clone(),
                        tier,
                        reason,
                    }
                };

                if !settings.is_collector_enabled(&registration.name) {
                    debug!(collector = %registration.name, tier = %tier, "Collector not enabled");
                    skipped.push(skip("not enabled".to_string()));
                    continue;
                }

                let built = (registration.factory)(&ctx)
                    .and_then(|collector| {
                        if collector.name() == registration.name {
                            Ok(collector)
                        } else {
                            Err(Error::config(format!(
                                "collector registered as '{}' reports name '{}'",
                                registration.name,
                                collector.name()
                            )))
                        }
                    })
                    .and_then(|collector| collector.initialize_metrics().map(|_| collector));
                match built {
                    Ok(collector) => {
                        health.seed(collector.name());
                        collectors.entry(tier).or_default().push(collector);
                    }
                    Err(e) => {
                        warn!(
                            collector = %registration.name,
                            tier = %tier,
                            error = %e,
                            "Collector initialization failed, skipping"
                        );
                        skipped.push(skip(format!("initialization failed: {}", e.kind())));
                    }
                }
            }
        }

        let config_warnings = unknown_collector_warnings(&settings, &collectors, &skipped);
        for warning in &config_warnings {
            warn!("{}", warning);
        }

        info!(
            active = collectors.values().map(Vec::len).sum::<usize>(),
            skipped = skipped.len(),
            "Collector manager initialized"
        );

        Self {
            settings,
            inventory,
            metrics,
            collectors,
            skipped,
            config_warnings,
            health,
        }
    }

    /// Run every collector of `tier` and wait for all of them.
    ///
    /// Collector failures are absorbed and show up in health records and
    /// metrics. An error here means the round itself could not run.
    pub async fn collect_tier(self: &Arc<Self>, tier: UpdateTier) -> Result<()> {
        let Some(collectors) = self.collectors.get(&tier).filter(|c| !c.is_empty()) else {
            debug!(tier = %tier, "No collectors for tier");
            return Ok(());
        };

        let timeout = self.settings.collector_timeout();
        let started = Instant::now();
        let mut group = TaskGroup::with_limit(self.settings.api_concurrency_limit);

        for collector in collectors {
            let manager = Arc::clone(self);
            let collector = Arc::clone(collector);
            let name = collector.name().to_string();
            group
                .spawn_named(name, async move {
                    manager
                        .run_collector_with_timeout(collector, tier, timeout)
                        .await
                })
                .await?;
        }

        let stats = group.wait().await;
        debug!(
            tier = %tier,
            collectors = stats.total_completed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Tier collection finished"
        );
        Ok(())
    }

    /// Run one collector with a deadline. Never fails: timeouts, errors and
    /// panics are logged, counted and recorded in the collector's health.
    pub async fn run_collector_with_timeout(
        &self,
        collector: Arc<dyn Collector>,
        tier: UpdateTier,
        timeout: Duration,
    ) {
        let name = collector.name().to_string();
        let _active = ActiveCollection::start(
            self.metrics
                .active_collections
                .with_label_values(&[&name, tier.as_ref()]),
        );
        self.health.start_run(&name);

        let started = Instant::now();
        let run = AssertUnwindSafe(collector.collect()).catch_unwind();
        let outcome = match tokio::time::timeout(timeout, run).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(Error::Panicked(panic_message(panic))),
            Err(_) => Err(Error::Timeout(timeout)),
        };

        match &outcome {
            Ok(()) => debug!(
                collector = %name,
                tier = %tier,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Collection succeeded"
            ),
            Err(Error::Timeout(limit)) => error!(
                collector = %name,
                tier = %tier,
                timeout_secs = limit.as_secs_f64(),
                "Collector timed out"
            ),
            Err(e) => error!(
                collector = %name,
                tier = %tier,
                error_type = e.kind(),
                error = %e,
                "Collector failed"
            ),
        }

        if let Err(e) = &outcome {
            self.metrics
                .collection_errors
                .with_label_values(&[&name, tier.as_ref(), e.kind()])
                .inc();
        }

        let record = self.health.finish_run(&name, outcome.is_ok());
        self.metrics
            .failure_streak
            .with_label_values(&[&name])
            .set(i64::from(record.failure_streak));
        if let Some(age) = record.last_success_age(Utc::now()) {
            self.metrics
                .last_success_age
                .with_label_values(&[&name])
                .set(age.as_secs_f64());
        }
    }

    /// Collect every tier once, fastest first, pausing between tiers.
    ///
    /// A failing tier is logged and the next one still runs.
    pub async fn collect_initial(self: &Arc<Self>) {
        info!("Running initial collection");
        for (i, tier) in UpdateTier::ALL.into_iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(INITIAL_TIER_PAUSE).await;
            }
            if let Err(e) = self.collect_tier(tier).await {
                error!(tier = %tier, error = %e, "Initial collection failed for tier");
            }
        }
        info!("Initial collection finished");
    }

    pub fn get_tier_interval(&self, tier: UpdateTier) -> Duration {
        self.settings.tier_interval(tier)
    }

    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    pub fn inventory(&self) -> &Arc<InventoryCache> {
        &self.inventory
    }

    pub fn skipped(&self) -> &[SkippedCollector] {
        &self.skipped
    }

    pub fn config_warnings(&self) -> &[String] {
        &self.config_warnings
    }

    /// Number of active collectors in `tier`.
    pub fn active_count(&self, tier: UpdateTier) -> usize {
        self.collectors.get(&tier).map_or(0, Vec::len)
    }

    /// Active collector names, in tier then registration order.
    pub fn collector_names(&self) -> Vec<String> {
        self.collectors
            .values()
            .flatten()
            .map(|c| c.name().to_string())
            .collect()
    }

    pub fn health(&self, name: &str) -> Option<HealthRecord> {
        self.health.get(name)
    }

    pub fn health_snapshot(&self) -> HealthReport {
        let records = self.health.snapshot();
        let collectors = self
            .collectors
            .iter()
            .flat_map(|(tier, collectors)| {
                let records = &records;
                collectors.iter().map(move |c| {
                    let record = records.get(c.name()).cloned().unwrap_or_default();
                    CollectorHealth::new(c.name(), *tier, record)
                })
            })
            .collect();
        HealthReport::new(collectors, self.skipped.clone())
    }
}

fn unknown_collector_warnings(
    settings: &Settings,
    collectors: &BTreeMap<UpdateTier, Vec<Arc<dyn Collector>>>,
    skipped: &[SkippedCollector],
) -> Vec<String> {
    let Some(enabled) = &settings.enabled_collectors else {
        return Vec::new();
    };

    let known: BTreeSet<&str> = collectors
        .values()
        .flatten()
        .map(|c| c.name())
        .chain(skipped.iter().map(|s| s.name.as_str()))
        .collect();

    enabled
        .iter()
        .filter(|name| !known.contains(name.as_str()))
        .map(|name| format!("Unknown collector in ENABLED_COLLECTORS: {}", name))
        .collect()
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
