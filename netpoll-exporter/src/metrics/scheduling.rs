//! Metrics owned by the scheduler and shared by every collector.
//!
//! Both are registered once at startup. Clones share the same series, so a
//! second manager built from the same handles never registers again.

use std::future::Future;
use std::time::Instant;

use chrono::Utc;
use prometheus::{GaugeVec, HistogramVec, IntCounterVec, IntGaugeVec};

use super::MetricsRegistry;
use crate::Result;
use crate::tier::UpdateTier;

const DURATION_BUCKETS: &[f64] = &[0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0];
const WAIT_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0];

/// Scheduler-level metrics emitted by the collector manager.
#[derive(Clone)]
pub struct SchedulingMetrics {
    /// Collections currently running, by collector and tier.
    pub active_collections: IntGaugeVec,
    /// Time a collector waited on upstream work for one organization.
    pub org_wait_seconds: HistogramVec,
    /// Failed collections by collector, tier and error type.
    pub collection_errors: IntCounterVec,
    /// Seconds since the collector last succeeded.
    pub last_success_age: GaugeVec,
    /// Consecutive failures per collector.
    pub failure_streak: IntGaugeVec,
    /// Inventory cache lookups by kind and result.
    pub inventory_requests: IntCounterVec,
    /// Shared instrumentation handed to collectors.
    pub instrumentation: CollectorInstrumentation,
}

impl SchedulingMetrics {
    pub fn register(metrics: &MetricsRegistry) -> Result<Self> {
        Ok(Self {
            active_collections: metrics.int_gauge_vec(
                "collector_active_collections",
                "Number of collections currently running",
                &["collector", "tier"],
            )?,
            org_wait_seconds: metrics.histogram_vec(
                "collector_org_wait_seconds",
                "Time spent waiting on upstream calls per organization",
                &["collector", "org"],
                Some(WAIT_BUCKETS.to_vec()),
            )?,
            collection_errors: metrics.int_counter_vec(
                "collector_errors_total",
                "Failed collections by error type",
                &["collector", "tier", "error_type"],
            )?,
            last_success_age: metrics.gauge_vec(
                "collector_last_success_age_seconds",
                "Seconds since the collector last completed successfully",
                &["collector"],
            )?,
            failure_streak: metrics.int_gauge_vec(
                "collector_failure_streak",
                "Consecutive failed collections",
                &["collector"],
            )?,
            inventory_requests: metrics.int_counter_vec(
                "inventory_cache_requests_total",
                "Inventory cache lookups",
                &["kind", "result"],
            )?,
            instrumentation: CollectorInstrumentation::register(metrics)?,
        })
    }

    pub fn observe_org_wait(&self, collector: &str, org: &str, seconds: f64) {
        self.org_wait_seconds
            .with_label_values(&[collector, org])
            .observe(seconds);
    }
}

/// Performance instrumentation shared by collectors.
///
/// Wrapping a collection body records its duration, counts failures by
/// error kind and stamps the last successful run.
#[derive(Clone)]
pub struct CollectorInstrumentation {
    duration: HistogramVec,
    failures: IntCounterVec,
    last_success: GaugeVec,
}

impl CollectorInstrumentation {
    pub fn register(metrics: &MetricsRegistry) -> Result<Self> {
        Ok(Self {
            duration: metrics.histogram_vec(
                "collector_duration_seconds",
                "Collection duration",
                &["collector", "tier"],
                Some(DURATION_BUCKETS.to_vec()),
            )?,
            failures: metrics.int_counter_vec(
                "collector_failures_total",
                "Collection bodies that returned an error",
                &["collector", "tier", "error_type"],
            )?,
            last_success: metrics.gauge_vec(
                "collector_last_success_timestamp_seconds",
                "Unix time of the last successful collection",
                &["collector", "tier"],
            )?,
        })
    }

    /// Run `body` and record its outcome. The result is passed through.
    pub async fn instrument<T, F>(&self, collector: &str, tier: UpdateTier, body: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let tier = tier.as_ref();
        let started = Instant::now();
        let result = body.await;

        self.duration
            .with_label_values(&[collector, tier])
            .observe(started.elapsed().as_secs_f64());
        match &result {
            Ok(_) => self
                .last_success
                .with_label_values(&[collector, tier])
                .set(Utc::now().timestamp() as f64),
            Err(e) => self
                .failures
                .with_label_values(&[collector, tier, e.kind()])
                .inc(),
        }
        result
    }
}
