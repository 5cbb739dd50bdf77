//! Rolling per-collector health.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::tier::UpdateTier;

/// Consecutive failures after which a collector is reported unhealthy.
pub const UNHEALTHY_STREAK: u32 = 3;

/// Health status of a collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Last run succeeded.
    Healthy,
    /// Failing, but fewer than [`UNHEALTHY_STREAK`] times in a row.
    Degraded,
    /// Failing repeatedly.
    Unhealthy,
    /// Never ran.
    #[default]
    Unknown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Run statistics for one collector.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub last_success_time: Option<DateTime<Utc>>,
    pub failure_streak: u32,
    pub total_runs: u64,
    pub total_successes: u64,
    pub total_failures: u64,
}

impl HealthRecord {
    pub fn record_success(&mut self, at: DateTime<Utc>) {
        self.last_success_time = Some(at);
        self.failure_streak = 0;
        self.total_successes += 1;
    }

    pub fn record_failure(&mut self) {
        self.failure_streak += 1;
        self.total_failures += 1;
    }

    pub fn status(&self) -> HealthStatus {
        if self.total_successes + self.total_failures == 0 {
            HealthStatus::Unknown
        } else if self.failure_streak == 0 {
            HealthStatus::Healthy
        } else if self.failure_streak < UNHEALTHY_STREAK {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        }
    }

    /// Time since the last success, if there was one.
    pub fn last_success_age(&self, now: DateTime<Utc>) -> Option<Duration> {
        let last = self.last_success_time?;
        Some((now - last).to_std().unwrap_or_default())
    }
}

/// Health records keyed by collector name.
///
/// Only the run wrapper for a collector writes its record, so each key has a
/// single writer at a time.
#[derive(Debug, Default)]
pub struct HealthTracker {
    records: DashMap<String, HealthRecord>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a zeroed record.
    pub fn seed(&self, name: &str) {
        self.records.entry(name.to_string()).or_default();
    }

    pub fn start_run(&self, name: &str) {
        self.records.entry(name.to_string()).or_default().total_runs += 1;
    }

    /// Record the outcome of a run and return the updated record.
    pub fn finish_run(&self, name: &str, success: bool) -> HealthRecord {
        let mut record = self.records.entry(name.to_string()).or_default();
        if success {
            record.record_success(Utc::now());
        } else {
            record.record_failure();
        }
        record.clone()
    }

    pub fn get(&self, name: &str) -> Option<HealthRecord> {
        self.records.get(name).map(|r| r.value().clone())
    }

    pub fn snapshot(&self) -> BTreeMap<String, HealthRecord> {
        self.records
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

/// Health of one active collector, as reported over HTTP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorHealth {
    pub name: String,
    pub tier: UpdateTier,
    pub status: HealthStatus,
    pub message: Option<String>,
    #[serde(flatten)]
    pub record: HealthRecord,
}

impl CollectorHealth {
    pub fn new(name: impl Into<String>, tier: UpdateTier, record: HealthRecord) -> Self {
        let status = record.status();
        let message = match status {
            HealthStatus::Degraded | HealthStatus::Unhealthy => Some(format!(
                "{} consecutive failures",
                record.failure_streak
            )),
            _ => None,
        };
        Self {
            name: name.into(),
            tier,
            status,
            message,
            record,
        }
    }
}

/// A registered collector that is not running, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedCollector {
    pub name: String,
    pub tier: UpdateTier,
    pub reason: String,
}

/// Health of every collector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// Overall status.
    pub status: HealthStatus,
    pub collectors: Vec<CollectorHealth>,
    pub skipped: Vec<SkippedCollector>,
    /// Timestamp of the report.
    pub timestamp: DateTime<Utc>,
}

impl HealthReport {
    pub fn new(collectors: Vec<CollectorHealth>, skipped: Vec<SkippedCollector>) -> Self {
        Self {
            status: overall_status(&collectors),
            collectors,
            skipped,
            timestamp: Utc::now(),
        }
    }

    /// At least one collector is doing useful work.
    pub fn is_ready(&self) -> bool {
        matches!(self.status, HealthStatus::Healthy | HealthStatus::Degraded)
    }
}

fn overall_status(collectors: &[CollectorHealth]) -> HealthStatus {
    let known: Vec<HealthStatus> = collectors
        .iter()
        .map(|c| c.status)
        .filter(|s| *s != HealthStatus::Unknown)
        .collect();

    if known.is_empty() {
        HealthStatus::Unknown
    } else if known.iter().all(|s| *s == HealthStatus::Healthy) {
        HealthStatus::Healthy
    } else if known.iter().all(|s| *s == HealthStatus::Unhealthy) {
        HealthStatus::Unhealthy
    } else {
        HealthStatus::Degraded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_status_default() {
        assert_eq!(HealthRecord::default().status(), HealthStatus::Unknown);
        assert_eq!(HealthStatus::Degraded.to_string(), "degraded");
    }

    #[test]
    fn test_streak_transitions() {
        let tracker = HealthTracker::new();
        tracker.seed("sites");

        for expected in [1, 2, 3] {
            tracker.start_run("sites");
            let record = tracker.finish_run("sites", false);
            assert_eq!(record.failure_streak, expected);
        }
        assert_eq!(tracker.get("sites").unwrap().status(), HealthStatus::Unhealthy);

        tracker.start_run("sites");
        let record = tracker.finish_run("sites", true);
        assert_eq!(record.failure_streak, 0);
        assert_eq!(record.total_runs, 4);
        assert_eq!(record.total_failures, 3);
        assert_eq!(record.total_successes, 1);
        assert!(record.last_success_time.is_some());
        assert_eq!(record.status(), HealthStatus::Healthy);
    }

    #[test]
    fn test_last_success_age() {
        let mut record = HealthRecord::default();
        let now = Utc::now();
        assert_eq!(record.last_success_age(now), None);

        record.record_success(now - chrono::Duration::seconds(30));
        assert_eq!(record.last_success_age(now), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_overall_status() {
        let mut failing = HealthRecord::default();
        for _ in 0..UNHEALTHY_STREAK {
            failing.record_failure();
        }
        let mut ok = HealthRecord::default();
        ok.record_success(Utc::now());

        let report = HealthReport::new(
            vec![
                CollectorHealth::new("a", UpdateTier::Fast, ok.clone()),
                CollectorHealth::new("b", UpdateTier::Slow, HealthRecord::default()),
            ],
            Vec::new(),
        );
        assert_eq!(report.status, HealthStatus::Healthy);

        let report = HealthReport::new(
            vec![
                CollectorHealth::new("a", UpdateTier::Fast, ok),
                CollectorHealth::new("b", UpdateTier::Slow, failing.clone()),
            ],
            Vec::new(),
        );
        assert_eq!(report.status, HealthStatus::Degraded);
        assert!(report.is_ready());

        let report = HealthReport::new(
            vec![CollectorHealth::new("b", UpdateTier::Slow, failing)],
            Vec::new(),
        );
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert_eq!(
            report.collectors[0].message.as_deref(),
            Some("3 consecutive failures")
        );
    }
}
