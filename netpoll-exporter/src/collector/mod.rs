//! Collector capability and the explicit collector catalogue.

pub mod builtin;
mod registry;

use std::sync::Arc;

use async_trait::async_trait;

pub use registry::{CollectorFactory, CollectorRegistration, CollectorRegistry};

use crate::Result;
use crate::client::ApiClient;
use crate::config::Settings;
use crate::inventory::{InventoryCache, TieredInventory};
use crate::metrics::{CollectorInstrumentation, MetricSink, SchedulingMetrics};
use crate::tier::UpdateTier;

/// A unit of periodic work that reads the upstream API and publishes
/// metrics.
#[async_trait]
pub trait Collector: Send + Sync {
    /// Short name used in the allow-list, labels and health records.
    fn name(&self) -> &str;

    fn update_tier(&self) -> UpdateTier;

    /// Create this collector's metrics. Called once, before any
    /// [`collect`](Self::collect).
    fn initialize_metrics(&self) -> Result<()>;

    /// Run one collection. Errors are absorbed by the manager.
    async fn collect(&self) -> Result<()>;
}

/// Everything a collector factory may capture.
#[derive(Clone)]
pub struct CollectorContext {
    pub client: Arc<dyn ApiClient>,
    pub settings: Arc<Settings>,
    pub inventory: Arc<InventoryCache>,
    pub sink: Arc<dyn MetricSink>,
    pub metrics: SchedulingMetrics,
}

impl CollectorContext {
    /// Inventory view using `tier`'s TTL.
    pub fn tiered_inventory(&self, tier: UpdateTier) -> TieredInventory {
        TieredInventory::new(self.inventory.clone(), tier)
    }

    pub fn instrumentation(&self) -> &CollectorInstrumentation {
        &self.metrics.instrumentation
    }
}
