use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::collector::{Collector, CollectorContext};
use crate::inventory::TieredInventory;
use crate::metrics::{MetricSink, SchedulingMetrics};
use crate::tier::UpdateTier;
use crate::{Error, Result};

pub const NAME: &str = "asset_status";

const ASSET_UP: &str = "asset_up";
const ASSETS_TOTAL: &str = "assets_total";

/// Online state of every managed asset.
pub struct AssetStatusCollector {
    inventory: TieredInventory,
    sink: Arc<dyn MetricSink>,
    metrics: SchedulingMetrics,
}

impl AssetStatusCollector {
    pub fn new(ctx: &CollectorContext) -> Self {
        Self {
            inventory: ctx.tiered_inventory(UpdateTier::Fast),
            sink: ctx.sink.clone(),
            metrics: ctx.metrics.clone(),
        }
    }

    async fn publish(&self) -> Result<()> {
        let accounts = self.inventory.get_accounts(false).await?;
        let mut first_error: Option<Error> = None;
        let mut published = 0usize;

        self.sink.reset(ASSET_UP)?;
        self.sink.reset(ASSETS_TOTAL)?;

        for account in accounts.iter() {
            let started = Instant::now();
            let assets = match self.inventory.get_assets(&account.id, None, false).await {
                Ok(assets) => assets,
                Err(e) => {
                    warn!(collector = NAME, account = %account.id, error = %e, "Asset listing failed");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                    continue;
                }
            };
            self.metrics
                .observe_org_wait(NAME, &account.id, started.elapsed().as_secs_f64());

            let mut per_kind: BTreeMap<&str, u64> = BTreeMap::new();
            for asset in assets.iter() {
                *per_kind.entry(asset.kind.as_str()).or_default() += 1;
                let up = if asset.online { 1.0 } else { 0.0 };
                self.sink.set_gauge(
                    ASSET_UP,
                    &[&account.id, &asset.site_id, &asset.id, &asset.kind],
                    up,
                )?;
            }
            for (kind, count) in per_kind {
                self.sink
                    .set_gauge(ASSETS_TOTAL, &[&account.id, kind], count as f64)?;
            }
            published += assets.len();
        }

        debug!(collector = NAME, assets = published, "Published asset status");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Collector for AssetStatusCollector {
    fn name(&self) -> &str {
        NAME
    }

    fn update_tier(&self) -> UpdateTier {
        UpdateTier::Fast
    }

    fn initialize_metrics(&self) -> Result<()> {
        self.sink.register_gauge(
            ASSET_UP,
            "Whether the asset is online (1) or offline (0)",
            &["account", "site", "asset", "kind"],
        )?;
        self.sink.register_gauge(
            ASSETS_TOTAL,
            "Number of assets per account and kind",
            &["account", "kind"],
        )
    }

    async fn collect(&self) -> Result<()> {
        self.metrics
            .instrumentation
            .instrument(NAME, UpdateTier::Fast, self.publish())
            .await
    }
}
