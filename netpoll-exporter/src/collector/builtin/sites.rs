use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::debug;

use crate::Result;
use crate::client::Site;
use crate::collector::{Collector, CollectorContext};
use crate::inventory::TieredInventory;
use crate::metrics::{CollectorInstrumentation, MetricSink, SchedulingMetrics};
use crate::tier::UpdateTier;

pub const NAME: &str = "site_status";

const SITE_UP: &str = "site_up";
const SITES_TOTAL: &str = "sites_total";

/// Per-site reachability for every account.
pub struct SiteStatusCollector {
    inventory: TieredInventory,
    sink: Arc<dyn MetricSink>,
    metrics: SchedulingMetrics,
}

impl SiteStatusCollector {
    pub fn new(ctx: &CollectorContext) -> Self {
        Self {
            inventory: ctx.tiered_inventory(UpdateTier::Medium),
            sink: ctx.sink.clone(),
            metrics: ctx.metrics.clone(),
        }
    }

    fn instrumentation(&self) -> &CollectorInstrumentation {
        &self.metrics.instrumentation
    }

    async fn publish(&self) -> Result<()> {
        let accounts = self.inventory.get_accounts(false).await?;

        let mut by_account: Vec<(String, Arc<Vec<Site>>)> = Vec::with_capacity(accounts.len());
        for account in accounts.iter() {
            let started = Instant::now();
            let sites = self.inventory.get_sites(&account.id, false).await?;
            self.metrics
                .observe_org_wait(NAME, &account.id, started.elapsed().as_secs_f64());
            by_account.push((account.id.clone(), sites));
        }

        // Publish only once every account answered, so a failed round keeps
        // the previous series.
        self.sink.reset(SITE_UP)?;
        for (account_id, sites) in &by_account {
            self.sink
                .set_gauge(SITES_TOTAL, &[account_id], sites.len() as f64)?;
            for site in sites.iter() {
                let up = if site.online { 1.0 } else { 0.0 };
                self.sink
                    .set_gauge(SITE_UP, &[account_id, &site.id, &site.name], up)?;
            }
        }

        debug!(collector = NAME, accounts = by_account.len(), "Published site status");
        Ok(())
    }
}

#[async_trait]
impl Collector for SiteStatusCollector {
    fn name(&self) -> &str {
        NAME
    }

    fn update_tier(&self) -> UpdateTier {
        UpdateTier::Medium
    }

    fn initialize_metrics(&self) -> Result<()> {
        self.sink.register_gauge(
            SITE_UP,
            "Whether the site is online (1) or offline (0)",
            &["account", "site", "site_name"],
        )?;
        self.sink
            .register_gauge(SITES_TOTAL, "Number of sites per account", &["account"])
    }

    async fn collect(&self) -> Result<()> {
        self.instrumentation()
            .instrument(NAME, UpdateTier::Medium, self.publish())
            .await
    }
}
