use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::Result;
use crate::collector::{Collector, CollectorContext};
use crate::inventory::TieredInventory;
use crate::metrics::{CollectorInstrumentation, MetricSink};
use crate::tier::UpdateTier;

pub const NAME: &str = "accounts";

const ACCOUNTS_TOTAL: &str = "accounts_total";
const ACCOUNT_INFO: &str = "account_info";

/// Publishes the accounts visible to the API token.
pub struct AccountsCollector {
    inventory: TieredInventory,
    sink: Arc<dyn MetricSink>,
    instrumentation: CollectorInstrumentation,
}

impl AccountsCollector {
    pub fn new(ctx: &CollectorContext) -> Self {
        Self {
            inventory: ctx.tiered_inventory(UpdateTier::Slow),
            sink: ctx.sink.clone(),
            instrumentation: ctx.instrumentation().clone(),
        }
    }

    async fn publish(&self) -> Result<()> {
        // Slow tier owns the account list; refreshing it here keeps the
        // faster tiers' lookups warm.
        let accounts = self.inventory.get_accounts(true).await?;

        self.sink
            .set_gauge(ACCOUNTS_TOTAL, &[], accounts.len() as f64)?;
        self.sink.reset(ACCOUNT_INFO)?;
        for account in accounts.iter() {
            self.sink
                .set_gauge(ACCOUNT_INFO, &[&account.id, &account.name], 1.0)?;
        }

        debug!(collector = NAME, accounts = accounts.len(), "Published accounts");
        Ok(())
    }
}

#[async_trait]
impl Collector for AccountsCollector {
    fn name(&self) -> &str {
        NAME
    }

    fn update_tier(&self) -> UpdateTier {
        UpdateTier::Slow
    }

    fn initialize_metrics(&self) -> Result<()> {
        self.sink
            .register_gauge(ACCOUNTS_TOTAL, "Number of accounts", &[])?;
        self.sink.register_gauge(
            ACCOUNT_INFO,
            "Account metadata, always 1",
            &["account", "account_name"],
        )
    }

    async fn collect(&self) -> Result<()> {
        self.instrumentation
            .instrument(NAME, UpdateTier::Slow, self.publish())
            .await
    }
}
