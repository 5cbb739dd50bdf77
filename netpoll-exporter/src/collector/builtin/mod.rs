//! Collectors shipped with the exporter.

mod accounts;
mod assets;
mod sites;

use std::sync::Arc;

pub use accounts::AccountsCollector;
pub use assets::AssetStatusCollector;
pub use sites::SiteStatusCollector;

use super::{Collector, CollectorRegistry};
use crate::tier::UpdateTier;

/// Catalogue of the built-in collectors.
pub fn registry() -> CollectorRegistry {
    CollectorRegistry::new()
        .with(UpdateTier::Fast, assets::NAME, |ctx| {
            Ok(Arc::new(AssetStatusCollector::new(ctx)) as Arc<dyn Collector>)
        })
        .with(UpdateTier::Medium, sites::NAME, |ctx| {
            Ok(Arc::new(SiteStatusCollector::new(ctx)) as Arc<dyn Collector>)
        })
        .with(UpdateTier::Slow, accounts::NAME, |ctx| {
            Ok(Arc::new(AccountsCollector::new(ctx)) as Arc<dyn Collector>)
        })
}
