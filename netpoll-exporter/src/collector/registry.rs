//! Catalogue of known collectors, grouped by tier.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::{Collector, CollectorContext};
use crate::Result;
use crate::tier::UpdateTier;

/// Builds a collector instance from the shared context.
pub type CollectorFactory =
    Arc<dyn Fn(&CollectorContext) -> Result<Arc<dyn Collector>> + Send + Sync>;

/// A registered collector: its tier, short name and factory.
#[derive(Clone)]
pub struct CollectorRegistration {
    pub tier: UpdateTier,
    pub name: String,
    pub factory: CollectorFactory,
}

impl fmt::Debug for CollectorRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectorRegistration")
            .field("tier", &self.tier)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Tier to registrations, each list in registration order.
///
/// Duplicate names are not rejected.
#[derive(Debug, Clone, Default)]
pub struct CollectorRegistry {
    tiers: BTreeMap<UpdateTier, Vec<CollectorRegistration>>,
}

impl CollectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a collector to `tier`.
    pub fn register<F>(&mut self, tier: UpdateTier, name: impl Into<String>, factory: F)
    where
        F: Fn(&CollectorContext) -> Result<Arc<dyn Collector>> + Send + Sync + 'static,
    {
        self.tiers
            .entry(tier)
            .or_default()
            .push(CollectorRegistration {
                tier,
                name: name.into(),
                factory: Arc::new(factory),
            });
    }

    /// Builder form of [`register`](Self::register).
    pub fn with<F>(mut self, tier: UpdateTier, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&CollectorContext) -> Result<Arc<dyn Collector>> + Send + Sync + 'static,
    {
        self.register(tier, name, factory);
        self
    }

    /// Copy of the catalogue. Tiers without registrations are absent.
    pub fn get_all(&self) -> BTreeMap<UpdateTier, Vec<CollectorRegistration>> {
        self.tiers.clone()
    }

    pub fn clear(&mut self) {
        self.tiers.clear();
    }

    pub fn len(&self) -> usize {
        self.tiers.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every registered name, in tier then registration order.
    pub fn names(&self) -> Vec<String> {
        self.tiers
            .values()
            .flatten()
            .map(|r| r.name.clone())
            .collect()
    }
}
