//! TTL cache for account, site and asset listings.

use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use prometheus::IntCounterVec;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::Result;
use crate::client::{Account, ApiClient, ApiError, Asset, Site};
use crate::tier::UpdateTier;

/// Lower bound for any tier-derived TTL.
pub const MIN_TTL: Duration = Duration::from_secs(10);

/// TTL used for a tier given the configured base TTL.
///
/// Faster tiers see fresher data: fast uses a quarter of the base, medium
/// half, slow the full base. Never below [`MIN_TTL`].
pub fn ttl_for_tier(base: Duration, tier: UpdateTier) -> Duration {
    let ttl = match tier {
        UpdateTier::Fast => base / 4,
        UpdateTier::Medium => base / 2,
        UpdateTier::Slow => base,
    };
    ttl.max(MIN_TTL)
}

struct CacheEntry<T> {
    items: Arc<Vec<T>>,
    fetched_at: Instant,
}

impl<T> CacheEntry<T> {
    fn new(items: Arc<Vec<T>>) -> Self {
        Self {
            items,
            fetched_at: Instant::now(),
        }
    }

    fn is_fresh(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() < ttl
    }
}

#[derive(Debug, Clone, Copy)]
enum InventoryKind {
    Accounts,
    Sites,
    Assets,
}

impl InventoryKind {
    fn as_str(self) -> &'static str {
        match self {
            InventoryKind::Accounts => "accounts",
            InventoryKind::Sites => "sites",
            InventoryKind::Assets => "assets",
        }
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InventoryStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

type AssetKey = (String, Option<String>);

/// Inventory cache shared by every collector.
///
/// Lookups of fresh entries never block. Fetches are serialized through one
/// async mutex and freshness is checked again after acquiring it, so
/// concurrent callers asking for the same stale key cause a single upstream
/// call. Invalidation bumps a generation counter; a fetch that started
/// before it still returns its result but does not store it.
pub struct InventoryCache {
    client: Arc<dyn ApiClient>,
    accounts: DashMap<(), CacheEntry<Account>>,
    sites: DashMap<String, CacheEntry<Site>>,
    assets: DashMap<AssetKey, CacheEntry<Asset>>,
    fetch_lock: Mutex<()>,
    generation: AtomicU64,
    base_ttl: Duration,
    ttl: RwLock<Duration>,
    hits: AtomicU64,
    misses: AtomicU64,
    requests: Option<IntCounterVec>,
}

impl InventoryCache {
    pub fn new(client: Arc<dyn ApiClient>, base_ttl: Duration) -> Self {
        Self {
            client,
            accounts: DashMap::new(),
            sites: DashMap::new(),
            assets: DashMap::new(),
            fetch_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
            base_ttl,
            ttl: RwLock::new(base_ttl),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            requests: None,
        }
    }

    /// Count lookups on `counter`, labelled by kind and `hit`/`miss`.
    pub fn with_request_counter(mut self, counter: IntCounterVec) -> Self {
        self.requests = Some(counter);
        self
    }

    pub fn base_ttl(&self) -> Duration {
        self.base_ttl
    }

    /// TTL applied by the plain `get_*` methods.
    pub fn ttl(&self) -> Duration {
        *self.ttl.read()
    }

    /// Set the instance TTL from the base TTL for `tier`.
    ///
    /// The TTL is shared by every caller of the plain `get_*` methods, so the
    /// last tier to call this wins. Use [`TieredInventory`] for a per-tier TTL.
    pub fn set_ttl_for_tier(&self, tier: UpdateTier) {
        let ttl = ttl_for_tier(self.base_ttl, tier);
        *self.ttl.write() = ttl;
        debug!(tier = %tier, ttl_secs = ttl.as_secs(), "Inventory TTL updated");
    }

    pub async fn get_accounts(&self, force_refresh: bool) -> Result<Arc<Vec<Account>>> {
        self.get_accounts_with_ttl(self.ttl(), force_refresh).await
    }

    pub async fn get_sites(&self, account_id: &str, force_refresh: bool) -> Result<Arc<Vec<Site>>> {
        self.get_sites_with_ttl(account_id, self.ttl(), force_refresh)
            .await
    }

    pub async fn get_assets(
        &self,
        account_id: &str,
        child_filter: Option<&str>,
        force_refresh: bool,
    ) -> Result<Arc<Vec<Asset>>> {
        self.get_assets_with_ttl(account_id, child_filter, self.ttl(), force_refresh)
            .await
    }

    pub async fn get_accounts_with_ttl(
        &self,
        ttl: Duration,
        force_refresh: bool,
    ) -> Result<Arc<Vec<Account>>> {
        self.get_or_fetch(
            &self.accounts,
            (),
            InventoryKind::Accounts,
            ttl,
            force_refresh,
            || self.client.list_accounts(),
        )
        .await
    }

    pub async fn get_sites_with_ttl(
        &self,
        account_id: &str,
        ttl: Duration,
        force_refresh: bool,
    ) -> Result<Arc<Vec<Site>>> {
        self.get_or_fetch(
            &self.sites,
            account_id.to_string(),
            InventoryKind::Sites,
            ttl,
            force_refresh,
            || self.client.list_sites(account_id),
        )
        .await
    }

    pub async fn get_assets_with_ttl(
        &self,
        account_id: &str,
        child_filter: Option<&str>,
        ttl: Duration,
        force_refresh: bool,
    ) -> Result<Arc<Vec<Asset>>> {
        let key = (account_id.to_string(), child_filter.map(str::to_string));
        self.get_or_fetch(
            &self.assets,
            key,
            InventoryKind::Assets,
            ttl,
            force_refresh,
            || self.client.list_assets(account_id, child_filter),
        )
        .await
    }

    /// Drop cached data for one account, or everything when `account_id` is
    /// `None`.
    pub fn invalidate(&self, account_id: Option<&str>) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        match account_id {
            Some(account_id) => {
                self.sites.remove(account_id);
                self.assets.retain(|(account, _), _| account != account_id);
                debug!(account_id, "Inventory invalidated for account");
            }
            None => {
                self.accounts.clear();
                self.sites.clear();
                self.assets.clear();
                debug!("Inventory invalidated");
            }
        }
    }

    pub fn stats(&self) -> InventoryStats {
        InventoryStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.accounts.len() + self.sites.len() + self.assets.len(),
        }
    }

    fn fresh<K, T>(map: &DashMap<K, CacheEntry<T>>, key: &K, ttl: Duration) -> Option<Arc<Vec<T>>>
    where
        K: Eq + Hash,
    {
        let entry = map.get(key)?;
        entry.is_fresh(ttl).then(|| entry.items.clone())
    }

    fn record(&self, kind: InventoryKind, hit: bool) {
        let (counter, result) = if hit {
            (&self.hits, "hit")
        } else {
            (&self.misses, "miss")
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if let Some(requests) = &self.requests {
            requests.with_label_values(&[kind.as_str(), result]).inc();
        }
    }

    async fn get_or_fetch<K, T, F, Fut>(
        &self,
        map: &DashMap<K, CacheEntry<T>>,
        key: K,
        kind: InventoryKind,
        ttl: Duration,
        force_refresh: bool,
        fetch: F,
    ) -> Result<Arc<Vec<T>>>
    where
        K: Eq + Hash,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<Vec<T>, ApiError>>,
    {
        if !force_refresh && let Some(items) = Self::fresh(map, &key, ttl) {
            self.record(kind, true);
            return Ok(items);
        }

        let _guard = self.fetch_lock.lock().await;

        // Another caller may have refreshed the entry while we waited.
        if !force_refresh && let Some(items) = Self::fresh(map, &key, ttl) {
            self.record(kind, true);
            return Ok(items);
        }

        self.record(kind, false);
        trace!(kind = kind.as_str(), "Fetching inventory");
        let generation = self.generation.load(Ordering::Acquire);
        let items = Arc::new(fetch().await?);
        if self.generation.load(Ordering::Acquire) == generation {
            map.insert(key, CacheEntry::new(items.clone()));
        } else {
            debug!(kind = kind.as_str(), "Inventory invalidated during fetch, not caching");
        }
        Ok(items)
    }
}

/// Inventory view bound to one tier's TTL.
#[derive(Clone)]
pub struct TieredInventory {
    cache: Arc<InventoryCache>,
    tier: UpdateTier,
    ttl: Duration,
}

impl TieredInventory {
    pub fn new(cache: Arc<InventoryCache>, tier: UpdateTier) -> Self {
        let ttl = ttl_for_tier(cache.base_ttl(), tier);
        Self { cache, tier, ttl }
    }

    pub fn tier(&self) -> UpdateTier {
        self.tier
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn cache(&self) -> &Arc<InventoryCache> {
        &self.cache
    }

    pub async fn get_accounts(&self, force_refresh: bool) -> Result<Arc<Vec<Account>>> {
        self.cache
            .get_accounts_with_ttl(self.ttl, force_refresh)
            .await
    }

    pub async fn get_sites(&self, account_id: &str, force_refresh: bool) -> Result<Arc<Vec<Site>>> {
        self.cache
            .get_sites_with_ttl(account_id, self.ttl, force_refresh)
            .await
    }

    pub async fn get_assets(
        &self,
        account_id: &str,
        child_filter: Option<&str>,
        force_refresh: bool,
    ) -> Result<Arc<Vec<Asset>>> {
        self.cache
            .get_assets_with_ttl(account_id, child_filter, self.ttl, force_refresh)
            .await
    }
}
