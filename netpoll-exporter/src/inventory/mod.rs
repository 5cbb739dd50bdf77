//! Shared inventory of accounts, sites and assets.
//!
//! Most collectors start from the same listings. The cache keeps one copy
//! per key for a TTL so a tier round does not repeat upstream calls.

mod cache;

pub use cache::{InventoryCache, InventoryStats, MIN_TTL, TieredInventory, ttl_for_tier};
