//! Update tiers.

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};

/// Collection frequency class. Every collector belongs to exactly one tier.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    AsRefStr,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum UpdateTier {
    Fast,
    Medium,
    Slow,
}

impl UpdateTier {
    /// All tiers, in the order initial collection runs them.
    pub const ALL: [UpdateTier; 3] = [UpdateTier::Fast, UpdateTier::Medium, UpdateTier::Slow];
}
