//! Provider vocabulary mapping
//!
//! Every provider status string, price id and product id is translated into
//! the canonical [`SubscriptionStatus`] and [`Tier`] here. The lookups are
//! data tables so they can be checked exhaustively, and they never fail:
//! unknown statuses become `Pending` and unknown price refs become the lowest
//! tier, because providers add new values without notice.

use std::collections::HashMap;

use kindred_shared::{ProviderKind, SubscriptionStatus, Tier};
use serde::{Deserialize, Serialize};

use crate::error::{BillingError, BillingResult};

// =============================================================================
// Status tables
// =============================================================================

/// Stripe `subscription.status` values
pub const STRIPE_STATUS_TABLE: &[(&str, SubscriptionStatus)] = &[
    ("active", SubscriptionStatus::Active),
    ("trialing", SubscriptionStatus::Active),
    ("past_due", SubscriptionStatus::BillingRetry),
    ("unpaid", SubscriptionStatus::BillingRetry),
    ("canceled", SubscriptionStatus::Cancelled),
    ("incomplete", SubscriptionStatus::Pending),
    ("incomplete_expired", SubscriptionStatus::Expired),
    ("paused", SubscriptionStatus::Pending),
];

/// App Store Server API subscription status codes and their names
pub const APP_STORE_STATUS_TABLE: &[(&str, SubscriptionStatus)] = &[
    ("1", SubscriptionStatus::Active),
    ("active", SubscriptionStatus::Active),
    ("2", SubscriptionStatus::Expired),
    ("expired", SubscriptionStatus::Expired),
    ("3", SubscriptionStatus::BillingRetry),
    ("billing_retry", SubscriptionStatus::BillingRetry),
    ("4", SubscriptionStatus::BillingRetry),
    ("grace_period", SubscriptionStatus::BillingRetry),
    ("5", SubscriptionStatus::Cancelled),
    ("revoked", SubscriptionStatus::Cancelled),
];

pub fn status_table(provider: ProviderKind) -> &'static [(&'static str, SubscriptionStatus)] {
    match provider {
        ProviderKind::Stripe => STRIPE_STATUS_TABLE,
        ProviderKind::AppStore => APP_STORE_STATUS_TABLE,
    }
}

/// Map a provider status string to the canonical status. Unknown values map to `Pending`.
pub fn map_provider_status(provider: ProviderKind, status: &str) -> SubscriptionStatus {
    let wanted = status.trim().to_lowercase();
    match status_table(provider)
        .iter()
        .find(|(name, _)| *name == wanted)
    {
        Some((_, mapped)) => *mapped,
        None => {
            tracing::warn!(
                provider = %provider,
                status = %status,
                "Unmapped provider status, defaulting to pending"
            );
            SubscriptionStatus::Pending
        }
    }
}

// =============================================================================
// Product keywords (legacy mobile product ids)
// =============================================================================

/// Keywords embedded in legacy App Store product ids, checked in order
pub const PRODUCT_KEYWORD_TABLE: &[(&str, Tier)] = &[
    ("community", Tier::Community),
    ("platinum", Tier::Community),
    ("premium", Tier::Premium),
    ("gold", Tier::Premium),
];

/// Tier for a product id by keyword, lowest tier if none match
pub fn tier_from_product_keyword(product_ref: &str) -> Tier {
    let lowered = product_ref.to_lowercase();
    PRODUCT_KEYWORD_TABLE
        .iter()
        .find(|(keyword, _)| lowered.contains(keyword))
        .map(|(_, tier)| *tier)
        .unwrap_or_else(Tier::lowest)
}

// =============================================================================
// Consumables
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumableKind {
    Boost,
    SuperLike,
}

impl std::str::FromStr for ConsumableKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "boost" | "boosts" => Ok(ConsumableKind::Boost),
            "super_like" | "super_likes" | "superlike" => Ok(ConsumableKind::SuperLike),
            _ => Err(format!("Unknown consumable kind: {}", s)),
        }
    }
}

/// Units of a consumable credited by one purchase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumableGrant {
    pub kind: ConsumableKind,
    pub quantity: u32,
}

/// A sellable consumable product
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumableProduct {
    pub product_ref: String,
    pub grant: ConsumableGrant,
}

/// Catalog used when `BILLING_CONSUMABLE_PRODUCTS` is not set
pub const DEFAULT_CONSUMABLE_PRODUCTS: &[(&str, ConsumableKind, u32)] = &[
    ("com.kindred.boost.1", ConsumableKind::Boost, 1),
    ("com.kindred.boost.5", ConsumableKind::Boost, 5),
    ("com.kindred.boost.10", ConsumableKind::Boost, 10),
    ("com.kindred.superlike.5", ConsumableKind::SuperLike, 5),
    ("com.kindred.superlike.15", ConsumableKind::SuperLike, 15),
    ("com.kindred.superlike.30", ConsumableKind::SuperLike, 30),
];

pub fn default_consumable_products() -> Vec<ConsumableProduct> {
    DEFAULT_CONSUMABLE_PRODUCTS
        .iter()
        .map(|(product_ref, kind, quantity)| ConsumableProduct {
            product_ref: product_ref.to_string(),
            grant: ConsumableGrant {
                kind: *kind,
                quantity: *quantity,
            },
        })
        .collect()
}

/// Parse `product:kind:quantity` entries separated by commas
pub fn parse_consumable_products(raw: &str) -> BillingResult<Vec<ConsumableProduct>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let parts: Vec<&str> = entry.split(':').map(str::trim).collect();
            let [product_ref, kind, quantity] = parts.as_slice() else {
                return Err(BillingError::Config(format!(
                    "Consumable entry '{}' must be product:kind:quantity",
                    entry
                )));
            };
            let kind = kind.parse::<ConsumableKind>().map_err(BillingError::Config)?;
            let quantity = quantity.parse::<u32>().map_err(|e| {
                BillingError::Config(format!("Invalid quantity in '{}': {}", entry, e))
            })?;
            if product_ref.is_empty() || quantity == 0 {
                return Err(BillingError::Config(format!(
                    "Consumable entry '{}' needs a product id and a positive quantity",
                    entry
                )));
            }
            Ok(ConsumableProduct {
                product_ref: product_ref.to_string(),
                grant: ConsumableGrant { kind, quantity },
            })
        })
        .collect()
}

// =============================================================================
// Vocabulary
// =============================================================================

/// Price/product lookup tables built from configuration
#[derive(Debug, Clone, Default)]
pub struct Vocabulary {
    price_tiers: HashMap<String, Tier>,
    app_store_products: HashMap<String, Tier>,
    consumables: HashMap<String, ConsumableGrant>,
}

impl Vocabulary {
    pub fn new(
        price_tiers: impl IntoIterator<Item = (String, Tier)>,
        app_store_products: impl IntoIterator<Item = (String, Tier)>,
        consumables: impl IntoIterator<Item = ConsumableProduct>,
    ) -> Self {
        Self {
            price_tiers: price_tiers.into_iter().collect(),
            app_store_products: app_store_products.into_iter().collect(),
            consumables: consumables
                .into_iter()
                .map(|p| (p.product_ref, p.grant))
                .collect(),
        }
    }

    pub fn map_status(&self, provider: ProviderKind, status: &str) -> SubscriptionStatus {
        map_provider_status(provider, status)
    }

    /// Tier for a currently sold price ref, `None` if the table lacks it
    pub fn known_price_tier(&self, price_ref: &str) -> Option<Tier> {
        self.price_tiers.get(price_ref).copied()
    }

    /// Tier for a web price ref; unmapped refs resolve to the lowest tier
    pub fn tier_for_price(&self, price_ref: &str) -> Tier {
        match self.known_price_tier(price_ref) {
            Some(tier) => tier,
            None => {
                tracing::warn!(price_ref = %price_ref, "Unmapped price ref, using lowest tier");
                Tier::lowest()
            }
        }
    }

    /// Tier for an App Store product id, by exact table then keyword
    pub fn tier_for_product(&self, product_ref: &str) -> Tier {
        self.app_store_products
            .get(product_ref)
            .copied()
            .unwrap_or_else(|| tier_from_product_keyword(product_ref))
    }

    pub fn consumable(&self, product_ref: &str) -> Option<ConsumableGrant> {
        self.consumables.get(product_ref).copied()
    }

    pub fn price_refs(&self) -> impl Iterator<Item = (&str, Tier)> {
        self.price_tiers.iter().map(|(k, v)| (k.as_str(), *v))
    }
}
