//! Stripe client configuration

use kindred_shared::Tier;
use serde::{Deserialize, Serialize};
use stripe::Client;

use crate::error::{BillingError, BillingResult};

/// Billing interval for web subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingInterval {
    #[default]
    Monthly,
    Annual,
}

/// Configuration for Stripe billing
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Stripe secret API key
    pub secret_key: String,
    /// Stripe webhook signing secret
    pub webhook_secret: String,
    /// Price IDs for each subscription tier
    pub price_ids: PriceIds,
}

/// Stripe price IDs for subscription tiers
#[derive(Debug, Clone, Default)]
pub struct PriceIds {
    pub basic: Option<String>,
    pub premium: Option<String>,
    pub community: Option<String>,

    pub basic_annual: Option<String>,
    pub premium_annual: Option<String>,
    pub community_annual: Option<String>,
}

impl StripeConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create config from an arbitrary key lookup (environment, file, tests)
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> BillingResult<Self> {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Ok(Self {
            secret_key: non_empty("STRIPE_SECRET_KEY")
                .ok_or_else(|| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?,
            webhook_secret: non_empty("STRIPE_WEBHOOK_SECRET").ok_or_else(|| {
                BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string())
            })?,
            price_ids: PriceIds {
                basic: non_empty("STRIPE_PRICE_BASIC"),
                premium: non_empty("STRIPE_PRICE_PREMIUM"),
                community: non_empty("STRIPE_PRICE_COMMUNITY"),
                basic_annual: non_empty("STRIPE_PRICE_BASIC_ANNUAL"),
                premium_annual: non_empty("STRIPE_PRICE_PREMIUM_ANNUAL"),
                community_annual: non_empty("STRIPE_PRICE_COMMUNITY_ANNUAL"),
            },
        })
    }

    /// Get price ID for a tier and interval
    pub fn price_id_for_tier(&self, tier: Tier, interval: BillingInterval) -> Option<&str> {
        let ids = &self.price_ids;
        let price = match (tier, interval) {
            (Tier::Basic, BillingInterval::Monthly) => &ids.basic,
            (Tier::Premium, BillingInterval::Monthly) => &ids.premium,
            (Tier::Community, BillingInterval::Monthly) => &ids.community,
            (Tier::Basic, BillingInterval::Annual) => &ids.basic_annual,
            (Tier::Premium, BillingInterval::Annual) => &ids.premium_annual,
            (Tier::Community, BillingInterval::Annual) => &ids.community_annual,
        };
        price.as_deref()
    }

    /// Every configured price ref with the tier it sells
    pub fn price_tier_entries(&self) -> Vec<(String, Tier)> {
        let ids = &self.price_ids;
        [
            (&ids.basic, Tier::Basic),
            (&ids.premium, Tier::Premium),
            (&ids.community, Tier::Community),
            (&ids.basic_annual, Tier::Basic),
            (&ids.premium_annual, Tier::Premium),
            (&ids.community_annual, Tier::Community),
        ]
        .into_iter()
        .filter_map(|(price, tier)| price.clone().map(|p| (p, tier)))
        .collect()
    }
}

/// Stripe billing client
#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    config: StripeConfig,
}

impl StripeClient {
    /// Create a new Stripe client from config
    pub fn new(config: StripeConfig) -> Self {
        let client = Client::new(config.secret_key.clone());
        Self { client, config }
    }

    /// Get the inner Stripe client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Get the config
    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_missing_secret_is_config_error() {
        let err = StripeConfig::from_lookup(lookup(&[("STRIPE_WEBHOOK_SECRET", "whsec_x")]))
            .unwrap_err();
        assert!(matches!(err, BillingError::Config(msg) if msg.contains("STRIPE_SECRET_KEY")));
    }

    #[test]
    fn test_price_lookup_by_interval() {
        let config = StripeConfig::from_lookup(lookup(&[
            ("STRIPE_SECRET_KEY", "sk_test_1"),
            ("STRIPE_WEBHOOK_SECRET", "whsec_1"),
            ("STRIPE_PRICE_PREMIUM", "price_premium_m"),
            ("STRIPE_PRICE_PREMIUM_ANNUAL", "price_premium_y"),
            ("STRIPE_PRICE_COMMUNITY", ""),
        ]))
        .unwrap();

        assert_eq!(
            config.price_id_for_tier(Tier::Premium, BillingInterval::Monthly),
            Some("price_premium_m")
        );
        assert_eq!(
            config.price_id_for_tier(Tier::Premium, BillingInterval::Annual),
            Some("price_premium_y")
        );
        // Blank values are treated as unset
        assert_eq!(
            config.price_id_for_tier(Tier::Community, BillingInterval::Monthly),
            None
        );
        assert_eq!(config.price_tier_entries().len(), 2);
    }
}
