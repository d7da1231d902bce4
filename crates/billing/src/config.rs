//! Billing configuration loaded from the environment

use std::time::Duration;

use kindred_shared::Tier;

use crate::client::StripeConfig;
use crate::error::{BillingError, BillingResult};
use crate::vocabulary::{
    default_consumable_products, parse_consumable_products, ConsumableProduct, Vocabulary,
};

/// Which provider endpoints receipts are verified against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BillingEnvironment {
    #[default]
    Sandbox,
    Production,
}

impl std::str::FromStr for BillingEnvironment {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sandbox" | "test" | "development" => Ok(BillingEnvironment::Sandbox),
            "production" | "prod" | "live" => Ok(BillingEnvironment::Production),
            other => Err(BillingError::Config(format!(
                "BILLING_ENVIRONMENT must be sandbox or production, got '{}'",
                other
            ))),
        }
    }
}

/// App Store credentials and product table
#[derive(Debug, Clone, Default)]
pub struct AppStoreConfig {
    /// Expected `bundleId` in signed notifications
    pub bundle_id: Option<String>,
    /// PEM public key (ES256) or shared secret (HS256) for signed payloads
    pub notification_key: Option<String>,
    /// App Store Server API key id
    pub key_id: Option<String>,
    /// App Store Connect issuer id
    pub issuer_id: Option<String>,
    /// PEM private key for App Store Server API tokens
    pub private_key: Option<String>,
    /// Exact product id to tier entries
    pub product_tiers: Vec<(String, Tier)>,
}

impl AppStoreConfig {
    pub fn api_credentials(&self) -> Option<(&str, &str, &str)> {
        match (&self.key_id, &self.issuer_id, &self.private_key) {
            (Some(key_id), Some(issuer_id), Some(private_key)) => {
                Some((key_id.as_str(), issuer_id.as_str(), private_key.as_str()))
            }
            _ => None,
        }
    }
}

/// Configuration for the billing engine
#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub stripe: StripeConfig,
    pub app_store: AppStoreConfig,
    pub consumables: Vec<ConsumableProduct>,
    /// Lower-case ISO currency used when a provider omits one
    pub default_currency: String,
    pub environment: BillingEnvironment,
    /// Bound on every outbound provider call
    pub provider_timeout: Duration,
    /// Allowed clock skew for signed webhook timestamps
    pub webhook_tolerance_secs: i64,
    /// Pending event claims older than this are taken over
    pub stale_claim_minutes: i32,
}

impl BillingConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> BillingResult<Self> {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let stripe = StripeConfig::from_lookup(&lookup)?;

        let product_tiers = Tier::ALL
            .into_iter()
            .filter_map(|tier| {
                let key = format!("APP_STORE_PRODUCT_{}", tier.as_str().to_uppercase());
                non_empty(&key).map(|products| (products, tier))
            })
            .flat_map(|(products, tier)| {
                products
                    .split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(|p| (p.to_string(), tier))
                    .collect::<Vec<_>>()
            })
            .collect();

        let app_store = AppStoreConfig {
            bundle_id: non_empty("APP_STORE_BUNDLE_ID"),
            notification_key: non_empty("APP_STORE_NOTIFICATION_KEY"),
            key_id: non_empty("APP_STORE_KEY_ID"),
            issuer_id: non_empty("APP_STORE_ISSUER_ID"),
            private_key: non_empty("APP_STORE_PRIVATE_KEY"),
            product_tiers,
        };

        let consumables = match non_empty("BILLING_CONSUMABLE_PRODUCTS") {
            Some(raw) => parse_consumable_products(&raw)?,
            None => default_consumable_products(),
        };

        let environment = match non_empty("BILLING_ENVIRONMENT") {
            Some(raw) => raw.parse()?,
            None => BillingEnvironment::default(),
        };

        let provider_timeout_secs: u64 = parse_or(
            non_empty("BILLING_PROVIDER_TIMEOUT_SECS"),
            10,
            "BILLING_PROVIDER_TIMEOUT_SECS",
        )?;
        if provider_timeout_secs == 0 {
            return Err(BillingError::Config(
                "BILLING_PROVIDER_TIMEOUT_SECS must be positive".to_string(),
            ));
        }

        Ok(Self {
            stripe,
            app_store,
            consumables,
            default_currency: non_empty("BILLING_DEFAULT_CURRENCY")
                .map(|c| c.trim().to_lowercase())
                .unwrap_or_else(|| "usd".to_string()),
            environment,
            provider_timeout: Duration::from_secs(provider_timeout_secs),
            webhook_tolerance_secs: parse_or(
                non_empty("BILLING_WEBHOOK_TOLERANCE_SECS"),
                300,
                "BILLING_WEBHOOK_TOLERANCE_SECS",
            )?,
            stale_claim_minutes: parse_or(
                non_empty("BILLING_STALE_CLAIM_MINUTES"),
                30,
                "BILLING_STALE_CLAIM_MINUTES",
            )?,
        })
    }

    /// Lookup tables for status, price and product translation
    pub fn vocabulary(&self) -> Vocabulary {
        Vocabulary::new(
            self.stripe.price_tier_entries(),
            self.app_store.product_tiers.clone(),
            self.consumables.clone(),
        )
    }
}

fn parse_or<T: std::str::FromStr>(
    raw: Option<String>,
    default: T,
    key: &str,
) -> BillingResult<T>
where
    T::Err: std::fmt::Display,
{
    match raw {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|e| BillingError::Config(format!("{} is invalid: {}", key, e))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> BillingResult<BillingConfig> {
        let mut map: HashMap<String, String> = HashMap::from([
            ("STRIPE_SECRET_KEY".to_string(), "sk_test_123".to_string()),
            ("STRIPE_WEBHOOK_SECRET".to_string(), "whsec_abc".to_string()),
        ]);
        for (k, v) in pairs {
            map.insert(k.to_string(), v.to_string());
        }
        BillingConfig::from_lookup(move |key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.default_currency, "usd");
        assert_eq!(config.environment, BillingEnvironment::Sandbox);
        assert_eq!(config.provider_timeout, Duration::from_secs(10));
        assert_eq!(config.webhook_tolerance_secs, 300);
        assert_eq!(config.stale_claim_minutes, 30);
        assert!(!config.consumables.is_empty());
        assert!(config.app_store.api_credentials().is_none());
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("BILLING_DEFAULT_CURRENCY", "EUR"),
            ("BILLING_ENVIRONMENT", "production"),
            ("BILLING_PROVIDER_TIMEOUT_SECS", "3"),
            ("APP_STORE_PRODUCT_COMMUNITY", "com.kindred.vip, com.kindred.vip.annual"),
            ("BILLING_CONSUMABLE_PRODUCTS", "b1:boost:1"),
            ("STRIPE_PRICE_PREMIUM", "price_p"),
        ])
        .unwrap();
        assert_eq!(config.default_currency, "eur");
        assert_eq!(config.environment, BillingEnvironment::Production);
        assert_eq!(config.provider_timeout, Duration::from_secs(3));
        assert_eq!(config.app_store.product_tiers.len(), 2);
        assert_eq!(config.consumables.len(), 1);

        let vocab = config.vocabulary();
        assert_eq!(vocab.tier_for_product("com.kindred.vip.annual"), Tier::Community);
        assert_eq!(vocab.tier_for_price("price_p"), Tier::Premium);
    }

    #[test]
    fn test_invalid_values_are_config_errors() {
        assert!(matches!(
            config_from(&[("BILLING_ENVIRONMENT", "staging")]),
            Err(BillingError::Config(_))
        ));
        assert!(matches!(
            config_from(&[("BILLING_PROVIDER_TIMEOUT_SECS", "0")]),
            Err(BillingError::Config(_))
        ));
        assert!(matches!(
            config_from(&[("BILLING_WEBHOOK_TOLERANCE_SECS", "soon")]),
            Err(BillingError::Config(_))
        ));
    }
}
