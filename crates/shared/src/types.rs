//! Canonical billing vocabulary shared across Kindred

use serde::{Deserialize, Serialize};

/// Error returned when a stored or user-supplied enum value is not recognized
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid {kind}: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

// =============================================================================
// Tier
// =============================================================================

/// Subscription tier, ordered from lowest to highest
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Basic,
    Premium,
    Community,
}

impl Default for Tier {
    fn default() -> Self {
        Self::lowest()
    }
}

impl Tier {
    /// Every tier, lowest first
    pub const ALL: [Tier; 3] = [Tier::Basic, Tier::Premium, Tier::Community];

    /// The tier every user falls back to (downgrade target on cancellation)
    pub const fn lowest() -> Self {
        Self::Basic
    }

    pub const fn ordinal(&self) -> u8 {
        match self {
            Self::Basic => 0,
            Self::Premium => 1,
            Self::Community => 2,
        }
    }

    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        Self::ALL.get(ordinal as usize).copied()
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Premium => "premium",
            Self::Community => "community",
        }
    }

    /// Name shown to users in upgrade prompts
    pub const fn display_name(&self) -> &'static str {
        match self {
            Self::Basic => "Basic",
            Self::Premium => "Premium",
            Self::Community => "Community",
        }
    }

    pub fn is_lowest(&self) -> bool {
        *self == Self::lowest()
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Tier {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "basic" => Ok(Self::Basic),
            "premium" => Ok(Self::Premium),
            "community" => Ok(Self::Community),
            _ => Err(ParseEnumError::new("tier", s)),
        }
    }
}

// =============================================================================
// Subscription status
// =============================================================================

/// Canonical subscription status, independent of provider vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Pending,
    Active,
    BillingRetry,
    Expired,
    Cancelled,
}

impl Default for SubscriptionStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl SubscriptionStatus {
    pub const ALL: [SubscriptionStatus; 5] = [
        SubscriptionStatus::Pending,
        SubscriptionStatus::Active,
        SubscriptionStatus::BillingRetry,
        SubscriptionStatus::Expired,
        SubscriptionStatus::Cancelled,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::BillingRetry => "billing_retry",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        }
    }

    /// Active or in the payment grace window
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Active | Self::BillingRetry)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Expired | Self::Cancelled)
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "billing_retry" => Ok(Self::BillingRetry),
            "expired" => Ok(Self::Expired),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(ParseEnumError::new("subscription status", s)),
        }
    }
}

// =============================================================================
// Provider
// =============================================================================

/// External payment provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Web checkout / card processor
    Stripe,
    /// Mobile in-app purchase store
    AppStore,
}

impl ProviderKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Stripe => "stripe",
            Self::AppStore => "app_store",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "stripe" | "web" => Ok(Self::Stripe),
            "app_store" | "app-store" | "appstore" | "apple" => Ok(Self::AppStore),
            _ => Err(ParseEnumError::new("provider", s)),
        }
    }
}
