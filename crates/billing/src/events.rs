//! Normalized provider events
//!
//! Every verified notification is translated exactly once into a
//! [`NormalizedEvent`]. Downstream components (state machine, ledger,
//! identity linker, consumables) only ever see this representation.

use kindred_shared::{ProviderKind, SubscriptionStatus, Tier};
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::reconcile::Transition;
use crate::store::{LedgerEntryType, LedgerStatus};
use crate::vocabulary::ConsumableGrant;

/// Provider event translated into the canonical vocabulary
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedEvent {
    pub provider: ProviderKind,
    pub provider_event_ref: String,
    /// Provider's own type string, kept for logs and the audit row
    pub event_type: String,
    /// Timestamp embedded by the provider, used for last-writer-wins ordering
    pub occurred_at: OffsetDateTime,
    pub owner: OwnerRef,
    /// Provider subscription the event refers to, if any
    pub subscription_ref: Option<String>,
    pub kind: EventKind,
    /// Ledger outcome carried by the event, if any
    pub invoice: Option<InvoiceOutcome>,
}

/// Provider-side identity used to find the owning user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerRef {
    /// Web provider customer id
    Customer(String),
    /// Mobile store original transaction id, with the account token the app
    /// attached at purchase time
    OriginalTransaction {
        original_transaction_ref: String,
        app_account_token: Option<Uuid>,
    },
    Unknown,
}

/// Absolute subscription state reported by a provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionSnapshot {
    pub status: SubscriptionStatus,
    pub tier: Tier,
    pub plan_ref: Option<String>,
    pub subscription_ref: Option<String>,
    pub customer_ref: Option<String>,
    pub original_transaction_ref: Option<String>,
    pub period_start: Option<OffsetDateTime>,
    pub period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub auto_renew: bool,
    pub is_trial: bool,
}

/// Normalized event kinds across both providers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    SubscriptionCreated(SubscriptionSnapshot),
    SubscriptionUpdated(SubscriptionSnapshot),
    SubscriptionDeleted,
    SubscriptionExpired,
    RenewalSucceeded {
        period_start: Option<OffsetDateTime>,
        period_end: OffsetDateTime,
        tier: Option<Tier>,
    },
    RenewalFailed,
    Refunded {
        transaction_ref: String,
        /// Full refund of a subscription purchase
        affects_subscription: bool,
    },
    /// Part of a charge returned; logged only
    PartialRefund {
        transaction_ref: String,
        amount_refunded: i64,
    },
    AutoRenewChanged {
        enabled: bool,
    },
    ConsumablePurchased {
        transaction_ref: String,
        product_ref: String,
        grant: Option<ConsumableGrant>,
    },
    /// Ledger-only outcome with no subscription effect
    InvoiceRecorded,
    Unhandled {
        event_type: String,
    },
}

impl EventKind {
    /// Subscription state-machine transition triggered by this kind, if any
    pub fn transition(&self) -> Option<Transition> {
        match self {
            EventKind::SubscriptionCreated(snapshot) => Some(Transition::Created(snapshot.clone())),
            EventKind::SubscriptionUpdated(snapshot) => Some(Transition::Updated(snapshot.clone())),
            EventKind::SubscriptionDeleted => Some(Transition::Cancel),
            EventKind::SubscriptionExpired => Some(Transition::Expire),
            EventKind::RenewalSucceeded {
                period_start,
                period_end,
                tier,
            } => Some(Transition::RenewalSucceeded {
                period_start: *period_start,
                period_end: *period_end,
                tier: *tier,
            }),
            EventKind::RenewalFailed => Some(Transition::RenewalFailed),
            EventKind::Refunded {
                affects_subscription: true,
                ..
            } => Some(Transition::Cancel),
            EventKind::Refunded {
                affects_subscription: false,
                ..
            } => None,
            EventKind::AutoRenewChanged { enabled } => {
                Some(Transition::AutoRenewChanged { enabled: *enabled })
            }
            EventKind::PartialRefund { .. } => None,
            EventKind::ConsumablePurchased { .. } => None,
            EventKind::InvoiceRecorded => None,
            EventKind::Unhandled { .. } => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            EventKind::SubscriptionCreated(_) => "subscription_created",
            EventKind::SubscriptionUpdated(_) => "subscription_updated",
            EventKind::SubscriptionDeleted => "subscription_deleted",
            EventKind::SubscriptionExpired => "subscription_expired",
            EventKind::RenewalSucceeded { .. } => "renewal_succeeded",
            EventKind::RenewalFailed => "renewal_failed",
            EventKind::Refunded { .. } => "refunded",
            EventKind::PartialRefund { .. } => "partial_refund",
            EventKind::AutoRenewChanged { .. } => "auto_renew_changed",
            EventKind::ConsumablePurchased { .. } => "consumable_purchased",
            EventKind::InvoiceRecorded => "invoice_recorded",
            EventKind::Unhandled { .. } => "unhandled",
        }
    }
}

/// Invoice or purchase outcome destined for the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvoiceOutcome {
    pub invoice_ref: String,
    pub entry_type: LedgerEntryType,
    /// Minor units (cents)
    pub amount_cents: i64,
    /// As reported; normalized by the ledger
    pub currency: Option<String>,
    pub status: LedgerStatus,
    /// Provider subscription the invoice billed
    pub subscription_ref: Option<String>,
    pub period_start: Option<OffsetDateTime>,
    pub period_end: Option<OffsetDateTime>,
    pub description: Option<String>,
    pub hosted_invoice_url: Option<String>,
    pub invoice_pdf_url: Option<String>,
}

impl InvoiceOutcome {
    pub fn new(
        invoice_ref: impl Into<String>,
        entry_type: LedgerEntryType,
        amount_cents: i64,
        status: LedgerStatus,
    ) -> Self {
        Self {
            invoice_ref: invoice_ref.into(),
            entry_type,
            amount_cents,
            currency: None,
            status,
            subscription_ref: None,
            period_start: None,
            period_end: None,
            description: None,
            hosted_invoice_url: None,
            invoice_pdf_url: None,
        }
    }
}

/// Parse a unix timestamp in seconds
pub(crate) fn from_unix_secs(secs: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(secs).ok()
}

/// Parse a unix timestamp in milliseconds
pub(crate) fn from_unix_millis(millis: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> SubscriptionSnapshot {
        SubscriptionSnapshot {
            status: SubscriptionStatus::Active,
            tier: Tier::Premium,
            plan_ref: Some("price_premium".to_string()),
            subscription_ref: Some("sub_1".to_string()),
            customer_ref: Some("cus_1".to_string()),
            original_transaction_ref: None,
            period_start: None,
            period_end: None,
            cancel_at_period_end: false,
            auto_renew: true,
            is_trial: false,
        }
    }

    #[test]
    fn test_subscription_kinds_map_to_transitions() {
        assert_eq!(
            EventKind::SubscriptionCreated(snapshot()).transition(),
            Some(Transition::Created(snapshot()))
        );
        assert_eq!(
            EventKind::SubscriptionDeleted.transition(),
            Some(Transition::Cancel)
        );
        assert_eq!(
            EventKind::SubscriptionExpired.transition(),
            Some(Transition::Expire)
        );
        assert_eq!(
            EventKind::RenewalFailed.transition(),
            Some(Transition::RenewalFailed)
        );
    }

    #[test]
    fn test_only_full_subscription_refund_cancels() {
        let full = EventKind::Refunded {
            transaction_ref: "ch_1".to_string(),
            affects_subscription: true,
        };
        let partial = EventKind::Refunded {
            transaction_ref: "ch_1".to_string(),
            affects_subscription: false,
        };
        assert_eq!(full.transition(), Some(Transition::Cancel));
        assert_eq!(partial.transition(), None);
    }

    #[test]
    fn test_ledger_only_kinds_have_no_transition() {
        assert!(EventKind::InvoiceRecorded.transition().is_none());
        assert!(EventKind::Unhandled {
            event_type: "customer.tax_id.created".to_string()
        }
        .transition()
        .is_none());
        assert!(EventKind::ConsumablePurchased {
            transaction_ref: "pi_1".to_string(),
            product_ref: "com.kindred.boost.1".to_string(),
            grant: None,
        }
        .transition()
        .is_none());
    }

    #[test]
    fn test_timestamp_helpers() {
        assert_eq!(
            from_unix_secs(1_700_000_000).map(|t| t.unix_timestamp()),
            Some(1_700_000_000)
        );
        assert_eq!(
            from_unix_millis(1_700_000_000_123).map(|t| t.unix_timestamp()),
            Some(1_700_000_000)
        );
    }
}
