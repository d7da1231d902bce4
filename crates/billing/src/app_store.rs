//! App Store Server Notification (V2) normalization
//!
//! Ingestion verifies the outer `signedPayload` and the nested signed
//! transaction and renewal blobs, then stores them decoded under
//! `data.transactionInfo` and `data.renewalInfo`. This module reads that
//! decoded form.

use kindred_shared::ProviderKind;
use serde::Deserialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::events::{
    from_unix_millis, EventKind, InvoiceOutcome, NormalizedEvent, OwnerRef, SubscriptionSnapshot,
};
use crate::store::{LedgerEntryType, LedgerStatus};
use crate::vocabulary::Vocabulary;

/// `type` value Apple uses for subscriptions
pub const AUTO_RENEWABLE_TYPE: &str = "Auto-Renewable Subscription";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Notification {
    notification_type: String,
    subtype: Option<String>,
    #[serde(rename = "notificationUUID")]
    notification_uuid: String,
    signed_date: i64,
    data: Option<NotificationData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NotificationData {
    status: Option<i32>,
    transaction_info: Option<TransactionInfo>,
    renewal_info: Option<RenewalInfo>,
}

/// Decoded `JWSTransactionDecodedPayload`, fields the engine reads
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionInfo {
    pub transaction_id: String,
    pub original_transaction_id: String,
    pub product_id: String,
    pub bundle_id: Option<String>,
    /// Milliseconds since the epoch
    pub purchase_date: Option<i64>,
    pub expires_date: Option<i64>,
    pub revocation_date: Option<i64>,
    #[serde(rename = "type")]
    pub product_type: Option<String>,
    pub app_account_token: Option<String>,
    pub offer_discount_type: Option<String>,
    /// Price in milliunits of `currency`
    pub price: Option<i64>,
    pub currency: Option<String>,
    pub environment: Option<String>,
}

impl TransactionInfo {
    pub fn is_subscription(&self) -> bool {
        self.product_type.as_deref() == Some(AUTO_RENEWABLE_TYPE)
    }

    pub fn account_token(&self) -> Option<Uuid> {
        self.app_account_token
            .as_deref()
            .and_then(|t| Uuid::parse_str(t).ok())
    }

    fn owner(&self) -> OwnerRef {
        OwnerRef::OriginalTransaction {
            original_transaction_ref: self.original_transaction_id.clone(),
            app_account_token: self.account_token(),
        }
    }

    /// Price in cents, if Apple reported one
    fn amount_cents(&self) -> i64 {
        self.price.map_or(0, |milli| milli / 10)
    }

    fn period(&self) -> BillingResult<(Option<OffsetDateTime>, Option<OffsetDateTime>)> {
        let parse = |millis: Option<i64>| -> BillingResult<Option<OffsetDateTime>> {
            millis
                .map(|m| {
                    from_unix_millis(m).ok_or_else(|| {
                        BillingError::MalformedPayload(format!("Invalid timestamp {}", m))
                    })
                })
                .transpose()
        };
        let (start, end) = (parse(self.purchase_date)?, parse(self.expires_date)?);
        if let (Some(start), Some(end)) = (start, end) {
            if end < start {
                return Err(BillingError::MalformedPayload(format!(
                    "Transaction {} expires before purchase",
                    self.transaction_id
                )));
            }
        }
        Ok((start, end))
    }

    fn ledger_outcome(&self, entry_type: LedgerEntryType, status: LedgerStatus) -> InvoiceOutcome {
        let (period_start, period_end) = self.period().unwrap_or((None, None));
        let mut outcome = InvoiceOutcome::new(
            self.transaction_id.clone(),
            entry_type,
            self.amount_cents(),
            status,
        );
        outcome.currency = self.currency.clone();
        outcome.period_start = period_start;
        outcome.period_end = period_end;
        outcome.description = Some(self.product_id.clone());
        outcome
    }
}

/// Decoded `JWSRenewalInfoDecodedPayload`, fields the engine reads
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenewalInfo {
    /// 1 = on, 0 = off
    pub auto_renew_status: Option<i32>,
    pub auto_renew_product_id: Option<String>,
}

impl RenewalInfo {
    pub fn auto_renew(&self) -> bool {
        self.auto_renew_status.map_or(true, |s| s == 1)
    }
}

/// Minimal view of a notification used by ingestion
#[derive(Debug, Clone)]
pub struct AppStoreNotificationHeader {
    pub id: String,
    pub event_type: String,
    pub signed_at: OffsetDateTime,
}

/// Read the notification id, type and signing time from a decoded payload
pub fn parse_header(payload: &serde_json::Value) -> BillingResult<AppStoreNotificationHeader> {
    let notification: Notification = serde_json::from_value(payload.clone())
        .map_err(|e| BillingError::InvalidPayload(format!("App Store notification: {}", e)))?;
    let signed_at = from_unix_millis(notification.signed_date).ok_or_else(|| {
        BillingError::InvalidPayload(format!("Invalid signedDate {}", notification.signed_date))
    })?;
    Ok(AppStoreNotificationHeader {
        id: notification.notification_uuid,
        event_type: event_type_name(&notification.notification_type, notification.subtype.as_deref()),
        signed_at,
    })
}

fn event_type_name(notification_type: &str, subtype: Option<&str>) -> String {
    match subtype {
        Some(subtype) => format!("{}.{}", notification_type, subtype),
        None => notification_type.to_string(),
    }
}

/// Canonical snapshot of a subscription transaction as of `as_of`
pub fn transaction_snapshot(
    info: &TransactionInfo,
    renewal: Option<&RenewalInfo>,
    status: Option<i32>,
    as_of: OffsetDateTime,
    vocab: &Vocabulary,
) -> BillingResult<SubscriptionSnapshot> {
    let (period_start, period_end) = info.period()?;

    let status = match status {
        Some(code) => vocab.map_status(ProviderKind::AppStore, &code.to_string()),
        None if info.revocation_date.is_some() => {
            vocab.map_status(ProviderKind::AppStore, "revoked")
        }
        None if period_end.is_some_and(|end| end <= as_of) => {
            vocab.map_status(ProviderKind::AppStore, "expired")
        }
        None => vocab.map_status(ProviderKind::AppStore, "active"),
    };
    let auto_renew = renewal.map_or(true, RenewalInfo::auto_renew);

    Ok(SubscriptionSnapshot {
        status,
        tier: vocab.tier_for_product(&info.product_id),
        plan_ref: Some(info.product_id.clone()),
        subscription_ref: Some(info.original_transaction_id.clone()),
        customer_ref: None,
        original_transaction_ref: Some(info.original_transaction_id.clone()),
        period_start,
        period_end,
        cancel_at_period_end: !auto_renew && status.is_live(),
        auto_renew,
        is_trial: info.offer_discount_type.as_deref() == Some("FREE_TRIAL"),
    })
}

/// Translate a verified, decoded notification into a [`NormalizedEvent`]
pub fn normalize(payload: &serde_json::Value, vocab: &Vocabulary) -> BillingResult<NormalizedEvent> {
    let header = parse_header(payload)?;
    let notification: Notification = serde_json::from_value(payload.clone())
        .map_err(|e| BillingError::MalformedPayload(e.to_string()))?;

    let mut event = NormalizedEvent {
        provider: ProviderKind::AppStore,
        provider_event_ref: header.id,
        event_type: header.event_type.clone(),
        occurred_at: header.signed_at,
        owner: OwnerRef::Unknown,
        subscription_ref: None,
        kind: EventKind::Unhandled {
            event_type: header.event_type.clone(),
        },
        invoice: None,
    };

    let data = notification.data.unwrap_or(NotificationData {
        status: None,
        transaction_info: None,
        renewal_info: None,
    });
    let Some(info) = data.transaction_info else {
        // TEST and summary notifications carry no transaction
        return Ok(event);
    };

    event.owner = info.owner();
    if info.is_subscription() {
        event.subscription_ref = Some(info.original_transaction_id.clone());
    }

    let require_transaction = |what: &str| {
        BillingError::MalformedPayload(format!(
            "{} notification for {} is missing {}",
            notification.notification_type, info.transaction_id, what
        ))
    };

    event.kind = match notification.notification_type.as_str() {
        "SUBSCRIBED" => {
            event.invoice = Some(
                info.ledger_outcome(LedgerEntryType::SubscriptionInvoice, LedgerStatus::Paid),
            );
            EventKind::SubscriptionCreated(transaction_snapshot(
                &info,
                data.renewal_info.as_ref(),
                data.status,
                header.signed_at,
                vocab,
            )?)
        }
        "DID_CHANGE_RENEWAL_PREF" | "OFFER_REDEEMED" => {
            EventKind::SubscriptionUpdated(transaction_snapshot(
                &info,
                data.renewal_info.as_ref(),
                data.status,
                header.signed_at,
                vocab,
            )?)
        }
        "DID_RENEW" | "RENEWAL_EXTENDED" => {
            let (period_start, period_end) = info.period()?;
            let period_end = period_end.ok_or_else(|| require_transaction("expiresDate"))?;
            if notification.notification_type == "DID_RENEW" {
                event.invoice = Some(
                    info.ledger_outcome(LedgerEntryType::SubscriptionInvoice, LedgerStatus::Paid),
                );
            }
            EventKind::RenewalSucceeded {
                period_start,
                period_end,
                tier: Some(vocab.tier_for_product(&info.product_id)),
            }
        }
        "DID_FAIL_TO_RENEW" => EventKind::RenewalFailed,
        "DID_CHANGE_RENEWAL_STATUS" => EventKind::AutoRenewChanged {
            enabled: notification.subtype.as_deref() == Some("AUTO_RENEW_ENABLED"),
        },
        "EXPIRED" | "GRACE_PERIOD_EXPIRED" => EventKind::SubscriptionExpired,
        "REFUND" | "REVOKE" => {
            if notification.notification_type == "REFUND" {
                let entry_type = if info.is_subscription() {
                    LedgerEntryType::SubscriptionInvoice
                } else {
                    LedgerEntryType::OneTimePurchase
                };
                event.invoice = Some(info.ledger_outcome(entry_type, LedgerStatus::Refunded));
            }
            EventKind::Refunded {
                transaction_ref: info.transaction_id.clone(),
                affects_subscription: info.is_subscription(),
            }
        }
        "ONE_TIME_CHARGE" => {
            event.invoice =
                Some(info.ledger_outcome(LedgerEntryType::OneTimePurchase, LedgerStatus::Paid));
            EventKind::ConsumablePurchased {
                transaction_ref: info.transaction_id.clone(),
                product_ref: info.product_id.clone(),
                grant: vocab.consumable(&info.product_id),
            }
        }
        other => EventKind::Unhandled {
            event_type: event_type_name(other, notification.subtype.as_deref()),
        },
    };

    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kindred_shared::{SubscriptionStatus, Tier};
    use serde_json::json;

    const SIGNED: i64 = 1_700_000_000_000;
    const DAY_MS: i64 = 86_400_000;

    fn vocab() -> Vocabulary {
        Vocabulary::new(
            Vec::new(),
            vec![("com.kindred.premium.monthly".to_string(), Tier::Premium)],
            crate::vocabulary::default_consumable_products(),
        )
    }

    fn transaction(product: &str, product_type: &str) -> serde_json::Value {
        json!({
            "transactionId": "2000000101",
            "originalTransactionId": "2000000100",
            "productId": product,
            "bundleId": "com.kindred.app",
            "purchaseDate": SIGNED - DAY_MS,
            "expiresDate": SIGNED + 29 * DAY_MS,
            "type": product_type,
            "appAccountToken": "6f1b0c9e-3c1a-4f6e-9f57-2b1f2c3d4e5f",
            "price": 9990,
            "currency": "USD"
        })
    }

    fn notification(
        notification_type: &str,
        subtype: Option<&str>,
        transaction: serde_json::Value,
    ) -> serde_json::Value {
        json!({
            "notificationType": notification_type,
            "subtype": subtype,
            "notificationUUID": "a1b2c3d4-0000-0000-0000-000000000001",
            "signedDate": SIGNED,
            "data": {
                "bundleId": "com.kindred.app",
                "transactionInfo": transaction,
                "renewalInfo": { "autoRenewStatus": 1 }
            }
        })
    }

    fn subscription_tx() -> serde_json::Value {
        transaction("com.kindred.premium.monthly", AUTO_RENEWABLE_TYPE)
    }

    #[test]
    fn test_subscribed_creates_subscription() {
        let event = normalize(
            &notification("SUBSCRIBED", Some("INITIAL_BUY"), subscription_tx()),
            &vocab(),
        )
        .unwrap();

        assert_eq!(event.event_type, "SUBSCRIBED.INITIAL_BUY");
        assert_eq!(event.subscription_ref.as_deref(), Some("2000000100"));
        assert_eq!(
            event.owner,
            OwnerRef::OriginalTransaction {
                original_transaction_ref: "2000000100".to_string(),
                app_account_token: Uuid::parse_str("6f1b0c9e-3c1a-4f6e-9f57-2b1f2c3d4e5f").ok(),
            }
        );
        let EventKind::SubscriptionCreated(snapshot) = &event.kind else {
            panic!("expected created");
        };
        assert_eq!(snapshot.status, SubscriptionStatus::Active);
        assert_eq!(snapshot.tier, Tier::Premium);
        assert_eq!(
            snapshot.original_transaction_ref.as_deref(),
            Some("2000000100")
        );

        let outcome = event.invoice.unwrap();
        assert_eq!(outcome.amount_cents, 999);
        assert_eq!(outcome.invoice_ref, "2000000101");
    }

    #[test]
    fn test_subscribed_after_expiry_is_expired() {
        let mut tx = subscription_tx();
        tx["expiresDate"] = json!(SIGNED - 1000);
        let event = normalize(&notification("SUBSCRIBED", None, tx), &vocab()).unwrap();
        let EventKind::SubscriptionCreated(snapshot) = event.kind else {
            panic!("expected created");
        };
        assert_eq!(snapshot.status, SubscriptionStatus::Expired);
    }

    #[test]
    fn test_product_keyword_fallback() {
        let tx = transaction("com.kindred.platinum.yearly", AUTO_RENEWABLE_TYPE);
        let event = normalize(&notification("SUBSCRIBED", None, tx), &vocab()).unwrap();
        let EventKind::SubscriptionCreated(snapshot) = event.kind else {
            panic!("expected created");
        };
        assert_eq!(snapshot.tier, Tier::Community);
    }

    #[test]
    fn test_did_renew() {
        let event = normalize(&notification("DID_RENEW", None, subscription_tx()), &vocab()).unwrap();
        let EventKind::RenewalSucceeded { period_end, tier, .. } = event.kind else {
            panic!("expected renewal");
        };
        assert_eq!(tier, Some(Tier::Premium));
        assert!(period_end > from_unix_millis(SIGNED).unwrap());
        assert_eq!(event.invoice.unwrap().status, LedgerStatus::Paid);
    }

    #[test]
    fn test_renewal_without_expiry_is_malformed() {
        let mut tx = subscription_tx();
        tx["expiresDate"] = serde_json::Value::Null;
        let result = normalize(&notification("DID_RENEW", None, tx), &vocab());
        assert!(matches!(result, Err(BillingError::MalformedPayload(_))));
    }

    #[test]
    fn test_auto_renew_status_change() {
        let disabled = normalize(
            &notification("DID_CHANGE_RENEWAL_STATUS", Some("AUTO_RENEW_DISABLED"), subscription_tx()),
            &vocab(),
        )
        .unwrap();
        assert_eq!(disabled.kind, EventKind::AutoRenewChanged { enabled: false });

        let enabled = normalize(
            &notification("DID_CHANGE_RENEWAL_STATUS", Some("AUTO_RENEW_ENABLED"), subscription_tx()),
            &vocab(),
        )
        .unwrap();
        assert_eq!(enabled.kind, EventKind::AutoRenewChanged { enabled: true });
    }

    #[test]
    fn test_expiry_and_failure() {
        for kind in ["EXPIRED", "GRACE_PERIOD_EXPIRED"] {
            let event = normalize(&notification(kind, None, subscription_tx()), &vocab()).unwrap();
            assert_eq!(event.kind, EventKind::SubscriptionExpired);
        }
        let failed =
            normalize(&notification("DID_FAIL_TO_RENEW", None, subscription_tx()), &vocab()).unwrap();
        assert_eq!(failed.kind, EventKind::RenewalFailed);
    }

    #[test]
    fn test_refund_of_subscription() {
        let event = normalize(&notification("REFUND", None, subscription_tx()), &vocab()).unwrap();
        assert_eq!(
            event.kind,
            EventKind::Refunded {
                transaction_ref: "2000000101".to_string(),
                affects_subscription: true
            }
        );
        assert_eq!(event.invoice.unwrap().status, LedgerStatus::Refunded);
    }

    #[test]
    fn test_consumable_purchase_and_refund() {
        let tx = transaction("com.kindred.superlike.15", "Consumable");
        let purchase = normalize(&notification("ONE_TIME_CHARGE", None, tx.clone()), &vocab()).unwrap();
        assert!(purchase.subscription_ref.is_none());
        let EventKind::ConsumablePurchased { grant, .. } = purchase.kind else {
            panic!("expected consumable");
        };
        assert_eq!(grant.map(|g| g.quantity), Some(15));

        let refund = normalize(&notification("REFUND", None, tx), &vocab()).unwrap();
        assert_eq!(
            refund.kind,
            EventKind::Refunded {
                transaction_ref: "2000000101".to_string(),
                affects_subscription: false
            }
        );
    }

    #[test]
    fn test_notification_without_transaction() {
        let payload = json!({
            "notificationType": "TEST",
            "notificationUUID": "a1b2c3d4-0000-0000-0000-000000000002",
            "signedDate": SIGNED
        });
        let event = normalize(&payload, &vocab()).unwrap();
        assert_eq!(event.owner, OwnerRef::Unknown);
        assert!(matches!(event.kind, EventKind::Unhandled { .. }));
    }

    #[test]
    fn test_unknown_notification_type() {
        let event = normalize(
            &notification("PRICE_INCREASE", Some("PENDING"), subscription_tx()),
            &vocab(),
        )
        .unwrap();
        assert_eq!(
            event.kind,
            EventKind::Unhandled {
                event_type: "PRICE_INCREASE.PENDING".to_string()
            }
        );
    }
}
