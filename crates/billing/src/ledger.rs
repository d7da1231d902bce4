//! Billing ledger: one row per provider invoice or purchase

use std::sync::Arc;

use kindred_shared::ProviderKind;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::events::InvoiceOutcome;
use crate::store::{BillingStore, LedgerEntry, LedgerUpsert};

/// Lower-case ISO currency, falling back to `default` when absent or blank
pub fn normalize_currency(currency: Option<&str>, default: &str) -> String {
    match currency.map(str::trim) {
        Some(code) if !code.is_empty() => code.to_lowercase(),
        _ => default.trim().to_lowercase(),
    }
}

#[derive(Clone)]
pub struct BillingLedger {
    store: Arc<dyn BillingStore>,
    default_currency: String,
}

impl BillingLedger {
    pub fn new(store: Arc<dyn BillingStore>, default_currency: impl Into<String>) -> Self {
        Self {
            store,
            default_currency: default_currency.into(),
        }
    }

    /// Insert the outcome, or update only the status if the invoice is known
    pub async fn record_outcome(
        &self,
        user_id: Uuid,
        provider: ProviderKind,
        outcome: &InvoiceOutcome,
    ) -> BillingResult<LedgerUpsert> {
        if outcome.invoice_ref.trim().is_empty() {
            return Err(BillingError::MalformedPayload(
                "Ledger outcome without an invoice reference".to_string(),
            ));
        }
        if outcome.amount_cents < 0 {
            return Err(BillingError::MalformedPayload(format!(
                "Negative amount {} for invoice {}",
                outcome.amount_cents, outcome.invoice_ref
            )));
        }

        let now = OffsetDateTime::now_utc();
        let entry = LedgerEntry {
            id: Uuid::new_v4(),
            user_id,
            provider,
            provider_invoice_ref: outcome.invoice_ref.clone(),
            entry_type: outcome.entry_type,
            amount_cents: outcome.amount_cents,
            currency: normalize_currency(outcome.currency.as_deref(), &self.default_currency),
            status: outcome.status,
            provider_subscription_ref: outcome.subscription_ref.clone(),
            period_start: outcome.period_start,
            period_end: outcome.period_end,
            description: outcome.description.clone(),
            hosted_invoice_url: outcome.hosted_invoice_url.clone(),
            invoice_pdf_url: outcome.invoice_pdf_url.clone(),
            created_at: now,
            updated_at: now,
        };

        let upsert = self.store.upsert_ledger_entry(&entry).await?;

        tracing::info!(
            user_id = %user_id,
            invoice_ref = %upsert.entry.provider_invoice_ref,
            status = ?upsert.entry.status,
            amount_cents = upsert.entry.amount_cents,
            inserted = upsert.inserted,
            "Ledger entry recorded"
        );

        Ok(upsert)
    }

    /// All ledger rows for a user, newest first
    pub async fn list(&self, user_id: Uuid) -> BillingResult<Vec<LedgerEntry>> {
        self.store.list_ledger_entries(user_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryBillingStore, LedgerEntryType, LedgerStatus};

    fn ledger() -> BillingLedger {
        BillingLedger::new(Arc::new(InMemoryBillingStore::new()), "usd")
    }

    #[test]
    fn test_normalize_currency() {
        assert_eq!(normalize_currency(Some("EUR"), "usd"), "eur");
        assert_eq!(normalize_currency(Some("  "), "usd"), "usd");
        assert_eq!(normalize_currency(None, "GBP"), "gbp");
    }

    #[tokio::test]
    async fn test_duplicate_paid_outcome_keeps_one_row() {
        let ledger = ledger();
        let user_id = Uuid::new_v4();
        let mut outcome =
            InvoiceOutcome::new("in_1", LedgerEntryType::SubscriptionInvoice, 1999, LedgerStatus::Paid);
        outcome.currency = Some("USD".to_string());

        let first = ledger
            .record_outcome(user_id, ProviderKind::Stripe, &outcome)
            .await
            .unwrap();
        let second = ledger
            .record_outcome(user_id, ProviderKind::Stripe, &outcome)
            .await
            .unwrap();

        assert!(first.inserted);
        assert!(!second.inserted);
        let rows = ledger.list(user_id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].amount_cents, 1999);
        assert_eq!(rows[0].currency, "usd");
        assert_eq!(rows[0].status, LedgerStatus::Paid);
    }

    #[tokio::test]
    async fn test_refund_updates_status_only() {
        let ledger = ledger();
        let user_id = Uuid::new_v4();
        let paid =
            InvoiceOutcome::new("in_2", LedgerEntryType::SubscriptionInvoice, 999, LedgerStatus::Paid);
        ledger
            .record_outcome(user_id, ProviderKind::Stripe, &paid)
            .await
            .unwrap();

        let refunded =
            InvoiceOutcome::new("in_2", LedgerEntryType::SubscriptionInvoice, 0, LedgerStatus::Refunded);
        let upsert = ledger
            .record_outcome(user_id, ProviderKind::Stripe, &refunded)
            .await
            .unwrap();

        assert!(!upsert.inserted);
        assert_eq!(upsert.entry.status, LedgerStatus::Refunded);
        assert_eq!(upsert.entry.amount_cents, 999);
    }

    #[tokio::test]
    async fn test_rejects_negative_amount() {
        let outcome =
            InvoiceOutcome::new("in_3", LedgerEntryType::OneTimePurchase, -5, LedgerStatus::Paid);
        let result = ledger()
            .record_outcome(Uuid::new_v4(), ProviderKind::AppStore, &outcome)
            .await;
        assert!(matches!(result, Err(BillingError::MalformedPayload(_))));
    }
}
