//! In-memory [`BillingStore`] used by tests and local runs

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use kindred_shared::ProviderKind;
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    BillingStore, ClaimOutcome, EntitlementSnapshot, IngestStatus, IngestedEventRecord,
    LedgerEntry, LedgerUpsert, NewIngestedEvent, ProviderTransactionRecord, SubscriptionRecord,
    TransactionInsert,
};
use crate::error::{BillingError, BillingResult};

#[derive(Default)]
struct State {
    subscriptions: HashMap<Uuid, SubscriptionRecord>,
    events: HashMap<Uuid, IngestedEventRecord>,
    event_keys: HashMap<(ProviderKind, String), Uuid>,
    ledger: HashMap<String, LedgerEntry>,
    transactions: HashMap<(ProviderKind, String), ProviderTransactionRecord>,
    snapshots: HashMap<Uuid, EntitlementSnapshot>,
}

impl State {
    /// Enforce the provider-ref unique indexes the Postgres schema carries
    fn check_unique_refs(&self, record: &SubscriptionRecord) -> BillingResult<()> {
        for other in self.subscriptions.values() {
            if other.user_id == record.user_id {
                continue;
            }
            let clash = |mine: &Option<String>, theirs: &Option<String>| {
                mine.is_some() && mine == theirs
            };
            if clash(&record.provider_subscription_ref, &other.provider_subscription_ref) {
                return Err(BillingError::AlreadyExists(
                    "idx_subscriptions_provider_subscription".to_string(),
                ));
            }
            if clash(&record.provider_customer_ref, &other.provider_customer_ref) {
                return Err(BillingError::AlreadyExists("idx_subscriptions_customer".to_string()));
            }
            if clash(
                &record.provider_original_transaction_ref,
                &other.provider_original_transaction_ref,
            ) {
                return Err(BillingError::AlreadyExists(
                    "idx_subscriptions_original_transaction".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Mutex-guarded maps with the same uniqueness rules as the SQL schema
#[derive(Default)]
pub struct InMemoryBillingStore {
    state: Mutex<State>,
    unavailable: AtomicBool,
}

impl InMemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with a transient database error until reset
    pub fn simulate_outage(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> BillingResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BillingError::Database("store unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl BillingStore for InMemoryBillingStore {
    async fn find_subscription_by_user(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        self.check_available()?;
        Ok(self.state.lock().await.subscriptions.get(&user_id).cloned())
    }

    async fn find_subscription_by_customer_ref(
        &self,
        customer_ref: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state
            .subscriptions
            .values()
            .find(|s| s.provider_customer_ref.as_deref() == Some(customer_ref))
            .cloned())
    }

    async fn find_subscription_by_original_transaction(
        &self,
        original_transaction_ref: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state
            .subscriptions
            .values()
            .find(|s| {
                s.provider_original_transaction_ref.as_deref() == Some(original_transaction_ref)
            })
            .cloned())
    }

    async fn insert_subscription(&self, record: &SubscriptionRecord) -> BillingResult<()> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        if state.subscriptions.contains_key(&record.user_id) {
            return Err(BillingError::AlreadyExists(format!(
                "subscription for user {}",
                record.user_id
            )));
        }
        state.check_unique_refs(record)?;
        state.subscriptions.insert(record.user_id, record.clone());
        Ok(())
    }

    async fn compare_and_swap_subscription(
        &self,
        record: &SubscriptionRecord,
        expected_version: i64,
    ) -> BillingResult<bool> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        match state.subscriptions.get(&record.user_id) {
            Some(current) if current.version == expected_version && current.id == record.id => {}
            _ => return Ok(false),
        }
        state.check_unique_refs(record)?;
        let mut stored = record.clone();
        stored.version = expected_version + 1;
        state.subscriptions.insert(record.user_id, stored);
        Ok(true)
    }

    async fn claim_event(
        &self,
        event: NewIngestedEvent,
        stale_after_minutes: i32,
    ) -> BillingResult<ClaimOutcome> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let now = OffsetDateTime::now_utc();
        let key = (event.provider, event.provider_event_ref.clone());

        if let Some(existing_id) = state.event_keys.get(&key).copied() {
            let Some(existing) = state.events.get_mut(&existing_id) else {
                return Err(BillingError::Internal("event index out of sync".to_string()));
            };
            let stale = existing.status == IngestStatus::Pending
                && existing.processing_started_at
                    < now - Duration::minutes(i64::from(stale_after_minutes));
            if !stale {
                return Ok(ClaimOutcome::Duplicate(existing.status));
            }
            existing.processing_started_at = now;
            existing.error_message = Some(format!("Recovered from stuck state at {}", now));
            return Ok(ClaimOutcome::Claimed(existing.clone()));
        }

        let record = IngestedEventRecord {
            id: Uuid::new_v4(),
            provider: event.provider,
            provider_event_ref: event.provider_event_ref,
            event_type: event.event_type,
            occurred_at: event.occurred_at,
            raw_payload: event.raw_payload,
            status: IngestStatus::Pending,
            error_message: None,
            processing_started_at: now,
            processed_at: None,
            created_at: now,
        };
        state.event_keys.insert(key, record.id);
        state.events.insert(record.id, record.clone());
        Ok(ClaimOutcome::Claimed(record))
    }

    async fn complete_event(
        &self,
        id: Uuid,
        status: IngestStatus,
        error_message: Option<String>,
    ) -> BillingResult<()> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let record = state
            .events
            .get_mut(&id)
            .ok_or_else(|| BillingError::NotFound(format!("ingested event {}", id)))?;
        record.status = status;
        record.error_message = error_message;
        record.processed_at = Some(OffsetDateTime::now_utc());
        Ok(())
    }

    async fn release_event(&self, id: Uuid) -> BillingResult<()> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let pending = state
            .events
            .get(&id)
            .is_some_and(|e| e.status == IngestStatus::Pending);
        if pending {
            if let Some(record) = state.events.remove(&id) {
                state
                    .event_keys
                    .remove(&(record.provider, record.provider_event_ref));
            }
        }
        Ok(())
    }

    async fn restart_event(&self, id: Uuid, note: &str) -> BillingResult<bool> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        match state.events.get_mut(&id) {
            Some(record) => {
                record.status = IngestStatus::Pending;
                record.processing_started_at = OffsetDateTime::now_utc();
                record.error_message = Some(note.to_string());
                record.processed_at = None;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_event(&self, id: Uuid) -> BillingResult<Option<IngestedEventRecord>> {
        self.check_available()?;
        Ok(self.state.lock().await.events.get(&id).cloned())
    }

    async fn list_events(
        &self,
        status: Option<IngestStatus>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<IngestedEventRecord>> {
        self.check_available()?;
        let state = self.state.lock().await;
        let mut events: Vec<IngestedEventRecord> = state
            .events
            .values()
            .filter(|e| status.map_or(true, |s| e.status == s))
            .cloned()
            .collect();
        events.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(events
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn upsert_ledger_entry(&self, entry: &LedgerEntry) -> BillingResult<LedgerUpsert> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        if let Some(existing) = state.ledger.get_mut(&entry.provider_invoice_ref) {
            existing.status = existing.status.advance(entry.status);
            if existing.provider_subscription_ref.is_none() {
                existing.provider_subscription_ref = entry.provider_subscription_ref.clone();
            }
            existing.updated_at = OffsetDateTime::now_utc();
            return Ok(LedgerUpsert {
                entry: existing.clone(),
                inserted: false,
            });
        }
        state
            .ledger
            .insert(entry.provider_invoice_ref.clone(), entry.clone());
        Ok(LedgerUpsert {
            entry: entry.clone(),
            inserted: true,
        })
    }

    async fn find_ledger_entry(
        &self,
        provider_invoice_ref: &str,
    ) -> BillingResult<Option<LedgerEntry>> {
        self.check_available()?;
        Ok(self.state.lock().await.ledger.get(provider_invoice_ref).cloned())
    }

    async fn list_ledger_entries(&self, user_id: Uuid) -> BillingResult<Vec<LedgerEntry>> {
        self.check_available()?;
        let state = self.state.lock().await;
        let mut entries: Vec<LedgerEntry> = state
            .ledger
            .values()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(entries)
    }

    async fn insert_transaction_if_absent(
        &self,
        record: &ProviderTransactionRecord,
    ) -> BillingResult<TransactionInsert> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let key = (record.provider, record.transaction_ref.clone());
        if let Some(existing) = state.transactions.get(&key) {
            return Ok(TransactionInsert::Existing(existing.clone()));
        }
        state.transactions.insert(key, record.clone());
        Ok(TransactionInsert::Inserted(record.clone()))
    }

    async fn find_transaction(
        &self,
        provider: ProviderKind,
        transaction_ref: &str,
    ) -> BillingResult<Option<ProviderTransactionRecord>> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state
            .transactions
            .get(&(provider, transaction_ref.to_string()))
            .cloned())
    }

    async fn mark_transaction_refunded(
        &self,
        provider: ProviderKind,
        transaction_ref: &str,
        refunded_at: OffsetDateTime,
    ) -> BillingResult<Option<ProviderTransactionRecord>> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        Ok(state
            .transactions
            .get_mut(&(provider, transaction_ref.to_string()))
            .map(|record| {
                record.refunded_at.get_or_insert(refunded_at);
                record.clone()
            }))
    }

    async fn claim_consumable_revocation(
        &self,
        provider: ProviderKind,
        transaction_ref: &str,
    ) -> BillingResult<bool> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        match state
            .transactions
            .get_mut(&(provider, transaction_ref.to_string()))
        {
            Some(record) if record.consumables_revoked_at.is_none() => {
                record.consumables_revoked_at = Some(OffsetDateTime::now_utc());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_consumable_revocation(
        &self,
        provider: ProviderKind,
        transaction_ref: &str,
    ) -> BillingResult<()> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        if let Some(record) = state
            .transactions
            .get_mut(&(provider, transaction_ref.to_string()))
        {
            record.consumables_revoked_at = None;
        }
        Ok(())
    }

    async fn get_entitlement_snapshot(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Option<EntitlementSnapshot>> {
        self.check_available()?;
        Ok(self.state.lock().await.snapshots.get(&user_id).cloned())
    }

    async fn insert_entitlement_snapshot(
        &self,
        snapshot: &EntitlementSnapshot,
    ) -> BillingResult<bool> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        if state.snapshots.contains_key(&snapshot.user_id) {
            return Ok(false);
        }
        state.snapshots.insert(snapshot.user_id, snapshot.clone());
        Ok(true)
    }

    async fn compare_and_swap_entitlement_snapshot(
        &self,
        snapshot: &EntitlementSnapshot,
        expected_version: i64,
    ) -> BillingResult<bool> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        match state.snapshots.get(&snapshot.user_id) {
            Some(current) if current.version == expected_version => {
                let mut stored = snapshot.clone();
                stored.version = expected_version + 1;
                state.snapshots.insert(snapshot.user_id, stored);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{LedgerEntryType, LedgerStatus, TransactionKind};
    use serde_json::json;

    fn new_event(reference: &str) -> NewIngestedEvent {
        NewIngestedEvent {
            provider: ProviderKind::Stripe,
            provider_event_ref: reference.to_string(),
            event_type: "invoice.paid".to_string(),
            occurred_at: OffsetDateTime::now_utc(),
            raw_payload: json!({"id": reference}),
        }
    }

    #[tokio::test]
    async fn test_claim_event_is_idempotent() {
        let store = InMemoryBillingStore::new();
        let first = store.claim_event(new_event("evt_1"), 30).await.unwrap();
        assert!(matches!(first, ClaimOutcome::Claimed(_)));

        let second = store.claim_event(new_event("evt_1"), 30).await.unwrap();
        assert_eq!(second, ClaimOutcome::Duplicate(IngestStatus::Pending));
    }

    #[tokio::test]
    async fn test_same_ref_from_other_provider_is_distinct() {
        let store = InMemoryBillingStore::new();
        store.claim_event(new_event("evt_1"), 30).await.unwrap();
        let mut other = new_event("evt_1");
        other.provider = ProviderKind::AppStore;
        let outcome = store.claim_event(other, 30).await.unwrap();
        assert!(matches!(outcome, ClaimOutcome::Claimed(_)));
    }

    #[tokio::test]
    async fn test_stale_pending_claim_is_recovered() {
        let store = InMemoryBillingStore::new();
        let ClaimOutcome::Claimed(record) = store.claim_event(new_event("evt_2"), 30).await.unwrap()
        else {
            panic!("expected claim");
        };
        {
            let mut state = store.state.lock().await;
            state.events.get_mut(&record.id).unwrap().processing_started_at =
                OffsetDateTime::now_utc() - Duration::minutes(45);
        }
        let retry = store.claim_event(new_event("evt_2"), 30).await.unwrap();
        match retry {
            ClaimOutcome::Claimed(reclaimed) => assert_eq!(reclaimed.id, record.id),
            other => panic!("expected reclaim, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_release_allows_redelivery() {
        let store = InMemoryBillingStore::new();
        let ClaimOutcome::Claimed(record) = store.claim_event(new_event("evt_3"), 30).await.unwrap()
        else {
            panic!("expected claim");
        };
        store.release_event(record.id).await.unwrap();
        let again = store.claim_event(new_event("evt_3"), 30).await.unwrap();
        assert!(matches!(again, ClaimOutcome::Claimed(_)));
    }

    #[tokio::test]
    async fn test_subscription_cas_rejects_stale_version() {
        let store = InMemoryBillingStore::new();
        let record = SubscriptionRecord::new(Uuid::new_v4(), ProviderKind::Stripe);
        store.insert_subscription(&record).await.unwrap();

        let mut update = record.clone();
        update.is_trial = true;
        assert!(store.compare_and_swap_subscription(&update, 0).await.unwrap());
        assert!(!store.compare_and_swap_subscription(&update, 0).await.unwrap());

        let stored = store.find_subscription_by_user(record.user_id).await.unwrap().unwrap();
        assert_eq!(stored.version, 1);
        assert!(stored.is_trial);
    }

    #[tokio::test]
    async fn test_subscription_ref_is_unique_across_users() {
        let store = InMemoryBillingStore::new();
        let mut a = SubscriptionRecord::new(Uuid::new_v4(), ProviderKind::Stripe);
        a.provider_subscription_ref = Some("sub_1".into());
        store.insert_subscription(&a).await.unwrap();

        let mut b = SubscriptionRecord::new(Uuid::new_v4(), ProviderKind::Stripe);
        b.provider_subscription_ref = Some("sub_1".into());
        let err = store.insert_subscription(&b).await.unwrap_err();
        assert!(matches!(err, BillingError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_ledger_upsert_updates_status_only() {
        let store = InMemoryBillingStore::new();
        let now = OffsetDateTime::now_utc();
        let entry = LedgerEntry {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            provider: ProviderKind::Stripe,
            provider_invoice_ref: "in_1".into(),
            entry_type: LedgerEntryType::SubscriptionInvoice,
            amount_cents: 1999,
            currency: "usd".into(),
            status: LedgerStatus::Paid,
            provider_subscription_ref: None,
            period_start: None,
            period_end: None,
            description: None,
            hosted_invoice_url: None,
            invoice_pdf_url: None,
            created_at: now,
            updated_at: now,
        };
        assert!(store.upsert_ledger_entry(&entry).await.unwrap().inserted);

        let mut refund = entry.clone();
        refund.id = Uuid::new_v4();
        refund.amount_cents = 0;
        refund.status = LedgerStatus::Refunded;
        let upsert = store.upsert_ledger_entry(&refund).await.unwrap();
        assert!(!upsert.inserted);
        assert_eq!(upsert.entry.id, entry.id);
        assert_eq!(upsert.entry.amount_cents, 1999);
        assert_eq!(upsert.entry.status, LedgerStatus::Refunded);
    }

    #[tokio::test]
    async fn test_ledger_status_never_moves_backwards() {
        let store = InMemoryBillingStore::new();
        let now = OffsetDateTime::now_utc();
        let paid = LedgerEntry {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            provider: ProviderKind::Stripe,
            provider_invoice_ref: "in_late".into(),
            entry_type: LedgerEntryType::SubscriptionInvoice,
            amount_cents: 1999,
            currency: "usd".into(),
            status: LedgerStatus::Paid,
            provider_subscription_ref: None,
            period_start: None,
            period_end: None,
            description: None,
            hosted_invoice_url: None,
            invoice_pdf_url: None,
            created_at: now,
            updated_at: now,
        };
        store.upsert_ledger_entry(&paid).await.unwrap();

        for late in [LedgerStatus::Draft, LedgerStatus::Open] {
            let mut delayed = paid.clone();
            delayed.status = late;
            delayed.provider_subscription_ref = Some("sub_1".into());
            let upsert = store.upsert_ledger_entry(&delayed).await.unwrap();
            assert_eq!(upsert.entry.status, LedgerStatus::Paid);
            assert_eq!(upsert.entry.provider_subscription_ref.as_deref(), Some("sub_1"));
        }

        let mut refunded = paid.clone();
        refunded.status = LedgerStatus::Refunded;
        store.upsert_ledger_entry(&refunded).await.unwrap();
        let upsert = store.upsert_ledger_entry(&paid).await.unwrap();
        assert_eq!(upsert.entry.status, LedgerStatus::Refunded);

        let stored = store.find_ledger_entry("in_late").await.unwrap().unwrap();
        assert_eq!(stored.status, LedgerStatus::Refunded);
    }

    #[tokio::test]
    async fn test_consumable_revocation_claimed_once() {
        let store = InMemoryBillingStore::new();
        let tx = ProviderTransactionRecord::new(
            ProviderKind::Stripe,
            "pi_1",
            Uuid::new_v4(),
            "com.kindred.boost.5",
            TransactionKind::Consumable,
        );
        store.insert_transaction_if_absent(&tx).await.unwrap();

        assert!(store.claim_consumable_revocation(ProviderKind::Stripe, "pi_1").await.unwrap());
        assert!(!store.claim_consumable_revocation(ProviderKind::Stripe, "pi_1").await.unwrap());

        store
            .release_consumable_revocation(ProviderKind::Stripe, "pi_1")
            .await
            .unwrap();
        assert!(store.claim_consumable_revocation(ProviderKind::Stripe, "pi_1").await.unwrap());
        assert!(!store.claim_consumable_revocation(ProviderKind::Stripe, "pi_unknown").await.unwrap());
    }

    #[tokio::test]
    async fn test_transaction_insert_if_absent() {
        let store = InMemoryBillingStore::new();
        let user = Uuid::new_v4();
        let tx = ProviderTransactionRecord::new(
            ProviderKind::AppStore,
            "2000001",
            user,
            "com.kindred.boost.5",
            TransactionKind::Consumable,
        );
        assert!(matches!(
            store.insert_transaction_if_absent(&tx).await.unwrap(),
            TransactionInsert::Inserted(_)
        ));
        let mut replay = tx.clone();
        replay.user_id = Uuid::new_v4();
        match store.insert_transaction_if_absent(&replay).await.unwrap() {
            TransactionInsert::Existing(existing) => assert_eq!(existing.user_id, user),
            other => panic!("expected existing, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_outage_surfaces_database_error() {
        let store = InMemoryBillingStore::new();
        store.simulate_outage(true);
        let err = store.find_subscription_by_user(Uuid::new_v4()).await.unwrap_err();
        assert!(err.is_transient());
    }
}
