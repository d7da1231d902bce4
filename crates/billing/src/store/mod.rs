//! Durable state owned by the billing engine
//!
//! All five entities live behind [`BillingStore`]. Subscriptions and
//! entitlement snapshots are read-modify-write and guarded by an optimistic
//! `version` compare-and-swap. Ingested events, ledger entries and provider
//! transactions are keyed by natural provider identifiers and rely on
//! unique-key upserts instead.

mod memory;
mod postgres;

pub use memory::InMemoryBillingStore;
pub use postgres::PgBillingStore;

use std::collections::BTreeSet;

use async_trait::async_trait;
use kindred_shared::{ProviderKind, SubscriptionStatus, Tier};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::entitlement::Feature;
use crate::error::BillingResult;

// =============================================================================
// Subscription
// =============================================================================

/// Canonical subscription, one per user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct SubscriptionRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    /// Provider currently backing this subscription
    pub provider: ProviderKind,
    pub tier: Tier,
    pub status: SubscriptionStatus,
    pub provider_customer_ref: Option<String>,
    pub provider_subscription_ref: Option<String>,
    /// Mobile store id that stays stable across renewals
    pub provider_original_transaction_ref: Option<String>,
    pub plan_ref: Option<String>,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub cancelled_at: Option<OffsetDateTime>,
    pub auto_renew: bool,
    pub is_trial: bool,
    /// Timestamp of the newest event that set status/tier
    pub state_event_at: Option<OffsetDateTime>,
    /// Timestamp of the newest event that set the period window
    pub period_event_at: Option<OffsetDateTime>,
    pub version: i64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl SubscriptionRecord {
    /// Fresh `Pending` row at the lowest tier
    pub fn new(user_id: Uuid, provider: ProviderKind) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: Uuid::new_v4(),
            user_id,
            provider,
            tier: Tier::lowest(),
            status: SubscriptionStatus::Pending,
            provider_customer_ref: None,
            provider_subscription_ref: None,
            provider_original_transaction_ref: None,
            plan_ref: None,
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: false,
            cancelled_at: None,
            auto_renew: true,
            is_trial: false,
            state_event_at: None,
            period_event_at: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

// =============================================================================
// Ingested events
// =============================================================================

/// Processing state of an ingested provider notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum IngestStatus {
    Pending,
    Processed,
    Failed,
}

impl IngestStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            IngestStatus::Pending => "pending",
            IngestStatus::Processed => "processed",
            IngestStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for IngestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for IngestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(IngestStatus::Pending),
            "processed" => Ok(IngestStatus::Processed),
            "failed" => Ok(IngestStatus::Failed),
            _ => Err(format!("Invalid ingest status: {}", s)),
        }
    }
}

/// Stored provider notification, one per provider event id
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct IngestedEventRecord {
    pub id: Uuid,
    pub provider: ProviderKind,
    pub provider_event_ref: String,
    pub event_type: String,
    pub occurred_at: OffsetDateTime,
    pub raw_payload: serde_json::Value,
    pub status: IngestStatus,
    pub error_message: Option<String>,
    pub processing_started_at: OffsetDateTime,
    pub processed_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

/// Fields needed to claim a new event
#[derive(Debug, Clone)]
pub struct NewIngestedEvent {
    pub provider: ProviderKind,
    pub provider_event_ref: String,
    pub event_type: String,
    pub occurred_at: OffsetDateTime,
    pub raw_payload: serde_json::Value,
}

/// Result of trying to claim an event for processing
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// This caller owns processing of the event
    Claimed(IngestedEventRecord),
    /// Another delivery already claimed or finished it
    Duplicate(IngestStatus),
}

// =============================================================================
// Ledger
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum LedgerStatus {
    Draft,
    Open,
    Paid,
    Uncollectible,
    Void,
    Refunded,
}

impl LedgerStatus {
    /// Position in the invoice lifecycle. An entry only moves to a higher rank,
    /// so a delayed `Draft` or `Open` never overwrites a settled outcome.
    pub const fn rank(&self) -> u8 {
        match self {
            LedgerStatus::Draft => 0,
            LedgerStatus::Open => 1,
            LedgerStatus::Uncollectible => 2,
            LedgerStatus::Paid | LedgerStatus::Void => 3,
            LedgerStatus::Refunded => 4,
        }
    }

    /// Status after a report of `incoming` for an entry currently at `self`
    pub fn advance(self, incoming: LedgerStatus) -> LedgerStatus {
        if incoming.rank() > self.rank() {
            incoming
        } else {
            self
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LedgerEntryType {
    SubscriptionInvoice,
    OneTimePurchase,
}

/// Invoice or payment outcome, one per provider invoice id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub provider: ProviderKind,
    pub provider_invoice_ref: String,
    pub entry_type: LedgerEntryType,
    /// Minor units (cents)
    pub amount_cents: i64,
    /// Lower-case ISO 4217 code
    pub currency: String,
    pub status: LedgerStatus,
    /// Provider subscription the invoice billed, if any
    pub provider_subscription_ref: Option<String>,
    pub period_start: Option<OffsetDateTime>,
    pub period_end: Option<OffsetDateTime>,
    pub description: Option<String>,
    pub hosted_invoice_url: Option<String>,
    pub invoice_pdf_url: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Result of a ledger upsert
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerUpsert {
    pub entry: LedgerEntry,
    /// False when the invoice was already known
    pub inserted: bool,
}

// =============================================================================
// Provider transactions
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Subscription,
    Consumable,
}

/// Provider purchase id linked to the user who redeemed it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct ProviderTransactionRecord {
    pub id: Uuid,
    pub provider: ProviderKind,
    pub transaction_ref: String,
    pub original_transaction_ref: Option<String>,
    pub user_id: Uuid,
    pub product_ref: String,
    pub kind: TransactionKind,
    pub refunded_at: Option<OffsetDateTime>,
    /// Set while (or after) granted consumables are taken back for a refund
    pub consumables_revoked_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

impl ProviderTransactionRecord {
    pub fn new(
        provider: ProviderKind,
        transaction_ref: impl Into<String>,
        user_id: Uuid,
        product_ref: impl Into<String>,
        kind: TransactionKind,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            provider,
            transaction_ref: transaction_ref.into(),
            original_transaction_ref: None,
            user_id,
            product_ref: product_ref.into(),
            kind,
            refunded_at: None,
            consumables_revoked_at: None,
            created_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Result of recording a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionInsert {
    Inserted(ProviderTransactionRecord),
    /// The id was already recorded; the stored row is returned untouched
    Existing(ProviderTransactionRecord),
}

// =============================================================================
// Entitlement snapshot
// =============================================================================

/// Per-user consumable counters plus the cached feature set of the effective tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntitlementSnapshot {
    pub user_id: Uuid,
    pub tier: Tier,
    pub boosts_remaining: i32,
    pub super_likes_remaining: i32,
    pub daily_likes_used: i32,
    pub daily_super_likes_used: i32,
    /// End of the newest subscription period whose monthly boosts were granted
    pub boosts_credited_through: Option<OffsetDateTime>,
    pub features: BTreeSet<Feature>,
    pub version: i64,
    pub updated_at: OffsetDateTime,
}

impl EntitlementSnapshot {
    pub fn new(user_id: Uuid) -> Self {
        Self {
            user_id,
            tier: Tier::lowest(),
            boosts_remaining: 0,
            super_likes_remaining: 0,
            daily_likes_used: 0,
            daily_super_likes_used: 0,
            boosts_credited_through: None,
            features: crate::entitlement::enabled_features(Tier::lowest()),
            version: 0,
            updated_at: OffsetDateTime::now_utc(),
        }
    }
}

// =============================================================================
// Store trait
// =============================================================================

/// Persistence for the billing engine
#[async_trait]
pub trait BillingStore: Send + Sync {
    // Subscriptions
    async fn find_subscription_by_user(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Option<SubscriptionRecord>>;

    async fn find_subscription_by_customer_ref(
        &self,
        customer_ref: &str,
    ) -> BillingResult<Option<SubscriptionRecord>>;

    async fn find_subscription_by_original_transaction(
        &self,
        original_transaction_ref: &str,
    ) -> BillingResult<Option<SubscriptionRecord>>;

    /// Insert a new row. Fails with `AlreadyExists` if the user already has one.
    async fn insert_subscription(&self, record: &SubscriptionRecord) -> BillingResult<()>;

    /// Replace the row only if its stored version still equals `expected_version`
    async fn compare_and_swap_subscription(
        &self,
        record: &SubscriptionRecord,
        expected_version: i64,
    ) -> BillingResult<bool>;

    // Ingested events
    /// Idempotent insert keyed by (provider, provider_event_ref). A `Pending`
    /// claim older than `stale_after_minutes` is taken over.
    async fn claim_event(
        &self,
        event: NewIngestedEvent,
        stale_after_minutes: i32,
    ) -> BillingResult<ClaimOutcome>;

    async fn complete_event(
        &self,
        id: Uuid,
        status: IngestStatus,
        error_message: Option<String>,
    ) -> BillingResult<()>;

    /// Drop a `Pending` claim so the provider's redelivery is processed
    async fn release_event(&self, id: Uuid) -> BillingResult<()>;

    /// Move an event back to `Pending` for replay
    async fn restart_event(&self, id: Uuid, note: &str) -> BillingResult<bool>;

    async fn get_event(&self, id: Uuid) -> BillingResult<Option<IngestedEventRecord>>;

    async fn list_events(
        &self,
        status: Option<IngestStatus>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<IngestedEventRecord>>;

    // Ledger
    /// Insert if new. Otherwise the status only moves forward (see
    /// [`LedgerStatus::rank`]) and a missing subscription ref is filled in.
    async fn upsert_ledger_entry(&self, entry: &LedgerEntry) -> BillingResult<LedgerUpsert>;

    async fn find_ledger_entry(&self, provider_invoice_ref: &str)
        -> BillingResult<Option<LedgerEntry>>;

    async fn list_ledger_entries(&self, user_id: Uuid) -> BillingResult<Vec<LedgerEntry>>;

    // Provider transactions
    async fn insert_transaction_if_absent(
        &self,
        record: &ProviderTransactionRecord,
    ) -> BillingResult<TransactionInsert>;

    async fn find_transaction(
        &self,
        provider: ProviderKind,
        transaction_ref: &str,
    ) -> BillingResult<Option<ProviderTransactionRecord>>;

    async fn mark_transaction_refunded(
        &self,
        provider: ProviderKind,
        transaction_ref: &str,
        refunded_at: OffsetDateTime,
    ) -> BillingResult<Option<ProviderTransactionRecord>>;

    /// Set `consumables_revoked_at` if unset. True only for the caller that set
    /// it, which then owns taking the consumables back.
    async fn claim_consumable_revocation(
        &self,
        provider: ProviderKind,
        transaction_ref: &str,
    ) -> BillingResult<bool>;

    /// Clear a revocation claim whose revoke did not complete
    async fn release_consumable_revocation(
        &self,
        provider: ProviderKind,
        transaction_ref: &str,
    ) -> BillingResult<()>;

    // Entitlement snapshots
    async fn get_entitlement_snapshot(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Option<EntitlementSnapshot>>;

    /// Insert a fresh snapshot; returns false if one already exists
    async fn insert_entitlement_snapshot(&self, snapshot: &EntitlementSnapshot)
        -> BillingResult<bool>;

    async fn compare_and_swap_entitlement_snapshot(
        &self,
        snapshot: &EntitlementSnapshot,
        expected_version: i64,
    ) -> BillingResult<bool>;
}
