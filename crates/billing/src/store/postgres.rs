//! Postgres-backed [`BillingStore`]

use std::collections::BTreeSet;

use async_trait::async_trait;
use kindred_shared::{ProviderKind, Tier};
use sqlx::types::Json;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    BillingStore, ClaimOutcome, EntitlementSnapshot, IngestStatus, IngestedEventRecord,
    LedgerEntry, LedgerUpsert, NewIngestedEvent, ProviderTransactionRecord, SubscriptionRecord,
    TransactionInsert,
};
use crate::entitlement::Feature;
use crate::error::{BillingError, BillingResult};

const SUBSCRIPTION_COLUMNS: &str = r#"
    id, user_id, provider, tier, status, provider_customer_ref, provider_subscription_ref,
    provider_original_transaction_ref, plan_ref, current_period_start, current_period_end,
    cancel_at_period_end, cancelled_at, auto_renew, is_trial, state_event_at, period_event_at,
    version, created_at, updated_at
"#;

const EVENT_COLUMNS: &str = r#"
    id, provider, provider_event_ref, event_type, occurred_at, raw_payload, status,
    error_message, processing_started_at, processed_at, created_at
"#;

const LEDGER_COLUMNS: &str = r#"
    id, user_id, provider, provider_invoice_ref, entry_type, amount_cents, currency, status,
    provider_subscription_ref, period_start, period_end, description, hosted_invoice_url, invoice_pdf_url,
    created_at, updated_at
"#;

const TRANSACTION_COLUMNS: &str = r#"
    id, provider, transaction_ref, original_transaction_ref, user_id, product_ref, kind,
    refunded_at, consumables_revoked_at, created_at
"#;

/// SQL mirror of [`super::LedgerStatus::rank`]
fn ledger_rank_sql(column: &str) -> String {
    format!(
        "(CASE {} WHEN 'draft' THEN 0 WHEN 'open' THEN 1 WHEN 'uncollectible' THEN 2 \
         WHEN 'paid' THEN 3 WHEN 'void' THEN 3 WHEN 'refunded' THEN 4 ELSE 0 END)",
        column
    )
}

#[derive(sqlx::FromRow)]
struct EntitlementRow {
    user_id: Uuid,
    tier: Tier,
    boosts_remaining: i32,
    super_likes_remaining: i32,
    daily_likes_used: i32,
    daily_super_likes_used: i32,
    boosts_credited_through: Option<OffsetDateTime>,
    features: Json<BTreeSet<Feature>>,
    version: i64,
    updated_at: OffsetDateTime,
}

impl From<EntitlementRow> for EntitlementSnapshot {
    fn from(row: EntitlementRow) -> Self {
        Self {
            user_id: row.user_id,
            tier: row.tier,
            boosts_remaining: row.boosts_remaining,
            super_likes_remaining: row.super_likes_remaining,
            daily_likes_used: row.daily_likes_used,
            daily_super_likes_used: row.daily_super_likes_used,
            boosts_credited_through: row.boosts_credited_through,
            features: row.features.0,
            version: row.version,
            updated_at: row.updated_at,
        }
    }
}

/// Billing store over a shared Postgres pool
#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn find_subscription_where(
        &self,
        predicate: &str,
        value: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let query = format!(
            "SELECT {} FROM subscriptions WHERE {} = $1",
            SUBSCRIPTION_COLUMNS, predicate
        );
        let record = sqlx::query_as::<_, SubscriptionRecord>(&query)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn find_subscription_by_user(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let query = format!(
            "SELECT {} FROM subscriptions WHERE user_id = $1",
            SUBSCRIPTION_COLUMNS
        );
        let record = sqlx::query_as::<_, SubscriptionRecord>(&query)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    async fn find_subscription_by_customer_ref(
        &self,
        customer_ref: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        self.find_subscription_where("provider_customer_ref", customer_ref)
            .await
    }

    async fn find_subscription_by_original_transaction(
        &self,
        original_transaction_ref: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        self.find_subscription_where(
            "provider_original_transaction_ref",
            original_transaction_ref,
        )
        .await
    }

    async fn insert_subscription(&self, record: &SubscriptionRecord) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions (
                id, user_id, provider, tier, status, provider_customer_ref,
                provider_subscription_ref, provider_original_transaction_ref, plan_ref,
                current_period_start, current_period_end, cancel_at_period_end, cancelled_at,
                auto_renew, is_trial, state_event_at, period_event_at, version,
                created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18,
                NOW(), NOW()
            )
            "#,
        )
        .bind(record.id)
        .bind(record.user_id)
        .bind(record.provider)
        .bind(record.tier)
        .bind(record.status)
        .bind(&record.provider_customer_ref)
        .bind(&record.provider_subscription_ref)
        .bind(&record.provider_original_transaction_ref)
        .bind(&record.plan_ref)
        .bind(record.current_period_start)
        .bind(record.current_period_end)
        .bind(record.cancel_at_period_end)
        .bind(record.cancelled_at)
        .bind(record.auto_renew)
        .bind(record.is_trial)
        .bind(record.state_event_at)
        .bind(record.period_event_at)
        .bind(record.version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn compare_and_swap_subscription(
        &self,
        record: &SubscriptionRecord,
        expected_version: i64,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions SET
                provider = $3,
                tier = $4,
                status = $5,
                provider_customer_ref = $6,
                provider_subscription_ref = $7,
                provider_original_transaction_ref = $8,
                plan_ref = $9,
                current_period_start = $10,
                current_period_end = $11,
                cancel_at_period_end = $12,
                cancelled_at = $13,
                auto_renew = $14,
                is_trial = $15,
                state_event_at = $16,
                period_event_at = $17,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(record.id)
        .bind(expected_version)
        .bind(record.provider)
        .bind(record.tier)
        .bind(record.status)
        .bind(&record.provider_customer_ref)
        .bind(&record.provider_subscription_ref)
        .bind(&record.provider_original_transaction_ref)
        .bind(&record.plan_ref)
        .bind(record.current_period_start)
        .bind(record.current_period_end)
        .bind(record.cancel_at_period_end)
        .bind(record.cancelled_at)
        .bind(record.auto_renew)
        .bind(record.is_trial)
        .bind(record.state_event_at)
        .bind(record.period_event_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn claim_event(
        &self,
        event: NewIngestedEvent,
        stale_after_minutes: i32,
    ) -> BillingResult<ClaimOutcome> {
        // Only one delivery can win the insert. A pending claim older than the
        // timeout is taken over so a crashed handler cannot wedge the event.
        let query = format!(
            r#"
            INSERT INTO ingested_events
                (id, provider, provider_event_ref, event_type, occurred_at, raw_payload,
                 status, processing_started_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, 'pending', NOW(), NOW())
            ON CONFLICT (provider, provider_event_ref) DO UPDATE SET
                processing_started_at = NOW(),
                error_message = CONCAT('Recovered from stuck state at ', NOW()::TEXT)
            WHERE ingested_events.status = 'pending'
              AND ingested_events.processing_started_at < NOW() - ($7 || ' minutes')::INTERVAL
            RETURNING {}
            "#,
            EVENT_COLUMNS
        );

        let claimed = sqlx::query_as::<_, IngestedEventRecord>(&query)
            .bind(Uuid::new_v4())
            .bind(event.provider)
            .bind(&event.provider_event_ref)
            .bind(&event.event_type)
            .bind(event.occurred_at)
            .bind(&event.raw_payload)
            .bind(stale_after_minutes.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                tracing::error!(
                    event_ref = %event.provider_event_ref,
                    error = %e,
                    "Failed to claim ingested event for processing"
                );
                BillingError::from(e)
            })?;

        if let Some(record) = claimed {
            return Ok(ClaimOutcome::Claimed(record));
        }

        let existing: Option<(IngestStatus,)> = sqlx::query_as(
            "SELECT status FROM ingested_events WHERE provider = $1 AND provider_event_ref = $2",
        )
        .bind(event.provider)
        .bind(&event.provider_event_ref)
        .fetch_optional(&self.pool)
        .await?;

        // A row must exist when the insert lost; fall back to pending if it vanished
        Ok(ClaimOutcome::Duplicate(
            existing.map(|(s,)| s).unwrap_or(IngestStatus::Pending),
        ))
    }

    async fn complete_event(
        &self,
        id: Uuid,
        status: IngestStatus,
        error_message: Option<String>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE ingested_events
            SET status = $2, error_message = $3, processed_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn release_event(&self, id: Uuid) -> BillingResult<()> {
        sqlx::query("DELETE FROM ingested_events WHERE id = $1 AND status = 'pending'")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn restart_event(&self, id: Uuid, note: &str) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE ingested_events
            SET status = 'pending',
                processing_started_at = NOW(),
                processed_at = NULL,
                error_message = $2
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(note)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_event(&self, id: Uuid) -> BillingResult<Option<IngestedEventRecord>> {
        let query = format!("SELECT {} FROM ingested_events WHERE id = $1", EVENT_COLUMNS);
        let record = sqlx::query_as::<_, IngestedEventRecord>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    async fn list_events(
        &self,
        status: Option<IngestStatus>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<IngestedEventRecord>> {
        let query = format!(
            r#"
            SELECT {} FROM ingested_events
            WHERE ($1::VARCHAR IS NULL OR status = $1)
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
            EVENT_COLUMNS
        );
        let records = sqlx::query_as::<_, IngestedEventRecord>(&query)
            .bind(status)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;
        Ok(records)
    }

    async fn upsert_ledger_entry(&self, entry: &LedgerEntry) -> BillingResult<LedgerUpsert> {
        // xmax = 0 only for freshly inserted tuples
        let query = format!(
            r#"
            INSERT INTO billing_ledger_entries (
                id, user_id, provider, provider_invoice_ref, entry_type, amount_cents, currency,
                status, provider_subscription_ref, period_start, period_end, description,
                hosted_invoice_url, invoice_pdf_url, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, NOW(), NOW()
            )
            ON CONFLICT (provider_invoice_ref) DO UPDATE SET
                status = CASE WHEN {} > {}
                    THEN EXCLUDED.status ELSE billing_ledger_entries.status END,
                provider_subscription_ref = COALESCE(
                    billing_ledger_entries.provider_subscription_ref,
                    EXCLUDED.provider_subscription_ref
                ),
                updated_at = NOW()
            RETURNING {}, (xmax = 0) AS inserted
            "#,
            ledger_rank_sql("EXCLUDED.status"),
            ledger_rank_sql("billing_ledger_entries.status"),
            LEDGER_COLUMNS
        );

        let row = sqlx::query_as::<_, LedgerUpsertRow>(&query)
            .bind(entry.id)
            .bind(entry.user_id)
            .bind(entry.provider)
            .bind(&entry.provider_invoice_ref)
            .bind(entry.entry_type)
            .bind(entry.amount_cents)
            .bind(&entry.currency)
            .bind(entry.status)
            .bind(&entry.provider_subscription_ref)
            .bind(entry.period_start)
            .bind(entry.period_end)
            .bind(&entry.description)
            .bind(&entry.hosted_invoice_url)
            .bind(&entry.invoice_pdf_url)
            .fetch_one(&self.pool)
            .await?;

        Ok(LedgerUpsert {
            entry: row.entry,
            inserted: row.inserted,
        })
    }

    async fn find_ledger_entry(
        &self,
        provider_invoice_ref: &str,
    ) -> BillingResult<Option<LedgerEntry>> {
        let query = format!(
            "SELECT {} FROM billing_ledger_entries WHERE provider_invoice_ref = $1",
            LEDGER_COLUMNS
        );
        let entry = sqlx::query_as::<_, LedgerEntry>(&query)
            .bind(provider_invoice_ref)
            .fetch_optional(&self.pool)
            .await?;
        Ok(entry)
    }

    async fn list_ledger_entries(&self, user_id: Uuid) -> BillingResult<Vec<LedgerEntry>> {
        let query = format!(
            "SELECT {} FROM billing_ledger_entries WHERE user_id = $1 ORDER BY created_at DESC",
            LEDGER_COLUMNS
        );
        let entries = sqlx::query_as::<_, LedgerEntry>(&query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(entries)
    }

    async fn insert_transaction_if_absent(
        &self,
        record: &ProviderTransactionRecord,
    ) -> BillingResult<TransactionInsert> {
        let query = format!(
            r#"
            INSERT INTO provider_transactions (
                id, provider, transaction_ref, original_transaction_ref, user_id, product_ref,
                kind, refunded_at, consumables_revoked_at, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW())
            ON CONFLICT (provider, transaction_ref) DO NOTHING
            RETURNING {}
            "#,
            TRANSACTION_COLUMNS
        );

        let inserted = sqlx::query_as::<_, ProviderTransactionRecord>(&query)
            .bind(record.id)
            .bind(record.provider)
            .bind(&record.transaction_ref)
            .bind(&record.original_transaction_ref)
            .bind(record.user_id)
            .bind(&record.product_ref)
            .bind(record.kind)
            .bind(record.refunded_at)
            .bind(record.consumables_revoked_at)
            .fetch_optional(&self.pool)
            .await?;

        if let Some(row) = inserted {
            return Ok(TransactionInsert::Inserted(row));
        }

        let existing = self
            .find_transaction(record.provider, &record.transaction_ref)
            .await?
            .ok_or_else(|| {
                BillingError::Internal(format!(
                    "transaction {} conflicted but could not be read back",
                    record.transaction_ref
                ))
            })?;
        Ok(TransactionInsert::Existing(existing))
    }

    async fn find_transaction(
        &self,
        provider: ProviderKind,
        transaction_ref: &str,
    ) -> BillingResult<Option<ProviderTransactionRecord>> {
        let query = format!(
            "SELECT {} FROM provider_transactions WHERE provider = $1 AND transaction_ref = $2",
            TRANSACTION_COLUMNS
        );
        let record = sqlx::query_as::<_, ProviderTransactionRecord>(&query)
            .bind(provider)
            .bind(transaction_ref)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    async fn mark_transaction_refunded(
        &self,
        provider: ProviderKind,
        transaction_ref: &str,
        refunded_at: OffsetDateTime,
    ) -> BillingResult<Option<ProviderTransactionRecord>> {
        let query = format!(
            r#"
            UPDATE provider_transactions
            SET refunded_at = COALESCE(refunded_at, $3)
            WHERE provider = $1 AND transaction_ref = $2
            RETURNING {}
            "#,
            TRANSACTION_COLUMNS
        );
        let record = sqlx::query_as::<_, ProviderTransactionRecord>(&query)
            .bind(provider)
            .bind(transaction_ref)
            .bind(refunded_at)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    async fn claim_consumable_revocation(
        &self,
        provider: ProviderKind,
        transaction_ref: &str,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE provider_transactions
            SET consumables_revoked_at = NOW()
            WHERE provider = $1 AND transaction_ref = $2 AND consumables_revoked_at IS NULL
            "#,
        )
        .bind(provider)
        .bind(transaction_ref)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_consumable_revocation(
        &self,
        provider: ProviderKind,
        transaction_ref: &str,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE provider_transactions
            SET consumables_revoked_at = NULL
            WHERE provider = $1 AND transaction_ref = $2
            "#,
        )
        .bind(provider)
        .bind(transaction_ref)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_entitlement_snapshot(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Option<EntitlementSnapshot>> {
        let row: Option<EntitlementRow> = sqlx::query_as(
            r#"
            SELECT user_id, tier, boosts_remaining, super_likes_remaining, daily_likes_used,
                   daily_super_likes_used, boosts_credited_through, features, version, updated_at
            FROM entitlement_snapshots
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(EntitlementSnapshot::from))
    }

    async fn insert_entitlement_snapshot(
        &self,
        snapshot: &EntitlementSnapshot,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO entitlement_snapshots (
                user_id, tier, boosts_remaining, super_likes_remaining, daily_likes_used,
                daily_super_likes_used, boosts_credited_through, features, version, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW())
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(snapshot.user_id)
        .bind(snapshot.tier)
        .bind(snapshot.boosts_remaining)
        .bind(snapshot.super_likes_remaining)
        .bind(snapshot.daily_likes_used)
        .bind(snapshot.daily_super_likes_used)
        .bind(snapshot.boosts_credited_through)
        .bind(Json(&snapshot.features))
        .bind(snapshot.version)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn compare_and_swap_entitlement_snapshot(
        &self,
        snapshot: &EntitlementSnapshot,
        expected_version: i64,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE entitlement_snapshots SET
                tier = $3,
                boosts_remaining = $4,
                super_likes_remaining = $5,
                daily_likes_used = $6,
                daily_super_likes_used = $7,
                boosts_credited_through = $8,
                features = $9,
                version = version + 1,
                updated_at = NOW()
            WHERE user_id = $1 AND version = $2
            "#,
        )
        .bind(snapshot.user_id)
        .bind(expected_version)
        .bind(snapshot.tier)
        .bind(snapshot.boosts_remaining)
        .bind(snapshot.super_likes_remaining)
        .bind(snapshot.daily_likes_used)
        .bind(snapshot.daily_super_likes_used)
        .bind(snapshot.boosts_credited_through)
        .bind(Json(&snapshot.features))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[derive(sqlx::FromRow)]
struct LedgerUpsertRow {
    #[sqlx(flatten)]
    entry: LedgerEntry,
    inserted: bool,
}
