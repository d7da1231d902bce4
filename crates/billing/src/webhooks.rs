//! Provider notification handling
//!
//! Runs a verified, claimed notification through the reconciliation core and
//! decides how it is acknowledged:
//!
//! - authenticity failures are returned as errors and never acknowledged
//! - transient failures release the claim and are returned as errors so the
//!   provider redelivers
//! - everything else, including payloads that can never be processed, is
//!   acknowledged and the stored event records the outcome
//!
//! Stored events can be listed, replayed from their stored payload, or reset
//! by operators.

use std::sync::Arc;

use kindred_shared::ProviderKind;
use serde::Serialize;
use uuid::Uuid;

use crate::app_store;
use crate::error::{BillingError, BillingResult};
use crate::events::{EventKind, NormalizedEvent};
use crate::identity::IdentityLinker;
use crate::ingestion::{EventGateway, Ingested};
use crate::ledger::BillingLedger;
use crate::reconcile::{EventMeta, Reconciler};
use crate::store::{BillingStore, IngestStatus, IngestedEventRecord, TransactionKind};
use crate::stripe_events;
use crate::subscriptions::SubscriptionService;
use crate::usage::EntitlementService;
use crate::vocabulary::Vocabulary;

const DEFAULT_REPLAY_BATCH: i64 = 100;

/// What happened to an acknowledged notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    Processed,
    /// Seen before; nothing was done
    Duplicate,
    /// No local user for the provider identity; dropped
    OwnerNotFound,
    /// Event type with no effect on billing state
    Ignored,
    /// Processing failed for a reason a redelivery will not fix
    Failed,
}

/// Acknowledgement returned to the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookAck {
    pub received: bool,
    pub provider: ProviderKind,
    pub event_ref: String,
    pub outcome: WebhookOutcome,
}

impl WebhookAck {
    fn new(provider: ProviderKind, event_ref: impl Into<String>, outcome: WebhookOutcome) -> Self {
        Self {
            received: true,
            provider,
            event_ref: event_ref.into(),
            outcome,
        }
    }
}

/// Result of replaying a stored event
#[derive(Debug, Clone, Serialize)]
pub struct WebhookReplayResult {
    pub record_id: Uuid,
    pub provider: ProviderKind,
    pub event_ref: String,
    pub event_type: String,
    pub previous_status: IngestStatus,
    pub previous_error: Option<String>,
    pub new_status: IngestStatus,
    pub new_error: Option<String>,
    pub outcome: Option<WebhookOutcome>,
    pub success: bool,
}

/// Inbound notification pipeline for both providers
#[derive(Clone)]
pub struct WebhookHandler {
    store: Arc<dyn BillingStore>,
    gateway: EventGateway,
    reconciler: Reconciler,
    identity: IdentityLinker,
    ledger: BillingLedger,
    entitlements: EntitlementService,
    subscriptions: SubscriptionService,
    vocabulary: Arc<Vocabulary>,
}

impl WebhookHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn BillingStore>,
        gateway: EventGateway,
        reconciler: Reconciler,
        identity: IdentityLinker,
        ledger: BillingLedger,
        entitlements: EntitlementService,
        subscriptions: SubscriptionService,
        vocabulary: Arc<Vocabulary>,
    ) -> Self {
        Self {
            store,
            gateway,
            reconciler,
            identity,
            ledger,
            entitlements,
            subscriptions,
            vocabulary,
        }
    }

    /// Verify, claim and process one notification.
    ///
    /// `Ok` means the provider should consider the notification delivered.
    /// `Err` is either an authenticity failure (client error) or a transient
    /// failure the provider should retry.
    pub async fn handle(
        &self,
        provider: ProviderKind,
        body: &str,
        signature: Option<&str>,
    ) -> BillingResult<WebhookAck> {
        let (event, record) = match self.gateway.ingest(provider, body, signature).await? {
            Ingested::Duplicate {
                provider,
                event_ref,
                ..
            } => return Ok(WebhookAck::new(provider, event_ref, WebhookOutcome::Duplicate)),
            Ingested::New { event, record } => (event, record),
        };

        let outcome = self.run(&record).await?;
        Ok(WebhookAck::new(event.provider, event.event_ref, outcome))
    }

    /// Process a claimed record and store its final status
    async fn run(&self, record: &IngestedEventRecord) -> BillingResult<WebhookOutcome> {
        match self.process(record.provider, &record.raw_payload).await {
            Ok(outcome) => {
                self.finish(record, IngestStatus::Processed, None).await;
                Ok(outcome)
            }
            Err(e) if e.is_transient() => {
                tracing::error!(
                    provider = %record.provider,
                    event_ref = %record.provider_event_ref,
                    error = %e,
                    "Transient failure processing event, releasing claim for redelivery"
                );
                if let Err(release_err) = self.store.release_event(record.id).await {
                    // The claim goes stale and is re-claimed on a later delivery
                    tracing::error!(
                        record_id = %record.id,
                        error = %release_err,
                        "Failed to release event claim"
                    );
                }
                Err(e)
            }
            Err(e) => {
                tracing::warn!(
                    provider = %record.provider,
                    event_ref = %record.provider_event_ref,
                    event_type = %record.event_type,
                    error = %e,
                    "Event processing failed, acknowledging without retry"
                );
                self.finish(record, IngestStatus::Failed, Some(e.to_string()))
                    .await;
                Ok(WebhookOutcome::Failed)
            }
        }
    }

    /// Store the final status, retrying once
    async fn finish(
        &self,
        record: &IngestedEventRecord,
        status: IngestStatus,
        error_message: Option<String>,
    ) {
        let first = self
            .store
            .complete_event(record.id, status, error_message.clone())
            .await;
        let Err(e) = first else {
            return;
        };

        tracing::warn!(
            record_id = %record.id,
            error = %e,
            "First attempt to complete event failed, retrying"
        );
        if let Err(retry_err) = self
            .store
            .complete_event(record.id, status, error_message.clone())
            .await
        {
            tracing::error!(
                record_id = %record.id,
                provider = %record.provider,
                event_ref = %record.provider_event_ref,
                status = %status,
                error_message = ?error_message,
                first_error = %e,
                retry_error = %retry_err,
                "Failed to complete event after retry; it stays pending until the claim goes stale"
            );
        }
    }

    async fn process(
        &self,
        provider: ProviderKind,
        payload: &serde_json::Value,
    ) -> BillingResult<WebhookOutcome> {
        let event = match provider {
            ProviderKind::Stripe => stripe_events::normalize(payload, &self.vocabulary)?,
            ProviderKind::AppStore => app_store::normalize(payload, &self.vocabulary)?,
        };

        if let EventKind::Unhandled { event_type } = &event.kind {
            tracing::debug!(
                provider = %provider,
                event_ref = %event.provider_event_ref,
                event_type = %event_type,
                "Unhandled event type"
            );
            return Ok(WebhookOutcome::Ignored);
        }

        let Some(user_id) = self.resolve_owner(&event).await? else {
            tracing::warn!(
                provider = %provider,
                event_ref = %event.provider_event_ref,
                event_type = %event.event_type,
                owner = ?event.owner,
                "No local user for event owner, dropping"
            );
            return Ok(WebhookOutcome::OwnerNotFound);
        };

        match self.apply(user_id, &event).await {
            Err(BillingError::NoSubscription(_)) => {
                tracing::warn!(
                    user_id = %user_id,
                    event_ref = %event.provider_event_ref,
                    "Owner has no subscription record, dropping"
                );
                Ok(WebhookOutcome::OwnerNotFound)
            }
            other => other,
        }
    }

    async fn resolve_owner(&self, event: &NormalizedEvent) -> BillingResult<Option<Uuid>> {
        if let Some(user_id) = self.identity.resolve(&event.owner).await? {
            return Ok(Some(user_id));
        }
        // Refunds of one-time purchases are traced through the transaction
        if let EventKind::Refunded { transaction_ref, .. } = &event.kind {
            return Ok(self
                .store
                .find_transaction(event.provider, transaction_ref)
                .await?
                .map(|tx| tx.user_id));
        }
        Ok(None)
    }

    async fn apply(&self, user_id: Uuid, event: &NormalizedEvent) -> BillingResult<WebhookOutcome> {
        match &event.kind {
            EventKind::Refunded { transaction_ref, .. } => {
                self.refund_transaction(user_id, event, transaction_ref).await?;
            }
            EventKind::PartialRefund {
                transaction_ref,
                amount_refunded,
            } => {
                tracing::info!(
                    user_id = %user_id,
                    transaction_ref = %transaction_ref,
                    amount_refunded = amount_refunded,
                    "Partial refund recorded without entitlement change"
                );
            }
            EventKind::ConsumablePurchased {
                transaction_ref,
                product_ref,
                ..
            } => {
                match self
                    .subscriptions
                    .record_consumable_purchase(user_id, event.provider, transaction_ref, product_ref)
                    .await
                {
                    Ok(redemption) => {
                        tracing::info!(
                            user_id = %user_id,
                            transaction_ref = %transaction_ref,
                            redemption = ?redemption,
                            "Consumable purchase reconciled"
                        );
                    }
                    Err(BillingError::ReceiptAlreadyUsed(_)) => {
                        tracing::warn!(
                            user_id = %user_id,
                            transaction_ref = %transaction_ref,
                            "Consumable transaction belongs to another user, not credited"
                        );
                    }
                    Err(e) => return Err(e),
                }
            }
            _ => {}
        }

        let subscription_ref = self.linked_subscription(event).await?;
        let delta = match event.kind.transition() {
            Some(transition) => {
                let meta =
                    EventMeta::provider(event.provider, event.occurred_at, subscription_ref.clone());
                Some(self.reconciler.apply(user_id, &transition, &meta).await?)
            }
            None => None,
        };

        if let Some(outcome) = &event.invoice {
            let mut outcome = outcome.clone();
            if outcome.subscription_ref.is_none() {
                outcome.subscription_ref = subscription_ref;
            }
            self.ledger
                .record_outcome(user_id, event.provider, &outcome)
                .await?;
        }

        match &delta {
            Some(delta) => {
                self.entitlements.sync_subscription(delta).await?;
            }
            None => {
                self.entitlements.recompute(user_id).await?;
            }
        }

        tracing::info!(
            user_id = %user_id,
            provider = %event.provider,
            event_ref = %event.provider_event_ref,
            kind = event.kind.name(),
            changed = delta.as_ref().is_some_and(|d| d.applied),
            "Event processed"
        );
        Ok(WebhookOutcome::Processed)
    }

    /// Subscription the event is about. A refund names only its invoice, so
    /// the subscription is taken from the ledger entry that invoice created.
    async fn linked_subscription(&self, event: &NormalizedEvent) -> BillingResult<Option<String>> {
        if event.subscription_ref.is_some() {
            return Ok(event.subscription_ref.clone());
        }
        let EventKind::Refunded {
            affects_subscription: true,
            ..
        } = &event.kind
        else {
            return Ok(None);
        };
        let Some(outcome) = &event.invoice else {
            return Ok(None);
        };

        let linked = self
            .store
            .find_ledger_entry(&outcome.invoice_ref)
            .await?
            .and_then(|entry| entry.provider_subscription_ref);
        if linked.is_none() {
            tracing::warn!(
                event_ref = %event.provider_event_ref,
                invoice_ref = %outcome.invoice_ref,
                "Refunded invoice has no known subscription, applying to the one on file"
            );
        }
        Ok(linked)
    }

    /// Mark the purchase refunded and take back consumables, once
    async fn refund_transaction(
        &self,
        user_id: Uuid,
        event: &NormalizedEvent,
        transaction_ref: &str,
    ) -> BillingResult<()> {
        let Some(record) = self
            .store
            .mark_transaction_refunded(event.provider, transaction_ref, event.occurred_at)
            .await?
        else {
            tracing::debug!(
                user_id = %user_id,
                transaction_ref = %transaction_ref,
                "Refund for a transaction that was never recorded locally"
            );
            return Ok(());
        };

        if record.kind != TransactionKind::Consumable {
            return Ok(());
        }
        let Some(grant) = self.vocabulary.consumable(&record.product_ref) else {
            tracing::warn!(
                transaction_ref = %transaction_ref,
                product_ref = %record.product_ref,
                "Refunded consumable is no longer in the catalog"
            );
            return Ok(());
        };

        // The claim is held only by the delivery that takes the consumables back
        if !self
            .store
            .claim_consumable_revocation(event.provider, transaction_ref)
            .await?
        {
            tracing::debug!(
                transaction_ref = %transaction_ref,
                "Refunded consumables already revoked"
            );
            return Ok(());
        }

        if let Err(e) = self.entitlements.revoke_consumable(record.user_id, grant).await {
            if let Err(release_err) = self
                .store
                .release_consumable_revocation(event.provider, transaction_ref)
                .await
            {
                tracing::error!(
                    transaction_ref = %transaction_ref,
                    error = %release_err,
                    "Failed to release consumable revocation claim"
                );
            }
            return Err(e);
        }
        Ok(())
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Failed events, oldest first
    pub async fn list_failed_events(
        &self,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<IngestedEventRecord>> {
        self.store
            .list_events(Some(IngestStatus::Failed), limit, offset)
            .await
    }

    pub async fn list_events(
        &self,
        status: Option<IngestStatus>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<IngestedEventRecord>> {
        self.store.list_events(status, limit, offset).await
    }

    /// Re-run processing of a stored event against its stored payload
    pub async fn replay_event(&self, record_id: Uuid) -> BillingResult<WebhookReplayResult> {
        let record = self
            .store
            .get_event(record_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Event {} not found", record_id)))?;

        tracing::info!(
            record_id = %record_id,
            provider = %record.provider,
            event_ref = %record.provider_event_ref,
            previous_status = %record.status,
            "Replaying stored event"
        );

        let note = format!(
            "Replay initiated. Previous status: {}. Previous error: {}",
            record.status,
            record.error_message.as_deref().unwrap_or("none")
        );
        if !self.store.restart_event(record_id, &note).await? {
            return Err(BillingError::NotFound(format!("Event {} not found", record_id)));
        }

        let result = self.run(&record).await;
        let stored = self.store.get_event(record_id).await?;
        let (new_status, new_error) = match (&result, stored) {
            (_, Some(stored)) => (stored.status, stored.error_message),
            // Released after a transient failure
            (Err(e), None) => (IngestStatus::Pending, Some(e.to_string())),
            (Ok(_), None) => (IngestStatus::Processed, None),
        };

        let outcome = result.as_ref().ok().copied();
        let success = matches!(
            outcome,
            Some(
                WebhookOutcome::Processed
                    | WebhookOutcome::OwnerNotFound
                    | WebhookOutcome::Ignored
            )
        );

        tracing::info!(
            record_id = %record_id,
            previous_status = %record.status,
            new_status = %new_status,
            success = success,
            "Event replay completed"
        );

        Ok(WebhookReplayResult {
            record_id,
            provider: record.provider,
            event_ref: record.provider_event_ref,
            event_type: record.event_type,
            previous_status: record.status,
            previous_error: record.error_message,
            new_status,
            new_error,
            outcome,
            success,
        })
    }

    /// Replay failed events, oldest first
    pub async fn replay_all_failed(
        &self,
        max_events: Option<i64>,
    ) -> BillingResult<Vec<WebhookReplayResult>> {
        let limit = max_events.unwrap_or(DEFAULT_REPLAY_BATCH);
        let failed = self.list_failed_events(limit, 0).await?;

        let mut results = Vec::with_capacity(failed.len());
        for record in failed {
            match self.replay_event(record.id).await {
                Ok(result) => results.push(result),
                Err(e) => {
                    tracing::error!(
                        record_id = %record.id,
                        error = %e,
                        "Failed to replay event"
                    );
                    results.push(WebhookReplayResult {
                        record_id: record.id,
                        provider: record.provider,
                        event_ref: record.provider_event_ref,
                        event_type: record.event_type,
                        previous_status: record.status,
                        previous_error: record.error_message,
                        new_status: record.status,
                        new_error: Some(e.to_string()),
                        outcome: None,
                        success: false,
                    });
                }
            }
        }

        Ok(results)
    }

    /// Forget a pending or failed event so the provider's next delivery of
    /// it is processed from scratch
    pub async fn reset_stuck_event(&self, record_id: Uuid) -> BillingResult<()> {
        let record = self.store.get_event(record_id).await?;
        let resettable = record
            .as_ref()
            .is_some_and(|r| matches!(r.status, IngestStatus::Pending | IngestStatus::Failed));
        if !resettable {
            return Err(BillingError::NotFound(format!(
                "Event {} not found or not in resettable state",
                record_id
            )));
        }

        self.store
            .restart_event(record_id, "Reset for redelivery")
            .await?;
        self.store.release_event(record_id).await?;

        tracing::info!(record_id = %record_id, "Event reset for redelivery");
        Ok(())
    }
}
