//! User-initiated subscription management
//!
//! Every change is made at the provider first and then applied locally as the
//! same [`Transition`] a provider notification would produce, so a user
//! cancelling and the provider reporting the cancellation end in one state.

use std::sync::Arc;
use std::time::Duration;

use kindred_shared::{ProviderKind, Tier};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::app_store::{self, TransactionInfo};
use crate::client::{BillingInterval, StripeConfig};
use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult};
use crate::events::SubscriptionSnapshot;
use crate::identity::IdentityLinker;
use crate::ingestion::AppStoreSignatureVerifier;
use crate::provider::{with_timeout, AppStoreApi, ProviderSubscription, WebBillingProvider};
use crate::reconcile::{EventMeta, Reconciler, SubscriptionDelta, Transition};
use crate::store::{
    BillingStore, ProviderTransactionRecord, SubscriptionRecord, TransactionInsert,
    TransactionKind,
};
use crate::usage::{EntitlementService, UsageSummary};
use crate::vocabulary::Vocabulary;

/// How a cancellation takes effect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelMode {
    /// Keep access until the paid period ends, then stop renewing
    #[default]
    AtPeriodEnd,
    /// End access now and drop to the lowest tier
    Immediately,
}

/// Outcome of redeeming a consumable purchase
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ConsumableRedemption {
    Credited { usage: UsageSummary },
    /// The transaction was redeemed before; balances are unchanged
    AlreadyRedeemed { usage: UsageSummary },
}

/// Outcome of verifying an App Store transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AppStorePurchase {
    Subscription { subscription: SubscriptionRecord },
    Consumable { redemption: ConsumableRedemption },
}

/// Subscription operations called from the API layer
#[derive(Clone)]
pub struct SubscriptionService {
    store: Arc<dyn BillingStore>,
    reconciler: Reconciler,
    identity: IdentityLinker,
    entitlements: EntitlementService,
    web: Arc<dyn WebBillingProvider>,
    app_store: Option<Arc<dyn AppStoreApi>>,
    app_store_verifier: Option<AppStoreSignatureVerifier>,
    prices: StripeConfig,
    bundle_id: Option<String>,
    vocabulary: Arc<Vocabulary>,
    timeout: Duration,
}

impl SubscriptionService {
    pub fn new(
        config: &BillingConfig,
        store: Arc<dyn BillingStore>,
        entitlements: EntitlementService,
        web: Arc<dyn WebBillingProvider>,
        app_store: Option<Arc<dyn AppStoreApi>>,
        app_store_verifier: Option<AppStoreSignatureVerifier>,
    ) -> Self {
        let reconciler = Reconciler::new(store.clone());
        Self {
            identity: IdentityLinker::new(store.clone(), reconciler.clone()),
            reconciler,
            store,
            entitlements,
            web,
            app_store,
            app_store_verifier,
            prices: config.stripe.clone(),
            bundle_id: config.app_store.bundle_id.clone(),
            vocabulary: Arc::new(config.vocabulary()),
            timeout: config.provider_timeout,
        }
    }

    pub async fn get_subscription(&self, user_id: Uuid) -> BillingResult<Option<SubscriptionRecord>> {
        self.store.find_subscription_by_user(user_id).await
    }

    /// Create the user's Stripe customer, or return the existing link
    pub async fn create_customer(
        &self,
        user_id: Uuid,
        email: &str,
    ) -> BillingResult<SubscriptionRecord> {
        if !email.contains('@') {
            return Err(BillingError::InvalidInput(format!("Invalid email: {}", email)));
        }

        let record = self
            .reconciler
            .ensure_subscription(user_id, ProviderKind::Stripe)
            .await?;
        if record.provider_customer_ref.is_some() {
            tracing::debug!(user_id = %user_id, "Customer already exists");
            return Ok(record);
        }

        let customer_ref = with_timeout(
            self.timeout,
            "web.create_customer",
            self.web.create_customer(user_id, email),
        )
        .await?;
        let delta = self.identity.link_customer(user_id, &customer_ref).await?;
        self.entitlements.recompute(user_id).await?;
        Ok(delta.record)
    }

    /// Subscribe the user's customer to the tier's price
    pub async fn create_subscription(
        &self,
        user_id: Uuid,
        tier: Tier,
        interval: BillingInterval,
    ) -> BillingResult<SubscriptionDelta> {
        let price_ref = self
            .prices
            .price_id_for_tier(tier, interval)
            .ok_or_else(|| {
                BillingError::InvalidPlan(format!("No {:?} price for {} tier", interval, tier))
            })?
            .to_string();

        let current = self.require_subscription(user_id).await?;
        let customer_ref = require_customer(&current)?;
        if current.status.is_live() && current.provider_subscription_ref.is_some() {
            return Err(BillingError::AlreadyExists(format!(
                "User {} already has a {} subscription",
                user_id, current.status
            )));
        }

        let subscription = with_timeout(
            self.timeout,
            "web.create_subscription",
            self.web.create_subscription(customer_ref, &price_ref),
        )
        .await?;

        tracing::info!(
            user_id = %user_id,
            tier = %tier,
            subscription_id = %subscription.subscription_ref,
            "Subscription created"
        );

        let snapshot = self.web_snapshot(&subscription);
        self.apply_local(user_id, Transition::Created(snapshot)).await
    }

    /// Move the web subscription to another sold price
    pub async fn change_plan(&self, user_id: Uuid, plan_ref: &str) -> BillingResult<SubscriptionDelta> {
        let tier = self
            .vocabulary
            .known_price_tier(plan_ref)
            .ok_or_else(|| BillingError::InvalidPlan(plan_ref.to_string()))?;

        let current = self.require_live(user_id).await?;
        let subscription_ref = require_web_subscription(&current)?;
        if current.plan_ref.as_deref() == Some(plan_ref) {
            return Err(BillingError::InvalidInput(format!(
                "Already subscribed to {}",
                plan_ref
            )));
        }

        let updated = with_timeout(
            self.timeout,
            "web.change_plan",
            self.web.change_plan(subscription_ref, plan_ref),
        )
        .await?;

        tracing::info!(
            user_id = %user_id,
            from_tier = %current.tier,
            to_tier = %tier,
            "Plan changed"
        );

        let snapshot = self.web_snapshot(&updated);
        self.apply_local(user_id, Transition::Updated(snapshot)).await
    }

    pub async fn cancel(&self, user_id: Uuid, mode: CancelMode) -> BillingResult<SubscriptionDelta> {
        let current = self.require_live(user_id).await?;
        let subscription_ref = require_web_subscription(&current)?;

        let transition = match mode {
            CancelMode::AtPeriodEnd => {
                with_timeout(
                    self.timeout,
                    "web.set_cancel_at_period_end",
                    self.web.set_cancel_at_period_end(subscription_ref, true),
                )
                .await?;
                Transition::CancelAtPeriodEnd
            }
            CancelMode::Immediately => {
                with_timeout(
                    self.timeout,
                    "web.cancel_now",
                    self.web.cancel_now(subscription_ref),
                )
                .await?;
                Transition::Cancel
            }
        };

        tracing::info!(user_id = %user_id, mode = ?mode, "Subscription cancellation requested");
        self.apply_local(user_id, transition).await
    }

    /// Undo a pending cancel-at-period-end before the period ends
    pub async fn reactivate(&self, user_id: Uuid) -> BillingResult<SubscriptionDelta> {
        let current = self.require_live(user_id).await?;
        let subscription_ref = require_web_subscription(&current)?;

        if !current.cancel_at_period_end {
            return Err(BillingError::InvalidInput(
                "Subscription is not scheduled to cancel".to_string(),
            ));
        }
        let period_running = current
            .current_period_end
            .is_some_and(|end| end > OffsetDateTime::now_utc());
        if !period_running {
            return Err(BillingError::InvalidInput(
                "The billing period has already ended".to_string(),
            ));
        }

        with_timeout(
            self.timeout,
            "web.set_cancel_at_period_end",
            self.web.set_cancel_at_period_end(subscription_ref, false),
        )
        .await?;

        tracing::info!(user_id = %user_id, "Subscription reactivated");
        self.apply_local(user_id, Transition::Reactivate).await
    }

    // =========================================================================
    // Payment methods
    // =========================================================================

    pub async fn attach_payment_method(
        &self,
        user_id: Uuid,
        payment_method_ref: &str,
    ) -> BillingResult<()> {
        let record = self.require_subscription(user_id).await?;
        let customer_ref = require_customer(&record)?;

        match self.payment_method_owner(payment_method_ref).await? {
            Some(owner) if owner == customer_ref => return Ok(()),
            Some(_) => {
                return Err(BillingError::PaymentMethodNotOwned(
                    payment_method_ref.to_string(),
                ))
            }
            None => {}
        }

        with_timeout(
            self.timeout,
            "web.attach_payment_method",
            self.web.attach_payment_method(customer_ref, payment_method_ref),
        )
        .await?;
        tracing::info!(user_id = %user_id, payment_method_id = %payment_method_ref, "Payment method attached");
        Ok(())
    }

    pub async fn detach_payment_method(
        &self,
        user_id: Uuid,
        payment_method_ref: &str,
    ) -> BillingResult<()> {
        let record = self.require_subscription(user_id).await?;
        self.require_owned(&record, payment_method_ref).await?;

        with_timeout(
            self.timeout,
            "web.detach_payment_method",
            self.web.detach_payment_method(payment_method_ref),
        )
        .await?;
        tracing::info!(user_id = %user_id, payment_method_id = %payment_method_ref, "Payment method detached");
        Ok(())
    }

    pub async fn set_default_payment_method(
        &self,
        user_id: Uuid,
        payment_method_ref: &str,
    ) -> BillingResult<()> {
        let record = self.require_subscription(user_id).await?;
        let customer_ref = self.require_owned(&record, payment_method_ref).await?;

        with_timeout(
            self.timeout,
            "web.set_default_payment_method",
            self.web.set_default_payment_method(customer_ref, payment_method_ref),
        )
        .await
    }

    // =========================================================================
    // Consumables and receipts
    // =========================================================================

    /// Credit a consumable purchase once per provider transaction id
    pub async fn record_consumable_purchase(
        &self,
        user_id: Uuid,
        provider: ProviderKind,
        transaction_ref: &str,
        product_ref: &str,
    ) -> BillingResult<ConsumableRedemption> {
        if transaction_ref.trim().is_empty() {
            return Err(BillingError::InvalidInput("Missing transaction id".to_string()));
        }
        let grant = self.vocabulary.consumable(product_ref).ok_or_else(|| {
            BillingError::InvalidPlan(format!("{} is not a consumable product", product_ref))
        })?;

        let record = ProviderTransactionRecord::new(
            provider,
            transaction_ref,
            user_id,
            product_ref,
            TransactionKind::Consumable,
        );

        match self.store.insert_transaction_if_absent(&record).await? {
            TransactionInsert::Inserted(_) => {
                let usage = self.entitlements.credit_consumable(user_id, grant).await?;
                Ok(ConsumableRedemption::Credited { usage })
            }
            TransactionInsert::Existing(existing) if existing.user_id != user_id => {
                tracing::warn!(
                    user_id = %user_id,
                    owner_id = %existing.user_id,
                    transaction_ref = %transaction_ref,
                    "Consumable transaction replayed by another user"
                );
                Err(BillingError::ReceiptAlreadyUsed(transaction_ref.to_string()))
            }
            TransactionInsert::Existing(_) => {
                let usage = self.entitlements.get_entitlements(user_id).await?.usage;
                Ok(ConsumableRedemption::AlreadyRedeemed { usage })
            }
        }
    }

    /// Verify an App Store transaction through the Server API and apply it
    pub async fn verify_app_store_purchase(
        &self,
        user_id: Uuid,
        transaction_id: &str,
    ) -> BillingResult<AppStorePurchase> {
        let api = self.app_store.as_ref().ok_or_else(|| {
            BillingError::Config("App Store Server API is not configured".to_string())
        })?;
        let verifier = self.app_store_verifier.as_ref().ok_or_else(|| {
            BillingError::Config("App Store signing key is not configured".to_string())
        })?;

        let signed = with_timeout(
            self.timeout,
            "app_store.fetch_transaction",
            api.fetch_transaction(transaction_id),
        )
        .await?;
        let info: TransactionInfo = serde_json::from_value(verifier.decode_jws(&signed)?)
            .map_err(|e| BillingError::MalformedPayload(format!("Signed transaction: {}", e)))?;

        if let (Some(expected), Some(actual)) = (self.bundle_id.as_deref(), info.bundle_id.as_deref()) {
            if expected != actual {
                return Err(BillingError::InvalidInput(format!(
                    "Transaction belongs to bundle {}",
                    actual
                )));
            }
        }
        if info.revocation_date.is_some() {
            return Err(BillingError::InvalidInput(format!(
                "Transaction {} was refunded",
                info.transaction_id
            )));
        }

        if !info.is_subscription() {
            let redemption = self
                .record_consumable_purchase(
                    user_id,
                    ProviderKind::AppStore,
                    &info.transaction_id,
                    &info.product_id,
                )
                .await?;
            return Ok(AppStorePurchase::Consumable { redemption });
        }

        if let Some(existing) = self
            .store
            .find_transaction(ProviderKind::AppStore, &info.transaction_id)
            .await?
        {
            if existing.user_id != user_id {
                return Err(BillingError::ReceiptAlreadyUsed(info.transaction_id));
            }
        }

        self.reconciler
            .ensure_subscription(user_id, ProviderKind::AppStore)
            .await?;
        self.identity
            .link_original_transaction(user_id, &info.original_transaction_id)
            .await?;

        // Verification reports the state as of now
        let now = OffsetDateTime::now_utc();
        let snapshot = app_store::transaction_snapshot(&info, None, None, now, &self.vocabulary)?;
        let meta = EventMeta::provider(
            ProviderKind::AppStore,
            now,
            Some(info.original_transaction_id.clone()),
        );
        let delta = self
            .reconciler
            .apply(user_id, &Transition::Created(snapshot), &meta)
            .await?;

        let mut transaction = ProviderTransactionRecord::new(
            ProviderKind::AppStore,
            &info.transaction_id,
            user_id,
            &info.product_id,
            TransactionKind::Subscription,
        );
        transaction.original_transaction_ref = Some(info.original_transaction_id.clone());
        self.store.insert_transaction_if_absent(&transaction).await?;

        self.entitlements.sync_subscription(&delta).await?;

        tracing::info!(
            user_id = %user_id,
            original_transaction_id = %info.original_transaction_id,
            tier = %delta.tier,
            status = %delta.status,
            "App Store purchase verified"
        );
        Ok(AppStorePurchase::Subscription {
            subscription: delta.record,
        })
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn apply_local(
        &self,
        user_id: Uuid,
        transition: Transition,
    ) -> BillingResult<SubscriptionDelta> {
        let delta = self
            .reconciler
            .apply(user_id, &transition, &EventMeta::local())
            .await?;
        self.entitlements.sync_subscription(&delta).await?;
        Ok(delta)
    }

    async fn require_subscription(&self, user_id: Uuid) -> BillingResult<SubscriptionRecord> {
        self.store
            .find_subscription_by_user(user_id)
            .await?
            .ok_or_else(|| BillingError::NoSubscription(format!("No billing record for user {}", user_id)))
    }

    async fn require_live(&self, user_id: Uuid) -> BillingResult<SubscriptionRecord> {
        let record = self.require_subscription(user_id).await?;
        if !record.status.is_live() {
            return Err(BillingError::NoSubscription(format!(
                "Subscription for user {} is {}",
                user_id, record.status
            )));
        }
        Ok(record)
    }

    async fn payment_method_owner(&self, payment_method_ref: &str) -> BillingResult<Option<String>> {
        with_timeout(
            self.timeout,
            "web.payment_method_owner",
            self.web.payment_method_owner(payment_method_ref),
        )
        .await
    }

    /// Customer ref of `record`, provided it owns the payment method
    async fn require_owned<'a>(
        &self,
        record: &'a SubscriptionRecord,
        payment_method_ref: &str,
    ) -> BillingResult<&'a str> {
        let customer_ref = require_customer(record)?;
        match self.payment_method_owner(payment_method_ref).await? {
            Some(owner) if owner == customer_ref => Ok(customer_ref),
            _ => Err(BillingError::PaymentMethodNotOwned(
                payment_method_ref.to_string(),
            )),
        }
    }

    fn web_snapshot(&self, subscription: &ProviderSubscription) -> SubscriptionSnapshot {
        SubscriptionSnapshot {
            status: self
                .vocabulary
                .map_status(ProviderKind::Stripe, &subscription.status),
            tier: subscription
                .price_ref
                .as_deref()
                .map_or(Tier::lowest(), |price| self.vocabulary.tier_for_price(price)),
            plan_ref: subscription.price_ref.clone(),
            subscription_ref: Some(subscription.subscription_ref.clone()),
            customer_ref: Some(subscription.customer_ref.clone()),
            original_transaction_ref: None,
            period_start: subscription.period_start,
            period_end: subscription.period_end,
            cancel_at_period_end: subscription.cancel_at_period_end,
            auto_renew: !subscription.cancel_at_period_end,
            is_trial: subscription.is_trial,
        }
    }
}

fn require_customer(record: &SubscriptionRecord) -> BillingResult<&str> {
    record.provider_customer_ref.as_deref().ok_or_else(|| {
        BillingError::NotFound(format!("No billing customer for user {}", record.user_id))
    })
}

fn require_web_subscription(record: &SubscriptionRecord) -> BillingResult<&str> {
    if record.provider == ProviderKind::AppStore {
        return Err(BillingError::InvalidInput(
            "App Store subscriptions are managed from the device".to_string(),
        ));
    }
    record.provider_subscription_ref.as_deref().ok_or_else(|| {
        BillingError::NoSubscription(format!("No web subscription for user {}", record.user_id))
    })
}
