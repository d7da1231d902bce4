// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::too_many_arguments)] // Service wiring takes every collaborator explicitly
#![allow(clippy::field_reassign_with_default)] // Used for conditional struct field setting
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Kindred Billing Module
//!
//! Reconciles Stripe and App Store billing events into one canonical
//! subscription and entitlement record per user.
//!
//! ## Features
//!
//! - **Ingestion**: Verify provider signatures and claim each event exactly once
//! - **Reconciliation**: Order-independent subscription state machine with
//!   monotonic billing periods
//! - **Entitlements**: Tier feature matrix, usage limits, consumable balances
//! - **Ledger**: One row per provider invoice, updated as its status moves
//! - **Identity**: Map Stripe customers and App Store original transactions to users
//! - **Subscriptions**: User-initiated create, change, cancel, reactivate and
//!   payment method management
//! - **App Store**: Purchase verification through the App Store Server API
//! - **Webhooks**: Acknowledgement policy, replay and reset of stored events

pub mod app_store;
pub mod app_store_client;
pub mod client;
pub mod config;
pub mod entitlement;
pub mod error;
pub mod events;
pub mod identity;
pub mod ingestion;
pub mod ledger;
pub mod notify;
pub mod provider;
pub mod reconcile;
pub mod store;
pub mod stripe_events;
pub mod stripe_provider;
pub mod subscriptions;
pub mod usage;
pub mod vocabulary;
pub mod webhooks;

#[cfg(any(test, feature = "test-support"))]
pub mod mocks;


use std::sync::Arc;

use sqlx::PgPool;

// Client
pub use client::{BillingInterval, PriceIds, StripeClient, StripeConfig};

// Config
pub use config::{AppStoreConfig, BillingConfig, BillingEnvironment};

// Error
pub use error::{BillingError, BillingResult};

// Entitlement
pub use entitlement::{
    effective_tier, enabled_features, entitlement_state, resolve, validate_access,
    AccessDecision, EntitlementState, Feature, FeatureMatrix,
};

// Events
pub use events::{EventKind, InvoiceOutcome, NormalizedEvent, OwnerRef, SubscriptionSnapshot};

// Identity
pub use identity::IdentityLinker;

// Ingestion
pub use ingestion::{
    AppStoreSignatureVerifier, EventGateway, Ingested, StripeSignatureVerifier, VerifiedEvent,
};

// Ledger
pub use ledger::BillingLedger;

// Notify
pub use notify::{EntitlementBroadcaster, EntitlementChanged};

// Providers
pub use app_store_client::AppStoreServerClient;
pub use provider::{AppStoreApi, ProviderSubscription, WebBillingProvider};
pub use stripe_provider::StripeWebProvider;

// Reconcile
pub use reconcile::{apply_transition, EventMeta, Reconciler, SubscriptionDelta, Transition};

// Store
pub use store::{
    BillingStore, EntitlementSnapshot, InMemoryBillingStore, IngestStatus, IngestedEventRecord,
    LedgerEntry, LedgerEntryType, LedgerStatus, PgBillingStore, ProviderTransactionRecord,
    SubscriptionRecord, TransactionKind,
};

// Subscriptions
pub use subscriptions::{AppStorePurchase, CancelMode, ConsumableRedemption, SubscriptionService};

// Usage
pub use usage::{EntitlementService, Entitlements, UsageKind, UsageSummary};

// Vocabulary
pub use vocabulary::{ConsumableGrant, ConsumableKind, ConsumableProduct, Vocabulary};

// Webhooks
pub use webhooks::{WebhookAck, WebhookHandler, WebhookOutcome, WebhookReplayResult};

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub config: BillingConfig,
    pub store: Arc<dyn BillingStore>,
    pub reconciler: Reconciler,
    pub identity: IdentityLinker,
    pub ledger: BillingLedger,
    pub entitlements: EntitlementService,
    pub subscriptions: SubscriptionService,
    pub webhooks: WebhookHandler,
    pub broadcaster: Arc<EntitlementBroadcaster>,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        Self::new(BillingConfig::from_env()?, pool)
    }

    /// Postgres-backed service talking to the real providers
    pub fn new(config: BillingConfig, pool: PgPool) -> BillingResult<Self> {
        let store: Arc<dyn BillingStore> = Arc::new(PgBillingStore::new(pool));
        let web: Arc<dyn WebBillingProvider> = Arc::new(StripeWebProvider::new(
            StripeClient::new(config.stripe.clone()),
            config.provider_timeout,
        ));
        let app_store = AppStoreServerClient::from_config(
            &config.app_store,
            config.environment,
            config.provider_timeout,
        )?
        .map(|client| Arc::new(client) as Arc<dyn AppStoreApi>);

        if app_store.is_none() {
            tracing::warn!("App Store Server API credentials not set, purchase verification disabled");
        }

        Self::with_parts(config, store, web, app_store)
    }

    /// Assemble the service around explicit collaborators
    pub fn with_parts(
        config: BillingConfig,
        store: Arc<dyn BillingStore>,
        web: Arc<dyn WebBillingProvider>,
        app_store: Option<Arc<dyn AppStoreApi>>,
    ) -> BillingResult<Self> {
        let vocabulary = Arc::new(config.vocabulary());
        let broadcaster = Arc::new(EntitlementBroadcaster::new());

        let reconciler = Reconciler::new(store.clone());
        let identity = IdentityLinker::new(store.clone(), reconciler.clone());
        let ledger = BillingLedger::new(store.clone(), config.default_currency.clone());
        let entitlements = EntitlementService::new(store.clone(), broadcaster.clone());

        let app_store_verifier = AppStoreSignatureVerifier::from_config(&config.app_store)?;
        let gateway = EventGateway::new(
            store.clone(),
            StripeSignatureVerifier::new(
                &config.stripe.webhook_secret,
                config.webhook_tolerance_secs,
            ),
            app_store_verifier.clone(),
            config.stale_claim_minutes,
        );

        let subscriptions = SubscriptionService::new(
            &config,
            store.clone(),
            entitlements.clone(),
            web,
            app_store,
            app_store_verifier,
        );

        let webhooks = WebhookHandler::new(
            store.clone(),
            gateway,
            reconciler.clone(),
            identity.clone(),
            ledger.clone(),
            entitlements.clone(),
            subscriptions.clone(),
            vocabulary,
        );

        Ok(Self {
            config,
            store,
            reconciler,
            identity,
            ledger,
            entitlements,
            subscriptions,
            webhooks,
            broadcaster,
        })
    }
}
