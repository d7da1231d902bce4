//! Maps provider identities back to users

use std::sync::Arc;

use kindred_shared::ProviderKind;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::events::OwnerRef;
use crate::reconcile::{Reconciler, SubscriptionDelta};
use crate::store::BillingStore;

/// Resolves and links provider customer/transaction ids to users
#[derive(Clone)]
pub struct IdentityLinker {
    store: Arc<dyn BillingStore>,
    reconciler: Reconciler,
}

impl IdentityLinker {
    pub fn new(store: Arc<dyn BillingStore>, reconciler: Reconciler) -> Self {
        Self { store, reconciler }
    }

    /// Reverse lookup of the user owning a provider reference.
    ///
    /// Stripe references are customer ids; App Store references are original
    /// transaction ids. `Ok(None)` is a normal outcome.
    pub async fn resolve_owner(
        &self,
        provider: ProviderKind,
        provider_ref: &str,
    ) -> BillingResult<Option<Uuid>> {
        let record = match provider {
            ProviderKind::Stripe => self.store.find_subscription_by_customer_ref(provider_ref).await?,
            ProviderKind::AppStore => {
                self.store
                    .find_subscription_by_original_transaction(provider_ref)
                    .await?
            }
        };
        Ok(record.map(|r| r.user_id))
    }

    /// Resolve the owner named by a normalized event
    pub async fn resolve(&self, owner: &OwnerRef) -> BillingResult<Option<Uuid>> {
        match owner {
            OwnerRef::Customer(customer_ref) => {
                self.resolve_owner(ProviderKind::Stripe, customer_ref).await
            }
            OwnerRef::OriginalTransaction {
                original_transaction_ref,
                app_account_token,
            } => {
                if let Some(user_id) = self
                    .resolve_owner(ProviderKind::AppStore, original_transaction_ref)
                    .await?
                {
                    return Ok(Some(user_id));
                }
                // First notification for a purchase the app tagged with the
                // user's id but never verified through the API
                match app_account_token {
                    Some(token) => Ok(self
                        .store
                        .find_subscription_by_user(*token)
                        .await?
                        .map(|r| r.user_id)),
                    None => Ok(None),
                }
            }
            OwnerRef::Unknown => Ok(None),
        }
    }

    /// Record the user's Stripe customer id
    pub async fn link_customer(
        &self,
        user_id: Uuid,
        customer_ref: &str,
    ) -> BillingResult<SubscriptionDelta> {
        if let Some(owner) = self.resolve_owner(ProviderKind::Stripe, customer_ref).await? {
            if owner != user_id {
                return Err(BillingError::AlreadyExists(format!(
                    "Customer {} is linked to another user",
                    customer_ref
                )));
            }
        }

        self.reconciler
            .modify(user_id, |current| {
                if current.provider_customer_ref.as_deref() == Some(customer_ref) {
                    return None;
                }
                let mut next = current.clone();
                next.provider_customer_ref = Some(customer_ref.to_string());
                Some(next)
            })
            .await
    }

    /// Record the App Store original transaction id for the user's subscription
    pub async fn link_original_transaction(
        &self,
        user_id: Uuid,
        original_transaction_ref: &str,
    ) -> BillingResult<SubscriptionDelta> {
        if let Some(owner) = self
            .resolve_owner(ProviderKind::AppStore, original_transaction_ref)
            .await?
        {
            if owner != user_id {
                tracing::warn!(
                    user_id = %user_id,
                    owner_id = %owner,
                    original_transaction_ref = %original_transaction_ref,
                    "Original transaction already linked to another user"
                );
                return Err(BillingError::ReceiptAlreadyUsed(
                    original_transaction_ref.to_string(),
                ));
            }
        }

        let delta = self
            .reconciler
            .modify(user_id, |current| {
                if current.provider_original_transaction_ref.as_deref()
                    == Some(original_transaction_ref)
                {
                    return None;
                }
                let mut next = current.clone();
                next.provider_original_transaction_ref = Some(original_transaction_ref.to_string());
                Some(next)
            })
            .await?;

        if delta.applied {
            tracing::info!(
                user_id = %user_id,
                original_transaction_ref = %original_transaction_ref,
                "Linked App Store subscription"
            );
        }
        Ok(delta)
    }
}
