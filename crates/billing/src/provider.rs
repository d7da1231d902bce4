//! Outbound provider capabilities
//!
//! The core calls providers only through these traits. Production code uses
//! [`crate::stripe_provider::StripeWebProvider`] and
//! [`crate::app_store_client::AppStoreServerClient`]; tests use in-memory fakes.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Subscription as returned by the web provider after a write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSubscription {
    pub subscription_ref: String,
    pub customer_ref: String,
    /// Provider status string, mapped through the vocabulary
    pub status: String,
    pub price_ref: Option<String>,
    pub period_start: Option<OffsetDateTime>,
    pub period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub is_trial: bool,
}

/// Card processor used for web purchases
#[async_trait]
pub trait WebBillingProvider: Send + Sync {
    async fn create_customer(&self, user_id: Uuid, email: &str) -> BillingResult<String>;

    async fn create_subscription(
        &self,
        customer_ref: &str,
        price_ref: &str,
    ) -> BillingResult<ProviderSubscription>;

    /// Swap the subscription's single price, prorating the difference
    async fn change_plan(
        &self,
        subscription_ref: &str,
        price_ref: &str,
    ) -> BillingResult<ProviderSubscription>;

    async fn set_cancel_at_period_end(
        &self,
        subscription_ref: &str,
        cancel: bool,
    ) -> BillingResult<ProviderSubscription>;

    async fn cancel_now(&self, subscription_ref: &str) -> BillingResult<ProviderSubscription>;

    /// Customer the payment method is attached to, if any
    async fn payment_method_owner(&self, payment_method_ref: &str) -> BillingResult<Option<String>>;

    async fn attach_payment_method(
        &self,
        customer_ref: &str,
        payment_method_ref: &str,
    ) -> BillingResult<()>;

    async fn detach_payment_method(&self, payment_method_ref: &str) -> BillingResult<()>;

    async fn set_default_payment_method(
        &self,
        customer_ref: &str,
        payment_method_ref: &str,
    ) -> BillingResult<()>;
}

/// App Store Server API
#[async_trait]
pub trait AppStoreApi: Send + Sync {
    /// Signed transaction (compact JWS) for a transaction id
    async fn fetch_transaction(&self, transaction_id: &str) -> BillingResult<String>;
}

/// Bound an outbound call. An elapsed timer becomes `ProviderTimeout`, which
/// callers treat as transient.
pub async fn with_timeout<T, F>(limit: Duration, operation: &str, call: F) -> BillingResult<T>
where
    F: Future<Output = BillingResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(
                operation = %operation,
                timeout_ms = limit.as_millis() as u64,
                "Provider call timed out"
            );
            Err(BillingError::ProviderTimeout(format!(
                "{} did not finish within {:?}",
                operation, limit
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let err = with_timeout(Duration::from_millis(10), "slow call", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, BillingError>(())
        })
        .await
        .unwrap_err();

        assert!(matches!(err, BillingError::ProviderTimeout(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_inner_error_passes_through() {
        let err = with_timeout(Duration::from_secs(1), "rejecting call", async {
            Err::<(), _>(BillingError::PaymentRejected("card_declined".to_string()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, BillingError::PaymentRejected(_)));
    }
}
