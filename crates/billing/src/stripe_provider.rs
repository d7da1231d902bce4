//! Stripe implementation of [`WebBillingProvider`]

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use stripe::{
    AttachPaymentMethod, CancelSubscription, CreateCustomer, CreateSubscription,
    CreateSubscriptionItems, Customer, CustomerId, CustomerInvoiceSettings, PaymentMethod,
    PaymentMethodId, Subscription, SubscriptionId, SubscriptionStatus as StripeSubStatus,
    UpdateCustomer, UpdateSubscription, UpdateSubscriptionItems,
};
// Import the proration behavior enum from the subscription module (not subscription_item)
use stripe::generated::billing::subscription::SubscriptionProrationBehavior;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::provider::{with_timeout, ProviderSubscription, WebBillingProvider};

/// Web purchases through the Stripe API
#[derive(Clone)]
pub struct StripeWebProvider {
    stripe: StripeClient,
    timeout: Duration,
}

impl StripeWebProvider {
    pub fn new(stripe: StripeClient, timeout: Duration) -> Self {
        Self { stripe, timeout }
    }

    async fn retrieve(&self, subscription_ref: &str) -> BillingResult<Subscription> {
        let sub_id = parse_subscription_id(subscription_ref)?;
        with_timeout(self.timeout, "stripe.subscription.retrieve", async {
            Ok(Subscription::retrieve(self.stripe.inner(), &sub_id, &[]).await?)
        })
        .await
    }
}

fn parse_customer_id(customer_ref: &str) -> BillingResult<CustomerId> {
    customer_ref
        .parse::<CustomerId>()
        .map_err(|e| BillingError::InvalidInput(format!("Invalid customer ID: {}", e)))
}

fn parse_subscription_id(subscription_ref: &str) -> BillingResult<SubscriptionId> {
    subscription_ref
        .parse::<SubscriptionId>()
        .map_err(|e| BillingError::InvalidInput(format!("Invalid subscription ID: {}", e)))
}

fn parse_payment_method_id(payment_method_ref: &str) -> BillingResult<PaymentMethodId> {
    payment_method_ref
        .parse::<PaymentMethodId>()
        .map_err(|e| BillingError::InvalidInput(format!("Invalid payment method ID: {}", e)))
}

fn timestamp(secs: i64) -> Option<OffsetDateTime> {
    (secs > 0)
        .then(|| OffsetDateTime::from_unix_timestamp(secs).ok())
        .flatten()
}

/// Flatten a Stripe subscription into the provider-neutral shape
fn to_provider_subscription(subscription: &Subscription) -> ProviderSubscription {
    let customer_ref = match &subscription.customer {
        stripe::Expandable::Id(id) => id.to_string(),
        stripe::Expandable::Object(customer) => customer.id.to_string(),
    };

    let price_ref = subscription
        .items
        .data
        .first()
        .and_then(|item| item.price.as_ref())
        .map(|p| p.id.to_string());

    ProviderSubscription {
        subscription_ref: subscription.id.to_string(),
        customer_ref,
        status: subscription.status.as_str().to_string(),
        price_ref,
        period_start: timestamp(subscription.current_period_start),
        period_end: timestamp(subscription.current_period_end),
        cancel_at_period_end: subscription.cancel_at_period_end,
        is_trial: subscription.status == StripeSubStatus::Trialing,
    }
}

#[async_trait]
impl WebBillingProvider for StripeWebProvider {
    async fn create_customer(&self, user_id: Uuid, email: &str) -> BillingResult<String> {
        let mut metadata = HashMap::new();
        metadata.insert("user_id".to_string(), user_id.to_string());
        metadata.insert("platform".to_string(), "kindred".to_string());

        let params = CreateCustomer {
            email: Some(email),
            metadata: Some(metadata),
            ..Default::default()
        };

        let customer = with_timeout(self.timeout, "stripe.customer.create", async {
            Ok(Customer::create(self.stripe.inner(), params).await?)
        })
        .await?;

        tracing::info!(
            user_id = %user_id,
            customer_id = %customer.id,
            "Created Stripe customer"
        );
        Ok(customer.id.to_string())
    }

    async fn create_subscription(
        &self,
        customer_ref: &str,
        price_ref: &str,
    ) -> BillingResult<ProviderSubscription> {
        let customer_id = parse_customer_id(customer_ref)?;

        let mut params = CreateSubscription::new(customer_id);
        params.items = Some(vec![CreateSubscriptionItems {
            price: Some(price_ref.to_string()),
            quantity: Some(1),
            ..Default::default()
        }]);

        let subscription = with_timeout(self.timeout, "stripe.subscription.create", async {
            Ok(Subscription::create(self.stripe.inner(), params).await?)
        })
        .await?;

        tracing::info!(
            customer_id = %customer_ref,
            subscription_id = %subscription.id,
            price_id = %price_ref,
            "Created Stripe subscription"
        );
        Ok(to_provider_subscription(&subscription))
    }

    async fn change_plan(
        &self,
        subscription_ref: &str,
        price_ref: &str,
    ) -> BillingResult<ProviderSubscription> {
        let current = self.retrieve(subscription_ref).await?;
        let item_id = current
            .items
            .data
            .first()
            .map(|item| item.id.to_string())
            .ok_or_else(|| {
                BillingError::MalformedPayload(format!(
                    "Subscription {} has no items",
                    subscription_ref
                ))
            })?;

        let params = UpdateSubscription {
            items: Some(vec![UpdateSubscriptionItems {
                id: Some(item_id),
                price: Some(price_ref.to_string()),
                ..Default::default()
            }]),
            proration_behavior: Some(SubscriptionProrationBehavior::CreateProrations),
            ..Default::default()
        };

        let sub_id = parse_subscription_id(subscription_ref)?;
        let updated = with_timeout(self.timeout, "stripe.subscription.update", async {
            Ok(Subscription::update(self.stripe.inner(), &sub_id, params).await?)
        })
        .await?;
        Ok(to_provider_subscription(&updated))
    }

    async fn set_cancel_at_period_end(
        &self,
        subscription_ref: &str,
        cancel: bool,
    ) -> BillingResult<ProviderSubscription> {
        let sub_id = parse_subscription_id(subscription_ref)?;
        let params = UpdateSubscription {
            cancel_at_period_end: Some(cancel),
            ..Default::default()
        };

        let updated = with_timeout(self.timeout, "stripe.subscription.update", async {
            Ok(Subscription::update(self.stripe.inner(), &sub_id, params).await?)
        })
        .await?;
        Ok(to_provider_subscription(&updated))
    }

    async fn cancel_now(&self, subscription_ref: &str) -> BillingResult<ProviderSubscription> {
        let sub_id = parse_subscription_id(subscription_ref)?;
        let cancelled = with_timeout(self.timeout, "stripe.subscription.cancel", async {
            Ok(Subscription::cancel(
                self.stripe.inner(),
                &sub_id,
                CancelSubscription {
                    cancellation_details: None,
                    invoice_now: None,
                    prorate: None,
                },
            )
            .await?)
        })
        .await?;
        Ok(to_provider_subscription(&cancelled))
    }

    async fn payment_method_owner(&self, payment_method_ref: &str) -> BillingResult<Option<String>> {
        let pm_id = parse_payment_method_id(payment_method_ref)?;
        let payment_method = with_timeout(self.timeout, "stripe.payment_method.retrieve", async {
            Ok(PaymentMethod::retrieve(self.stripe.inner(), &pm_id, &[]).await?)
        })
        .await?;

        Ok(payment_method.customer.map(|customer| match customer {
            stripe::Expandable::Id(id) => id.to_string(),
            stripe::Expandable::Object(customer) => customer.id.to_string(),
        }))
    }

    async fn attach_payment_method(
        &self,
        customer_ref: &str,
        payment_method_ref: &str,
    ) -> BillingResult<()> {
        let customer = parse_customer_id(customer_ref)?;
        let pm_id = parse_payment_method_id(payment_method_ref)?;
        with_timeout(self.timeout, "stripe.payment_method.attach", async {
            PaymentMethod::attach(self.stripe.inner(), &pm_id, AttachPaymentMethod { customer })
                .await?;
            Ok(())
        })
        .await
    }

    async fn detach_payment_method(&self, payment_method_ref: &str) -> BillingResult<()> {
        let pm_id = parse_payment_method_id(payment_method_ref)?;
        with_timeout(self.timeout, "stripe.payment_method.detach", async {
            PaymentMethod::detach(self.stripe.inner(), &pm_id).await?;
            Ok(())
        })
        .await
    }

    async fn set_default_payment_method(
        &self,
        customer_ref: &str,
        payment_method_ref: &str,
    ) -> BillingResult<()> {
        let customer_id = parse_customer_id(customer_ref)?;
        let params = UpdateCustomer {
            invoice_settings: Some(CustomerInvoiceSettings {
                default_payment_method: Some(payment_method_ref.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        with_timeout(self.timeout, "stripe.customer.update", async {
            Customer::update(self.stripe.inner(), &customer_id, params).await?;
            Ok(())
        })
        .await?;

        tracing::info!(
            customer_id = %customer_ref,
            payment_method_id = %payment_method_ref,
            "Default payment method updated"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_ids_are_client_errors() {
        assert!(parse_customer_id("not-a-customer").unwrap_err().is_client_error());
        assert!(parse_subscription_id("cus_123").unwrap_err().is_client_error());
        assert!(parse_payment_method_id("sub_123").unwrap_err().is_client_error());
        assert!(parse_payment_method_id("pm_1Nx").is_ok());
    }

    #[test]
    fn test_zero_timestamp_is_unset() {
        assert_eq!(timestamp(0), None);
        assert_eq!(
            timestamp(1_700_000_000).map(|t| t.unix_timestamp()),
            Some(1_700_000_000)
        );
    }
}
