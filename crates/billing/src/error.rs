//! Billing error types

use thiserror::Error;

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    // Authenticity failures: rejected before any persistence
    #[error("Notification signature header is missing")]
    SignatureMissing,

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Notification body could not be parsed: {0}")]
    InvalidPayload(String),

    // Caller errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unknown plan: {0}")]
    InvalidPlan(String),

    #[error("Payment method {0} does not belong to this account")]
    PaymentMethodNotOwned(String),

    #[error("Purchase receipt {0} has already been redeemed")]
    ReceiptAlreadyUsed(String),

    #[error("Usage limit reached: {0}")]
    LimitReached(String),

    // Missing resources
    #[error("No active subscription: {0}")]
    NoSubscription(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    // Provider outcomes
    #[error("Payment was rejected by the provider: {0}")]
    PaymentRejected(String),

    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("App Store API error: {0}")]
    AppStoreApi(String),

    #[error("Provider call timed out: {0}")]
    ProviderTimeout(String),

    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    // Processing failures
    #[error("Malformed provider payload: {0}")]
    MalformedPayload(String),

    #[error("Concurrent modification detected: {0}")]
    ConcurrentModification(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Failures that may succeed on redelivery. Inbound notifications that hit
    /// one of these are not acknowledged.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BillingError::Database(_)
                | BillingError::ProviderTimeout(_)
                | BillingError::ProviderUnavailable(_)
                | BillingError::ConcurrentModification(_)
        )
    }

    /// Errors caused by the caller's input rather than our state or a provider
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            BillingError::SignatureMissing
                | BillingError::WebhookSignatureInvalid
                | BillingError::InvalidPayload(_)
                | BillingError::InvalidInput(_)
                | BillingError::InvalidPlan(_)
                | BillingError::PaymentMethodNotOwned(_)
                | BillingError::ReceiptAlreadyUsed(_)
                | BillingError::LimitReached(_)
        )
    }

    pub fn is_authenticity_failure(&self) -> bool {
        matches!(
            self,
            BillingError::SignatureMissing | BillingError::WebhookSignatureInvalid
        )
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        match err {
            stripe::StripeError::Stripe(request) => {
                let message = request
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("{:?}", request.error_type));
                if matches!(request.error_type, stripe::ErrorType::Card) {
                    BillingError::PaymentRejected(message)
                } else if request.http_status >= 500
                    || matches!(request.error_type, stripe::ErrorType::RateLimit)
                {
                    BillingError::ProviderUnavailable(message)
                } else {
                    BillingError::StripeApi(message)
                }
            }
            stripe::StripeError::Timeout => {
                BillingError::ProviderTimeout("stripe request timed out".to_string())
            }
            other => BillingError::StripeApi(other.to_string()),
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            // PostgreSQL unique violation
            if db_err.code().as_deref() == Some("23505") {
                return BillingError::AlreadyExists(
                    db_err
                        .constraint()
                        .map(str::to_string)
                        .unwrap_or_else(|| db_err.message().to_string()),
                );
            }
        }
        BillingError::Database(err.to_string())
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BillingError::ProviderTimeout(err.to_string())
        } else if err.is_connect() || err.status().is_some_and(|s| s.is_server_error()) {
            BillingError::ProviderUnavailable(err.to_string())
        } else {
            BillingError::AppStoreApi(err.to_string())
        }
    }
}

impl From<jsonwebtoken::errors::Error> for BillingError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        tracing::warn!(error = %err, "JWS verification failed");
        BillingError::WebhookSignatureInvalid
    }
}

pub type BillingResult<T> = Result<T, BillingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(BillingError::Database("down".into()).is_transient());
        assert!(BillingError::ProviderTimeout("apple".into()).is_transient());
        assert!(BillingError::ConcurrentModification("sub".into()).is_transient());
        assert!(!BillingError::MalformedPayload("shape".into()).is_transient());
        assert!(!BillingError::WebhookSignatureInvalid.is_transient());
    }

    #[test]
    fn test_client_error_classification() {
        assert!(BillingError::SignatureMissing.is_client_error());
        assert!(BillingError::InvalidPlan("price_x".into()).is_client_error());
        assert!(BillingError::PaymentMethodNotOwned("pm_1".into()).is_client_error());
        assert!(!BillingError::NoSubscription("u".into()).is_client_error());
        assert!(!BillingError::PaymentRejected("card".into()).is_client_error());
        assert!(!BillingError::Database("x".into()).is_client_error());
    }

    #[test]
    fn test_row_not_found_is_database_error() {
        let err: BillingError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, BillingError::Database(_)));
    }
}
