//! HTTP error mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use kindred_billing::BillingError;
use serde_json::json;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Authentication required")]
    Unauthorized,
    #[error("Admin routes are disabled")]
    AdminDisabled,
    #[error("Validation error: {0}")]
    Validation(String),
    #[error(transparent)]
    Billing(#[from] BillingError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::AdminDisabled => StatusCode::NOT_FOUND,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Billing(e) => billing_status(e),
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::Unauthorized => "UNAUTHORIZED",
            ApiError::AdminDisabled => "NOT_FOUND",
            ApiError::Validation(_) => "VALIDATION_ERROR",
            ApiError::Billing(e) => billing_code(e),
        }
    }
}

fn billing_status(err: &BillingError) -> StatusCode {
    match err {
        e if e.is_client_error() => StatusCode::BAD_REQUEST,
        BillingError::NoSubscription(_) | BillingError::NotFound(_) => StatusCode::NOT_FOUND,
        BillingError::PaymentRejected(_) => StatusCode::PAYMENT_REQUIRED,
        BillingError::ConcurrentModification(_) | BillingError::AlreadyExists(_) => {
            StatusCode::CONFLICT
        }
        e if e.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn billing_code(err: &BillingError) -> &'static str {
    match err {
        BillingError::SignatureMissing => "SIGNATURE_MISSING",
        BillingError::WebhookSignatureInvalid => "SIGNATURE_INVALID",
        BillingError::InvalidPayload(_) => "INVALID_PAYLOAD",
        BillingError::InvalidInput(_) => "INVALID_INPUT",
        BillingError::InvalidPlan(_) => "INVALID_PLAN",
        BillingError::PaymentMethodNotOwned(_) => "PAYMENT_METHOD_NOT_OWNED",
        BillingError::ReceiptAlreadyUsed(_) => "RECEIPT_ALREADY_USED",
        BillingError::LimitReached(_) => "LIMIT_REACHED",
        BillingError::NoSubscription(_) => "NO_SUBSCRIPTION",
        BillingError::NotFound(_) => "NOT_FOUND",
        BillingError::AlreadyExists(_) => "ALREADY_EXISTS",
        BillingError::PaymentRejected(_) => "PAYMENT_REJECTED",
        BillingError::ConcurrentModification(_) => "CONFLICT",
        BillingError::ProviderTimeout(_) | BillingError::ProviderUnavailable(_) => {
            "PROVIDER_UNAVAILABLE"
        }
        BillingError::Database(_) => "UNAVAILABLE",
        _ => "INTERNAL_ERROR",
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Internal details stay in the logs
        let message = if status.is_server_error() {
            tracing::error!(error = %self, status = status.as_u16(), "Request failed");
            match status {
                StatusCode::SERVICE_UNAVAILABLE => "Service temporarily unavailable".to_string(),
                _ => "Internal server error".to_string(),
            }
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "Request rejected");
            self.to_string()
        };

        let body = Json(json!({
            "error": {
                "code": self.code(),
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}
