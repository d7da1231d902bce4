//! Inbound provider notifications
//!
//! A 200 tells the provider to stop retrying. Authenticity failures answer 400
//! and transient failures 503 so the provider redelivers; every other outcome,
//! including events we could not process, is acknowledged.

use axum::{extract::State, http::HeaderMap, Json};
use kindred_billing::WebhookAck;
use kindred_shared::ProviderKind;

use crate::{error::ApiResult, state::AppState};

const STRIPE_SIGNATURE_HEADER: &str = "stripe-signature";

pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<WebhookAck>> {
    let signature = headers
        .get(STRIPE_SIGNATURE_HEADER)
        .and_then(|h| h.to_str().ok());

    let ack = state
        .billing
        .webhooks
        .handle(ProviderKind::Stripe, &body, signature)
        .await?;
    Ok(Json(ack))
}

/// App Store notifications carry their signature inside the signed payload
pub async fn app_store_webhook(
    State(state): State<AppState>,
    body: String,
) -> ApiResult<Json<WebhookAck>> {
    let ack = state
        .billing
        .webhooks
        .handle(ProviderKind::AppStore, &body, None)
        .await?;
    Ok(Json(ack))
}
