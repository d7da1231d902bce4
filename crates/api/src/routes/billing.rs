//! User-initiated billing operations

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use kindred_billing::{
    AccessDecision, AppStorePurchase, BillingError, BillingInterval, CancelMode,
    ConsumableRedemption, Entitlements, Feature, LedgerEntry, SubscriptionDelta,
    SubscriptionRecord, UsageKind, UsageSummary,
};
use kindred_shared::{ProviderKind, Tier};
use serde::Deserialize;

use crate::{
    auth::CurrentUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

// =============================================================================
// Request Types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateCustomerRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateSubscriptionRequest {
    pub tier: Tier,
    #[serde(default)]
    pub interval: BillingInterval,
}

#[derive(Debug, Deserialize)]
pub struct ChangePlanRequest {
    pub plan_id: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    pub mode: CancelMode,
}

#[derive(Debug, Deserialize)]
pub struct PaymentMethodRequest {
    pub payment_method_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ConsumeRequest {
    pub kind: UsageKind,
}

#[derive(Debug, Deserialize)]
pub struct ConsumablePurchaseRequest {
    pub provider: ProviderKind,
    pub transaction_id: String,
    pub product_id: String,
}

#[derive(Debug, Deserialize)]
pub struct VerifyPurchaseRequest {
    pub transaction_id: String,
}

fn require_non_empty(field: &str, value: &str) -> ApiResult<()> {
    if value.trim().is_empty() {
        return Err(ApiError::Validation(format!("{} is required", field)));
    }
    Ok(())
}

// =============================================================================
// Subscription
// =============================================================================

pub async fn create_customer(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Json(req): Json<CreateCustomerRequest>,
) -> ApiResult<Json<SubscriptionRecord>> {
    let record = state
        .billing
        .subscriptions
        .create_customer(user_id, req.email.trim())
        .await?;
    Ok(Json(record))
}

pub async fn get_subscription(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
) -> ApiResult<Json<SubscriptionRecord>> {
    let record = state
        .billing
        .subscriptions
        .get_subscription(user_id)
        .await?
        .ok_or_else(|| BillingError::NoSubscription(format!("User {}", user_id)))?;
    Ok(Json(record))
}

pub async fn create_subscription(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Json(req): Json<CreateSubscriptionRequest>,
) -> ApiResult<(StatusCode, Json<SubscriptionDelta>)> {
    let delta = state
        .billing
        .subscriptions
        .create_subscription(user_id, req.tier, req.interval)
        .await?;
    Ok((StatusCode::CREATED, Json(delta)))
}

pub async fn change_plan(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Json(req): Json<ChangePlanRequest>,
) -> ApiResult<Json<SubscriptionDelta>> {
    require_non_empty("plan_id", &req.plan_id)?;
    let delta = state
        .billing
        .subscriptions
        .change_plan(user_id, &req.plan_id)
        .await?;
    Ok(Json(delta))
}

/// An empty body cancels at period end
pub async fn cancel_subscription(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    req: Option<Json<CancelRequest>>,
) -> ApiResult<Json<SubscriptionDelta>> {
    let req = req.map(|Json(req)| req).unwrap_or_default();
    let delta = state.billing.subscriptions.cancel(user_id, req.mode).await?;
    Ok(Json(delta))
}

pub async fn reactivate_subscription(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
) -> ApiResult<Json<SubscriptionDelta>> {
    let delta = state.billing.subscriptions.reactivate(user_id).await?;
    Ok(Json(delta))
}

// =============================================================================
// Payment methods
// =============================================================================

pub async fn attach_payment_method(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Json(req): Json<PaymentMethodRequest>,
) -> ApiResult<StatusCode> {
    require_non_empty("payment_method_id", &req.payment_method_id)?;
    state
        .billing
        .subscriptions
        .attach_payment_method(user_id, &req.payment_method_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn detach_payment_method(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(payment_method_id): Path<String>,
) -> ApiResult<StatusCode> {
    state
        .billing
        .subscriptions
        .detach_payment_method(user_id, &payment_method_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn set_default_payment_method(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(payment_method_id): Path<String>,
) -> ApiResult<StatusCode> {
    state
        .billing
        .subscriptions
        .set_default_payment_method(user_id, &payment_method_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Entitlements and usage
// =============================================================================

pub async fn get_entitlements(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
) -> ApiResult<Json<Entitlements>> {
    Ok(Json(state.billing.entitlements.get_entitlements(user_id).await?))
}

pub async fn check_access(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(feature): Path<Feature>,
) -> ApiResult<Json<AccessDecision>> {
    Ok(Json(
        state.billing.entitlements.check_access(user_id, feature).await?,
    ))
}

pub async fn consume(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Json(req): Json<ConsumeRequest>,
) -> ApiResult<Json<UsageSummary>> {
    Ok(Json(state.billing.entitlements.consume(user_id, req.kind).await?))
}

pub async fn record_consumable(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Json(req): Json<ConsumablePurchaseRequest>,
) -> ApiResult<Json<ConsumableRedemption>> {
    require_non_empty("transaction_id", &req.transaction_id)?;
    let redemption = state
        .billing
        .subscriptions
        .record_consumable_purchase(user_id, req.provider, &req.transaction_id, &req.product_id)
        .await?;
    Ok(Json(redemption))
}

pub async fn verify_app_store_purchase(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Json(req): Json<VerifyPurchaseRequest>,
) -> ApiResult<Json<AppStorePurchase>> {
    require_non_empty("transaction_id", &req.transaction_id)?;
    let purchase = state
        .billing
        .subscriptions
        .verify_app_store_purchase(user_id, req.transaction_id.trim())
        .await?;
    Ok(Json(purchase))
}

pub async fn list_ledger(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
) -> ApiResult<Json<Vec<LedgerEntry>>> {
    Ok(Json(state.billing.ledger.list(user_id).await?))
}
