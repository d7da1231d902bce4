//! HTTP routes

pub mod admin;
pub mod billing;
pub mod webhooks;

use axum::{
    middleware,
    routing::{delete, get, post, put},
    Json, Router,
};
use serde_json::{json, Value};

use crate::{auth::require_admin, state::AppState};

/// Build the application router
pub fn create_router(state: AppState) -> Router {
    let webhook_routes = Router::new()
        .route("/stripe", post(webhooks::stripe_webhook))
        .route("/app-store", post(webhooks::app_store_webhook));

    let billing_routes = Router::new()
        .route("/customer", post(billing::create_customer))
        .route(
            "/subscription",
            get(billing::get_subscription).post(billing::create_subscription),
        )
        .route("/subscription/plan", put(billing::change_plan))
        .route("/subscription/cancel", post(billing::cancel_subscription))
        .route(
            "/subscription/reactivate",
            post(billing::reactivate_subscription),
        )
        .route("/payment-methods", post(billing::attach_payment_method))
        .route(
            "/payment-methods/{payment_method_id}",
            delete(billing::detach_payment_method),
        )
        .route(
            "/payment-methods/{payment_method_id}/default",
            post(billing::set_default_payment_method),
        )
        .route("/entitlements", get(billing::get_entitlements))
        .route("/access/{feature}", get(billing::check_access))
        .route("/usage", post(billing::consume))
        .route("/consumables", post(billing::record_consumable))
        .route("/app-store/verify", post(billing::verify_app_store_purchase))
        .route("/ledger", get(billing::list_ledger));

    let admin_routes = Router::new()
        .route("/webhooks", get(admin::list_events))
        .route("/webhooks/failed", get(admin::list_failed_events))
        .route("/webhooks/replay-failed", post(admin::replay_all_failed))
        .route("/webhooks/{record_id}/replay", post(admin::replay_event))
        .route("/webhooks/{record_id}/reset", post(admin::reset_event))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));

    Router::new()
        .route("/health", get(health))
        .nest("/webhooks", webhook_routes)
        .nest("/billing", billing_routes)
        .nest("/admin", admin_routes)
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
