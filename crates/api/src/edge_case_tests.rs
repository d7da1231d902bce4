// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the HTTP Surface
//!
//! Drives the router with `tower::ServiceExt::oneshot` over the in-memory
//! store and fake providers:
//! - Notification endpoints (API-W01 to API-W05)
//! - Caller identification (API-A01 to API-A02)
//! - Billing operations (API-B01 to API-B05)
//! - Webhook admin routes (API-ADM01 to API-ADM04)

#[cfg(test)]
mod support {
    use std::sync::Arc;

    use axum::{
        body::Body,
        http::{Request, StatusCode},
        Router,
    };
    use kindred_billing::mocks::{sign_stripe_payload, test_config, FakeWebProvider};
    use kindred_billing::{BillingService, InMemoryBillingStore};
    use serde_json::{json, Value};
    use time::OffsetDateTime;
    use tower::ServiceExt;
    use uuid::Uuid;

    use crate::{routes::create_router, state::AppState};

    pub const ADMIN_TOKEN: &str = "admin-test-token";
    pub const DAY: i64 = 86_400;

    pub struct Harness {
        pub app: Router,
        pub store: Arc<InMemoryBillingStore>,
    }

    pub fn harness_with_admin(admin_token: Option<&str>) -> Harness {
        let store = Arc::new(InMemoryBillingStore::new());
        let billing = BillingService::with_parts(
            test_config(),
            store.clone(),
            Arc::new(FakeWebProvider::new()),
            None,
        )
        .unwrap();
        let app = create_router(AppState::with_admin_token(billing, admin_token));
        Harness { app, store }
    }

    pub fn harness() -> Harness {
        harness_with_admin(Some(ADMIN_TOKEN))
    }

    pub fn now() -> i64 {
        OffsetDateTime::now_utc().unix_timestamp()
    }

    pub async fn send(h: &Harness, request: Request<Body>) -> (StatusCode, Value) {
        let response = h.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    pub fn user_request(method: &str, uri: &str, user_id: Uuid, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("x-user-id", user_id.to_string());
        match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    pub fn admin_request(method: &str, uri: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("x-admin-token", token);
        }
        builder.body(Body::empty()).unwrap()
    }

    pub fn stripe_request(body: &str, signature: Option<String>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/webhooks/stripe")
            .header("content-type", "application/json");
        if let Some(signature) = signature {
            builder = builder.header("stripe-signature", signature);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    pub async fn deliver(h: &Harness, body: &str) -> (StatusCode, Value) {
        let signature = sign_stripe_payload(body, now());
        send(h, stripe_request(body, Some(signature))).await
    }

    pub fn stripe_event(id: &str, event_type: &str, object: Value) -> String {
        json!({
            "id": id,
            "object": "event",
            "type": event_type,
            "created": now(),
            "data": { "object": object }
        })
        .to_string()
    }

    pub fn subscription_object(subscription_ref: &str, customer_ref: &str, price: &str) -> Value {
        let period_end = now() + 30 * DAY;
        json!({
            "id": subscription_ref,
            "object": "subscription",
            "customer": customer_ref,
            "status": "active",
            "current_period_start": period_end - 30 * DAY,
            "current_period_end": period_end,
            "cancel_at_period_end": false,
            "items": { "data": [ { "price": { "id": price } } ] }
        })
    }

    /// Registers a customer for a fresh user; returns (user, customer ref)
    pub async fn customer(h: &Harness) -> (Uuid, String) {
        let user_id = Uuid::new_v4();
        let (status, body) = send(
            h,
            user_request(
                "POST",
                "/billing/customer",
                user_id,
                Some(json!({ "email": "ada@example.com" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        let customer_ref = body["provider_customer_ref"].as_str().unwrap().to_string();
        (user_id, customer_ref)
    }
}

// =============================================================================
// Notification endpoints
// =============================================================================

#[cfg(test)]
mod webhook_tests {
    use super::support::*;
    use axum::http::StatusCode;
    use kindred_billing::mocks::{sign_stripe_payload, PRICE_PREMIUM};
    use serde_json::json;

    // =========================================================================
    // API-W01: Missing signature header - 400, nothing stored
    // =========================================================================
    #[tokio::test]
    async fn test_missing_signature_is_rejected() {
        let h = harness();
        let body = stripe_event("evt_a1", "invoice.paid", json!({ "id": "in_1" }));

        let (status, response) = send(&h, stripe_request(&body, None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(response["error"]["code"], "SIGNATURE_MISSING");

        let (_, events) = send(&h, admin_request("GET", "/admin/webhooks", Some(ADMIN_TOKEN))).await;
        assert_eq!(events["events"].as_array().unwrap().len(), 0);
    }

    // =========================================================================
    // API-W02: Signature over a different body - 400
    // =========================================================================
    #[tokio::test]
    async fn test_tampered_body_is_rejected() {
        let h = harness();
        let body = stripe_event("evt_a2", "invoice.paid", json!({ "id": "in_2" }));
        let signature = sign_stripe_payload(&body, now());
        let tampered = body.replace("in_2", "in_3");

        let (status, response) = send(&h, stripe_request(&tampered, Some(signature))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(response["error"]["code"], "SIGNATURE_INVALID");
    }

    // =========================================================================
    // API-W03: Unknown customer - acknowledged and dropped
    // =========================================================================
    #[tokio::test]
    async fn test_unknown_customer_is_acknowledged() {
        let h = harness();
        let body = stripe_event(
            "evt_a3",
            "customer.subscription.created",
            subscription_object("sub_unknown", "cus_unknown", PRICE_PREMIUM),
        );

        let (status, ack) = deliver(&h, &body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ack["received"], true);
        assert_eq!(ack["outcome"], "owner_not_found");
    }

    // =========================================================================
    // API-W04: Linked customer subscribes - entitlements follow, redelivery is a duplicate
    // =========================================================================
    #[tokio::test]
    async fn test_subscription_webhook_updates_entitlements() {
        let h = harness();
        let (user_id, customer_ref) = customer(&h).await;
        let body = stripe_event(
            "evt_a4",
            "customer.subscription.created",
            subscription_object("sub_a4", &customer_ref, PRICE_PREMIUM),
        );

        let (status, ack) = deliver(&h, &body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ack["outcome"], "processed");

        let (status, entitlements) =
            send(&h, user_request("GET", "/billing/entitlements", user_id, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(entitlements["tier"], "premium");
        assert_eq!(entitlements["subscription_status"], "active");

        let (status, again) = deliver(&h, &body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(again["outcome"], "duplicate");
    }

    // =========================================================================
    // API-W05: Store outage - 503 so the provider redelivers
    // =========================================================================
    #[tokio::test]
    async fn test_store_outage_is_not_acknowledged() {
        let h = harness();
        h.store.simulate_outage(true);
        let body = stripe_event(
            "evt_a5",
            "customer.subscription.created",
            subscription_object("sub_a5", "cus_a5", PRICE_PREMIUM),
        );

        let (status, response) = deliver(&h, &body).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response["error"]["code"], "UNAVAILABLE");
        assert!(!response["error"]["message"]
            .as_str()
            .unwrap()
            .contains("simulated"));
    }
}

// =============================================================================
// Caller identification
// =============================================================================

#[cfg(test)]
mod identity_tests {
    use super::support::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };

    // =========================================================================
    // API-A01: No X-User-Id header - 401
    // =========================================================================
    #[tokio::test]
    async fn test_missing_user_header() {
        let h = harness();
        let request = Request::builder()
            .uri("/billing/entitlements")
            .body(Body::empty())
            .unwrap();

        let (status, body) = send(&h, request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "UNAUTHORIZED");
    }

    // =========================================================================
    // API-A02: Malformed user id - 400
    // =========================================================================
    #[tokio::test]
    async fn test_malformed_user_header() {
        let h = harness();
        let request = Request::builder()
            .uri("/billing/entitlements")
            .header("x-user-id", "not-a-uuid")
            .body(Body::empty())
            .unwrap();

        let (status, body) = send(&h, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
    }
}

// =============================================================================
// Billing operations
// =============================================================================

#[cfg(test)]
mod billing_tests {
    use super::support::*;
    use axum::http::StatusCode;
    use serde_json::json;
    use uuid::Uuid;

    // =========================================================================
    // API-B01: Subscribe, cancel at period end, reactivate
    // =========================================================================
    #[tokio::test]
    async fn test_subscription_lifecycle() {
        let h = harness();
        let (user_id, _) = customer(&h).await;

        let (status, created) = send(
            &h,
            user_request(
                "POST",
                "/billing/subscription",
                user_id,
                Some(json!({ "tier": "premium" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{}", created);
        assert_eq!(created["tier"], "premium");

        let (status, cancelled) = send(
            &h,
            user_request("POST", "/billing/subscription/cancel", user_id, None),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{}", cancelled);
        assert_eq!(cancelled["record"]["cancel_at_period_end"], true);
        assert_eq!(cancelled["tier"], "premium");

        let (status, reactivated) = send(
            &h,
            user_request("POST", "/billing/subscription/reactivate", user_id, None),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{}", reactivated);
        assert_eq!(reactivated["record"]["cancel_at_period_end"], false);
    }

    // =========================================================================
    // API-B02: Unknown plan is 400, missing subscription is 404
    // =========================================================================
    #[tokio::test]
    async fn test_plan_and_subscription_errors() {
        let h = harness();
        let (user_id, _) = customer(&h).await;

        let (status, body) = send(
            &h,
            user_request(
                "PUT",
                "/billing/subscription/plan",
                user_id,
                Some(json!({ "plan_id": "price_unknown" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "INVALID_PLAN");

        let (status, body) = send(
            &h,
            user_request("GET", "/billing/subscription", Uuid::new_v4(), None),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "NO_SUBSCRIPTION");
    }

    // =========================================================================
    // API-B03: Consumable purchase credits once and is spendable
    // =========================================================================
    #[tokio::test]
    async fn test_consumable_purchase_and_spend() {
        let h = harness();
        let user_id = Uuid::new_v4();
        let purchase = json!({
            "provider": "stripe",
            "transaction_id": "pi_boost_1",
            "product_id": "com.kindred.boost.5"
        });

        let (status, first) = send(
            &h,
            user_request("POST", "/billing/consumables", user_id, Some(purchase.clone())),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{}", first);
        assert_eq!(first["result"], "credited");
        assert_eq!(first["usage"]["boosts_remaining"], 5);

        let (_, second) = send(
            &h,
            user_request("POST", "/billing/consumables", user_id, Some(purchase.clone())),
        )
        .await;
        assert_eq!(second["result"], "already_redeemed");
        assert_eq!(second["usage"]["boosts_remaining"], 5);

        let (status, stolen) = send(
            &h,
            user_request("POST", "/billing/consumables", Uuid::new_v4(), Some(purchase)),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(stolen["error"]["code"], "RECEIPT_ALREADY_USED");

        let (status, usage) = send(
            &h,
            user_request("POST", "/billing/usage", user_id, Some(json!({ "kind": "boost" }))),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(usage["boosts_remaining"], 4);
    }

    // =========================================================================
    // API-B04: Spending with an empty balance - 400 limit_reached
    // =========================================================================
    #[tokio::test]
    async fn test_boost_without_balance() {
        let h = harness();
        let (status, body) = send(
            &h,
            user_request(
                "POST",
                "/billing/usage",
                Uuid::new_v4(),
                Some(json!({ "kind": "boost" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "LIMIT_REACHED");
    }

    // =========================================================================
    // API-B05: Access check names the tier to upgrade to
    // =========================================================================
    #[tokio::test]
    async fn test_access_check_for_basic_user() {
        let h = harness();
        let (status, body) = send(
            &h,
            user_request("GET", "/billing/access/incognito_mode", Uuid::new_v4(), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["decision"], "denied");
        assert_eq!(body["required_tier"], "community");
        assert_eq!(body["upgrade_available"], true);
    }
}

// =============================================================================
// Webhook admin routes
// =============================================================================

#[cfg(test)]
mod admin_tests {
    use super::support::*;
    use axum::http::StatusCode;
    use serde_json::json;
    use uuid::Uuid;

    async fn failed_event(h: &Harness) -> String {
        let body = stripe_event(
            "evt_adm",
            "customer.subscription.updated",
            json!({ "id": "sub_adm", "status": "active" }),
        );
        let (status, ack) = deliver(h, &body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ack["outcome"], "failed");

        let (_, failed) = send(
            h,
            admin_request("GET", "/admin/webhooks/failed", Some(ADMIN_TOKEN)),
        )
        .await;
        failed["events"][0]["id"].as_str().unwrap().to_string()
    }

    // =========================================================================
    // API-ADM01: Token required; wrong token rejected
    // =========================================================================
    #[tokio::test]
    async fn test_admin_token_required() {
        let h = harness();

        let (status, _) = send(&h, admin_request("GET", "/admin/webhooks", None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = send(&h, admin_request("GET", "/admin/webhooks", Some("wrong"))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) =
            send(&h, admin_request("GET", "/admin/webhooks", Some(ADMIN_TOKEN))).await;
        assert_eq!(status, StatusCode::OK);
    }

    // =========================================================================
    // API-ADM02: No configured token - admin routes do not exist
    // =========================================================================
    #[tokio::test]
    async fn test_admin_disabled_without_token() {
        let h = harness_with_admin(None);
        let (status, _) = send(&h, admin_request("GET", "/admin/webhooks", Some(ADMIN_TOKEN))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    // =========================================================================
    // API-ADM03: Replaying an unprocessable event fails again
    // =========================================================================
    #[tokio::test]
    async fn test_replay_failed_event() {
        let h = harness();
        let record_id = failed_event(&h).await;

        let (status, result) = send(
            &h,
            admin_request(
                "POST",
                &format!("/admin/webhooks/{}/replay", record_id),
                Some(ADMIN_TOKEN),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{}", result);
        assert_eq!(result["success"], false);
        assert_eq!(result["previous_status"], "failed");
        assert_eq!(result["new_status"], "failed");

        let (status, batch) = send(
            &h,
            admin_request("POST", "/admin/webhooks/replay-failed", Some(ADMIN_TOKEN)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(batch["replayed"], 1);
        assert_eq!(batch["succeeded"], 0);
    }

    // =========================================================================
    // API-ADM04: Reset clears the event; unknown ids are 404; bad paging is 400
    // =========================================================================
    #[tokio::test]
    async fn test_reset_and_paging() {
        let h = harness();
        let record_id = failed_event(&h).await;

        let (status, _) = send(
            &h,
            admin_request(
                "POST",
                &format!("/admin/webhooks/{}/reset", record_id),
                Some(ADMIN_TOKEN),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (_, failed) = send(
            &h,
            admin_request("GET", "/admin/webhooks/failed", Some(ADMIN_TOKEN)),
        )
        .await;
        assert_eq!(failed["events"].as_array().unwrap().len(), 0);

        let (status, body) = send(
            &h,
            admin_request(
                "POST",
                &format!("/admin/webhooks/{}/reset", Uuid::new_v4()),
                Some(ADMIN_TOKEN),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "NOT_FOUND");

        let (status, _) = send(
            &h,
            admin_request("GET", "/admin/webhooks?limit=0", Some(ADMIN_TOKEN)),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
