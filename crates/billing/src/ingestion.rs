//! Event ingestion gateway
//!
//! Verifies provider signatures before anything is persisted, then claims the
//! event by its provider id. A second delivery of the same id is reported as
//! a duplicate so the caller can acknowledge it without reprocessing.

use std::collections::HashSet;
use std::sync::Arc;

use hmac::{Hmac, Mac};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use kindred_shared::ProviderKind;
use sha2::Sha256;
use time::OffsetDateTime;

use crate::app_store;
use crate::config::AppStoreConfig;
use crate::error::{BillingError, BillingResult};
use crate::store::{BillingStore, ClaimOutcome, IngestStatus, IngestedEventRecord, NewIngestedEvent};
use crate::stripe_events;

type HmacSha256 = Hmac<Sha256>;

// =============================================================================
// Stripe
// =============================================================================

/// Verifies the `Stripe-Signature` header (`t=...,v1=...`)
#[derive(Clone)]
pub struct StripeSignatureVerifier {
    secret: String,
    tolerance_secs: i64,
}

impl StripeSignatureVerifier {
    pub fn new(webhook_secret: &str, tolerance_secs: i64) -> Self {
        Self {
            secret: webhook_secret.to_string(),
            tolerance_secs,
        }
    }

    pub fn verify(&self, payload: &str, header: &str) -> BillingResult<()> {
        self.verify_at(payload, header, OffsetDateTime::now_utc().unix_timestamp())
    }

    /// Verified by hand rather than through `stripe::Webhook::construct_event`,
    /// which rejects events from API versions newer than async-stripe knows.
    pub fn verify_at(&self, payload: &str, header: &str, now: i64) -> BillingResult<()> {
        let mut timestamp: Option<i64> = None;
        let mut signatures: Vec<&str> = Vec::new();

        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse().ok(),
                Some(("v1", value)) => signatures.push(value),
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            tracing::warn!("Missing timestamp in signature header");
            BillingError::WebhookSignatureInvalid
        })?;
        if signatures.is_empty() {
            tracing::warn!("Missing v1 signature in signature header");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        if (now - timestamp).abs() > self.tolerance_secs {
            tracing::warn!(
                timestamp = timestamp,
                now = now,
                diff = (now - timestamp).abs(),
                "Webhook timestamp outside tolerance"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let secret_key = self.secret.strip_prefix("whsec_").unwrap_or(&self.secret);
        let signed_payload = format!("{}.{}", timestamp, payload);

        let matched = signatures.iter().any(|candidate| {
            let Ok(expected) = hex::decode(candidate) else {
                return false;
            };
            let Ok(mut mac) = HmacSha256::new_from_slice(secret_key.as_bytes()) else {
                return false;
            };
            mac.update(signed_payload.as_bytes());
            mac.verify_slice(&expected).is_ok()
        });

        if !matched {
            tracing::warn!("Stripe signature mismatch");
            return Err(BillingError::WebhookSignatureInvalid);
        }
        Ok(())
    }
}

// =============================================================================
// App Store
// =============================================================================

/// Verifies App Store signed payloads (JWS)
#[derive(Clone)]
pub struct AppStoreSignatureVerifier {
    key: DecodingKey,
    algorithm: Algorithm,
    bundle_id: Option<String>,
}

impl AppStoreSignatureVerifier {
    /// `None` when no notification key is configured
    pub fn from_config(config: &AppStoreConfig) -> BillingResult<Option<Self>> {
        let Some(raw_key) = config.notification_key.as_deref() else {
            return Ok(None);
        };
        let key_material = raw_key.replace("\\n", "\n");
        let (key, algorithm) = if key_material.contains("-----BEGIN") {
            let key = DecodingKey::from_ec_pem(key_material.as_bytes()).map_err(|e| {
                BillingError::Config(format!("APP_STORE_NOTIFICATION_KEY is not a valid EC key: {}", e))
            })?;
            (key, Algorithm::ES256)
        } else {
            (DecodingKey::from_secret(key_material.as_bytes()), Algorithm::HS256)
        };
        Ok(Some(Self {
            key,
            algorithm,
            bundle_id: config.bundle_id.clone(),
        }))
    }

    /// Verify one compact JWS and return its claims
    pub fn decode_jws(&self, token: &str) -> BillingResult<serde_json::Value> {
        let mut validation = Validation::new(self.algorithm);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims = HashSet::new();

        let data = jsonwebtoken::decode::<serde_json::Value>(token, &self.key, &validation)?;
        Ok(data.claims)
    }

    /// Verify a notification body (`{"signedPayload": "..."}`) and return the
    /// decoded notification with nested signed blobs decoded in place
    pub fn verify_notification(&self, body: &str) -> BillingResult<serde_json::Value> {
        let envelope: serde_json::Value = serde_json::from_str(body)
            .map_err(|e| BillingError::InvalidPayload(format!("Body is not JSON: {}", e)))?;
        let signed_payload = envelope
            .get("signedPayload")
            .and_then(|v| v.as_str())
            .ok_or(BillingError::SignatureMissing)?;

        let mut notification = self.decode_jws(signed_payload)?;

        if let Some(data) = notification.get_mut("data").and_then(|d| d.as_object_mut()) {
            if let (Some(expected), Some(actual)) = (
                self.bundle_id.as_deref(),
                data.get("bundleId").and_then(|b| b.as_str()),
            ) {
                if expected != actual {
                    tracing::warn!(expected = %expected, actual = %actual, "Notification for another bundle");
                    return Err(BillingError::WebhookSignatureInvalid);
                }
            }

            for (signed, decoded) in [
                ("signedTransactionInfo", "transactionInfo"),
                ("signedRenewalInfo", "renewalInfo"),
            ] {
                if let Some(token) = data.remove(signed) {
                    let token = token.as_str().ok_or_else(|| {
                        BillingError::InvalidPayload(format!("{} is not a string", signed))
                    })?;
                    let claims = self.decode_jws(token)?;
                    data.insert(decoded.to_string(), claims);
                }
            }
        }

        Ok(notification)
    }
}

// =============================================================================
// Gateway
// =============================================================================

/// An authenticated provider notification
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedEvent {
    pub provider: ProviderKind,
    pub event_ref: String,
    pub event_type: String,
    pub occurred_at: OffsetDateTime,
    /// Payload as stored for audit and replay
    pub payload: serde_json::Value,
}

/// Result of ingesting a notification
#[derive(Debug, Clone, PartialEq)]
pub enum Ingested {
    /// First delivery; the caller owns processing
    New {
        event: VerifiedEvent,
        record: IngestedEventRecord,
    },
    /// Already claimed or finished; processing is skipped
    Duplicate {
        provider: ProviderKind,
        event_ref: String,
        status: IngestStatus,
    },
}

/// Verifies and claims inbound notifications
#[derive(Clone)]
pub struct EventGateway {
    store: Arc<dyn BillingStore>,
    stripe: StripeSignatureVerifier,
    app_store: Option<AppStoreSignatureVerifier>,
    stale_claim_minutes: i32,
}

impl EventGateway {
    pub fn new(
        store: Arc<dyn BillingStore>,
        stripe: StripeSignatureVerifier,
        app_store: Option<AppStoreSignatureVerifier>,
        stale_claim_minutes: i32,
    ) -> Self {
        Self {
            store,
            stripe,
            app_store,
            stale_claim_minutes,
        }
    }

    pub fn app_store_verifier(&self) -> Option<&AppStoreSignatureVerifier> {
        self.app_store.as_ref()
    }

    /// Authenticate the notification without persisting anything
    pub fn verify(
        &self,
        provider: ProviderKind,
        body: &str,
        signature: Option<&str>,
    ) -> BillingResult<VerifiedEvent> {
        match provider {
            ProviderKind::Stripe => {
                let signature = signature.ok_or(BillingError::SignatureMissing)?;
                self.stripe.verify(body, signature)?;
                let payload: serde_json::Value = serde_json::from_str(body)
                    .map_err(|e| BillingError::InvalidPayload(format!("Body is not JSON: {}", e)))?;
                let header = stripe_events::parse_header(&payload)?;
                Ok(VerifiedEvent {
                    provider,
                    event_ref: header.id,
                    event_type: header.event_type,
                    occurred_at: header.created,
                    payload,
                })
            }
            ProviderKind::AppStore => {
                let verifier = self.app_store.as_ref().ok_or_else(|| {
                    BillingError::Config("App Store notifications are not configured".to_string())
                })?;
                let payload = verifier.verify_notification(body)?;
                let header = app_store::parse_header(&payload)?;
                Ok(VerifiedEvent {
                    provider,
                    event_ref: header.id,
                    event_type: header.event_type,
                    occurred_at: header.signed_at,
                    payload,
                })
            }
        }
    }

    /// Verify, then claim the event by provider id
    pub async fn ingest(
        &self,
        provider: ProviderKind,
        body: &str,
        signature: Option<&str>,
    ) -> BillingResult<Ingested> {
        let event = self.verify(provider, body, signature)?;

        let outcome = self
            .store
            .claim_event(
                NewIngestedEvent {
                    provider,
                    provider_event_ref: event.event_ref.clone(),
                    event_type: event.event_type.clone(),
                    occurred_at: event.occurred_at,
                    raw_payload: event.payload.clone(),
                },
                self.stale_claim_minutes,
            )
            .await
            .map_err(|e| {
                tracing::error!(
                    provider = %provider,
                    event_ref = %event.event_ref,
                    error = %e,
                    "Failed to claim event for processing"
                );
                e
            })?;

        match outcome {
            ClaimOutcome::Claimed(record) => {
                tracing::info!(
                    provider = %provider,
                    event_ref = %event.event_ref,
                    event_type = %event.event_type,
                    "Claimed provider event"
                );
                Ok(Ingested::New { event, record })
            }
            ClaimOutcome::Duplicate(status) => {
                tracing::info!(
                    provider = %provider,
                    event_ref = %event.event_ref,
                    status = %status,
                    "Duplicate provider event, skipping"
                );
                Ok(Ingested::Duplicate {
                    provider,
                    event_ref: event.event_ref,
                    status,
                })
            }
        }
    }
}
