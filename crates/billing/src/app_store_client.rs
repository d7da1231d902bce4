//! App Store Server API client
//!
//! Looks up signed transactions by id. Requests carry a short-lived ES256
//! bearer token minted from the App Store Connect API key; the host is picked
//! by [`BillingEnvironment`]. Transient failures are retried with exponential
//! backoff before surfacing.

use std::time::Duration;

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

use crate::config::{AppStoreConfig, BillingEnvironment};
use crate::error::{BillingError, BillingResult};
use crate::provider::AppStoreApi;

const PRODUCTION_URL: &str = "https://api.storekit.itunes.apple.com";
const SANDBOX_URL: &str = "https://api.storekit-sandbox.itunes.apple.com";

const TOKEN_AUDIENCE: &str = "appstoreconnect-v1";
/// Apple rejects tokens valid for more than an hour
const TOKEN_TTL_SECS: i64 = 300;

const MAX_RETRIES: usize = 2;
const RETRY_BASE_DELAY_MS: u64 = 100;
const RETRY_MAX_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Serialize)]
struct ApiClaims<'a> {
    iss: &'a str,
    iat: i64,
    exp: i64,
    aud: &'static str,
    bid: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionInfoResponse {
    signed_transaction_info: String,
}

/// Base URL of the App Store Server API for an environment
pub fn base_url(environment: BillingEnvironment) -> &'static str {
    match environment {
        BillingEnvironment::Production => PRODUCTION_URL,
        BillingEnvironment::Sandbox => SANDBOX_URL,
    }
}

/// Authenticated client for the App Store Server API
#[derive(Clone)]
pub struct AppStoreServerClient {
    http: reqwest::Client,
    base_url: String,
    key_id: String,
    issuer_id: String,
    bundle_id: String,
    signing_key: EncodingKey,
}

impl std::fmt::Debug for AppStoreServerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppStoreServerClient")
            .field("base_url", &self.base_url)
            .field("key_id", &self.key_id)
            .field("bundle_id", &self.bundle_id)
            .finish_non_exhaustive()
    }
}

impl AppStoreServerClient {
    /// `None` when API credentials are not configured
    pub fn from_config(
        config: &AppStoreConfig,
        environment: BillingEnvironment,
        timeout: Duration,
    ) -> BillingResult<Option<Self>> {
        let Some((key_id, issuer_id, private_key)) = config.api_credentials() else {
            return Ok(None);
        };
        let bundle_id = config.bundle_id.clone().ok_or_else(|| {
            BillingError::Config(
                "APP_STORE_BUNDLE_ID is required with App Store API credentials".to_string(),
            )
        })?;

        let pem = private_key.replace("\\n", "\n");
        let signing_key = EncodingKey::from_ec_pem(pem.as_bytes()).map_err(|e| {
            BillingError::Config(format!("APP_STORE_PRIVATE_KEY is not a valid EC key: {}", e))
        })?;

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BillingError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Some(Self {
            http,
            base_url: base_url(environment).to_string(),
            key_id: key_id.to_string(),
            issuer_id: issuer_id.to_string(),
            bundle_id,
            signing_key,
        }))
    }

    /// Point the client at another host
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn bearer_token(&self) -> BillingResult<String> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let claims = ApiClaims {
            iss: &self.issuer_id,
            iat: now,
            exp: now + TOKEN_TTL_SECS,
            aud: TOKEN_AUDIENCE,
            bid: &self.bundle_id,
        };
        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(self.key_id.clone());

        jsonwebtoken::encode(&header, &claims, &self.signing_key)
            .map_err(|e| BillingError::Internal(format!("Failed to sign App Store token: {}", e)))
    }

    async fn fetch_once(&self, url: &str) -> BillingResult<String> {
        let response = self
            .http
            .get(url)
            .bearer_auth(self.bearer_token()?)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            let body: TransactionInfoResponse = response.json().await.map_err(|e| {
                BillingError::AppStoreApi(format!("Unexpected transaction response: {}", e))
            })?;
            return Ok(body.signed_transaction_info);
        }

        let text = response.text().await.unwrap_or_default();
        Err(match status.as_u16() {
            404 => BillingError::NotFound(format!("App Store transaction: {}", text)),
            429 => BillingError::ProviderUnavailable("App Store API rate limited".to_string()),
            s if s >= 500 => {
                BillingError::ProviderUnavailable(format!("App Store API returned {}", status))
            }
            _ => BillingError::AppStoreApi(format!("App Store API returned {}: {}", status, text)),
        })
    }
}

#[async_trait]
impl AppStoreApi for AppStoreServerClient {
    async fn fetch_transaction(&self, transaction_id: &str) -> BillingResult<String> {
        if transaction_id.is_empty() || !transaction_id.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(BillingError::InvalidInput(format!(
                "Invalid transaction id: {}",
                transaction_id
            )));
        }
        let url = format!("{}/inApps/v1/transactions/{}", self.base_url, transaction_id);

        let retry_strategy = ExponentialBackoff::from_millis(RETRY_BASE_DELAY_MS)
            .max_delay(RETRY_MAX_DELAY)
            .take(MAX_RETRIES)
            .map(jitter);

        Retry::spawn(retry_strategy, || async {
            let result = self.fetch_once(&url).await;
            match &result {
                Err(e) if e.is_transient() => {
                    tracing::debug!(
                        transaction_id = %transaction_id,
                        error = %e,
                        "Transient App Store API error - will retry"
                    );
                    Err(result)
                }
                _ => Ok(result),
            }
        })
        .await
        .unwrap_or_else(|e| e)
    }
}
