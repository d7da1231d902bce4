//! Application state

use std::sync::Arc;

use kindred_billing::BillingService;

use crate::config::ApiConfig;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub billing: BillingService,
    /// Shared secret for `/admin` routes; admin routes answer 404 without it
    pub admin_token: Option<Arc<str>>,
}

impl AppState {
    pub fn new(billing: BillingService, config: &ApiConfig) -> Self {
        if config.admin_token.is_some() {
            tracing::info!("Webhook admin routes enabled");
        } else {
            tracing::warn!("Webhook admin routes disabled (missing ADMIN_TOKEN)");
        }

        Self::with_admin_token(billing, config.admin_token.as_deref())
    }

    pub fn with_admin_token(billing: BillingService, admin_token: Option<&str>) -> Self {
        Self {
            billing,
            admin_token: admin_token.map(Arc::from),
        }
    }
}
