// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Kindred API Library
//!
//! HTTP surface for the billing engine: provider notification endpoints,
//! user-initiated billing operations and webhook admin routes.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

#[cfg(test)]
mod edge_case_tests;

pub use config::{ApiConfig, ConfigError, LogFormat};
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
