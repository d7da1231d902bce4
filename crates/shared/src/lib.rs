#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Kindred Shared Types and Utilities
//!
//! Canonical billing vocabulary and database helpers shared by the billing
//! engine and the API binary.

pub mod db;
pub mod types;

pub use db::*;
pub use types::*;
