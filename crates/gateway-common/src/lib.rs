//! Gateway Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared error handling, environment helpers and logging setup for the
//! gateway workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`GatewayError`] and the [`Result`] alias
//! - **Environment**: typed lookups of `APP_*` style variables
//! - **Logging**: tracing subscriber configuration
//!
//! # Example
//!
//! ```no_run
//! use gateway_common::{env, Result};
//!
//! fn channel_size() -> Result<usize> {
//!     env::parse_or("APP_AUDITLOG_CHANNEL_SIZE", 100)
//! }
//! ```

pub mod env;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{GatewayError, Result};
