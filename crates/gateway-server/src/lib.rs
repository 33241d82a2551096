//! Gateway Server Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! GraphQL gateway that proxies requests to its upstream components and
//! records state-changing operations with an external audit log.
//!
//! - [`audit`]: claims extraction, payload sharding, response classification,
//!   audit log delivery and the audit transport
//! - [`proxy`]: reverse proxy routes and the upstream forwarder
//! - [`config`]: environment configuration
//! - [`metrics`]: audit pipeline metrics and the `/metrics` endpoint

pub mod audit;
pub mod config;
pub mod error;
pub mod metrics;
pub mod middleware;
pub mod proxy;

pub use error::TransportError;
