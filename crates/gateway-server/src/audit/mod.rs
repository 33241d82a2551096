//! Compliance audit logging for proxied GraphQL traffic
//!
//! Every state-changing request passing through the gateway is recorded with
//! an external audit log service.
//!
//! # Architecture
//!
//! - **Pre-log** (fail-closed): the request body is sharded and each shard is
//!   logged synchronously before the request is forwarded. If the audit log
//!   cannot record the intent, the request is rejected.
//! - **Post-log** (fail-open): the response is sharded and queued for a
//!   background worker, which classifies it and delivers a configuration
//!   change or security event. Failures are logged and dropped.
//! - GET and bodyless requests are not audited.
//!
//! # Usage
//!
//! ```no_run
//! use gateway_server::audit::AuditPipeline;
//! use gateway_server::metrics::AuditlogMetrics;
//! use gateway_server::proxy::HttpForwarder;
//! use tokio_util::sync::CancellationToken;
//! use tower::Layer;
//!
//! # async fn example() {
//! let pipeline =
//!     AuditPipeline::from_config(None, CancellationToken::new(), AuditlogMetrics::default())
//!         .unwrap();
//! let transport = pipeline.layer.layer(HttpForwarder::new(reqwest::Client::new()));
//! # }
//! ```

pub mod claims;
pub mod classifier;
pub mod client;
pub mod factory;
pub mod models;
pub mod pipeline;
pub mod service;
pub mod shard;
pub mod transport;
pub mod worker;

#[cfg(test)]
mod transport_tests;

pub use claims::{extract_claims, Claims, ClaimsError};
pub use classifier::{classify, Outcome};
pub use client::{AuditlogClient, AuditlogError, HttpAuditlogClient};
pub use models::{AuditlogMessage, ConfigurationChange, CorrelationHeaders, SecurityEvent};
pub use pipeline::AuditPipeline;
pub use service::{AuditlogService, PostAuditlogService, PreAuditlogService};
pub use transport::{AuditLayer, AuditTransport};
pub use worker::{AuditWorker, AuditlogSink};
