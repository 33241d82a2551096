//! Audit log service
//!
//! Turns proxied exchanges into audit records and hands them to an
//! [`AuditlogClient`]. Pre-log records document the intent to change state
//! before the request is forwarded; post-log records document the outcome.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info};

use super::claims::Claims;
use super::classifier::{self, ClassificationError, Outcome};
use super::client::{AuditlogClient, AuditlogError};
use super::factory::MessageFactory;
use super::models::{
    Attribute, AuditlogMessage, CorrelationHeaders, Object, SecurityEventData,
};

/// Object name of records written before a request is forwarded
pub const PRE_CHANGE_OBJECT: &str = "pre-change";
/// Object name of records describing a completed change
pub const CONFIG_CHANGE_OBJECT: &str = "Config Change";
/// Object name of security event records
pub const SECURITY_EVENT_OBJECT: &str = "Security Event";

/// Response attribute value for exchanges that left no failed change behind
pub const SUCCESS_RESPONSE: &str = "success";

#[derive(Error, Debug)]
pub enum PostLogError {
    #[error(transparent)]
    Classification(#[from] ClassificationError),

    #[error("failed to deliver audit record: {0}")]
    Delivery(#[from] AuditlogError),

    #[error("failed to encode security event data: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl PostLogError {
    /// Metric label
    pub fn reason(&self) -> &'static str {
        match self {
            PostLogError::Classification(_) => "classification",
            PostLogError::Delivery(_) => "delivery",
            PostLogError::Encoding(_) => "encoding",
        }
    }
}

#[async_trait]
pub trait PreAuditlogService: Send + Sync {
    /// Persist one request shard, already tagged with its transaction ID
    async fn pre_log(
        &self,
        request: &str,
        claims: &Claims,
        correlation: &CorrelationHeaders,
    ) -> Result<(), AuditlogError>;
}

#[async_trait]
pub trait PostAuditlogService: Send + Sync {
    async fn log(&self, message: &AuditlogMessage) -> Result<(), PostLogError>;
}

pub struct AuditlogService {
    client: Arc<dyn AuditlogClient>,
    factory: MessageFactory,
    user: String,
}

impl AuditlogService {
    pub fn new(client: Arc<dyn AuditlogClient>, factory: MessageFactory, user: impl Into<String>) -> Self {
        Self {
            client,
            factory,
            user: user.into(),
        }
    }

    async fn log_change(
        &self,
        message: &AuditlogMessage,
        response: &str,
    ) -> Result<(), PostLogError> {
        let mut change = self.factory.new_configuration_change(&self.user);
        change.object = Object::for_claims(CONFIG_CHANGE_OBJECT, &message.claims);
        change.attributes = vec![
            Attribute::new("request", &*message.logged_request),
            Attribute::new("response", response),
        ];

        self.client
            .log_configuration_change(&change, &message.correlation_headers)
            .await?;
        Ok(())
    }

    async fn log_security_event(&self, message: &AuditlogMessage) -> Result<(), PostLogError> {
        let raw: JsonValue = serde_json::from_slice(&message.raw_response)
            .map_err(ClassificationError::from)?;
        let reason = raw.get("errors").unwrap_or(&JsonValue::Null);
        let object = Object::for_claims(SECURITY_EVENT_OBJECT, &message.claims);

        let mut event = self.factory.new_security_event(&self.user);
        event.data = serde_json::to_string(&SecurityEventData {
            id: &object.id,
            reason,
        })?;

        self.client
            .log_security_event(&event, &message.correlation_headers)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl PreAuditlogService for AuditlogService {
    async fn pre_log(
        &self,
        request: &str,
        claims: &Claims,
        correlation: &CorrelationHeaders,
    ) -> Result<(), AuditlogError> {
        let mut change = self.factory.new_configuration_change(&self.user);
        change.object = Object::for_claims(PRE_CHANGE_OBJECT, claims);
        change.attributes = vec![Attribute::new("request", request)];

        self.client
            .log_configuration_change(&change, correlation)
            .await
    }
}

#[async_trait]
impl PostAuditlogService for AuditlogService {
    async fn log(&self, message: &AuditlogMessage) -> Result<(), PostLogError> {
        let response = classifier::parse_response(&message.raw_response)?;
        let outcome = classifier::classify(&message.request, &response);
        let tag = message.tag;

        debug!(
            transaction_id = %tag.transaction_id,
            shard = tag.index,
            shards = tag.count,
            outcome = ?outcome,
            "Classified proxied response"
        );

        // Only failed mutations carry the response body, so only they need
        // one record per shard.
        match outcome {
            Outcome::MutationFailure => self.log_change(message, &message.response).await,
            _ if !tag.is_first() => Ok(()),
            Outcome::Success | Outcome::ReadFailure => {
                self.log_change(message, SUCCESS_RESPONSE).await
            },
            Outcome::SecurityViolation => {
                info!(
                    transaction_id = %tag.transaction_id,
                    tenant = %message.claims.tenant,
                    consumer_id = %message.claims.consumer_id,
                    "Logging security event for insufficient scopes"
                );
                self.log_security_event(message).await
            },
        }
    }
}

/// Pre-log service used when audit logging is disabled
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpAuditlogService;

#[async_trait]
impl PreAuditlogService for NoOpAuditlogService {
    async fn pre_log(
        &self,
        _request: &str,
        _claims: &Claims,
        _correlation: &CorrelationHeaders,
    ) -> Result<(), AuditlogError> {
        Ok(())
    }
}

#[async_trait]
impl PostAuditlogService for NoOpAuditlogService {
    async fn log(&self, _message: &AuditlogMessage) -> Result<(), PostLogError> {
        Ok(())
    }
}
