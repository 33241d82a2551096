//! Audit record envelopes
//!
//! Every record gets its own UUID and timestamp. Both sources are injected so
//! tests can assert exact envelopes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::models::{AuditlogMetadata, ConfigurationChange, SecurityEvent};

/// Timestamp layout expected by the audit backend
pub const AUDITLOG_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

pub trait UuidService: Send + Sync {
    fn generate(&self) -> String;
}

pub trait TimeService: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RandomUuidService;

impl UuidService for RandomUuidService {
    fn generate(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeService;

impl TimeService for SystemTimeService {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Builds record envelopes stamped with the configured tenant
#[derive(Clone)]
pub struct MessageFactory {
    tenant: String,
    uuid: Arc<dyn UuidService>,
    time: Arc<dyn TimeService>,
}

impl MessageFactory {
    pub fn new(
        tenant: impl Into<String>,
        uuid: Arc<dyn UuidService>,
        time: Arc<dyn TimeService>,
    ) -> Self {
        Self {
            tenant: tenant.into(),
            uuid,
            time,
        }
    }

    /// Factory using random UUIDs and the system clock
    pub fn system(tenant: impl Into<String>) -> Self {
        Self::new(tenant, Arc::new(RandomUuidService), Arc::new(SystemTimeService))
    }

    pub fn new_configuration_change(&self, user: &str) -> ConfigurationChange {
        ConfigurationChange {
            user: user.to_string(),
            metadata: self.metadata(),
            ..Default::default()
        }
    }

    pub fn new_security_event(&self, user: &str) -> SecurityEvent {
        SecurityEvent {
            user: user.to_string(),
            data: String::new(),
            metadata: self.metadata(),
        }
    }

    fn metadata(&self) -> AuditlogMetadata {
        AuditlogMetadata {
            time: self.time.now().format(AUDITLOG_TIME_FORMAT).to_string(),
            tenant: self.tenant.clone(),
            uuid: self.uuid.generate(),
        }
    }
}

impl std::fmt::Debug for MessageFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageFactory")
            .field("tenant", &self.tenant)
            .finish_non_exhaustive()
    }
}
