//! Configuration management

use std::time::Duration;

use gateway_common::{env, GatewayError, Result};
use serde::{Deserialize, Serialize};

// ============================================================================
// Server Configuration Constants
// ============================================================================

/// Default listen address.
pub const DEFAULT_ADDRESS: &str = "127.0.0.1:3000";

pub const DEFAULT_DIRECTOR_ORIGIN: &str = "http://127.0.0.1:3001";
pub const DEFAULT_CONNECTOR_ORIGIN: &str = "http://127.0.0.1:3002";
pub const DEFAULT_NSADAPTER_ORIGIN: &str = "http://127.0.0.1:3005";

/// Default listen address of the metrics server.
pub const DEFAULT_METRICS_ADDRESS: &str = "127.0.0.1:3003";

/// Default timeout for proxied requests in seconds.
pub const DEFAULT_HANDLER_TIMEOUT_SECS: u64 = 114;

/// Default graceful shutdown timeout in seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 15;

// ============================================================================
// Audit Log Configuration Constants
// ============================================================================

/// Default maximum size in bytes of one logged payload shard.
pub const DEFAULT_MSG_BODY_SIZE_LIMIT: usize = 10_000;

/// Default capacity of the post-log queue.
pub const DEFAULT_CHANNEL_SIZE: usize = 100;

/// Default time a request waits for room in a full post-log queue, in milliseconds.
pub const DEFAULT_CHANNEL_TIMEOUT_MS: u64 = 10_000;

/// Default timeout of calls to the audit backend in seconds.
pub const DEFAULT_CLIENT_TIMEOUT_SECS: u64 = 30;

pub const DEFAULT_CONFIG_PATH: &str = "/audit-log/v2/configuration-changes";
pub const DEFAULT_SECURITY_PATH: &str = "/audit-log/v2/security-events";
pub const DEFAULT_TOKEN_PATH: &str = "/oauth/token";

/// Audit user stamped on records when authenticating with basic auth
pub const BASIC_AUTH_AUDIT_USER: &str = "proxy";

/// Gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    /// Present when audit logging is enabled
    pub auditlog: Option<AuditlogConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub address: String,
    pub director_origin: String,
    pub connector_origin: String,
    pub nsadapter_origin: String,
    pub metrics_address: String,
    pub handler_timeout_secs: u64,
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditlogConfig {
    pub url: String,
    pub config_path: String,
    pub security_path: String,
    pub client_timeout_secs: u64,
    pub channel_size: usize,
    pub channel_timeout_ms: u64,
    pub msg_body_size_limit: usize,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum AuthConfig {
    Basic {
        user: String,
        #[serde(skip_serializing)]
        password: String,
        tenant: String,
    },
    #[serde(rename = "oauth")]
    OAuth {
        client_id: String,
        #[serde(skip_serializing)]
        client_secret: String,
        oauth_url: String,
        token_path: String,
        user: String,
        tenant: String,
    },
}

impl ServerConfig {
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl AuditlogConfig {
    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }

    pub fn channel_timeout(&self) -> Duration {
        Duration::from_millis(self.channel_timeout_ms)
    }
}

impl AuthConfig {
    /// Audit user recorded on every record
    pub fn audit_user(&self) -> &str {
        match self {
            AuthConfig::Basic { .. } => BASIC_AUTH_AUDIT_USER,
            AuthConfig::OAuth { user, .. } => user,
        }
    }

    pub fn tenant(&self) -> &str {
        match self {
            AuthConfig::Basic { tenant, .. } | AuthConfig::OAuth { tenant, .. } => tenant,
        }
    }
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let server = ServerConfig {
            address: env::string_or("APP_ADDRESS", DEFAULT_ADDRESS),
            director_origin: env::string_or("APP_DIRECTOR_ORIGIN", DEFAULT_DIRECTOR_ORIGIN),
            connector_origin: env::string_or("APP_CONNECTOR_ORIGIN", DEFAULT_CONNECTOR_ORIGIN),
            nsadapter_origin: env::string_or("APP_NSADAPTER_ORIGIN", DEFAULT_NSADAPTER_ORIGIN),
            metrics_address: env::string_or("APP_METRICS_ADDRESS", DEFAULT_METRICS_ADDRESS),
            handler_timeout_secs: env::parse_or(
                "APP_DEFAULT_HANDLERS_TIMEOUT",
                DEFAULT_HANDLER_TIMEOUT_SECS,
            )?,
            shutdown_timeout_secs: env::parse_or(
                "APP_SHUTDOWN_TIMEOUT",
                DEFAULT_SHUTDOWN_TIMEOUT_SECS,
            )?,
        };

        let auditlog = if env::parse_or("APP_AUDITLOG_ENABLED", false)? {
            Some(AuditlogConfig::load()?)
        } else {
            None
        };

        let config = Config { server, auditlog };
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.address.trim().is_empty() {
            return Err(GatewayError::config("Listen address cannot be empty"));
        }

        if self.server.metrics_address == self.server.address {
            return Err(GatewayError::config(
                "Metrics address must differ from the listen address",
            ));
        }

        for (name, origin) in [
            ("director", &self.server.director_origin),
            ("connector", &self.server.connector_origin),
            ("nsadapter", &self.server.nsadapter_origin),
        ] {
            if !origin.starts_with("http://") && !origin.starts_with("https://") {
                return Err(GatewayError::config(format!(
                    "The {name} origin must be an http(s) URL, got '{origin}'"
                )));
            }
        }

        if self.server.handler_timeout_secs == 0 {
            return Err(GatewayError::config("Handler timeout must be greater than 0"));
        }

        if let Some(auditlog) = &self.auditlog {
            auditlog.validate()?;
        }

        Ok(())
    }
}

impl AuditlogConfig {
    fn load() -> Result<Self> {
        let mode = env::string_or("APP_AUDITLOG_AUTH_MODE", "basic");
        let auth = match mode.trim().to_ascii_lowercase().as_str() {
            "basic" => AuthConfig::Basic {
                user: env::required("APP_AUDITLOG_USER")?,
                password: env::required("APP_AUDITLOG_PASSWORD")?,
                tenant: env::required("APP_AUDITLOG_TENANT")?,
            },
            "oauth" => AuthConfig::OAuth {
                client_id: env::required("APP_AUDITLOG_CLIENT_ID")?,
                client_secret: env::required("APP_AUDITLOG_CLIENT_SECRET")?,
                oauth_url: env::required("APP_AUDITLOG_OAUTH_URL")?,
                token_path: env::string_or("APP_AUDITLOG_TOKEN_PATH", DEFAULT_TOKEN_PATH),
                user: env::required("APP_AUDITLOG_OAUTH_USER")?,
                tenant: env::required("APP_AUDITLOG_OAUTH_TENANT")?,
            },
            other => {
                return Err(GatewayError::invalid_variable(
                    "APP_AUDITLOG_AUTH_MODE",
                    other,
                    "expected 'basic' or 'oauth'",
                ))
            },
        };

        Ok(Self {
            url: env::required("APP_AUDITLOG_URL")?,
            config_path: env::string_or("APP_AUDITLOG_CONFIG_PATH", DEFAULT_CONFIG_PATH),
            security_path: env::string_or("APP_AUDITLOG_SECURITY_PATH", DEFAULT_SECURITY_PATH),
            client_timeout_secs: env::parse_or(
                "APP_AUDITLOG_CLIENT_TIMEOUT",
                DEFAULT_CLIENT_TIMEOUT_SECS,
            )?,
            channel_size: env::parse_or("APP_AUDITLOG_CHANNEL_SIZE", DEFAULT_CHANNEL_SIZE)?,
            channel_timeout_ms: env::parse_or(
                "APP_AUDITLOG_CHANNEL_TIMEOUT",
                DEFAULT_CHANNEL_TIMEOUT_MS,
            )?,
            msg_body_size_limit: env::parse_or(
                "APP_AUDIT_LOG_MSG_BODY_SIZE_LIMIT",
                DEFAULT_MSG_BODY_SIZE_LIMIT,
            )?,
            auth,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.msg_body_size_limit == 0 {
            return Err(GatewayError::config(
                "Audit log message body size limit must be greater than 0",
            ));
        }

        if self.channel_size == 0 {
            return Err(GatewayError::config("Audit log channel size must be greater than 0"));
        }

        if self.client_timeout_secs == 0 {
            return Err(GatewayError::config("Audit log client timeout must be greater than 0"));
        }

        if !self.url.starts_with("http://") && !self.url.starts_with("https://") {
            return Err(GatewayError::config(format!(
                "Audit log URL must be an http(s) URL, got '{}'",
                self.url
            )));
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                address: DEFAULT_ADDRESS.to_string(),
                director_origin: DEFAULT_DIRECTOR_ORIGIN.to_string(),
                connector_origin: DEFAULT_CONNECTOR_ORIGIN.to_string(),
                nsadapter_origin: DEFAULT_NSADAPTER_ORIGIN.to_string(),
                metrics_address: DEFAULT_METRICS_ADDRESS.to_string(),
                handler_timeout_secs: DEFAULT_HANDLER_TIMEOUT_SECS,
                shutdown_timeout_secs: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
            },
            auditlog: None,
        }
    }
}
