//! Error types shared across the gateway crates

use thiserror::Error;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Main error type for configuration and bootstrap failures
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Missing required environment variable: {0}")]
    MissingVariable(String),

    #[error("Invalid value for {name}: {value:?} ({reason})")]
    InvalidVariable {
        name: String,
        value: String,
        reason: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl GatewayError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid variable error
    pub fn invalid_variable(
        name: impl Into<String>,
        value: impl Into<String>,
        reason: impl ToString,
    ) -> Self {
        Self::InvalidVariable {
            name: name.into(),
            value: value.into(),
            reason: reason.to_string(),
        }
    }
}
