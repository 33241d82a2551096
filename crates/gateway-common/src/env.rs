//! Typed environment variable lookups
//!
//! Unset variables fall back to defaults; set but malformed variables are
//! reported instead of silently ignored.

use crate::error::{GatewayError, Result};
use std::str::FromStr;

/// Read a string variable, falling back to `default` when unset.
pub fn string_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

/// Read a string variable that must be present and non-empty.
pub fn required(name: &str) -> Result<String> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(GatewayError::MissingVariable(name.to_string())),
    }
}

/// Parse a variable into `T`, falling back to `default` when unset.
pub fn parse_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| GatewayError::invalid_variable(name, raw.clone(), e)),
        Err(_) => Ok(default),
    }
}
