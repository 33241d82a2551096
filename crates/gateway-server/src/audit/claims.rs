//! Bearer token claims extraction
//!
//! Tokens reaching the gateway have already been verified upstream, so the
//! payload segment is decoded without checking the signature.

use axum::http::{header, HeaderMap};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

const BEARER_SCHEME: &str = "bearer";

#[derive(Error, Debug)]
pub enum ClaimsError {
    #[error("no bearer token")]
    MissingToken,

    #[error("failed to parse bearer token: {0}")]
    TokenParse(String),
}

/// Identity attributes of the caller, as asserted by the bearer token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Claims {
    /// External tenant the operation is performed in
    pub tenant: String,
    pub consumer_tenant: String,
    pub scopes: String,
    pub consumer_id: String,
    pub consumer_type: String,
    pub on_behalf_of: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenPayload {
    #[serde(default)]
    tenant: Option<JsonValue>,
    #[serde(default)]
    scopes: Option<JsonValue>,
    #[serde(default, rename = "consumerID")]
    consumer_id: Option<String>,
    #[serde(default)]
    consumer_type: Option<String>,
    #[serde(default)]
    on_behalf_of: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TenantClaim {
    #[serde(default)]
    consumer_tenant: Option<String>,
    #[serde(default)]
    external_tenant: Option<String>,
}

/// Decode the claims carried by the request's `Authorization: Bearer` header.
pub fn extract_claims(headers: &HeaderMap) -> Result<Claims, ClaimsError> {
    let token = bearer_token(headers)?;
    let payload = decode_payload(token)?;
    Ok(payload.into_claims())
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, ClaimsError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .ok_or(ClaimsError::MissingToken)?;

    let token = match value.split_once(' ') {
        Some((scheme, token)) if scheme.eq_ignore_ascii_case(BEARER_SCHEME) => token,
        None if value.eq_ignore_ascii_case(BEARER_SCHEME) => "",
        _ => value,
    };

    let token = token.trim();
    if token.is_empty() {
        return Err(ClaimsError::MissingToken);
    }
    Ok(token)
}

fn decode_payload(token: &str) -> Result<TokenPayload, ClaimsError> {
    let segments: Vec<&str> = token.split('.').collect();
    if segments.len() != 3 {
        return Err(ClaimsError::TokenParse(format!(
            "expected 3 token segments, got {}",
            segments.len()
        )));
    }

    let raw = URL_SAFE_NO_PAD
        .decode(segments[1].trim_end_matches('='))
        .map_err(|e| ClaimsError::TokenParse(format!("payload is not base64url: {e}")))?;

    serde_json::from_slice(&raw)
        .map_err(|e| ClaimsError::TokenParse(format!("payload is not a JSON object: {e}")))
}

impl TokenPayload {
    fn into_claims(self) -> Claims {
        let (tenant, consumer_tenant) = split_tenant(self.tenant);
        Claims {
            tenant,
            consumer_tenant,
            scopes: scopes_string(self.scopes),
            consumer_id: self.consumer_id.unwrap_or_default(),
            consumer_type: self.consumer_type.unwrap_or_default(),
            on_behalf_of: self.on_behalf_of.unwrap_or_default(),
        }
    }
}

/// The tenant claim is either a bare tenant ID or a JSON document (possibly
/// string-encoded) naming the external and consumer tenants.
fn split_tenant(tenant: Option<JsonValue>) -> (String, String) {
    let parsed = match tenant {
        None | Some(JsonValue::Null) => return (String::new(), String::new()),
        Some(JsonValue::String(s)) => match serde_json::from_str::<TenantClaim>(&s) {
            Ok(claim) => claim,
            Err(_) => return (s.clone(), s),
        },
        Some(other) => serde_json::from_value::<TenantClaim>(other).unwrap_or_default(),
    };

    let external = parsed.external_tenant.unwrap_or_default();
    let consumer = parsed.consumer_tenant.unwrap_or_else(|| external.clone());
    (external, consumer)
}

fn scopes_string(scopes: Option<JsonValue>) -> String {
    match scopes {
        Some(JsonValue::String(s)) => s,
        Some(JsonValue::Array(items)) => items
            .iter()
            .filter_map(JsonValue::as_str)
            .collect::<Vec<_>>()
            .join(" "),
        _ => String::new(),
    }
}
