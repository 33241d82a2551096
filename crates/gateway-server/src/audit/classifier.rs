//! GraphQL response classification
//!
//! Decides how a proxied GraphQL exchange is reported to the audit backend:
//!
//! - no errors: a successful change
//! - an insufficient-scope error: a security event
//! - a failed top-level mutation field (error path of length 1): a failed change,
//!   reported with the response body
//! - anything else (failed queries, nested failures inside an otherwise
//!   successful mutation): reported as success, since nothing was persisted in
//!   a bad state

use serde::Deserialize;
use thiserror::Error;

use super::models::GraphqlResponse;

/// Error message fragment marking an authorization violation
pub const INSUFFICIENT_SCOPES: &str = "insufficient scopes provided";

#[derive(Error, Debug)]
pub enum ClassificationError {
    #[error("malformed GraphQL response: {0}")]
    MalformedResponse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    SecurityViolation,
    MutationFailure,
    ReadFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Query,
    Mutation,
}

#[derive(Deserialize)]
struct WrappedOperation {
    query: String,
}

pub fn parse_response(body: &[u8]) -> Result<GraphqlResponse, ClassificationError> {
    Ok(serde_json::from_slice(body)?)
}

pub fn classify(request: &str, response: &GraphqlResponse) -> Outcome {
    if response.errors.is_empty() {
        return Outcome::Success;
    }

    if response
        .errors
        .iter()
        .any(|e| e.message.contains(INSUFFICIENT_SCOPES))
    {
        return Outcome::SecurityViolation;
    }

    match operation_kind(request) {
        Some(Operation::Mutation) if response.errors.iter().any(|e| e.path.len() == 1) => {
            Outcome::MutationFailure
        },
        _ => Outcome::ReadFailure,
    }
}

/// Determine the operation type of a raw GraphQL request, which is either
/// bare GraphQL text or a JSON document carrying it under `query`.
pub fn operation_kind(request: &str) -> Option<Operation> {
    let request = request.trim();

    if request.starts_with("mutation") {
        return Some(Operation::Mutation);
    }
    if request.starts_with("query") || (request.starts_with('{') && !looks_like_json(request)) {
        return Some(Operation::Query);
    }

    let wrapped: WrappedOperation = serde_json::from_str(request).ok()?;
    let inner = wrapped.query.trim();
    if inner.is_empty() || inner.len() >= request.len() {
        return None;
    }
    operation_kind(inner)
}

/// Whether a `{`-prefixed request is a JSON document rather than a shorthand
/// GraphQL selection set such as `{ applications { id } }`
fn looks_like_json(request: &str) -> bool {
    request[1..].trim_start().starts_with('"')
}
