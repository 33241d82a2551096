//! Gateway error types

use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tokio::task::JoinError;
use tower::BoxError;

use crate::audit::claims::ClaimsError;
use crate::audit::client::AuditlogError;
use crate::audit::shard::ShardError;

/// Failures of a proxied call that reach the caller
#[derive(Error, Debug)]
pub enum TransportError {
    #[error(transparent)]
    Claims(#[from] ClaimsError),

    #[error("failed to shard payload: {0}")]
    Sharding(#[from] ShardError),

    #[error("failed to read request body: {0}")]
    RequestRead(String),

    #[error("failed to pre-log request: {0}")]
    PreLog(#[source] AuditlogError),

    #[error("failed to forward request: {0}")]
    Forward(#[source] BoxError),

    #[error("failed to read response body: {0}")]
    ResponseRead(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("audited exchange aborted: {0}")]
    Aborted(#[from] JoinError),
}

impl TransportError {
    pub fn status(&self) -> StatusCode {
        match self {
            TransportError::Claims(_) => StatusCode::UNAUTHORIZED,
            TransportError::RequestRead(_) => StatusCode::BAD_REQUEST,
            TransportError::PreLog(_) | TransportError::Timeout(_) => StatusCode::SERVICE_UNAVAILABLE,
            TransportError::Forward(_) | TransportError::ResponseRead(_) => StatusCode::BAD_GATEWAY,
            TransportError::Sharding(_) | TransportError::Aborted(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            },
        }
    }
}

impl IntoResponse for TransportError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self {
            TransportError::PreLog(ref e) => {
                tracing::error!(error = %e, "Pre-log failed, request not forwarded");
                "Audit log unavailable".to_string()
            },
            TransportError::Forward(ref e) => {
                tracing::error!(error = %e, "Upstream request failed");
                "Upstream request failed".to_string()
            },
            TransportError::Sharding(ref e) => {
                tracing::error!(error = %e, "Sharding error");
                "Server configuration error".to_string()
            },
            TransportError::Aborted(ref e) => {
                tracing::error!(error = %e, "Audited exchange aborted");
                "Internal server error".to_string()
            },
            ref other => {
                tracing::warn!(error = %other, status = %status, "Request rejected");
                other.to_string()
            },
        };

        let body = Json(json!({
            "error": {
                "message": message,
                "status": status.as_u16(),
            }
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_json(error: TransportError) -> (StatusCode, serde_json::Value) {
        let response = error.into_response();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_missing_token_is_unauthorized() {
        let (status, body) = body_json(ClaimsError::MissingToken.into()).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["message"], "no bearer token");
        assert_eq!(body["error"]["status"], 401);
    }

    #[tokio::test]
    async fn test_pre_log_failure_hides_backend_details() {
        let error = TransportError::PreLog(AuditlogError::Token("secret detail".to_string()));
        let (status, body) = body_json(error).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"]["message"], "Audit log unavailable");
    }

    #[tokio::test]
    async fn test_aborted_exchange_is_internal_error() {
        let handle = tokio::spawn(std::future::pending::<()>());
        handle.abort();
        let join_error = handle.await.unwrap_err();

        let (status, body) = body_json(join_error.into()).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"]["message"], "Internal server error");
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            TransportError::Forward("refused".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            TransportError::ResponseRead("eof".to_string()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            TransportError::Timeout(Duration::from_secs(1)).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
