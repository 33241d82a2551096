//! HTTP client for the audit log backend
//!
//! Records are POSTed as JSON to two endpoints resolved once at startup. The
//! backend answers `201 Created`; anything else is a delivery error. There is
//! a single attempt per record.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::models::{ConfigurationChange, CorrelationHeaders, SecurityEvent};
use crate::metrics::AuditlogMetrics;

/// Refresh OAuth tokens this long before they expire
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(30);

/// Lifetime assumed for tokens issued without `expires_in`
const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(300);

#[derive(Error, Debug)]
pub enum AuditlogError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("audit log responded with {status}: {body}")]
    UnexpectedStatus { status: StatusCode, body: String },

    #[error("invalid audit log URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("failed to obtain OAuth token: {0}")]
    Token(String),
}

/// Delivery of finished audit records
#[async_trait]
pub trait AuditlogClient: Send + Sync {
    async fn log_configuration_change(
        &self,
        change: &ConfigurationChange,
        correlation: &CorrelationHeaders,
    ) -> Result<(), AuditlogError>;

    async fn log_security_event(
        &self,
        event: &SecurityEvent,
        correlation: &CorrelationHeaders,
    ) -> Result<(), AuditlogError>;
}

/// How requests to the audit backend are authenticated
pub enum AuditlogAuth {
    Basic { user: String, password: String },
    OAuth(OAuthTokenSource),
}

impl AuditlogAuth {
    async fn authorize(&self, request: RequestBuilder) -> Result<RequestBuilder, AuditlogError> {
        match self {
            AuditlogAuth::Basic { user, password } => Ok(request.basic_auth(user, Some(password))),
            AuditlogAuth::OAuth(source) => Ok(request.bearer_auth(source.token().await?)),
        }
    }
}

/// OAuth client-credentials token source with a cached token
pub struct OAuthTokenSource {
    http: Client,
    token_url: Url,
    client_id: String,
    client_secret: String,
    cached: Mutex<Option<CachedToken>>,
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

impl OAuthTokenSource {
    pub fn new(
        http: Client,
        oauth_url: &str,
        token_path: &str,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Result<Self, AuditlogError> {
        Ok(Self {
            http,
            token_url: endpoint(oauth_url, token_path)?,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            cached: Mutex::new(None),
        })
    }

    /// Return the cached token, fetching a new one when it is about to expire
    pub async fn token(&self) -> Result<String, AuditlogError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| Instant::now() < t.refresh_at) {
            return Ok(token.value.clone());
        }

        let token = self.fetch().await?;
        let value = token.value.clone();
        *cached = Some(token);
        Ok(value)
    }

    async fn fetch(&self) -> Result<CachedToken, AuditlogError> {
        debug!(url = %self.token_url, "Fetching audit log OAuth token");

        let response = self
            .http
            .post(self.token_url.clone())
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials"), ("client_id", self.client_id.as_str())])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuditlogError::Token(format!("token endpoint responded with {status}: {body}")));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuditlogError::Token(format!("malformed token response: {e}")))?;

        let lifetime = token
            .expires_in
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TOKEN_LIFETIME);

        Ok(CachedToken {
            value: token.access_token,
            refresh_at: Instant::now() + lifetime.saturating_sub(TOKEN_EXPIRY_MARGIN),
        })
    }
}

/// Audit log client talking to the backend over HTTP
pub struct HttpAuditlogClient {
    http: Client,
    config_url: Url,
    security_url: Url,
    auth: AuditlogAuth,
    metrics: AuditlogMetrics,
}

impl HttpAuditlogClient {
    pub fn new(
        http: Client,
        base_url: &str,
        config_path: &str,
        security_path: &str,
        auth: AuditlogAuth,
    ) -> Result<Self, AuditlogError> {
        Ok(Self {
            http,
            config_url: endpoint(base_url, config_path)?,
            security_url: endpoint(base_url, security_path)?,
            auth,
            metrics: AuditlogMetrics::default(),
        })
    }

    pub fn with_metrics(mut self, metrics: AuditlogMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    async fn post<T: Serialize + Sync>(
        &self,
        kind: &'static str,
        url: &Url,
        record: &T,
        correlation: &CorrelationHeaders,
    ) -> Result<(), AuditlogError> {
        let started = Instant::now();
        let result = self.send(url, record, correlation).await;
        let outcome = if result.is_ok() { "success" } else { "error" };
        self.metrics.record_request(kind, outcome, started.elapsed());
        result
    }

    async fn send<T: Serialize + Sync>(
        &self,
        url: &Url,
        record: &T,
        correlation: &CorrelationHeaders,
    ) -> Result<(), AuditlogError> {
        let mut request = self.http.post(url.clone()).json(record);
        for (name, value) in correlation.iter() {
            request = request.header(name, value);
        }
        let request = self.auth.authorize(request).await?;

        let response = request.send().await?;
        let status = response.status();
        if status != StatusCode::CREATED {
            let body = response.text().await.unwrap_or_default();
            warn!(url = %url, status = %status, "Audit log rejected record");
            return Err(AuditlogError::UnexpectedStatus { status, body });
        }

        Ok(())
    }
}

#[async_trait]
impl AuditlogClient for HttpAuditlogClient {
    async fn log_configuration_change(
        &self,
        change: &ConfigurationChange,
        correlation: &CorrelationHeaders,
    ) -> Result<(), AuditlogError> {
        self.post("configuration_change", &self.config_url, change, correlation)
            .await?;
        debug!(uuid = %change.metadata.uuid, "Configuration change logged");
        Ok(())
    }

    async fn log_security_event(
        &self,
        event: &SecurityEvent,
        correlation: &CorrelationHeaders,
    ) -> Result<(), AuditlogError> {
        self.post("security_event", &self.security_url, event, correlation)
            .await?;
        debug!(uuid = %event.metadata.uuid, "Security event logged");
        Ok(())
    }
}

/// Join `base` and `path` with exactly one slash between them
fn endpoint(base: &str, path: &str) -> Result<Url, AuditlogError> {
    let url = format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    Url::parse(&url).map_err(|e| AuditlogError::InvalidUrl {
        url,
        reason: e.to_string(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::audit::models::{Attribute, AuditlogMetadata};
    use crate::metrics::MetricsRegistry;
    use serde_json::json;
    use wiremock::matchers::{basic_auth, bearer_token, body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const CONFIG_PATH: &str = "/audit-log/v2/configuration-changes";
    const SECURITY_PATH: &str = "/audit-log/v2/security-events";

    fn basic_client(server: &MockServer) -> HttpAuditlogClient {
        HttpAuditlogClient::new(
            Client::new(),
            &server.uri(),
            CONFIG_PATH,
            SECURITY_PATH,
            AuditlogAuth::Basic {
                user: "auditor".to_string(),
                password: "secret".to_string(),
            },
        )
        .unwrap()
    }

    fn change() -> ConfigurationChange {
        ConfigurationChange {
            user: "proxy".to_string(),
            attributes: vec![Attribute::new("request", "tx: mutation {}")],
            metadata: AuditlogMetadata {
                time: "2024-03-15T09:30:05.042Z".to_string(),
                tenant: "tenant-1".to_string(),
                uuid: "uuid-1".to_string(),
            },
            ..Default::default()
        }
    }

    fn correlation() -> CorrelationHeaders {
        let mut headers = CorrelationHeaders::default();
        headers.insert("x-request-id", "req-42");
        headers
    }

    #[tokio::test]
    async fn test_configuration_change_is_posted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(CONFIG_PATH))
            .and(basic_auth("auditor", "secret"))
            .and(header("x-request-id", "req-42"))
            .and(body_partial_json(json!({
                "user": "proxy",
                "uuid": "uuid-1",
                "attributes": [{"name": "request", "old": "", "new": "tx: mutation {}"}]
            })))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        basic_client(&server)
            .log_configuration_change(&change(), &correlation())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_security_event_goes_to_security_path() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(SECURITY_PATH))
            .and(body_partial_json(json!({"data": "{}"})))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let event = SecurityEvent {
            user: "proxy".to_string(),
            data: "{}".to_string(),
            metadata: AuditlogMetadata::default(),
        };

        basic_client(&server)
            .log_security_event(&event, &CorrelationHeaders::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_non_created_status_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("accepted but not created"))
            .mount(&server)
            .await;

        let err = basic_client(&server)
            .log_configuration_change(&change(), &correlation())
            .await
            .unwrap_err();

        match err {
            AuditlogError::UnexpectedStatus { status, body } => {
                assert_eq!(status, StatusCode::OK);
                assert_eq!(body, "accepted but not created");
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_request_latency_is_recorded_per_outcome() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let registry = MetricsRegistry::new().unwrap();
        let client = basic_client(&server).with_metrics(AuditlogMetrics::new(&registry.meter()));
        client
            .log_configuration_change(&change(), &correlation())
            .await
            .unwrap_err();

        let text = registry.render().unwrap();
        assert!(text.lines().any(|l| l.starts_with("gateway_auditlog_request_duration")
            && l.contains("record=\"configuration_change\"")
            && l.contains("outcome=\"error\"")));
    }

    #[tokio::test]
    async fn test_oauth_token_is_fetched_once_and_reused() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .and(basic_auth("client", "client-secret"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"access_token": "tok-1", "expires_in": 3600})),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(CONFIG_PATH))
            .and(bearer_token("tok-1"))
            .respond_with(ResponseTemplate::new(201))
            .expect(2)
            .mount(&server)
            .await;

        let http = Client::new();
        let source =
            OAuthTokenSource::new(http.clone(), &server.uri(), "/oauth/token", "client", "client-secret")
                .unwrap();
        let client = HttpAuditlogClient::new(
            http,
            &format!("{}/", server.uri()),
            CONFIG_PATH,
            SECURITY_PATH,
            AuditlogAuth::OAuth(source),
        )
        .unwrap();

        for _ in 0..2 {
            client
                .log_configuration_change(&change(), &CorrelationHeaders::default())
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_oauth_token_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let source =
            OAuthTokenSource::new(Client::new(), &server.uri(), "oauth/token", "client", "bad").unwrap();

        let err = source.token().await.unwrap_err();
        assert!(matches!(err, AuditlogError::Token(_)));
    }

    #[test]
    fn test_endpoint_joins_with_single_slash() {
        let url = endpoint("http://audit.local/", "/v2/changes").unwrap();
        assert_eq!(url.as_str(), "http://audit.local/v2/changes");
        assert!(endpoint("not a url", "x").is_err());
    }
}
