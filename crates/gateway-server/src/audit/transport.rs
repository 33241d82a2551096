//! Audit logging transport
//!
//! Wraps the service that forwards requests upstream:
//! - GET and bodyless requests pass through without auditing
//! - Other requests are pre-logged shard by shard before they are forwarded.
//!   A failed pre-log aborts the request
//! - The upstream response is re-buffered, returned unchanged and queued for
//!   post-logging. Queueing failures are only logged
//!
//! The deadline covers the upstream call only. An audited exchange runs on its
//! own task, so once pre-logging has started neither the deadline nor a caller
//! that hangs up can stop it short of post-logging.

use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use axum::{
    body::{Body, Bytes},
    extract::Request,
    http::Method,
    response::Response,
};
use http_body::Body as _;
use http_body_util::BodyExt;
use tower::{BoxError, Layer, Service};
use tracing::{debug, warn};
use uuid::Uuid;

use super::claims::{extract_claims, Claims};
use super::models::{AuditlogMessage, CorrelationHeaders, ShardTag};
use super::service::PreAuditlogService;
use super::shard::shard;
use super::worker::AuditlogSink;
use crate::config::DEFAULT_HANDLER_TIMEOUT_SECS;
use crate::error::TransportError;
use crate::metrics::AuditlogMetrics;

#[derive(Clone)]
struct AuditContext {
    pre_log: Arc<dyn PreAuditlogService>,
    sink: Arc<dyn AuditlogSink>,
    shard_limit: usize,
    forward_timeout: Duration,
    metrics: AuditlogMetrics,
}

/// Audit logging layer
#[derive(Clone)]
pub struct AuditLayer {
    context: AuditContext,
}

impl AuditLayer {
    pub fn new(
        pre_log: Arc<dyn PreAuditlogService>,
        sink: Arc<dyn AuditlogSink>,
        shard_limit: usize,
    ) -> Self {
        Self {
            context: AuditContext {
                pre_log,
                sink,
                shard_limit,
                forward_timeout: Duration::from_secs(DEFAULT_HANDLER_TIMEOUT_SECS),
                metrics: AuditlogMetrics::default(),
            },
        }
    }

    /// Deadline for the upstream call
    pub fn with_forward_timeout(mut self, timeout: Duration) -> Self {
        self.context.forward_timeout = timeout;
        self
    }

    pub fn with_metrics(mut self, metrics: AuditlogMetrics) -> Self {
        self.context.metrics = metrics;
        self
    }
}

impl<S> Layer<S> for AuditLayer {
    type Service = AuditTransport<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuditTransport {
            inner,
            context: self.context.clone(),
        }
    }
}

/// Audit transport service
#[derive(Clone)]
pub struct AuditTransport<S> {
    inner: S,
    context: AuditContext,
}

impl<S> Service<Request> for AuditTransport<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<BoxError> + Send,
{
    type Response = Response;
    type Error = TransportError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner
            .poll_ready(cx)
            .map_err(|e| TransportError::Forward(e.into()))
    }

    fn call(&mut self, request: Request) -> Self::Future {
        // Keep the instance that was polled ready
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);
        let context = self.context.clone();

        Box::pin(async move {
            if *request.method() == Method::GET || request.body().is_end_stream() {
                return forward(inner, request, context.forward_timeout).await;
            }
            tokio::spawn(round_trip(inner, context, request)).await?
        })
    }
}

async fn forward<S>(
    mut inner: S,
    request: Request,
    timeout: Duration,
) -> Result<Response, TransportError>
where
    S: Service<Request, Response = Response>,
    S::Error: Into<BoxError>,
{
    match tokio::time::timeout(timeout, inner.call(request)).await {
        Ok(result) => result.map_err(|e| TransportError::Forward(e.into())),
        Err(_) => Err(TransportError::Timeout(timeout)),
    }
}

async fn round_trip<S>(
    inner: S,
    context: AuditContext,
    request: Request,
) -> Result<Response, TransportError>
where
    S: Service<Request, Response = Response>,
    S::Error: Into<BoxError>,
{
    let (parts, body) = request.into_parts();
    let claims = Arc::new(extract_claims(&parts.headers)?);

    let body = body
        .collect()
        .await
        .map_err(|e| TransportError::RequestRead(e.to_string()))?
        .to_bytes();

    let correlation = CorrelationHeaders::from_headers(&parts.headers);
    let transaction_id = Uuid::new_v4();

    let request_shards = shard(&body, context.shard_limit)?;
    let count = request_shards.len();
    for (index, chunk) in request_shards.into_iter().enumerate() {
        let tag = ShardTag {
            transaction_id,
            index,
            count,
        };
        context
            .pre_log
            .pre_log(&tag.label(&String::from_utf8_lossy(chunk)), &claims, &correlation)
            .await
            .map_err(TransportError::PreLog)?;
    }

    debug!(
        transaction_id = %transaction_id,
        method = %parts.method,
        uri = %parts.uri,
        shards = count,
        "Request pre-logged"
    );

    let request_text: Arc<str> = Arc::from(String::from_utf8_lossy(&body).as_ref());
    let logged_request = if count == 1 {
        request_text.clone()
    } else {
        Arc::from(transaction_id.to_string())
    };
    let request = Request::from_parts(parts, Body::from(body));
    let response = forward(inner, request, context.forward_timeout).await?;

    let (parts, body) = response.into_parts();
    let body = body
        .collect()
        .await
        .map_err(|e| TransportError::ResponseRead(e.to_string()))?
        .to_bytes();

    let request = LoggedRequest {
        text: request_text,
        logged: logged_request,
    };
    post_log(&context, transaction_id, request, &body, claims, correlation).await;

    Ok(Response::from_parts(parts, Body::from(body)))
}

struct LoggedRequest {
    text: Arc<str>,
    logged: Arc<str>,
}

async fn post_log(
    context: &AuditContext,
    transaction_id: Uuid,
    request: LoggedRequest,
    response: &Bytes,
    claims: Arc<Claims>,
    correlation: CorrelationHeaders,
) {
    let shards = match shard(response, context.shard_limit) {
        Ok(shards) => shards,
        Err(e) => {
            warn!(transaction_id = %transaction_id, error = %e, "Response not post-logged");
            context.metrics.record_dropped(1, "sharding");
            return;
        },
    };

    let count = shards.len();
    for (index, chunk) in shards.into_iter().enumerate() {
        let tag = ShardTag {
            transaction_id,
            index,
            count,
        };
        let message = AuditlogMessage {
            correlation_headers: correlation.clone(),
            request: request.text.clone(),
            logged_request: request.logged.clone(),
            response: tag.label(&String::from_utf8_lossy(chunk)),
            raw_response: response.clone(),
            tag,
            claims: claims.clone(),
        };

        // Later shards would only queue behind the same blockage
        match context.sink.enqueue(message).await {
            Ok(()) => context.metrics.record_enqueued(),
            Err(e) => {
                warn!(
                    transaction_id = %transaction_id,
                    shard = index,
                    shards = count,
                    error = %e,
                    "Dropped post-log message"
                );
                context.metrics.record_dropped((count - index) as u64, e.reason());
                return;
            },
        }
    }
}
