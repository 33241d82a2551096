//! Reverse proxy for the gateway's upstream components
//!
//! Every component is mounted under a path prefix. Requests have the prefix
//! stripped, are rewritten onto the component's origin and are sent through
//! the audit transport, which owns the upstream deadline.

mod forwarder;

pub use forwarder::{ForwarderError, HttpForwarder};

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{HeaderMap, HeaderValue, Uri},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use tower::{Service, ServiceExt};
use tracing::debug;
use uuid::Uuid;

use crate::audit::models::{CORRELATION_HEADER_NAMES, REQUEST_ID_HEADER};
use crate::error::TransportError;

/// One proxied component
pub struct ReverseProxy<S> {
    prefix: String,
    origin: String,
    transport: S,
}

impl<S> ReverseProxy<S> {
    pub fn new(prefix: &str, origin: &str, transport: S) -> Self {
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
            origin: origin.trim_end_matches('/').to_string(),
            transport,
        }
    }

    /// Map a gateway URI onto the component's origin, dropping the prefix
    pub fn target_uri(&self, uri: &Uri) -> Result<Uri, TransportError> {
        let path = uri.path();
        let rest = path.strip_prefix(self.prefix.as_str()).unwrap_or(path);
        let rest = if rest.starts_with('/') {
            rest.to_string()
        } else {
            format!("/{rest}")
        };

        let target = match uri.query() {
            Some(query) => format!("{}{}?{}", self.origin, rest, query),
            None => format!("{}{}", self.origin, rest),
        };

        target
            .parse()
            .map_err(|e: axum::http::uri::InvalidUri| TransportError::Forward(e.into()))
    }
}

/// Mount `proxy` under its prefix
pub fn router<S>(proxy: ReverseProxy<S>) -> Router
where
    S: Service<Request, Response = Response, Error = TransportError> + Clone + Send + Sync + 'static,
    S::Future: Send + 'static,
{
    let prefix = proxy.prefix.clone();
    Router::new()
        .route(&prefix, any(proxy_handler::<S>))
        .route(&format!("{prefix}/*rest"), any(proxy_handler::<S>))
        .with_state(Arc::new(proxy))
}

async fn proxy_handler<S>(State(proxy): State<Arc<ReverseProxy<S>>>, mut request: Request) -> Response
where
    S: Service<Request, Response = Response, Error = TransportError> + Clone + Send + Sync + 'static,
    S::Future: Send + 'static,
{
    let target = match proxy.target_uri(request.uri()) {
        Ok(target) => target,
        Err(e) => return e.into_response(),
    };
    debug!(from = %request.uri(), to = %target, "Proxying request");
    *request.uri_mut() = target;
    ensure_request_id(request.headers_mut());

    match proxy.transport.clone().oneshot(request).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

/// Attach a generated `x-request-id` unless the request already carries a
/// correlation ID
pub fn ensure_request_id(headers: &mut HeaderMap) {
    if CORRELATION_HEADER_NAMES
        .iter()
        .any(|name| headers.contains_key(*name))
    {
        return;
    }

    if let Ok(value) = HeaderValue::from_str(&Uuid::new_v4().to_string()) {
        headers.insert(REQUEST_ID_HEADER, value);
    }
}
