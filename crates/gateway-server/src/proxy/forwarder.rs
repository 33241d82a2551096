//! Upstream forwarding over reqwest

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use axum::{
    body::Body,
    extract::Request,
    http::{header, HeaderMap},
    response::Response,
};
use http_body_util::BodyExt;
use reqwest::Client;
use thiserror::Error;
use tower::Service;

/// Headers describing a single connection rather than the message
const HOP_BY_HOP_HEADERS: [header::HeaderName; 6] = [
    header::CONNECTION,
    header::HOST,
    header::CONTENT_LENGTH,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::PROXY_AUTHORIZATION,
];

#[derive(Error, Debug)]
pub enum ForwarderError {
    #[error("failed to read request body: {0}")]
    Body(#[from] axum::Error),

    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
}

/// Sends requests with an absolute URI upstream and buffers the response
#[derive(Debug, Clone)]
pub struct HttpForwarder {
    client: Client,
}

impl HttpForwarder {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl Service<Request> for HttpForwarder {
    type Response = Response;
    type Error = ForwarderError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request) -> Self::Future {
        let client = self.client.clone();

        Box::pin(async move {
            let (parts, body) = request.into_parts();
            let body = body.collect().await?.to_bytes();

            let upstream = client
                .request(parts.method, parts.uri.to_string())
                .headers(strip_hop_by_hop(parts.headers))
                .body(body)
                .send()
                .await?;

            let status = upstream.status();
            let headers = strip_hop_by_hop(upstream.headers().clone());
            let body = upstream.bytes().await?;

            let mut response = Response::new(Body::from(body));
            *response.status_mut() = status;
            *response.headers_mut() = headers;
            Ok(response)
        })
    }
}

fn strip_hop_by_hop(mut headers: HeaderMap) -> HeaderMap {
    for name in &HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
    headers
}
