use super::claims::{tests::token_for, Claims};
use super::client::AuditlogError;
use super::models::{AuditlogMessage, CorrelationHeaders};
use super::service::PreAuditlogService;
use super::transport::AuditLayer;
use super::worker::{AuditlogSink, EnqueueError};
use crate::error::TransportError;
use crate::metrics::{AuditlogMetrics, MetricsRegistry};
use crate::proxy::{router, ReverseProxy};
use async_trait::async_trait;
use axum::{
    body::{Body, Bytes},
    extract::Request,
    http::{header, Method, StatusCode},
    response::Response,
};
use http_body::Frame;
use http_body_util::BodyExt;
use serde_json::json;
use std::convert::Infallible;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tower::{service_fn, BoxError, Layer, ServiceExt};

type Events = Arc<Mutex<Vec<String>>>;

const RESPONSE_BODY: &str = r#"{"data":{"registerRuntime":{"id":"r-1"}}}"#;

struct RecordingPreLog {
    events: Events,
    fail: bool,
}

#[async_trait]
impl PreAuditlogService for RecordingPreLog {
    async fn pre_log(
        &self,
        request: &str,
        claims: &Claims,
        correlation: &CorrelationHeaders,
    ) -> Result<(), AuditlogError> {
        self.events.lock().unwrap().push(format!(
            "pre-log {} {} {}",
            claims.tenant,
            correlation.get("x-request-id").unwrap_or("-"),
            request
        ));
        if self.fail {
            return Err(AuditlogError::Token("audit backend unavailable".to_string()));
        }
        Ok(())
    }
}

#[derive(Default)]
struct RecordingSink {
    messages: Mutex<Vec<AuditlogMessage>>,
    fail: bool,
    /// Time spent waiting for queue room before each message is accepted
    delay: Duration,
}

#[async_trait]
impl AuditlogSink for RecordingSink {
    async fn enqueue(&self, message: AuditlogMessage) -> Result<(), EnqueueError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(EnqueueError::Closed);
        }
        self.messages.lock().unwrap().push(message);
        Ok(())
    }
}

struct Harness {
    events: Events,
    sink: Arc<RecordingSink>,
    layer: AuditLayer,
}

fn harness(fail_pre_log: bool, fail_sink: bool, shard_limit: usize) -> Harness {
    let events: Events = Arc::default();
    let sink = Arc::new(RecordingSink {
        fail: fail_sink,
        ..Default::default()
    });
    let pre_log = Arc::new(RecordingPreLog {
        events: events.clone(),
        fail: fail_pre_log,
    });
    let layer = AuditLayer::new(pre_log, sink.clone(), shard_limit);
    Harness { events, sink, layer }
}

async fn upstream(events: Events, request: Request) -> Result<Response, Infallible> {
    let body = request.into_body().collect().await.unwrap().to_bytes();
    events
        .lock()
        .unwrap()
        .push(format!("forward {}", String::from_utf8_lossy(&body)));
    Ok(Response::new(Body::from(RESPONSE_BODY)))
}

async fn slow_upstream(
    events: Events,
    request: Request,
    delay: Duration,
) -> Result<Response, Infallible> {
    tokio::time::sleep(delay).await;
    upstream(events, request).await
}

/// Body whose first read fails
struct FailingBody;

impl http_body::Body for FailingBody {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Poll::Ready(Some(Err(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "connection reset by peer",
        ))))
    }
}

fn mutation_request(body: &'static str) -> Request {
    let token = token_for(&json!({"tenant": "tenant-a", "consumerID": "c-1"}));
    Request::builder()
        .method(Method::POST)
        .uri("/graphql")
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .header("x-request-id", "req-1")
        .body(Body::from(body))
        .unwrap()
}

async fn body_string(response: Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_pre_log_happens_before_forwarding() {
    let h = harness(false, false, 1000);
    let events = h.events.clone();
    let transport = h.layer.layer(service_fn(move |req| upstream(events.clone(), req)));

    let response = transport
        .oneshot(mutation_request("mutation { registerRuntime }"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, RESPONSE_BODY);

    let events = h.events.lock().unwrap().clone();
    assert_eq!(events.len(), 2);
    assert!(events[0].starts_with("pre-log tenant-a req-1 "));
    assert!(events[0].ends_with(": mutation { registerRuntime }"));
    assert_eq!(events[1], "forward mutation { registerRuntime }");
}

#[tokio::test]
async fn test_request_shards_share_transaction_id() {
    let h = harness(false, false, 10);
    let events = h.events.clone();
    let transport = h.layer.layer(service_fn(move |req| upstream(events.clone(), req)));

    transport
        .oneshot(mutation_request("mutation { registerRuntime }"))
        .await
        .unwrap();

    let events = h.events.lock().unwrap().clone();
    let pre_logs: Vec<&String> = events.iter().filter(|e| e.starts_with("pre-log")).collect();
    assert_eq!(pre_logs.len(), 3);

    let transaction_ids: Vec<&str> = pre_logs
        .iter()
        .map(|e| e.split(' ').nth(3).unwrap().trim_end_matches(':'))
        .collect();
    assert!(transaction_ids.iter().all(|id| *id == transaction_ids[0]));
    assert_eq!(events.last().unwrap(), "forward mutation { registerRuntime }");
}

#[tokio::test]
async fn test_get_request_passes_through() {
    let h = harness(false, false, 1000);
    let events = h.events.clone();
    let transport = h.layer.layer(service_fn(move |req| upstream(events.clone(), req)));

    let request = Request::builder()
        .method(Method::GET)
        .uri("/graphql?query=%7Ba%7D")
        .body(Body::from("ignored"))
        .unwrap();
    let response = transport.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(*h.events.lock().unwrap(), vec!["forward ignored".to_string()]);
    assert!(h.sink.messages.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_bodyless_request_passes_through_without_token() {
    let h = harness(false, false, 1000);
    let events = h.events.clone();
    let transport = h.layer.layer(service_fn(move |req| upstream(events.clone(), req)));

    let request = Request::builder()
        .method(Method::POST)
        .uri("/graphql")
        .body(Body::empty())
        .unwrap();
    let response = transport.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(*h.events.lock().unwrap(), vec!["forward ".to_string()]);
    assert!(h.sink.messages.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_pre_log_failure_is_fail_closed() {
    let h = harness(true, false, 1000);
    let events = h.events.clone();
    let transport = h.layer.layer(service_fn(move |req| upstream(events.clone(), req)));

    let err = transport
        .oneshot(mutation_request("mutation { registerRuntime }"))
        .await
        .unwrap_err();

    assert!(matches!(err, TransportError::PreLog(_)));
    let events = h.events.lock().unwrap().clone();
    assert_eq!(events.len(), 1);
    assert!(events.iter().all(|e| !e.starts_with("forward")));
    assert!(h.sink.messages.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_missing_token_aborts_request() {
    let h = harness(false, false, 1000);
    let events = h.events.clone();
    let transport = h.layer.layer(service_fn(move |req| upstream(events.clone(), req)));

    let request = Request::builder()
        .method(Method::POST)
        .uri("/graphql")
        .body(Body::from("mutation { a }"))
        .unwrap();
    let err = transport.oneshot(request).await.unwrap_err();

    assert!(err.to_string().contains("no bearer token"));
    assert!(h.events.lock().unwrap().is_empty());
    assert!(h.sink.messages.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_response_shards_are_enqueued_in_order() {
    let h = harness(false, false, 16);
    let events = h.events.clone();
    let transport = h.layer.layer(service_fn(move |req| upstream(events.clone(), req)));

    let response = transport
        .oneshot(mutation_request("mutation { registerRuntime }"))
        .await
        .unwrap();
    assert_eq!(body_string(response).await, RESPONSE_BODY);

    let messages = h.sink.messages.lock().unwrap();
    let count = RESPONSE_BODY.len().div_ceil(16);
    assert_eq!(messages.len(), count);

    let transaction_id = messages[0].tag.transaction_id;
    let mut reassembled = String::new();
    for (index, message) in messages.iter().enumerate() {
        assert_eq!(message.tag.index, index);
        assert_eq!(message.tag.count, count);
        assert_eq!(message.tag.transaction_id, transaction_id);
        assert_eq!(message.raw_response, RESPONSE_BODY.as_bytes());
        assert_eq!(&*message.request, "mutation { registerRuntime }");
        // The request spans two shards, so records point at its pre-log entries
        assert_eq!(&*message.logged_request, transaction_id.to_string());
        assert_eq!(message.claims.tenant, "tenant-a");
        assert_eq!(message.correlation_headers.get("x-request-id"), Some("req-1"));

        let prefix = format!("{transaction_id}: ");
        reassembled.push_str(message.response.strip_prefix(&prefix).unwrap());
    }
    assert_eq!(reassembled, RESPONSE_BODY);
}

#[tokio::test]
async fn test_enqueue_failure_does_not_fail_request() {
    let h = harness(false, true, 1000);
    let events = h.events.clone();
    let transport = h.layer.layer(service_fn(move |req| upstream(events.clone(), req)));

    let response = transport
        .oneshot(mutation_request("mutation { registerRuntime }"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, RESPONSE_BODY);
}

#[tokio::test]
async fn test_forward_failure_skips_post_log() {
    let h = harness(false, false, 1000);
    let transport = h.layer.layer(service_fn(|_req: Request| async {
        Err::<Response, BoxError>("connection refused".into())
    }));

    let err = transport
        .oneshot(mutation_request("mutation { registerRuntime }"))
        .await
        .unwrap_err();

    assert!(matches!(err, TransportError::Forward(_)));
    assert_eq!(h.events.lock().unwrap().len(), 1);
    assert!(h.sink.messages.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_single_shard_request_is_logged_verbatim() {
    let h = harness(false, false, 1000);
    let events = h.events.clone();
    let transport = h.layer.layer(service_fn(move |req| upstream(events.clone(), req)));

    transport
        .oneshot(mutation_request("mutation { registerRuntime }"))
        .await
        .unwrap();

    let messages = h.sink.messages.lock().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(&*messages[0].logged_request, "mutation { registerRuntime }");
}

#[tokio::test]
async fn test_request_read_failure_is_reported_before_pre_log() {
    let h = harness(false, false, 1000);
    let events = h.events.clone();
    let transport = h.layer.layer(service_fn(move |req| upstream(events.clone(), req)));

    let token = token_for(&json!({"tenant": "tenant-a"}));
    let request = Request::builder()
        .method(Method::POST)
        .uri("/graphql")
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::new(FailingBody))
        .unwrap();
    let err = transport.oneshot(request).await.unwrap_err();

    assert!(matches!(err, TransportError::RequestRead(_)));
    assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    assert!(h.events.lock().unwrap().is_empty());
    assert!(h.sink.messages.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_response_read_failure_skips_post_log() {
    let h = harness(false, false, 1000);
    let events = h.events.clone();
    let transport = h.layer.layer(service_fn(move |request: Request| {
        let events = events.clone();
        async move {
            upstream(events, request).await?;
            Ok::<_, Infallible>(Response::new(Body::new(FailingBody)))
        }
    }));

    let err = transport
        .oneshot(mutation_request("mutation { registerRuntime }"))
        .await
        .unwrap_err();

    assert!(matches!(err, TransportError::ResponseRead(_)));
    let events = h.events.lock().unwrap().clone();
    assert_eq!(events.len(), 2);
    assert_eq!(events[1], "forward mutation { registerRuntime }");
    assert!(h.sink.messages.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_slow_upstream_times_out_without_post_log() {
    let h = harness(false, false, 1000);
    let events = h.events.clone();
    let transport = h
        .layer
        .with_forward_timeout(Duration::from_secs(5))
        .layer(service_fn(move |req| {
            slow_upstream(events.clone(), req, Duration::from_secs(60))
        }));

    let err = transport
        .oneshot(mutation_request("mutation { registerRuntime }"))
        .await
        .unwrap_err();

    assert!(matches!(err, TransportError::Timeout(d) if d == Duration::from_secs(5)));
    assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(h.events.lock().unwrap().len(), 1);
    assert!(h.sink.messages.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_pass_through_request_is_bounded_by_deadline() {
    let h = harness(false, false, 1000);
    let events = h.events.clone();
    let transport = h
        .layer
        .with_forward_timeout(Duration::from_secs(5))
        .layer(service_fn(move |req| {
            slow_upstream(events.clone(), req, Duration::from_secs(60))
        }));

    let request = Request::builder()
        .method(Method::GET)
        .uri("/graphql")
        .body(Body::empty())
        .unwrap();
    let err = transport.oneshot(request).await.unwrap_err();

    assert!(matches!(err, TransportError::Timeout(_)));
}

#[tokio::test(start_paused = true)]
async fn test_deadline_covers_upstream_only_not_post_log() {
    let events: Events = Arc::default();
    let sink = Arc::new(RecordingSink {
        delay: Duration::from_secs(10),
        ..Default::default()
    });
    let pre_log = Arc::new(RecordingPreLog {
        events: events.clone(),
        fail: false,
    });
    let upstream_events = events.clone();
    let transport = AuditLayer::new(pre_log, sink.clone(), 1000)
        .with_forward_timeout(Duration::from_secs(5))
        .layer(service_fn(move |req| {
            slow_upstream(upstream_events.clone(), req, Duration::from_secs(3))
        }));
    let app = router(ReverseProxy::new("/director", "http://127.0.0.1:3001", transport));

    let mut request = mutation_request("mutation { registerRuntime }");
    *request.uri_mut() = "/director/graphql".parse().unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, RESPONSE_BODY);
    assert_eq!(events.lock().unwrap().len(), 2);
    assert_eq!(sink.messages.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_audited_exchange_outlives_dropped_caller() {
    let h = harness(false, false, 1000);
    let events = h.events.clone();
    let transport = h.layer.layer(service_fn(move |req| {
        slow_upstream(events.clone(), req, Duration::from_secs(3))
    }));

    let call = tokio::spawn(transport.oneshot(mutation_request("mutation { registerRuntime }")));
    tokio::time::sleep(Duration::from_secs(1)).await;
    call.abort();
    tokio::time::sleep(Duration::from_secs(5)).await;

    let events = h.events.lock().unwrap().clone();
    assert_eq!(events.len(), 2);
    assert_eq!(events[1], "forward mutation { registerRuntime }");
    assert_eq!(h.sink.messages.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_enqueue_failure_counts_every_lost_shard() {
    let registry = MetricsRegistry::new().unwrap();
    let h = harness(false, true, 16);
    let events = h.events.clone();
    let transport = h
        .layer
        .with_metrics(AuditlogMetrics::new(&registry.meter()))
        .layer(service_fn(move |req| upstream(events.clone(), req)));

    let response = transport
        .oneshot(mutation_request("mutation { registerRuntime }"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let text = registry.render().unwrap();
    let dropped = text
        .lines()
        .find(|l| l.starts_with("gateway_auditlog_messages_dropped"))
        .unwrap();
    assert!(dropped.contains("reason=\"closed\""));
    assert!(dropped.ends_with(&format!(" {}", RESPONSE_BODY.len().div_ceil(16))));
}
