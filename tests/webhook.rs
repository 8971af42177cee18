//! Webhook Integration Tests
//!
//! End-to-end tests of the secure webhook executor against a transport
//! double that counts outbound calls.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hookguard::adapters::{
    webhook_idempotency_key, HttpMethod, HttpTransport, OutboundRequest, RawResponse,
    WebhookExecutor, WebhookOptions,
};
use hookguard::core::{GuardContext, GuardError, GuardSettings, SafetyViolation};
use hookguard::domain::CircuitState;
use hookguard::store::MemoryStore;
use serde_json::json;

/// Transport double: fixed response, counts and records requests
struct CountingTransport {
    calls: AtomicUsize,
    requests: Mutex<Vec<OutboundRequest>>,
    status: u16,
    body: String,
    delay: Option<Duration>,
}

impl CountingTransport {
    fn new(status: u16, body: &str) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            status,
            body: body.to_string(),
            delay: None,
        })
    }

    fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            status: 200,
            body: String::new(),
            delay: Some(delay),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn last_request(&self) -> OutboundRequest {
        self.requests.lock().unwrap().last().cloned().unwrap()
    }
}

#[async_trait]
impl HttpTransport for CountingTransport {
    async fn send(&self, request: OutboundRequest) -> Result<RawResponse, GuardError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(RawResponse {
            status: self.status,
            body: self.body.clone(),
        })
    }
}

fn executor(transport: Arc<CountingTransport>) -> (WebhookExecutor, GuardContext) {
    let context = GuardContext::new(Arc::new(MemoryStore::new()), GuardSettings::default());
    (context.webhooks_with_transport(transport), context)
}

#[tokio::test]
async fn test_identical_payload_sends_once() {
    let transport = CountingTransport::new(200, r#"{"accepted": true, "id": "abc"}"#);
    let (executor, _context) = executor(transport.clone());
    let payload = json!({"a": 1});

    let first = executor
        .execute("https://x/hook", &payload, WebhookOptions::default())
        .await
        .unwrap();
    let second = executor
        .execute("https://x/hook", &payload, WebhookOptions::default())
        .await
        .unwrap();

    assert_eq!(transport.calls(), 1);
    assert!(first.success && second.success);
    assert!(!first.deduplicated);
    assert!(second.deduplicated);
    assert_eq!(first.status_code, 200);
    assert_eq!(second.data, json!({"accepted": true, "id": "abc"}));
}

#[tokio::test]
async fn test_distinct_payloads_are_independent() {
    let transport = CountingTransport::new(202, "");
    let (executor, _context) = executor(transport.clone());

    for id in 0..3 {
        let response = executor
            .execute("https://x/hook", &json!({"id": id}), WebhookOptions::default())
            .await
            .unwrap();
        assert!(!response.deduplicated);
        assert_eq!(response.status_code, 202);
        assert_eq!(response.data, serde_json::Value::Null);
    }

    assert_eq!(transport.calls(), 3);
}

#[tokio::test]
async fn test_request_shape() {
    let transport = CountingTransport::new(200, "ok");
    let (executor, _context) = executor(transport.clone());
    let payload = json!({"b": 2, "a": 1});

    let response = executor
        .execute(
            "https://hooks.example.com/catch",
            &payload,
            WebhookOptions::default()
                .with_method(HttpMethod::Put)
                .with_header("Authorization", "Bearer t0ken"),
        )
        .await
        .unwrap();
    assert_eq!(response.data, json!("ok"));

    let request = transport.last_request();
    assert_eq!(request.method, HttpMethod::Put);
    assert_eq!(request.url.as_str(), "https://hooks.example.com/catch");
    assert_eq!(request.timeout, Duration::from_secs(15));
    assert_eq!(
        serde_json::from_str::<serde_json::Value>(request.body.as_deref().unwrap()).unwrap(),
        payload
    );

    let header = |name: &str| {
        request
            .headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
    };
    assert_eq!(header("Authorization").as_deref(), Some("Bearer t0ken"));
    assert_eq!(
        header("X-Idempotency-Key"),
        Some(webhook_idempotency_key("https://hooks.example.com/catch", &payload))
    );
}

#[tokio::test]
async fn test_get_sends_no_body() {
    let transport = CountingTransport::new(200, "[]");
    let (executor, _context) = executor(transport.clone());

    executor
        .execute(
            "https://x/items",
            &json!({}),
            WebhookOptions::default().with_method(HttpMethod::Get),
        )
        .await
        .unwrap();

    assert!(transport.last_request().body.is_none());
}

#[tokio::test]
async fn test_security_rejection_before_network() {
    let transport = CountingTransport::new(200, "");
    let (executor, _context) = executor(transport.clone());

    for url in [
        "http://x/hook",
        "https://127.0.0.1/hook",
        "https://localhost/hook",
        "https://user:secret@x/hook",
        "file:///etc/passwd",
        "not a url",
    ] {
        let err = executor
            .execute(url, &json!({"a": 1}), WebhookOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GuardError::Security(_)), "{} should be rejected", url);
    }

    assert_eq!(transport.calls(), 0);
}

#[tokio::test]
async fn test_oversized_payload_rejected() {
    let transport = CountingTransport::new(200, "");
    let context = GuardContext::new(Arc::new(MemoryStore::new()), GuardSettings::default());
    let mut settings = context.settings().clone();
    settings.safety.max_payload_bytes = 64;
    let executor = GuardContext::new(context.store().clone(), settings)
        .webhooks_with_transport(transport.clone());

    let err = executor
        .execute(
            "https://x/hook",
            &json!({"blob": "y".repeat(100)}),
            WebhookOptions::default(),
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        GuardError::Security(SafetyViolation::PayloadTooLarge { .. })
    ));
    assert_eq!(transport.calls(), 0);
}

#[tokio::test]
async fn test_http_errors_trip_host_circuit() {
    let transport = CountingTransport::new(503, "maintenance");
    let (executor, context) = executor(transport.clone());

    for attempt in 0..5 {
        let err = executor
            .execute("https://x/hook", &json!({"n": attempt}), WebhookOptions::default())
            .await
            .unwrap_err();
        match err {
            GuardError::Http { status, body } => {
                assert_eq!(status, 503);
                assert_eq!(body, "maintenance");
            }
            other => panic!("Expected Http error, got {:?}", other),
        }
    }
    assert_eq!(transport.calls(), 5);

    let err = executor
        .execute("https://x/hook", &json!({"n": 99}), WebhookOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_circuit_open());
    assert_eq!(transport.calls(), 5);

    let status = context.breakers().status("webhook:x").await.unwrap();
    assert_eq!(status.state, CircuitState::Open);

    // Other hosts keep their own circuit
    executor
        .execute("https://y/hook", &json!({"n": 1}), WebhookOptions::default())
        .await
        .unwrap_err();
    assert_eq!(transport.calls(), 6);
}

#[tokio::test]
async fn test_failed_delivery_is_retried() {
    let failing = CountingTransport::new(500, "oops");
    let context = GuardContext::new(Arc::new(MemoryStore::new()), GuardSettings::default());
    let payload = json!({"order": 42});

    context
        .webhooks_with_transport(failing.clone())
        .execute("https://x/hook", &payload, WebhookOptions::default())
        .await
        .unwrap_err();

    let healthy = CountingTransport::new(200, "{}");
    let response = context
        .webhooks_with_transport(healthy.clone())
        .execute("https://x/hook", &payload, WebhookOptions::default())
        .await
        .unwrap();

    assert!(!response.deduplicated);
    assert_eq!(healthy.calls(), 1);
}

#[tokio::test]
async fn test_slow_endpoint_times_out() {
    let transport = CountingTransport::slow(Duration::from_secs(5));
    let (executor, _context) = executor(transport.clone());

    let err = executor
        .execute(
            "https://x/slow",
            &json!({}),
            WebhookOptions::default().with_timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, GuardError::Timeout { limit_ms: 50, .. }));
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn test_force_retry_sends_again() {
    let transport = CountingTransport::new(200, "{}");
    let (executor, _context) = executor(transport.clone());
    let payload = json!({"a": 1});

    executor
        .execute("https://x/hook", &payload, WebhookOptions::default())
        .await
        .unwrap();
    let forced = executor
        .execute(
            "https://x/hook",
            &payload,
            WebhookOptions {
                force_retry: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert!(!forced.deduplicated);
    assert_eq!(transport.calls(), 2);
}
