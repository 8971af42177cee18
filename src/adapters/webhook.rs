//! Hardened outbound webhook calls.
//!
//! Every call is vetted by the URL policy, deduplicated through the
//! idempotency ledger and gated by the circuit breaker for its host:
//!
//! ```text
//! ledger.run(key, || breakers.call("webhook:<host>", || http(url, payload)))
//! ```
//!
//! The idempotency key is derived from the URL and the canonical payload,
//! so an identical retry is suppressed while a different payload to the
//! same URL is an independent operation.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::core::breaker::CircuitBreakerRegistry;
use crate::core::error::GuardError;
use crate::core::ledger::{IdempotencyLedger, IdempotencyOptions, Idempotent};
use crate::core::safety::UrlPolicy;
use crate::domain::{canonical_json, hash_input};

/// Header carrying the derived key so the receiver can deduplicate too
pub const IDEMPOTENCY_HEADER: &str = "X-Idempotency-Key";

/// Bytes of an error response body kept in [`GuardError::Http`]
const ERROR_BODY_LIMIT: usize = 2048;

/// Bytes kept in the preview of a summarized response
const PREVIEW_BYTES: usize = 1024;

/// Webhook client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSettings {
    /// Request timeout (default: 15s)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Responses larger than this are summarized before storage (default: 32KB)
    #[serde(default = "default_max_snapshot_bytes")]
    pub max_snapshot_bytes: usize,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_timeout_ms() -> u64 {
    15_000
}

fn default_max_snapshot_bytes() -> usize {
    32 * 1024
}

fn default_user_agent() -> String {
    format!("hookguard/{}", env!("CARGO_PKG_VERSION"))
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            max_snapshot_bytes: default_max_snapshot_bytes(),
            user_agent: default_user_agent(),
        }
    }
}

impl WebhookSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Supported request methods
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    #[default]
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }

    /// Whether the payload travels as a request body
    pub fn sends_body(&self) -> bool {
        !matches!(self, Self::Get)
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            other => Err(format!("unsupported method: {}", other)),
        }
    }
}

/// Per-call options
#[derive(Debug, Clone, Default)]
pub struct WebhookOptions {
    pub method: HttpMethod,

    /// Extra request headers
    pub headers: Vec<(String, String)>,

    /// Override the configured request timeout
    pub timeout: Option<Duration>,

    /// Override the ledger TTL for this call
    pub ttl: Option<Duration>,

    /// Send even if an identical call already completed
    pub force_retry: bool,
}

impl WebhookOptions {
    pub fn with_method(mut self, method: HttpMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// A fully prepared request handed to the transport
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: HttpMethod,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    /// JSON body, absent for GET
    pub body: Option<String>,
    pub timeout: Duration,
}

/// Status and body as received
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
}

/// Performs the actual network call
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: OutboundRequest) -> Result<RawResponse, GuardError>;
}

/// reqwest client with redirects disabled and certificate validation on
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(settings: &WebhookSettings) -> Result<Self, GuardError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(false)
            .timeout(settings.timeout())
            .user_agent(settings.user_agent.clone())
            .build()
            .map_err(|e| GuardError::Transport(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: OutboundRequest) -> Result<RawResponse, GuardError> {
        let method = match request.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        };

        let mut builder = self
            .client
            .request(method, request.url)
            .timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                GuardError::Timeout {
                    elapsed_ms: request.timeout.as_millis() as u64,
                    limit_ms: request.timeout.as_millis() as u64,
                }
            } else {
                GuardError::Transport(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| GuardError::Transport(format!("Failed to read response body: {}", e)))?;

        Ok(RawResponse { status, body })
    }
}

/// Result of a webhook call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookResponse {
    pub success: bool,

    /// Decoded JSON, raw text, or a summary when the body was large
    pub data: Value,

    pub status_code: u16,
    pub response_time_ms: u64,

    /// True when an identical earlier call was returned instead
    #[serde(default)]
    pub deduplicated: bool,
}

/// Idempotency key for a URL and payload
pub fn webhook_idempotency_key(url: &str, payload: &Value) -> String {
    let material = format!("{}\n{}", url, canonical_json(payload));
    format!("webhook_{}", hash_input(&material))
}

/// Circuit key for a target URL (one circuit per host)
pub fn circuit_key(url: &Url) -> String {
    format!("webhook:{}", url.host_str().unwrap_or("unknown"))
}

/// Secure webhook executor
#[derive(Clone)]
pub struct WebhookExecutor {
    ledger: IdempotencyLedger,
    breakers: CircuitBreakerRegistry,
    policy: UrlPolicy,
    settings: WebhookSettings,
    transport: Arc<dyn HttpTransport>,
}

impl WebhookExecutor {
    pub fn new(
        ledger: IdempotencyLedger,
        breakers: CircuitBreakerRegistry,
        policy: UrlPolicy,
        settings: WebhookSettings,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        Self {
            ledger,
            breakers,
            policy,
            settings,
            transport,
        }
    }

    pub fn policy(&self) -> &UrlPolicy {
        &self.policy
    }

    /// Send `payload` to `url` at most once per TTL window.
    ///
    /// Policy violations fail with [`GuardError::Security`] before any
    /// network activity. A repeated identical call returns the stored
    /// response with `deduplicated: true`.
    #[instrument(skip(self, payload, options), fields(method = %options.method))]
    pub async fn execute(
        &self,
        url: &str,
        payload: &Value,
        options: WebhookOptions,
    ) -> Result<WebhookResponse, GuardError> {
        let target = self.policy.validate_url(url)?;
        let body = serde_json::to_string(payload)?;
        self.policy.validate_payload(&body)?;

        let key = webhook_idempotency_key(target.as_str(), payload);
        let service = circuit_key(&target);
        let timeout = options.timeout.unwrap_or_else(|| self.settings.timeout());

        let mut headers = options.headers;
        headers.push((IDEMPOTENCY_HEADER.to_string(), key.clone()));

        let request = OutboundRequest {
            method: options.method,
            url: target,
            headers,
            body: options.method.sends_body().then_some(body),
            timeout,
        };

        let ledger_options = IdempotencyOptions {
            ttl: options.ttl,
            force_retry: options.force_retry,
            timeout: None,
        };

        let service = service.as_str();
        let outcome = self
            .ledger
            .run(&key, ledger_options, move || {
                self.breakers
                    .call(service, move || self.dispatch(request))
            })
            .await?;

        match outcome {
            Idempotent::Executed(response) => Ok(response),
            Idempotent::Skipped { value, completed_at, .. } => {
                info!(%key, %completed_at, "Webhook already delivered, returning stored response");
                Ok(WebhookResponse {
                    deduplicated: true,
                    ..value
                })
            }
        }
    }

    async fn dispatch(&self, request: OutboundRequest) -> Result<WebhookResponse, GuardError> {
        let limit = request.timeout;
        let started = Instant::now();
        debug!(url = %request.url, "Sending webhook");

        let raw = match tokio::time::timeout(limit, self.transport.send(request)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(GuardError::Timeout {
                    elapsed_ms: started.elapsed().as_millis() as u64,
                    limit_ms: limit.as_millis() as u64,
                })
            }
        };
        let response_time_ms = started.elapsed().as_millis() as u64;

        if raw.status >= 400 {
            warn!(status = raw.status, response_time_ms, "Webhook rejected");
            return Err(GuardError::Http {
                status: raw.status,
                body: truncate_utf8(&raw.body, ERROR_BODY_LIMIT).to_string(),
            });
        }

        let data = summarize(decode_body(&raw.body), self.settings.max_snapshot_bytes);
        info!(status = raw.status, response_time_ms, "Webhook delivered");

        Ok(WebhookResponse {
            success: true,
            data,
            status_code: raw.status,
            response_time_ms,
            deduplicated: false,
        })
    }
}

/// JSON if the body parses, otherwise the raw text
fn decode_body(body: &str) -> Value {
    if body.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.to_string()))
}

/// Replace oversized data with a preview so it fits in the ledger
fn summarize(data: Value, max_bytes: usize) -> Value {
    let encoded = match serde_json::to_string(&data) {
        Ok(encoded) => encoded,
        Err(_) => return data,
    };
    if encoded.len() <= max_bytes {
        return data;
    }

    let mut summary = BTreeMap::new();
    summary.insert("truncated".to_string(), Value::Bool(true));
    summary.insert("original_bytes".to_string(), Value::from(encoded.len()));
    summary.insert(
        "preview".to_string(),
        Value::String(truncate_utf8(&encoded, PREVIEW_BYTES.min(max_bytes)).to_string()),
    );
    Value::Object(summary.into_iter().collect())
}

fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_ignores_field_order() {
        let a = webhook_idempotency_key("https://x/hook", &json!({"a": 1, "b": [1, 2]}));
        let b = webhook_idempotency_key("https://x/hook", &json!({"b": [1, 2], "a": 1}));
        assert_eq!(a, b);
        assert!(a.starts_with("webhook_"));
        assert_eq!(a.len(), "webhook_".len() + 32);
    }

    #[test]
    fn test_key_distinguishes_payload_and_url() {
        let base = webhook_idempotency_key("https://x/hook", &json!({"a": 1}));
        assert_ne!(base, webhook_idempotency_key("https://x/hook", &json!({"a": 2})));
        assert_ne!(base, webhook_idempotency_key("https://y/hook", &json!({"a": 1})));
    }

    #[test]
    fn test_circuit_key_per_host() {
        let url = Url::parse("https://hooks.example.com/a/b").unwrap();
        assert_eq!(circuit_key(&url), "webhook:hooks.example.com");
    }

    #[test]
    fn test_decode_body() {
        assert_eq!(decode_body(r#"{"ok":true}"#), json!({"ok": true}));
        assert_eq!(decode_body("Accepted"), json!("Accepted"));
        assert_eq!(decode_body("  "), Value::Null);
    }

    #[test]
    fn test_summarize_large_data() {
        let small = json!({"id": 1});
        assert_eq!(summarize(small.clone(), 100), small);

        let large = Value::String("x".repeat(500));
        let summary = summarize(large, 100);
        assert_eq!(summary["truncated"], json!(true));
        assert_eq!(summary["original_bytes"], json!(502));
        assert_eq!(summary["preview"].as_str().unwrap().len(), 100);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let text = "héllo";
        assert_eq!(truncate_utf8(text, 2), "h");
        assert_eq!(truncate_utf8(text, 3), "hé");
        assert_eq!(truncate_utf8(text, 50), text);
    }

    #[test]
    fn test_method_parsing() {
        assert_eq!("patch".parse::<HttpMethod>().unwrap(), HttpMethod::Patch);
        assert_eq!(HttpMethod::default(), HttpMethod::Post);
        assert!(!HttpMethod::Get.sends_body());
        assert!("TRACE".parse::<HttpMethod>().is_err());
    }
}
