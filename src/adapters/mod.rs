//! Adapters for external systems.
//!
//! Outbound integrations go through the coordination layer in
//! [`crate::core`] rather than calling the network directly.

pub mod webhook;

// Re-export the webhook executor
pub use webhook::{
    webhook_idempotency_key, HttpMethod, HttpTransport, OutboundRequest, RawResponse,
    ReqwestTransport, WebhookExecutor, WebhookOptions, WebhookResponse, WebhookSettings,
};
