#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Webhook ingestion: insert-first dedupe, signature gate, typed dispatch,
//! and the dead-letter queue. The record is written before anything is
//! verified so that duplicate deliveries cost one indexed lookup and a
//! forged flood cannot buy HMAC work for free.

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

mod ingest;
mod retry;
mod store;

pub use ingest::IngestOutcome;
pub use ingest::WebhookIngestor;
pub use retry::RetryRunStats;
pub use retry::WebhookRetryEngine;
pub use store::InMemoryWebhookStore;
pub use store::InsertOutcome;
pub use store::WebhookStore;

pub type TenantId = String;
pub type WebhookResult<T> = Result<T, WebhookError>;

pub const REASON_INVALID_SIGNATURE: &str = "invalid-signature";

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("invalid payload: {0}")]
    Malformed(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookStatus {
    Received,
    Processing,
    Processed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookRecord {
    pub tenant_id: TenantId,
    pub event_id: String,
    pub event_type: String,
    pub status: WebhookStatus,
    pub attempt_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dead_at: Option<DateTime<Utc>>,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub received_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revived_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revived_by: Option<String>,
}

impl WebhookRecord {
    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.dead_at.is_some()
    }
}

/// Parsed shape of a processor delivery. The `data` bag stays opaque here;
/// handlers normalize it into typed fields at their boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl ProcessorEvent {
    pub fn parse(raw_body: &[u8]) -> WebhookResult<Self> {
        let event: ProcessorEvent = serde_json::from_slice(raw_body)
            .map_err(|err| WebhookError::Malformed(format!("event body: {err}")))?;
        if event.id.trim().is_empty() {
            return Err(WebhookError::Malformed("event id is empty".into()));
        }
        if event.event_type.trim().is_empty() {
            return Err(WebhookError::Malformed("event type is empty".into()));
        }
        Ok(event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    PaymentSucceeded,
    PaymentFailed,
    Refund,
    Dispute,
    Subscription,
    Unknown,
}

#[must_use]
pub fn classify(event_type: &str) -> EventKind {
    match event_type {
        "payments.payment.succeeded" => EventKind::PaymentSucceeded,
        "payments.payment.failed" => EventKind::PaymentFailed,
        _ if event_type.starts_with("payments.refund.") => EventKind::Refund,
        _ if event_type.starts_with("payments.dispute.") => EventKind::Dispute,
        _ if event_type.starts_with("subscription.") => EventKind::Subscription,
        _ => EventKind::Unknown,
    }
}

/// Error surfaced by a domain handler. `retriable` routes the record to the
/// backoff ladder versus straight to failure accounting.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct HandlerError {
    pub code: String,
    pub message: String,
    pub retriable: bool,
}

impl HandlerError {
    #[must_use]
    pub fn retriable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retriable: true,
        }
    }

    #[must_use]
    pub fn permanent(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retriable: false,
        }
    }
}

/// Implemented by the command layer; the ingestor owns ordering, dedupe,
/// and retry accounting, the handler owns domain semantics.
#[async_trait::async_trait]
pub trait WebhookHandler: Send + Sync {
    async fn handle(&self, tenant: &TenantId, event: &ProcessorEvent) -> Result<(), HandlerError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn classification_covers_documented_types() {
        assert_eq!(classify("payments.payment.succeeded"), EventKind::PaymentSucceeded);
        assert_eq!(classify("payments.payment.failed"), EventKind::PaymentFailed);
        assert_eq!(classify("payments.refund.succeeded"), EventKind::Refund);
        assert_eq!(classify("payments.refund.failed"), EventKind::Refund);
        assert_eq!(classify("payments.dispute.opened"), EventKind::Dispute);
        assert_eq!(classify("payments.dispute.closed_lost"), EventKind::Dispute);
        assert_eq!(classify("subscription.updated"), EventKind::Subscription);
        assert_eq!(classify("payments.payout.settled"), EventKind::Unknown);
        assert_eq!(classify(""), EventKind::Unknown);
    }

    #[test]
    fn event_parse_rejects_structural_defects() {
        assert!(ProcessorEvent::parse(b"not json").is_err());
        assert!(ProcessorEvent::parse(br#"{"id":"","type":"x","occurred_at":"2025-06-01T00:00:00Z"}"#).is_err());
        assert!(ProcessorEvent::parse(br#"{"id":"evt_1","type":" ","occurred_at":"2025-06-01T00:00:00Z"}"#).is_err());

        let event = ProcessorEvent::parse(
            br#"{"id":"evt_1","type":"payments.payment.succeeded","occurred_at":"2025-06-01T00:00:00Z","data":{"amount_cents":9900}}"#,
        )
        .expect("valid event");
        assert_eq!(event.id, "evt_1");
        assert_eq!(classify(&event.event_type), EventKind::PaymentSucceeded);
    }
}
