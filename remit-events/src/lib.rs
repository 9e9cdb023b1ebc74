#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Outbound event envelope and publisher contract. Every event the engine
//! emits — GL posting requests, domain notifications like
//! `customer.suspended` — travels in the same envelope so downstream
//! consumers can dedupe on `event_id` and route on the subject.

use std::collections::HashSet;
use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

pub type EventResult<T> = Result<T, EventError>;

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("publish failed: {0}")]
    Publish(String),
}

impl EventError {
    /// Publish failures are transport problems; redelivery is always safe
    /// because consumers dedupe on `event_id`.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(self, EventError::Publish(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedPayload {
    pub schema_version: u32,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: String,
    pub occurred_at: DateTime<Utc>,
    pub tenant_id: String,
    pub source_module: String,
    pub source_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
    pub subject: String,
    pub payload: VersionedPayload,
}

#[must_use]
pub fn subject_for(module: &str, event_type: &str) -> String {
    format!("{module}.events.{event_type}")
}

impl EventEnvelope {
    /// Builds an envelope with a fresh v4 `event_id` and this crate's
    /// version as `source_version`.
    #[must_use]
    pub fn new(
        tenant_id: impl Into<String>,
        source_module: &str,
        event_type: &str,
        payload: VersionedPayload,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            occurred_at: Utc::now(),
            tenant_id: tenant_id.into(),
            source_module: source_module.to_string(),
            source_version: env!("CARGO_PKG_VERSION").to_string(),
            correlation_id: None,
            causation_id: None,
            subject: subject_for(source_module, event_type),
            payload,
        }
    }

    #[must_use]
    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    #[must_use]
    pub fn with_causation(mut self, causation_id: impl Into<String>) -> Self {
        self.causation_id = Some(causation_id.into());
        self
    }
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// At-least-once delivery; callers may re-publish the same `event_id`
    /// after transient failures.
    async fn publish(&self, envelope: EventEnvelope) -> EventResult<()>;
}

/// Publisher used by tests and the demo deployment. Duplicate `event_id`s
/// are accepted but recorded once, mirroring a consumer that dedupes.
#[derive(Default)]
pub struct InMemoryEventPublisher {
    state: Mutex<PublisherState>,
}

#[derive(Default)]
struct PublisherState {
    published: Vec<EventEnvelope>,
    seen_event_ids: HashSet<String>,
    queued_failures: VecDeque<String>,
}

impl InMemoryEventPublisher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a transport failure for the next publish call.
    pub async fn fail_next(&self, reason: impl Into<String>) {
        let mut state = self.state.lock().await;
        state.queued_failures.push_back(reason.into());
    }

    pub async fn published(&self) -> Vec<EventEnvelope> {
        self.state.lock().await.published.clone()
    }

    pub async fn published_on(&self, subject: &str) -> Vec<EventEnvelope> {
        self.state
            .lock()
            .await
            .published
            .iter()
            .filter(|envelope| envelope.subject == subject)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventPublisher {
    async fn publish(&self, envelope: EventEnvelope) -> EventResult<()> {
        let mut state = self.state.lock().await;
        if let Some(reason) = state.queued_failures.pop_front() {
            return Err(EventError::Publish(reason));
        }
        if state.seen_event_ids.insert(envelope.event_id.clone()) {
            state.published.push(envelope);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn envelope() -> EventEnvelope {
        EventEnvelope::new(
            "acme",
            "gl",
            "posting.requested",
            VersionedPayload {
                schema_version: 1,
                data: json!({"posting_event_id": "pe-1"}),
            },
        )
    }

    #[test]
    fn subject_follows_module_events_type() {
        assert_eq!(subject_for("gl", "posting.requested"), "gl.events.posting.requested");
        assert_eq!(envelope().subject, "gl.events.posting.requested");
    }

    #[test]
    fn envelope_serializes_expected_fields() {
        let value = serde_json::to_value(envelope()).expect("serialize");
        for field in [
            "event_id",
            "occurred_at",
            "tenant_id",
            "source_module",
            "source_version",
            "subject",
            "payload",
        ] {
            assert!(value.get(field).is_some(), "missing {field}");
        }
        // Unset correlation ids stay off the wire.
        assert!(value.get("correlation_id").is_none());
    }

    #[tokio::test]
    async fn duplicate_event_ids_record_once() {
        let publisher = InMemoryEventPublisher::new();
        let event = envelope();
        publisher.publish(event.clone()).await.expect("publish");
        publisher.publish(event).await.expect("republish");
        assert_eq!(publisher.published().await.len(), 1);
    }

    #[tokio::test]
    async fn queued_failures_surface_then_clear() {
        let publisher = InMemoryEventPublisher::new();
        publisher.fail_next("broker unavailable").await;
        let err = publisher.publish(envelope()).await.unwrap_err();
        assert!(err.is_retriable());
        publisher.publish(envelope()).await.expect("publish after failure");
        assert_eq!(publisher.published().await.len(), 1);
    }
}
