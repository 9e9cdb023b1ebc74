use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;
use remit_events::EventEnvelope;
use remit_events::EventPublisher;
use remit_events::VersionedPayload;
use remit_retry::RunBudget;
use remit_retry::gl::GlRetryDecision;
use remit_retry::gl::after_failure;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::GlError;
use crate::GlResult;
use crate::JournalIntent;
use crate::SourceDocType;
use crate::TenantId;

pub const SUBJECT_POSTING_REQUESTED: &str = "gl.events.posting.requested";
pub const SUBJECT_POSTING_ACCEPTED: &str = "gl.events.posting.accepted";
pub const SUBJECT_POSTING_REJECTED: &str = "gl.events.posting.rejected";

pub const POSTING_REQUEST_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostingStatus {
    Pending,
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostingQueueEntry {
    pub tenant_id: TenantId,
    pub posting_event_id: String,
    pub source_doc_type: SourceDocType,
    pub source_doc_id: String,
    pub status: PostingStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub attempt_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub enqueued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub intent: JournalIntent,
}

/// Reply from the GL service, parsed off the `gl.posting.accepted` /
/// `gl.posting.rejected` subjects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum PostingOutcome {
    Accepted,
    Rejected { reason: String },
}

#[async_trait]
pub trait GlPostingQueue: Send + Sync {
    /// Idempotent on (tenant, posting_event_id); re-enqueueing returns the
    /// stored entry untouched.
    async fn enqueue(&self, entry: PostingQueueEntry) -> GlResult<PostingQueueEntry>;
    async fn entry(
        &self,
        tenant: &TenantId,
        posting_event_id: &str,
    ) -> GlResult<PostingQueueEntry>;
    async fn update(&self, entry: PostingQueueEntry) -> GlResult<PostingQueueEntry>;
    /// Pending entries due for (re)delivery at `now`.
    async fn due(&self, now: DateTime<Utc>) -> GlResult<Vec<PostingQueueEntry>>;
    async fn rejected(&self, tenant: &TenantId) -> GlResult<Vec<PostingQueueEntry>>;
    async fn list(&self, tenant: &TenantId) -> GlResult<Vec<PostingQueueEntry>>;
}

#[derive(Default)]
pub struct InMemoryGlPostingQueue {
    entries: Mutex<HashMap<(TenantId, String), PostingQueueEntry>>,
}

impl InMemoryGlPostingQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GlPostingQueue for InMemoryGlPostingQueue {
    async fn enqueue(&self, entry: PostingQueueEntry) -> GlResult<PostingQueueEntry> {
        let mut entries = self.entries.lock().await;
        let queue_key = (entry.tenant_id.clone(), entry.posting_event_id.clone());
        if let Some(existing) = entries.get(&queue_key) {
            return Ok(existing.clone());
        }
        entries.insert(queue_key, entry.clone());
        Ok(entry)
    }

    async fn entry(
        &self,
        tenant: &TenantId,
        posting_event_id: &str,
    ) -> GlResult<PostingQueueEntry> {
        let entries = self.entries.lock().await;
        entries
            .get(&(tenant.clone(), posting_event_id.to_string()))
            .cloned()
            .ok_or_else(|| GlError::NotFound(format!("posting {posting_event_id}")))
    }

    async fn update(&self, entry: PostingQueueEntry) -> GlResult<PostingQueueEntry> {
        let mut entries = self.entries.lock().await;
        let queue_key = (entry.tenant_id.clone(), entry.posting_event_id.clone());
        if !entries.contains_key(&queue_key) {
            return Err(GlError::NotFound(format!(
                "posting {}",
                entry.posting_event_id
            )));
        }
        entries.insert(queue_key, entry.clone());
        Ok(entry)
    }

    async fn due(&self, now: DateTime<Utc>) -> GlResult<Vec<PostingQueueEntry>> {
        let entries = self.entries.lock().await;
        let mut due: Vec<PostingQueueEntry> = entries
            .values()
            .filter(|entry| entry.status == PostingStatus::Pending)
            .filter(|entry| entry.next_attempt_at.is_some_and(|at| at <= now))
            .cloned()
            .collect();
        due.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at));
        Ok(due)
    }

    async fn rejected(&self, tenant: &TenantId) -> GlResult<Vec<PostingQueueEntry>> {
        let entries = self.entries.lock().await;
        let mut rejected: Vec<PostingQueueEntry> = entries
            .values()
            .filter(|entry| &entry.tenant_id == tenant && entry.status == PostingStatus::Rejected)
            .cloned()
            .collect();
        rejected.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at));
        Ok(rejected)
    }

    async fn list(&self, tenant: &TenantId) -> GlResult<Vec<PostingQueueEntry>> {
        let entries = self.entries.lock().await;
        let mut list: Vec<PostingQueueEntry> = entries
            .values()
            .filter(|entry| &entry.tenant_id == tenant)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at));
        Ok(list)
    }
}

/// Builds, queues, and publishes posting requests, and folds the GL
/// service's verdicts back into the queue.
#[derive(Clone)]
pub struct GlEmitter {
    queue: Arc<dyn GlPostingQueue>,
    publisher: Arc<dyn EventPublisher>,
}

impl GlEmitter {
    pub fn new(queue: Arc<dyn GlPostingQueue>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self { queue, publisher }
    }

    fn envelope_for(intent: &JournalIntent) -> GlResult<EventEnvelope> {
        let data = serde_json::to_value(intent)
            .map_err(|err| GlError::Validation(format!("intent serialization failed: {err}")))?;
        let mut envelope = EventEnvelope::new(
            intent.tenant_id.clone(),
            "gl",
            "posting.requested",
            VersionedPayload {
                schema_version: POSTING_REQUEST_SCHEMA_VERSION,
                data,
            },
        );
        // Redeliveries must carry the same event id so consumers can dedupe
        // a posting, not just a transmission.
        envelope.event_id = intent.posting_event_id.clone();
        Ok(envelope)
    }

    /// Validates balance, enqueues, and attempts the first delivery. A
    /// transient publish failure leaves the entry pending with a retry
    /// schedule; the intent is never lost.
    pub async fn submit(&self, intent: JournalIntent) -> GlResult<PostingQueueEntry> {
        intent.validate()?;
        let now = Utc::now();
        let entry = self
            .queue
            .enqueue(PostingQueueEntry {
                tenant_id: intent.tenant_id.clone(),
                posting_event_id: intent.posting_event_id.clone(),
                source_doc_type: intent.source_doc_type,
                source_doc_id: intent.source_doc_id.clone(),
                status: PostingStatus::Pending,
                reason: None,
                attempt_count: 0,
                next_attempt_at: None,
                enqueued_at: now,
                updated_at: now,
                intent,
            })
            .await?;
        self.deliver(entry).await
    }

    async fn deliver(&self, mut entry: PostingQueueEntry) -> GlResult<PostingQueueEntry> {
        let envelope = Self::envelope_for(&entry.intent)?;
        entry.attempt_count += 1;
        entry.updated_at = Utc::now();
        match self.publisher.publish(envelope.clone()).await {
            Ok(()) => {
                entry.next_attempt_at = None;
                self.queue.update(entry).await
            }
            Err(err) => {
                tracing::warn!(
                    tenant_id = %entry.tenant_id,
                    posting_event_id = %entry.posting_event_id,
                    attempt = entry.attempt_count,
                    error = %err,
                    "gl posting publish failed"
                );
                match after_failure(entry.attempt_count, None) {
                    GlRetryDecision::RetryNow => {
                        entry.attempt_count += 1;
                        entry.updated_at = Utc::now();
                        match self.publisher.publish(envelope).await {
                            Ok(()) => {
                                entry.next_attempt_at = None;
                                self.queue.update(entry).await
                            }
                            Err(second) => {
                                tracing::warn!(
                                    tenant_id = %entry.tenant_id,
                                    posting_event_id = %entry.posting_event_id,
                                    error = %second,
                                    "immediate gl retry failed, backing off"
                                );
                                self.park_for_retry(entry).await
                            }
                        }
                    }
                    GlRetryDecision::RetryAfter(_) => self.park_for_retry(entry).await,
                    GlRetryDecision::Park => {
                        entry.next_attempt_at = None;
                        self.queue.update(entry).await
                    }
                }
            }
        }
    }

    async fn park_for_retry(&self, mut entry: PostingQueueEntry) -> GlResult<PostingQueueEntry> {
        match after_failure(entry.attempt_count, None) {
            GlRetryDecision::RetryAfter(delay) => {
                let millis = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
                entry.next_attempt_at = Some(Utc::now() + Duration::milliseconds(millis));
            }
            GlRetryDecision::RetryNow => {
                entry.next_attempt_at = Some(Utc::now());
            }
            GlRetryDecision::Park => {
                entry.next_attempt_at = None;
                tracing::error!(
                    tenant_id = %entry.tenant_id,
                    posting_event_id = %entry.posting_event_id,
                    "gl posting delivery exhausted retries; awaiting manual attention"
                );
            }
        }
        entry.updated_at = Utc::now();
        self.queue.update(entry).await
    }

    /// Redelivers pending entries whose backoff has elapsed. Cooperative
    /// with the run budget between entries.
    pub async fn run_retries(&self, now: DateTime<Utc>, budget: RunBudget) -> GlResult<usize> {
        let due = self.queue.due(now).await?;
        let mut delivered = 0;
        for entry in due {
            if budget.expired(Utc::now()) {
                break;
            }
            self.deliver(entry).await?;
            delivered += 1;
        }
        Ok(delivered)
    }

    pub async fn postings(&self, tenant: &TenantId) -> GlResult<Vec<PostingQueueEntry>> {
        self.queue.list(tenant).await
    }

    pub async fn rejected_postings(&self, tenant: &TenantId) -> GlResult<Vec<PostingQueueEntry>> {
        self.queue.rejected(tenant).await
    }

    /// Applies the GL service's asynchronous verdict. Business rejections
    /// park permanently: the receivable stays as posted and the rejection
    /// feeds the reconciliation report.
    pub async fn apply_outcome(
        &self,
        tenant: &TenantId,
        posting_event_id: &str,
        outcome: PostingOutcome,
    ) -> GlResult<PostingQueueEntry> {
        let mut entry = self.queue.entry(tenant, posting_event_id).await?;
        match outcome {
            PostingOutcome::Accepted => {
                entry.status = PostingStatus::Accepted;
                entry.reason = None;
            }
            PostingOutcome::Rejected { reason } => {
                tracing::warn!(
                    tenant_id = %tenant,
                    posting_event_id = %posting_event_id,
                    reason = %reason,
                    "gl posting rejected; receivable state is not rolled back"
                );
                entry.status = PostingStatus::Rejected;
                entry.reason = Some(reason);
            }
        }
        entry.next_attempt_at = None;
        entry.updated_at = Utc::now();
        self.queue.update(entry).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AccountMapping;
    use crate::ArTrigger;
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;
    use remit_events::InMemoryEventPublisher;

    fn intent(posting_event_id: &str) -> JournalIntent {
        JournalIntent::for_trigger(
            posting_event_id,
            "acme",
            ArTrigger::PaymentApplied,
            &AccountMapping::default(),
            9_900,
            "USD",
            NaiveDate::from_ymd_opt(2025, 6, 1).expect("valid date"),
            SourceDocType::Payment,
            "pay-1",
        )
    }

    fn emitter() -> (GlEmitter, Arc<InMemoryGlPostingQueue>, Arc<InMemoryEventPublisher>) {
        let queue = Arc::new(InMemoryGlPostingQueue::new());
        let publisher = Arc::new(InMemoryEventPublisher::new());
        (
            GlEmitter::new(queue.clone(), publisher.clone()),
            queue,
            publisher,
        )
    }

    #[tokio::test]
    async fn submit_publishes_a_balanced_request() {
        let (emitter, _, publisher) = emitter();
        let entry = emitter.submit(intent("pe-1")).await.expect("submit");
        assert_eq!(entry.status, PostingStatus::Pending);
        assert_eq!(entry.attempt_count, 1);

        let requests = publisher.published_on(SUBJECT_POSTING_REQUESTED).await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].event_id, "pe-1");
        assert_eq!(requests[0].tenant_id, "acme");
    }

    #[tokio::test]
    async fn unbalanced_intent_never_reaches_the_queue() {
        let (emitter, queue, publisher) = emitter();
        let mut bad = intent("pe-1");
        bad.lines[0].debit_cents = 1;
        assert!(matches!(
            emitter.submit(bad).await,
            Err(GlError::Unbalanced(_))
        ));
        assert!(queue.list(&"acme".to_string()).await.expect("list").is_empty());
        assert!(publisher.published().await.is_empty());
    }

    #[tokio::test]
    async fn resubmitting_the_same_posting_is_idempotent() {
        let (emitter, queue, publisher) = emitter();
        emitter.submit(intent("pe-1")).await.expect("submit");
        emitter.submit(intent("pe-1")).await.expect("resubmit");

        let entries = queue.list(&"acme".to_string()).await.expect("list");
        assert_eq!(entries.len(), 1);
        // At-least-once on the wire, but consumers dedupe on the stable
        // event id, so the in-memory publisher records a single posting.
        assert_eq!(publisher.published_on(SUBJECT_POSTING_REQUESTED).await.len(), 1);
    }

    #[tokio::test]
    async fn transient_publish_failure_retries_immediately() {
        let (emitter, _, publisher) = emitter();
        publisher.fail_next("broker unavailable").await;
        let entry = emitter.submit(intent("pe-1")).await.expect("submit");
        assert_eq!(entry.status, PostingStatus::Pending);
        assert_eq!(entry.attempt_count, 2);
        assert!(entry.next_attempt_at.is_none());
        assert_eq!(publisher.published_on(SUBJECT_POSTING_REQUESTED).await.len(), 1);
    }

    #[tokio::test]
    async fn double_failure_backs_off_five_minutes_then_run_retries_delivers() {
        let (emitter, _, publisher) = emitter();
        publisher.fail_next("down").await;
        publisher.fail_next("still down").await;
        let entry = emitter.submit(intent("pe-1")).await.expect("submit");
        assert_eq!(entry.attempt_count, 2);
        let scheduled = entry.next_attempt_at.expect("backoff scheduled");
        assert!(scheduled > Utc::now());

        // Nothing is due yet.
        let delivered = emitter
            .run_retries(Utc::now(), RunBudget::unbounded())
            .await
            .expect("run");
        assert_eq!(delivered, 0);

        let delivered = emitter
            .run_retries(scheduled + Duration::seconds(1), RunBudget::unbounded())
            .await
            .expect("run after backoff");
        assert_eq!(delivered, 1);
        assert_eq!(publisher.published_on(SUBJECT_POSTING_REQUESTED).await.len(), 1);
    }

    #[tokio::test]
    async fn rejection_parks_entry_and_keeps_reason() {
        let (emitter, queue, _) = emitter();
        emitter.submit(intent("pe-1")).await.expect("submit");
        let entry = emitter
            .apply_outcome(
                &"acme".to_string(),
                "pe-1",
                PostingOutcome::Rejected {
                    reason: "UNBALANCED_ENTRY".into(),
                },
            )
            .await
            .expect("apply outcome");
        assert_eq!(entry.status, PostingStatus::Rejected);
        assert_eq!(entry.reason.as_deref(), Some("UNBALANCED_ENTRY"));

        let rejected = queue.rejected(&"acme".to_string()).await.expect("rejected");
        assert_eq!(rejected.len(), 1);

        // A rejected entry is never due again.
        let due = queue.due(Utc::now() + Duration::days(1)).await.expect("due");
        assert!(due.is_empty());
    }

    #[tokio::test]
    async fn acceptance_marks_entry_accepted() {
        let (emitter, _, _) = emitter();
        emitter.submit(intent("pe-1")).await.expect("submit");
        let entry = emitter
            .apply_outcome(&"acme".to_string(), "pe-1", PostingOutcome::Accepted)
            .await
            .expect("apply outcome");
        assert_eq!(entry.status, PostingStatus::Accepted);
        assert!(entry.reason.is_none());
    }
}
