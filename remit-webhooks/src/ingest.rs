use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;
use remit_processor::signature;
use remit_retry::BackoffLadder;

use crate::EventKind;
use crate::HandlerError;
use crate::InsertOutcome;
use crate::ProcessorEvent;
use crate::REASON_INVALID_SIGNATURE;
use crate::TenantId;
use crate::WebhookHandler;
use crate::WebhookRecord;
use crate::WebhookResult;
use crate::WebhookStatus;
use crate::WebhookStore;
use crate::classify;

#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// Handled to completion; the record is `processed`.
    Processed,
    /// The (tenant, event_id) pair was seen before. Nothing was verified or
    /// re-processed.
    Duplicate,
    /// Signature verification failed. Recorded once, never retried.
    InvalidSignature,
    /// The handler failed; the record is `failed` and either scheduled for
    /// retry or dead on arrival if the failure is permanent.
    Failed { error: String },
}

pub struct WebhookIngestor {
    store: Arc<dyn WebhookStore>,
    handler: Arc<dyn WebhookHandler>,
    ladder: BackoffLadder,
    tolerance_seconds: i64,
}

impl WebhookIngestor {
    pub fn new(
        store: Arc<dyn WebhookStore>,
        handler: Arc<dyn WebhookHandler>,
        ladder: BackoffLadder,
        tolerance_seconds: i64,
    ) -> Self {
        Self {
            store,
            handler,
            ladder,
            tolerance_seconds,
        }
    }

    /// Runs the single-entry pipeline: parse, insert-first, verify,
    /// dispatch, persist outcome. The raw body must be the exact bytes the
    /// transport received, untouched by any JSON round-trip.
    pub async fn ingest(
        &self,
        tenant: &TenantId,
        raw_body: &[u8],
        signature_header: &str,
        webhook_secret: &str,
        now: DateTime<Utc>,
    ) -> WebhookResult<IngestOutcome> {
        let event = ProcessorEvent::parse(raw_body)?;

        let inserted = self
            .store
            .insert(WebhookRecord {
                tenant_id: tenant.clone(),
                event_id: event.id.clone(),
                event_type: event.event_type.clone(),
                status: WebhookStatus::Received,
                attempt_count: 0,
                last_attempt_at: None,
                next_attempt_at: None,
                dead_at: None,
                payload: serde_json::to_value(&event)
                    .unwrap_or(serde_json::Value::Null),
                error: None,
                received_at: now,
                processed_at: None,
                revived_at: None,
                revived_by: None,
            })
            .await?;

        let mut record = match inserted {
            InsertOutcome::Duplicate(_) => {
                tracing::info!(
                    tenant_id = %tenant,
                    event_id = %event.id,
                    "duplicate webhook delivery"
                );
                return Ok(IngestOutcome::Duplicate);
            }
            InsertOutcome::Inserted(record) => record,
        };

        if let Err(err) = signature::verify(
            webhook_secret.as_bytes(),
            signature_header,
            raw_body,
            now,
            self.tolerance_seconds,
        ) {
            tracing::warn!(
                tenant_id = %tenant,
                event_id = %event.id,
                error = %err,
                "webhook signature rejected"
            );
            record.status = WebhookStatus::Failed;
            record.attempt_count = 1;
            record.last_attempt_at = Some(now);
            record.error = Some(REASON_INVALID_SIGNATURE.to_string());
            // Deliberately no next_attempt_at: bad signatures never retry.
            self.store.update(record).await?;
            return Ok(IngestOutcome::InvalidSignature);
        }

        record.status = WebhookStatus::Processing;
        let record = self.store.update(record).await?;

        let result = dispatch(self.handler.as_ref(), tenant, &event).await;
        let outcome = settle_attempt(record, &result, &self.ladder, now);
        self.store.update(outcome.record).await?;
        Ok(outcome.outcome)
    }
}

/// Routes by event type. Unknown types are acknowledged and marked
/// processed so a processor rollout of new event kinds does not pile up
/// dead letters here.
pub(crate) async fn dispatch(
    handler: &dyn WebhookHandler,
    tenant: &TenantId,
    event: &ProcessorEvent,
) -> Result<(), HandlerError> {
    match classify(&event.event_type) {
        EventKind::Unknown => {
            tracing::info!(
                tenant_id = %tenant,
                event_id = %event.id,
                event_type = %event.event_type,
                "unknown webhook event type acknowledged"
            );
            Ok(())
        }
        _ => handler.handle(tenant, event).await,
    }
}

pub(crate) struct SettledAttempt {
    pub record: WebhookRecord,
    pub outcome: IngestOutcome,
}

/// Applies one attempt's result to the record: success finalizes, failure
/// increments the attempt count and either schedules the next rung of the
/// ladder or dead-letters.
pub(crate) fn settle_attempt(
    mut record: WebhookRecord,
    result: &Result<(), HandlerError>,
    ladder: &BackoffLadder,
    now: DateTime<Utc>,
) -> SettledAttempt {
    record.attempt_count += 1;
    record.last_attempt_at = Some(now);
    match result {
        Ok(()) => {
            record.status = WebhookStatus::Processed;
            record.processed_at = Some(now);
            record.next_attempt_at = None;
            record.error = None;
            SettledAttempt {
                record,
                outcome: IngestOutcome::Processed,
            }
        }
        Err(err) => {
            record.status = WebhookStatus::Failed;
            record.error = Some(format!("{}: {}", err.code, err.message));
            let mut rng = rand::rng();
            let next = if err.retriable {
                ladder.next_attempt_at(record.attempt_count, now, &mut rng)
            } else {
                None
            };
            match next {
                Some(at) => {
                    record.next_attempt_at = Some(at);
                }
                None => {
                    record.next_attempt_at = None;
                    record.dead_at = Some(now);
                    tracing::error!(
                        tenant_id = %record.tenant_id,
                        event_id = %record.event_id,
                        attempts = record.attempt_count,
                        "webhook dead-lettered"
                    );
                }
            }
            SettledAttempt {
                outcome: IngestOutcome::Failed {
                    error: record.error.clone().unwrap_or_default(),
                },
                record,
            }
        }
    }
}
