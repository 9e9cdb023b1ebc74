use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;
use remit_retry::BackoffLadder;
use remit_retry::RunBudget;

use crate::IngestOutcome;
use crate::ProcessorEvent;
use crate::WebhookHandler;
use crate::WebhookResult;
use crate::WebhookStore;
use crate::ingest::dispatch;
use crate::ingest::settle_attempt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryRunStats {
    pub scanned: usize,
    pub processed: usize,
    pub rescheduled: usize,
    pub dead_lettered: usize,
}

/// Batch redelivery of failed webhook records. Records are ordered per
/// tenant and processed serially; the run stops cooperatively when the
/// budget expires.
pub struct WebhookRetryEngine {
    store: Arc<dyn WebhookStore>,
    handler: Arc<dyn WebhookHandler>,
    ladder: BackoffLadder,
}

impl WebhookRetryEngine {
    pub fn new(
        store: Arc<dyn WebhookStore>,
        handler: Arc<dyn WebhookHandler>,
        ladder: BackoffLadder,
    ) -> Self {
        Self {
            store,
            handler,
            ladder,
        }
    }

    pub async fn run(&self, now: DateTime<Utc>, budget: RunBudget) -> WebhookResult<RetryRunStats> {
        let due = self.store.due_for_retry(now).await?;
        let mut stats = RetryRunStats::default();

        for record in due {
            if budget.expired(Utc::now()) {
                tracing::info!(
                    scanned = stats.scanned,
                    "webhook retry run stopped at deadline"
                );
                break;
            }
            stats.scanned += 1;

            let event = match serde_json::from_value::<ProcessorEvent>(record.payload.clone()) {
                Ok(event) => event,
                Err(err) => {
                    // A stored payload that no longer parses cannot make
                    // progress; dead-letter it for manual inspection.
                    tracing::error!(
                        tenant_id = %record.tenant_id,
                        event_id = %record.event_id,
                        error = %err,
                        "stored webhook payload failed to parse"
                    );
                    let mut dead = record;
                    dead.dead_at = Some(now);
                    dead.next_attempt_at = None;
                    dead.error = Some(format!("payload parse: {err}"));
                    self.store.update(dead).await?;
                    stats.dead_lettered += 1;
                    continue;
                }
            };

            let tenant = record.tenant_id.clone();
            let result = dispatch(self.handler.as_ref(), &tenant, &event).await;
            let settled = settle_attempt(record, &result, &self.ladder, now);
            let is_dead = settled.record.dead_at.is_some();
            self.store.update(settled.record).await?;
            match settled.outcome {
                IngestOutcome::Processed => stats.processed += 1,
                IngestOutcome::Failed { .. } if is_dead => stats.dead_lettered += 1,
                IngestOutcome::Failed { .. } => stats.rescheduled += 1,
                IngestOutcome::Duplicate | IngestOutcome::InvalidSignature => {}
            }
        }

        Ok(stats)
    }
}
