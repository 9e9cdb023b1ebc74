use chrono::DateTime;
use chrono::Utc;
use remit_gl::ArTrigger;
use remit_gl::JournalIntent;
use remit_gl::SourceDocType;
use remit_ledger::ArStore;
use remit_ledger::CustomerId;
use remit_ledger::InvoiceId;
use remit_ledger::LedgerEventType;
use remit_ledger::PostEventRequest;

use crate::Billing;
use crate::BillingResult;
use crate::TenantId;
use crate::deterministic_event_id;

/// One financial event = one ledger posting + one GL intent, both keyed by
/// the same deterministic source key. Whichever path records the event
/// first (command or webhook) wins; the other collapses into an idempotent
/// no-op on both surfaces.
pub(crate) struct FinancialEvent<'a> {
    pub customer_id: &'a CustomerId,
    pub invoice_id: Option<&'a InvoiceId>,
    pub event_type: LedgerEventType,
    pub amount_delta_cents: i64,
    pub currency: &'a str,
    /// Stable key, e.g. the processor payment id or the refund reference.
    pub source_kind: &'a str,
    pub source_key: &'a str,
    pub gl_trigger: Option<ArTrigger>,
    pub gl_doc_type: SourceDocType,
    pub gl_doc_id: &'a str,
    pub occurred_at: DateTime<Utc>,
}

impl Billing {
    /// Returns whether the ledger event was newly posted. The GL intent is
    /// only submitted for fresh postings; replays never re-emit.
    pub(crate) async fn record_financial_event(
        &self,
        tenant: &TenantId,
        event: FinancialEvent<'_>,
    ) -> BillingResult<bool> {
        let source_event_id =
            deterministic_event_id(tenant, event.source_kind, event.source_key);
        let posted = self
            .store
            .post_event(PostEventRequest {
                tenant_id: tenant.clone(),
                customer_id: event.customer_id.clone(),
                invoice_id: event.invoice_id.cloned(),
                event_type: event.event_type,
                amount_delta_cents: event.amount_delta_cents,
                currency: event.currency.to_string(),
                source_event_id,
                occurred_at: event.occurred_at,
            })
            .await?;

        if !posted.newly_posted {
            tracing::debug!(
                tenant_id = %tenant,
                customer_id = %event.customer_id,
                source_kind = event.source_kind,
                source_key = event.source_key,
                "financial event already posted; skipping"
            );
            return Ok(false);
        }

        if let Some(trigger) = event.gl_trigger {
            let posting_event_id = deterministic_event_id(
                tenant,
                &format!("gl-{}", event.source_kind),
                event.source_key,
            );
            let amount = event.amount_delta_cents.abs();
            let intent = JournalIntent::for_trigger(
                posting_event_id,
                tenant.clone(),
                trigger,
                &self.accounts,
                amount,
                event.currency,
                event.occurred_at.date_naive(),
                event.gl_doc_type,
                event.gl_doc_id,
            );
            self.gl.submit(intent).await?;
        }

        Ok(true)
    }
}
