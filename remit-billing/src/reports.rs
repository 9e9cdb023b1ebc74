use remit_gl::PostingQueueEntry;
use remit_ledger::AgingBuckets;
use remit_ledger::ArStore;
use remit_ledger::Customer;
use remit_ledger::CustomerFilter;
use remit_ledger::DelinquencyState;
use remit_ledger::Invoice;
use serde::Serialize;

use crate::Billing;
use crate::BillingResult;
use crate::TenantId;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgingSummaryRow {
    pub customer_id: String,
    pub external_id: String,
    pub display_name: String,
    pub buckets: AgingBuckets,
    pub ar_balance_cents: i64,
    pub delinquency: DelinquencyState,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgingSummary {
    pub rows: Vec<AgingSummaryRow>,
    pub totals: AgingBuckets,
}

impl Billing {
    pub async fn aging_summary(&self, tenant: &TenantId) -> BillingResult<AgingSummary> {
        let customers = self
            .store()
            .list_customers(tenant, CustomerFilter::default())
            .await?;
        let mut totals = AgingBuckets::default();
        let rows = customers
            .into_iter()
            .map(|customer| {
                totals.accumulate(&customer.aging);
                AgingSummaryRow {
                    customer_id: customer.id,
                    external_id: customer.external_id,
                    display_name: customer.display_name,
                    buckets: customer.aging,
                    ar_balance_cents: customer.ar_balance_cents,
                    delinquency: customer.delinquency,
                }
            })
            .collect();
        Ok(AgingSummary { rows, totals })
    }

    pub async fn open_invoices(&self, tenant: &TenantId) -> BillingResult<Vec<Invoice>> {
        Ok(self.store().list_open_invoices(tenant).await?)
    }

    pub async fn delinquent_customers(&self, tenant: &TenantId) -> BillingResult<Vec<Customer>> {
        let mut delinquent = Vec::new();
        for state in [
            DelinquencyState::Delinquent,
            DelinquencyState::Grace,
            DelinquencyState::Suspended,
        ] {
            delinquent.extend(
                self.store()
                    .list_customers(
                        tenant,
                        CustomerFilter {
                            include_deleted: false,
                            delinquency: Some(state),
                        },
                    )
                    .await?,
            );
        }
        delinquent.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(delinquent)
    }

    /// Rejected GL postings awaiting human resolution; the receivable side
    /// of each entry is untouched by design.
    pub async fn gl_reconciliation_queue(
        &self,
        tenant: &TenantId,
    ) -> BillingResult<Vec<PostingQueueEntry>> {
        Ok(self.gl().rejected_postings(tenant).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CreateInvoiceRequest;
    use crate::InvoiceLineInput;
    use crate::testutil::harness;
    use pretty_assertions::assert_eq;
    use remit_gl::PostingOutcome;
    use remit_retry::RunBudget;

    #[tokio::test]
    async fn aging_summary_totals_match_balances() {
        let h = harness();
        for (ext, amount) in [("cu_001", 3_000), ("cu_002", 7_000)] {
            let customer = h
                .billing
                .create_customer(
                    &"acme".to_string(),
                    crate::CreateCustomerRequest {
                        external_id: ext.into(),
                        email: format!("{ext}@example.com"),
                        display_name: ext.into(),
                    },
                )
                .await
                .expect("create");
            let invoice = h
                .billing
                .create_invoice(
                    &"acme".to_string(),
                    CreateInvoiceRequest {
                        customer_id: customer.id.clone(),
                        currency: "USD".into(),
                        lines: vec![InvoiceLineInput {
                            description: "plan".into(),
                            quantity: 1,
                            unit_price_cents: amount,
                        }],
                        tax_cents: 0,
                        due_at: None,
                        period_start: None,
                        period_end: None,
                    },
                )
                .await
                .expect("invoice");
            h.billing
                .issue_invoice(&"acme".to_string(), &invoice.id)
                .await
                .expect("issue");
        }
        h.billing
            .run_aging_recompute(&"acme".to_string(), chrono::Utc::now(), RunBudget::unbounded())
            .await
            .expect("recompute");

        let summary = h
            .billing
            .aging_summary(&"acme".to_string())
            .await
            .expect("summary");
        assert_eq!(summary.rows.len(), 2);
        assert_eq!(summary.totals.total_cents(), 10_000);
        for row in &summary.rows {
            assert_eq!(row.buckets.total_cents(), row.ar_balance_cents);
        }

        let open = h
            .billing
            .open_invoices(&"acme".to_string())
            .await
            .expect("open invoices");
        assert_eq!(open.len(), 2);
    }

    #[tokio::test]
    async fn gl_reconciliation_queue_lists_rejections() {
        let h = harness();
        let customer = h
            .billing
            .create_customer(
                &"acme".to_string(),
                crate::CreateCustomerRequest {
                    external_id: "cu_001".into(),
                    email: "cu@example.com".into(),
                    display_name: "Customer One".into(),
                },
            )
            .await
            .expect("create");
        let invoice = h
            .billing
            .create_invoice(
                &"acme".to_string(),
                CreateInvoiceRequest {
                    customer_id: customer.id,
                    currency: "USD".into(),
                    lines: vec![InvoiceLineInput {
                        description: "plan".into(),
                        quantity: 1,
                        unit_price_cents: 9_900,
                    }],
                    tax_cents: 0,
                    due_at: None,
                    period_start: None,
                    period_end: None,
                },
            )
            .await
            .expect("invoice");
        let invoice = h
            .billing
            .issue_invoice(&"acme".to_string(), &invoice.id)
            .await
            .expect("issue");

        let postings = h
            .billing
            .gl()
            .postings(&"acme".to_string())
            .await
            .expect("postings");
        assert_eq!(postings.len(), 1);

        h.billing
            .gl()
            .apply_outcome(
                &"acme".to_string(),
                &postings[0].posting_event_id,
                PostingOutcome::Rejected {
                    reason: "UNBALANCED_ENTRY".into(),
                },
            )
            .await
            .expect("reject");

        let queue = h
            .billing
            .gl_reconciliation_queue(&"acme".to_string())
            .await
            .expect("queue");
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].reason.as_deref(), Some("UNBALANCED_ENTRY"));

        // The invoice (and its ledger state) is untouched by the rejection.
        let stored = h
            .billing
            .get_invoice(&"acme".to_string(), &invoice.id)
            .await
            .expect("invoice");
        assert_eq!(stored.status, remit_ledger::InvoiceStatus::Issued);
    }
}
