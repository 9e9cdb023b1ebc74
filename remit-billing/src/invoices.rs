use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;
use remit_gl::ArTrigger;
use remit_gl::SourceDocType;
use remit_ledger::AllocationType;
use remit_ledger::ApplyPaymentRequest;
use remit_ledger::ArStore;
use remit_ledger::CreditMemo;
use remit_ledger::CreditReason;
use remit_ledger::CustomerId;
use remit_ledger::Invoice;
use remit_ledger::InvoiceId;
use remit_ledger::InvoiceLine;
use remit_ledger::InvoiceStatus;
use remit_ledger::LedgerEventType;
use remit_ledger::PaymentApplication;
use remit_ledger::validate_currency_code;
use remit_ledger::validate_positive_cents;
use uuid::Uuid;

use crate::Billing;
use crate::BillingError;
use crate::BillingResult;
use crate::BusinessCode;
use crate::TenantId;
use crate::postings::FinancialEvent;

pub const DEFAULT_PAYMENT_TERMS_DAYS: i64 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceLineInput {
    pub description: String,
    pub quantity: u32,
    pub unit_price_cents: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateInvoiceRequest {
    pub customer_id: CustomerId,
    pub currency: String,
    pub lines: Vec<InvoiceLineInput>,
    pub tax_cents: i64,
    pub due_at: Option<DateTime<Utc>>,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
}

impl CreateInvoiceRequest {
    pub fn normalize(mut self) -> BillingResult<Self> {
        self.currency = self.currency.trim().to_ascii_uppercase();
        validate_currency_code(&self.currency)?;
        if self.lines.is_empty() {
            return Err(BillingError::Validation(
                "invoice requires at least one line".into(),
            ));
        }
        for line in &self.lines {
            if line.description.trim().is_empty() {
                return Err(BillingError::Validation(
                    "line description cannot be empty".into(),
                ));
            }
            if line.quantity == 0 {
                return Err(BillingError::Validation(
                    "line quantity must be positive".into(),
                ));
            }
            validate_positive_cents(line.unit_price_cents, "unit_price_cents")?;
        }
        if self.tax_cents < 0 {
            return Err(BillingError::Validation("tax_cents cannot be negative".into()));
        }
        Ok(self)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordApplicationRequest {
    pub processor_payment_id: String,
    pub amount_cents: i64,
    pub currency: String,
    pub allocation_type: AllocationType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateCreditMemoRequest {
    pub customer_id: CustomerId,
    pub invoice_id: Option<InvoiceId>,
    pub amount_cents: i64,
    pub currency: String,
    pub reason: CreditReason,
    pub memo: Option<String>,
}

impl Billing {
    pub async fn create_invoice(
        &self,
        tenant: &TenantId,
        request: CreateInvoiceRequest,
    ) -> BillingResult<Invoice> {
        let request = request.normalize()?;
        let customer = self.get_customer(tenant, &request.customer_id).await?;

        let lines: Vec<InvoiceLine> = request
            .lines
            .iter()
            .map(|line| InvoiceLine {
                description: line.description.trim().to_string(),
                quantity: line.quantity,
                unit_price_cents: line.unit_price_cents,
                amount_cents: line.unit_price_cents * i64::from(line.quantity),
            })
            .collect();
        let subtotal_cents: i64 = lines.iter().map(|line| line.amount_cents).sum();

        let invoice = Invoice {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant.clone(),
            customer_id: customer.id,
            status: InvoiceStatus::Draft,
            currency: request.currency,
            subtotal_cents,
            tax_cents: request.tax_cents,
            total_cents: subtotal_cents + request.tax_cents,
            applied_cents: 0,
            lines,
            period_start: request.period_start,
            period_end: request.period_end,
            issued_at: None,
            due_at: request.due_at,
            paid_at: None,
            created_at: Utc::now(),
        };
        invoice.validate_totals().map_err(BillingError::from)?;
        Ok(self.store.insert_invoice(invoice).await?)
    }

    pub async fn get_invoice(&self, tenant: &TenantId, id: &InvoiceId) -> BillingResult<Invoice> {
        Ok(self.store.invoice(tenant, id).await?)
    }

    pub async fn list_invoices(
        &self,
        tenant: &TenantId,
        customer_id: Option<&CustomerId>,
    ) -> BillingResult<Vec<Invoice>> {
        Ok(self.store.list_invoices(tenant, customer_id).await?)
    }

    /// Draft → issued: freezes the lines, books the receivable, emits the
    /// DR Receivable / CR Revenue intent, and makes the invoice
    /// collectible.
    pub async fn issue_invoice(&self, tenant: &TenantId, id: &InvoiceId) -> BillingResult<Invoice> {
        let mut invoice = self.store.invoice(tenant, id).await?;
        if invoice.status.is_terminal() {
            return Err(BillingError::Conflict(format!(
                "invoice {id} is terminal in status {:?}",
                invoice.status
            )));
        }
        if invoice.status != InvoiceStatus::Draft {
            return Err(BillingError::Conflict(format!(
                "invoice {id} was already issued"
            )));
        }
        invoice.validate_totals().map_err(BillingError::from)?;

        let now = Utc::now();
        invoice.status = InvoiceStatus::Issued;
        invoice.issued_at = Some(now);
        if invoice.due_at.is_none() {
            invoice.due_at = Some(now + Duration::days(DEFAULT_PAYMENT_TERMS_DAYS));
        }
        let invoice = self.store.update_invoice(invoice).await?;

        self.record_financial_event(
            tenant,
            FinancialEvent {
                customer_id: &invoice.customer_id,
                invoice_id: Some(&invoice.id),
                event_type: LedgerEventType::InvoiceIssued,
                amount_delta_cents: invoice.total_cents,
                currency: &invoice.currency,
                source_kind: "invoice-issued",
                source_key: &invoice.id,
                gl_trigger: Some(ArTrigger::InvoiceIssued),
                gl_doc_type: SourceDocType::Invoice,
                gl_doc_id: &invoice.id,
                occurred_at: now,
            },
        )
        .await?;
        tracing::info!(
            tenant_id = %tenant,
            invoice_id = %invoice.id,
            total_cents = invoice.total_cents,
            "invoice issued"
        );
        Ok(invoice)
    }

    /// Void is only possible before money has been applied. A draft void is
    /// purely a status change; an issued void reverses the receivable.
    pub async fn void_invoice(&self, tenant: &TenantId, id: &InvoiceId) -> BillingResult<Invoice> {
        let mut invoice = self.store.invoice(tenant, id).await?;
        if invoice.status.is_terminal() {
            return Err(BillingError::Conflict(format!(
                "invoice {id} is terminal in status {:?}",
                invoice.status
            )));
        }
        if invoice.applied_cents > 0 {
            return Err(BillingError::Conflict(format!(
                "invoice {id} has applied payments and cannot be voided"
            )));
        }

        let was_issued = invoice.status != InvoiceStatus::Draft;
        let outstanding = invoice.outstanding_cents();
        let now = Utc::now();
        invoice.status = InvoiceStatus::Voided;
        let invoice = self.store.update_invoice(invoice).await?;

        if was_issued && outstanding > 0 {
            self.record_financial_event(
                tenant,
                FinancialEvent {
                    customer_id: &invoice.customer_id,
                    invoice_id: Some(&invoice.id),
                    event_type: LedgerEventType::Adjustment,
                    amount_delta_cents: -outstanding,
                    currency: &invoice.currency,
                    source_kind: "invoice-voided",
                    source_key: &invoice.id,
                    gl_trigger: None,
                    gl_doc_type: SourceDocType::Adjustment,
                    gl_doc_id: &invoice.id,
                    occurred_at: now,
                },
            )
            .await?;
        }
        Ok(invoice)
    }

    /// Writes off the outstanding remainder: DR Bad-debt / CR Receivable.
    pub async fn write_off_invoice(
        &self,
        tenant: &TenantId,
        id: &InvoiceId,
    ) -> BillingResult<Invoice> {
        let mut invoice = self.store.invoice(tenant, id).await?;
        if invoice.status.is_terminal() {
            return Err(BillingError::Conflict(format!(
                "invoice {id} is terminal in status {:?}",
                invoice.status
            )));
        }
        if invoice.status == InvoiceStatus::Draft {
            return Err(BillingError::business(
                BusinessCode::InvoiceNotIssued,
                format!("draft invoice {id} cannot be written off"),
            ));
        }

        let outstanding = invoice.outstanding_cents();
        let now = Utc::now();
        invoice.status = InvoiceStatus::WrittenOff;
        let invoice = self.store.update_invoice(invoice).await?;

        if outstanding > 0 {
            self.record_financial_event(
                tenant,
                FinancialEvent {
                    customer_id: &invoice.customer_id,
                    invoice_id: Some(&invoice.id),
                    event_type: LedgerEventType::WriteOff,
                    amount_delta_cents: -outstanding,
                    currency: &invoice.currency,
                    source_kind: "invoice-write-off",
                    source_key: &invoice.id,
                    gl_trigger: Some(ArTrigger::WriteOff),
                    gl_doc_type: SourceDocType::Invoice,
                    gl_doc_id: &invoice.id,
                    occurred_at: now,
                },
            )
            .await?;
        }
        tracing::info!(
            tenant_id = %tenant,
            invoice_id = %invoice.id,
            written_off_cents = outstanding,
            "invoice written off"
        );
        Ok(invoice)
    }

    /// Internal application entry point, also used by the webhook handler.
    /// Business codes map the failure precisely; the store re-checks the
    /// arithmetic under its lock.
    pub async fn record_application(
        &self,
        tenant: &TenantId,
        invoice_id: &InvoiceId,
        request: RecordApplicationRequest,
    ) -> BillingResult<(PaymentApplication, Invoice)> {
        let invoice = self.store.invoice(tenant, invoice_id).await?;
        match invoice.status {
            InvoiceStatus::Voided => {
                return Err(BillingError::business(
                    BusinessCode::InvoiceVoided,
                    format!("invoice {invoice_id} is voided"),
                ));
            }
            InvoiceStatus::Paid => {
                return Err(BillingError::business(
                    BusinessCode::InvoicePaid,
                    format!("invoice {invoice_id} is already paid"),
                ));
            }
            InvoiceStatus::Draft => {
                return Err(BillingError::business(
                    BusinessCode::InvoiceNotIssued,
                    format!("invoice {invoice_id} has not been issued"),
                ));
            }
            InvoiceStatus::WrittenOff | InvoiceStatus::Uncollectible => {
                return Err(BillingError::Conflict(format!(
                    "invoice {invoice_id} is not collectible in status {:?}",
                    invoice.status
                )));
            }
            InvoiceStatus::Issued | InvoiceStatus::PartiallyPaid | InvoiceStatus::Disputed => {}
        }

        let currency = request.currency.trim().to_ascii_uppercase();
        if currency != invoice.currency {
            return Err(BillingError::business(
                BusinessCode::CurrencyMismatch,
                format!("expected {}, got {currency}", invoice.currency),
            ));
        }
        validate_positive_cents(request.amount_cents, "amount_cents")?;
        if request.amount_cents > invoice.outstanding_cents() {
            // Overpayment is rejected, never silently stored as credit.
            return Err(BillingError::business(
                BusinessCode::AmountMismatch,
                format!(
                    "allocation {} exceeds outstanding {} on invoice {invoice_id}",
                    request.amount_cents,
                    invoice.outstanding_cents()
                ),
            ));
        }

        let now = Utc::now();
        let applied = self
            .store
            .apply_payment(ApplyPaymentRequest {
                tenant_id: tenant.clone(),
                invoice_id: invoice_id.clone(),
                processor_payment_id: request.processor_payment_id.clone(),
                amount_cents: request.amount_cents,
                currency,
                allocation_type: request.allocation_type,
                occurred_at: now,
            })
            .await?;

        self.record_financial_event(
            tenant,
            FinancialEvent {
                customer_id: &applied.invoice.customer_id,
                invoice_id: Some(invoice_id),
                event_type: LedgerEventType::PaymentApplied,
                amount_delta_cents: -request.amount_cents,
                currency: &applied.invoice.currency,
                source_kind: "payment",
                source_key: &request.processor_payment_id,
                gl_trigger: Some(ArTrigger::PaymentApplied),
                gl_doc_type: SourceDocType::Payment,
                gl_doc_id: &request.processor_payment_id,
                occurred_at: now,
            },
        )
        .await?;

        Ok((applied.application, applied.invoice))
    }

    /// Signed correction against the customer balance:
    /// DR Sales-returns / CR Receivable.
    pub async fn create_credit_memo(
        &self,
        tenant: &TenantId,
        request: CreateCreditMemoRequest,
    ) -> BillingResult<CreditMemo> {
        validate_positive_cents(request.amount_cents, "amount_cents")?;
        let currency = request.currency.trim().to_ascii_uppercase();
        validate_currency_code(&currency)?;
        let customer = self.get_customer(tenant, &request.customer_id).await?;

        if let Some(invoice_id) = &request.invoice_id {
            let invoice = self.store.invoice(tenant, invoice_id).await?;
            if invoice.currency != currency {
                return Err(BillingError::business(
                    BusinessCode::CurrencyMismatch,
                    format!("expected {}, got {currency}", invoice.currency),
                ));
            }
        }

        let memo = CreditMemo {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant.clone(),
            customer_id: customer.id.clone(),
            invoice_id: request.invoice_id.clone(),
            amount_cents: request.amount_cents,
            currency: currency.clone(),
            reason: request.reason,
            memo: request.memo.clone(),
            created_at: Utc::now(),
        };
        let memo = self.store.insert_credit_memo(memo).await?;

        self.record_financial_event(
            tenant,
            FinancialEvent {
                customer_id: &memo.customer_id,
                invoice_id: memo.invoice_id.as_ref(),
                event_type: LedgerEventType::CreditIssued,
                amount_delta_cents: -memo.amount_cents,
                currency: &memo.currency,
                source_kind: "credit-memo",
                source_key: &memo.id,
                gl_trigger: Some(ArTrigger::CreditIssued),
                gl_doc_type: SourceDocType::CreditMemo,
                gl_doc_id: &memo.id,
                occurred_at: memo.created_at,
            },
        )
        .await?;
        Ok(memo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::Harness;
    use crate::testutil::harness;
    use pretty_assertions::assert_eq;
    use remit_gl::SUBJECT_POSTING_REQUESTED;

    async fn seeded(h: &Harness) -> remit_ledger::Customer {
        h.billing
            .create_customer(
                &"acme".to_string(),
                crate::CreateCustomerRequest {
                    external_id: "cu_001".into(),
                    email: "cu@example.com".into(),
                    display_name: "Customer One".into(),
                },
            )
            .await
            .expect("create customer")
    }

    fn invoice_request(customer_id: &str, amount: i64) -> CreateInvoiceRequest {
        CreateInvoiceRequest {
            customer_id: customer_id.into(),
            currency: "usd".into(),
            lines: vec![InvoiceLineInput {
                description: "Pro plan".into(),
                quantity: 1,
                unit_price_cents: amount,
            }],
            tax_cents: 0,
            due_at: None,
            period_start: None,
            period_end: None,
        }
    }

    #[tokio::test]
    async fn issue_books_receivable_and_emits_gl() {
        let h = harness();
        let customer = seeded(&h).await;
        let invoice = h
            .billing
            .create_invoice(&"acme".to_string(), invoice_request(&customer.id, 9_900))
            .await
            .expect("create");
        assert_eq!(invoice.status, InvoiceStatus::Draft);
        assert_eq!(invoice.total_cents, 9_900);

        let issued = h
            .billing
            .issue_invoice(&"acme".to_string(), &invoice.id)
            .await
            .expect("issue");
        assert_eq!(issued.status, InvoiceStatus::Issued);
        assert!(issued.due_at.is_some());

        let balance = h
            .billing
            .get_customer(&"acme".to_string(), &customer.id)
            .await
            .expect("customer")
            .ar_balance_cents;
        assert_eq!(balance, 9_900);

        let intents = h.publisher.published_on(SUBJECT_POSTING_REQUESTED).await;
        assert_eq!(intents.len(), 1);

        // Issuing twice conflicts and does not double-book.
        let err = h
            .billing
            .issue_invoice(&"acme".to_string(), &invoice.id)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Conflict(_)));
    }

    #[tokio::test]
    async fn application_flow_flips_paid_and_clears_balance() {
        let h = harness();
        let customer = seeded(&h).await;
        let invoice = h
            .billing
            .create_invoice(&"acme".to_string(), invoice_request(&customer.id, 9_900))
            .await
            .expect("create");
        h.billing
            .issue_invoice(&"acme".to_string(), &invoice.id)
            .await
            .expect("issue");

        let (application, updated) = h
            .billing
            .record_application(
                &"acme".to_string(),
                &invoice.id,
                RecordApplicationRequest {
                    processor_payment_id: "pay_1".into(),
                    amount_cents: 9_900,
                    currency: "USD".into(),
                    allocation_type: AllocationType::Auto,
                },
            )
            .await
            .expect("apply");
        assert_eq!(application.allocated_cents, 9_900);
        assert_eq!(updated.status, InvoiceStatus::Paid);

        let customer = h
            .billing
            .get_customer(&"acme".to_string(), &customer.id)
            .await
            .expect("customer");
        assert_eq!(customer.ar_balance_cents, 0);
    }

    #[tokio::test]
    async fn application_business_codes() {
        let h = harness();
        let customer = seeded(&h).await;
        let invoice = h
            .billing
            .create_invoice(&"acme".to_string(), invoice_request(&customer.id, 9_900))
            .await
            .expect("create");

        let request = |amount: i64, currency: &str| RecordApplicationRequest {
            processor_payment_id: "pay_1".into(),
            amount_cents: amount,
            currency: currency.into(),
            allocation_type: AllocationType::Auto,
        };

        // Draft invoice.
        let err = h
            .billing
            .record_application(&"acme".to_string(), &invoice.id, request(9_900, "USD"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BillingError::Business {
                code: BusinessCode::InvoiceNotIssued,
                ..
            }
        ));

        h.billing
            .issue_invoice(&"acme".to_string(), &invoice.id)
            .await
            .expect("issue");

        let err = h
            .billing
            .record_application(&"acme".to_string(), &invoice.id, request(9_900, "EUR"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BillingError::Business {
                code: BusinessCode::CurrencyMismatch,
                ..
            }
        ));

        let err = h
            .billing
            .record_application(&"acme".to_string(), &invoice.id, request(10_000, "USD"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BillingError::Business {
                code: BusinessCode::AmountMismatch,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn void_restores_balance_and_blocks_paid_invoices() {
        let h = harness();
        let customer = seeded(&h).await;
        let invoice = h
            .billing
            .create_invoice(&"acme".to_string(), invoice_request(&customer.id, 5_000))
            .await
            .expect("create");
        h.billing
            .issue_invoice(&"acme".to_string(), &invoice.id)
            .await
            .expect("issue");

        let voided = h
            .billing
            .void_invoice(&"acme".to_string(), &invoice.id)
            .await
            .expect("void");
        assert_eq!(voided.status, InvoiceStatus::Voided);

        let balance = h
            .billing
            .get_customer(&"acme".to_string(), &customer.id)
            .await
            .expect("customer")
            .ar_balance_cents;
        assert_eq!(balance, 0);

        // Terminal now: voiding again conflicts.
        let err = h
            .billing
            .void_invoice(&"acme".to_string(), &invoice.id)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Conflict(_)));

        // Applications on a voided invoice carry the documented code.
        let err = h
            .billing
            .record_application(
                &"acme".to_string(),
                &invoice.id,
                RecordApplicationRequest {
                    processor_payment_id: "pay_9".into(),
                    amount_cents: 100,
                    currency: "USD".into(),
                    allocation_type: AllocationType::Auto,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BillingError::Business {
                code: BusinessCode::InvoiceVoided,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn write_off_books_bad_debt() {
        let h = harness();
        let customer = seeded(&h).await;
        let invoice = h
            .billing
            .create_invoice(&"acme".to_string(), invoice_request(&customer.id, 5_000))
            .await
            .expect("create");
        h.billing
            .issue_invoice(&"acme".to_string(), &invoice.id)
            .await
            .expect("issue");

        let written_off = h
            .billing
            .write_off_invoice(&"acme".to_string(), &invoice.id)
            .await
            .expect("write off");
        assert_eq!(written_off.status, InvoiceStatus::WrittenOff);

        let events = h
            .store
            .ledger_events(&"acme".to_string(), &customer.id)
            .await
            .expect("events");
        assert!(
            events
                .iter()
                .any(|event| event.event_type == LedgerEventType::WriteOff)
        );

        let balance = h
            .billing
            .get_customer(&"acme".to_string(), &customer.id)
            .await
            .expect("customer")
            .ar_balance_cents;
        assert_eq!(balance, 0);
    }

    #[tokio::test]
    async fn credit_memo_reduces_balance_and_emits_gl() {
        let h = harness();
        let customer = seeded(&h).await;
        let invoice = h
            .billing
            .create_invoice(&"acme".to_string(), invoice_request(&customer.id, 9_900))
            .await
            .expect("create");
        h.billing
            .issue_invoice(&"acme".to_string(), &invoice.id)
            .await
            .expect("issue");

        let memo = h
            .billing
            .create_credit_memo(
                &"acme".to_string(),
                CreateCreditMemoRequest {
                    customer_id: customer.id.clone(),
                    invoice_id: Some(invoice.id.clone()),
                    amount_cents: 1_000,
                    currency: "USD".into(),
                    reason: CreditReason::Goodwill,
                    memo: Some("outage credit".into()),
                },
            )
            .await
            .expect("credit memo");
        assert_eq!(memo.reason, CreditReason::Goodwill);

        let balance = h
            .billing
            .get_customer(&"acme".to_string(), &customer.id)
            .await
            .expect("customer")
            .ar_balance_cents;
        assert_eq!(balance, 8_900);

        let intents = h.publisher.published_on(SUBJECT_POSTING_REQUESTED).await;
        assert_eq!(intents.len(), 2);
    }
}
