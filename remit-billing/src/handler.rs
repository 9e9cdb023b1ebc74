use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use remit_gl::ArTrigger;
use remit_gl::SourceDocType;
use remit_ledger::AllocationType;
use remit_ledger::ArStore;
use remit_ledger::Customer;
use remit_ledger::CustomerId;
use remit_ledger::DelinquencyState;
use remit_ledger::Dispute;
use remit_ledger::DisputeStatus;
use remit_ledger::LedgerError;
use remit_ledger::LedgerEventType;
use remit_ledger::Refund;
use remit_ledger::RefundStatus;
use remit_ledger::SubscriptionStatus;
use remit_ledger::Upsert;
use remit_retry::dunning::DunningDecision;
use remit_webhooks::EventKind;
use remit_webhooks::HandlerError;
use remit_webhooks::ProcessorEvent;
use remit_webhooks::WebhookHandler;
use remit_webhooks::classify;
use serde::Deserialize;
use uuid::Uuid;

use crate::Billing;
use crate::BillingError;
use crate::BillingResult;
use crate::RecordApplicationRequest;
use crate::TenantId;
use crate::postings::FinancialEvent;

/// Bridges the webhook ingestor into the command services. All ordering,
/// dedupe, and retry bookkeeping happens upstream; this type only carries
/// domain semantics.
#[derive(Clone)]
pub struct BillingWebhookHandler {
    billing: Billing,
}

impl BillingWebhookHandler {
    #[must_use]
    pub fn new(billing: Billing) -> Self {
        Self { billing }
    }
}

fn parse_data<T: for<'de> Deserialize<'de>>(event: &ProcessorEvent) -> Result<T, HandlerError> {
    serde_json::from_value(event.data.clone()).map_err(|err| {
        HandlerError::permanent("malformed_payload", format!("event {}: {err}", event.id))
    })
}

fn map_billing_error(err: BillingError) -> HandlerError {
    match err {
        // The referenced entity may simply not have committed locally yet;
        // redelivery can succeed later.
        BillingError::NotFound(what) => HandlerError::retriable("not_found", what),
        BillingError::Processor(processor) if processor.retriable => {
            HandlerError::retriable(processor.code.clone(), processor.to_string())
        }
        other => HandlerError::permanent("handler_failed", other.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct PaymentSucceededData {
    payment_id: String,
    #[serde(default)]
    invoice_id: Option<String>,
    #[serde(default)]
    customer_external_id: Option<String>,
    amount_cents: i64,
    currency: String,
}

#[derive(Debug, Deserialize)]
struct PaymentFailedData {
    #[serde(default)]
    payment_id: Option<String>,
    customer_external_id: String,
    failure_code: String,
}

#[derive(Debug, Deserialize)]
struct RefundData {
    refund_id: String,
    charge_id: String,
    amount_cents: i64,
    currency: String,
    status: String,
    #[serde(default)]
    reference_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DisputeData {
    dispute_id: String,
    charge_id: String,
    amount_cents: i64,
    currency: String,
    status: DisputeStatus,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionData {
    subscription_id: String,
    #[serde(default)]
    status: Option<SubscriptionStatus>,
    #[serde(default)]
    current_period_start: Option<DateTime<Utc>>,
    #[serde(default)]
    current_period_end: Option<DateTime<Utc>>,
    #[serde(default)]
    cancel_at_period_end: Option<bool>,
}

#[async_trait]
impl WebhookHandler for BillingWebhookHandler {
    async fn handle(&self, tenant: &TenantId, event: &ProcessorEvent) -> Result<(), HandlerError> {
        match classify(&event.event_type) {
            EventKind::PaymentSucceeded => {
                let data: PaymentSucceededData = parse_data(event)?;
                self.billing
                    .handle_payment_succeeded(tenant, &data, event.occurred_at)
                    .await
                    .map_err(map_billing_error)
            }
            EventKind::PaymentFailed => {
                let data: PaymentFailedData = parse_data(event)?;
                self.billing
                    .handle_payment_failed(tenant, &data, event.occurred_at)
                    .await
                    .map_err(map_billing_error)
            }
            EventKind::Refund => {
                let data: RefundData = parse_data(event)?;
                self.billing
                    .handle_refund_event(tenant, &data, event.occurred_at)
                    .await
                    .map_err(map_billing_error)
            }
            EventKind::Dispute => {
                let data: DisputeData = parse_data(event)?;
                self.billing
                    .handle_dispute_event(tenant, &data, event.occurred_at)
                    .await
                    .map_err(map_billing_error)
            }
            EventKind::Subscription => {
                let data: SubscriptionData = parse_data(event)?;
                self.billing
                    .handle_subscription_event(tenant, &data)
                    .await
                    .map_err(map_billing_error)
            }
            EventKind::Unknown => Ok(()),
        }
    }
}

impl Billing {
    async fn handle_payment_succeeded(
        &self,
        tenant: &TenantId,
        data: &PaymentSucceededData,
        occurred_at: DateTime<Utc>,
    ) -> BillingResult<()> {
        let customer_id = match &data.invoice_id {
            Some(invoice_id) => {
                let (_, invoice) = self
                    .record_application(
                        tenant,
                        invoice_id,
                        RecordApplicationRequest {
                            processor_payment_id: data.payment_id.clone(),
                            amount_cents: data.amount_cents,
                            currency: data.currency.clone(),
                            allocation_type: AllocationType::Auto,
                        },
                    )
                    .await?;
                invoice.customer_id
            }
            None => {
                // Payment on account: reduce the balance without an invoice
                // allocation.
                let external_id = data.customer_external_id.as_deref().ok_or_else(|| {
                    BillingError::Validation(
                        "payment event carries neither invoice_id nor customer_external_id".into(),
                    )
                })?;
                let customer = self
                    .store()
                    .customer_by_external_id(tenant, external_id)
                    .await?;
                self.record_financial_event(
                    tenant,
                    FinancialEvent {
                        customer_id: &customer.id,
                        invoice_id: None,
                        event_type: LedgerEventType::PaymentApplied,
                        amount_delta_cents: -data.amount_cents,
                        currency: &data.currency.to_ascii_uppercase(),
                        source_kind: "payment",
                        source_key: &data.payment_id,
                        gl_trigger: Some(ArTrigger::PaymentApplied),
                        gl_doc_type: SourceDocType::Payment,
                        gl_doc_id: &data.payment_id,
                        occurred_at,
                    },
                )
                .await?;
                customer.id
            }
        };
        self.clear_dunning_state(tenant, &customer_id).await
    }

    /// A successful collection resets the retry ladder and lifts the
    /// customer out of delinquency.
    async fn clear_dunning_state(
        &self,
        tenant: &TenantId,
        customer_id: &CustomerId,
    ) -> BillingResult<()> {
        let mut customer = self.store().customer(tenant, customer_id).await?;
        if customer.payment_retry_count == 0 && customer.delinquency == DelinquencyState::None {
            return Ok(());
        }
        customer.payment_retry_count = 0;
        customer.next_retry_at = None;
        customer.grace_period_end = None;
        if customer.delinquency != DelinquencyState::None {
            tracing::info!(
                tenant_id = %tenant,
                customer_id = %customer_id,
                previous = ?customer.delinquency,
                "customer restored to good standing after successful payment"
            );
            customer.delinquency = DelinquencyState::None;
        }
        self.store().update_customer(customer).await?;
        Ok(())
    }

    async fn handle_payment_failed(
        &self,
        tenant: &TenantId,
        data: &PaymentFailedData,
        occurred_at: DateTime<Utc>,
    ) -> BillingResult<()> {
        let customer = self
            .store()
            .customer_by_external_id(tenant, &data.customer_external_id)
            .await?;
        self.record_payment_failure(tenant, &customer.id, &data.failure_code, occurred_at)
            .await?;
        tracing::info!(
            tenant_id = %tenant,
            customer_id = %customer.id,
            payment_id = data.payment_id.as_deref().unwrap_or("unknown"),
            failure_code = %data.failure_code,
            "payment failure recorded"
        );
        Ok(())
    }

    /// Shared by the webhook path and the dunning engine: bumps the retry
    /// counter, schedules the next attempt on the day ladder, and walks the
    /// delinquency state machine.
    pub(crate) async fn record_payment_failure(
        &self,
        tenant: &TenantId,
        customer_id: &CustomerId,
        failure_code: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<Customer> {
        let mut customer = self.store().customer(tenant, customer_id).await?;
        customer.payment_retry_count += 1;

        match self
            .dunning
            .after_failure(customer.payment_retry_count, failure_code, now)
        {
            DunningDecision::RetryAt(at) => customer.next_retry_at = Some(at),
            DunningDecision::GiveUp => customer.next_retry_at = None,
        }

        if self.dunning.is_delinquent(customer.payment_retry_count)
            && customer.delinquency == DelinquencyState::None
        {
            customer.delinquency = DelinquencyState::Delinquent;
            customer.grace_period_end = Some(self.dunning.grace_period_end(now));
            tracing::warn!(
                tenant_id = %tenant,
                customer_id = %customer_id,
                failures = customer.payment_retry_count,
                "customer marked delinquent"
            );
        }

        Ok(self.store().update_customer(customer).await?)
    }

    async fn handle_refund_event(
        &self,
        tenant: &TenantId,
        data: &RefundData,
        occurred_at: DateTime<Utc>,
    ) -> BillingResult<()> {
        // Known refund: converge the status.
        match self.store().refund_by_processor_id(tenant, &data.refund_id).await {
            Ok(mut refund) => {
                let new_status = match data.status.as_str() {
                    "succeeded" => RefundStatus::Succeeded,
                    "failed" => RefundStatus::Failed,
                    _ => refund.status,
                };
                if refund.status != new_status {
                    refund.status = new_status;
                    self.store().update_refund(refund).await?;
                }
                return Ok(());
            }
            Err(LedgerError::NotFound(_)) => {}
            Err(err) => return Err(err.into()),
        }

        // Processor-initiated refund: create only when the originating
        // charge is resolvable locally.
        let charge = self
            .store()
            .charge_by_processor_id(tenant, &data.charge_id)
            .await?;
        let reference_id = data
            .reference_id
            .clone()
            .unwrap_or_else(|| format!("wh-{}", data.refund_id));
        let status = if data.status == "succeeded" {
            RefundStatus::Succeeded
        } else {
            RefundStatus::Failed
        };
        let refund = Refund {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant.clone(),
            customer_id: charge.customer_id.clone(),
            charge_id: charge.id.clone(),
            reference_id: reference_id.clone(),
            amount_cents: data.amount_cents,
            currency: data.currency.to_ascii_uppercase(),
            status,
            processor_refund_id: Some(data.refund_id.clone()),
            reason: None,
            created_at: occurred_at,
        };
        let refund = match self.store().insert_refund(refund).await? {
            Upsert::Created(refund) => refund,
            Upsert::Existing(existing) => existing,
        };

        if status == RefundStatus::Succeeded {
            self.record_financial_event(
                tenant,
                FinancialEvent {
                    customer_id: &refund.customer_id,
                    invoice_id: None,
                    event_type: LedgerEventType::RefundRecorded,
                    amount_delta_cents: -refund.amount_cents,
                    currency: &refund.currency,
                    source_kind: "refund",
                    source_key: &refund.reference_id,
                    gl_trigger: Some(ArTrigger::RefundRecorded),
                    gl_doc_type: SourceDocType::Refund,
                    gl_doc_id: &refund.id,
                    occurred_at,
                },
            )
            .await?;
        }
        Ok(())
    }

    async fn handle_dispute_event(
        &self,
        tenant: &TenantId,
        data: &DisputeData,
        occurred_at: DateTime<Utc>,
    ) -> BillingResult<()> {
        let charge = self
            .store()
            .charge_by_processor_id(tenant, &data.charge_id)
            .await?;

        let previous = self
            .store()
            .dispute_by_processor_id(tenant, &data.dispute_id)
            .await
            .ok();

        let dispute = Dispute {
            id: previous
                .as_ref()
                .map(|existing| existing.id.clone())
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            tenant_id: tenant.clone(),
            customer_id: charge.customer_id.clone(),
            charge_id: Some(charge.id.clone()),
            processor_dispute_id: data.dispute_id.clone(),
            amount_cents: data.amount_cents,
            currency: data.currency.to_ascii_uppercase(),
            status: data.status,
            opened_at: previous
                .as_ref()
                .map(|existing| existing.opened_at)
                .unwrap_or(occurred_at),
            closed_at: data.status.is_closed().then_some(occurred_at),
            processor_updated_at: data.updated_at,
        };
        let stored = self.store().upsert_dispute(dispute).await?;

        // Losing the dispute pulls the funds back: the adjustment posts
        // exactly once per dispute id regardless of redelivery.
        if stored.status == DisputeStatus::ClosedLost {
            self.record_financial_event(
                tenant,
                FinancialEvent {
                    customer_id: &stored.customer_id,
                    invoice_id: None,
                    event_type: LedgerEventType::DisputeLoss,
                    amount_delta_cents: -stored.amount_cents,
                    currency: &stored.currency,
                    source_kind: "dispute-loss",
                    source_key: &stored.processor_dispute_id,
                    gl_trigger: Some(ArTrigger::DisputeLost),
                    gl_doc_type: SourceDocType::Dispute,
                    gl_doc_id: &stored.id,
                    occurred_at,
                },
            )
            .await?;
        }
        Ok(())
    }

    async fn handle_subscription_event(
        &self,
        tenant: &TenantId,
        data: &SubscriptionData,
    ) -> BillingResult<()> {
        let mut subscription = self
            .store()
            .subscription_by_processor_id(tenant, &data.subscription_id)
            .await?;
        if let Some(status) = data.status {
            subscription.status = status;
            if status == SubscriptionStatus::Canceled && subscription.canceled_at.is_none() {
                subscription.canceled_at = Some(Utc::now());
            }
        }
        if let Some(start) = data.current_period_start {
            subscription.current_period_start = start;
        }
        if let Some(end) = data.current_period_end {
            subscription.current_period_end = end;
        }
        if let Some(flag) = data.cancel_at_period_end {
            subscription.cancel_at_period_end = flag;
        }
        self.store().update_subscription(subscription).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AttachPaymentMethodRequest;
    use crate::CreateChargeRequest;
    use crate::CreateInvoiceRequest;
    use crate::InvoiceLineInput;
    use crate::testutil::Harness;
    use crate::testutil::harness;
    use pretty_assertions::assert_eq;
    use remit_gl::SUBJECT_POSTING_REQUESTED;
    use remit_ledger::InvoiceStatus;
    use serde_json::json;

    fn event(event_type: &str, data: serde_json::Value) -> ProcessorEvent {
        ProcessorEvent {
            id: format!("evt-{}", Uuid::new_v4().simple()),
            event_type: event_type.into(),
            occurred_at: Utc::now(),
            data,
        }
    }

    async fn seeded(h: &Harness) -> remit_ledger::Customer {
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
            .expect("create customer");
        h.billing
            .attach_payment_method(
                &"acme".to_string(),
                AttachPaymentMethodRequest {
                    customer_id: customer.id.clone(),
                    token: "pm_test_1".into(),
                    set_default: true,
                    raw_payload: json!({"token": "pm_test_1"}),
                },
            )
            .await
            .expect("attach");
        customer
    }

    async fn issued_invoice(h: &Harness, customer_id: &str, total: i64) -> remit_ledger::Invoice {
        let invoice = h
            .billing
            .create_invoice(
                &"acme".to_string(),
                CreateInvoiceRequest {
                    customer_id: customer_id.into(),
                    currency: "USD".into(),
                    lines: vec![InvoiceLineInput {
                        description: "Pro plan".into(),
                        quantity: 1,
                        unit_price_cents: total,
                    }],
                    tax_cents: 0,
                    due_at: None,
                    period_start: None,
                    period_end: None,
                },
            )
            .await
            .expect("create invoice");
        h.billing
            .issue_invoice(&"acme".to_string(), &invoice.id)
            .await
            .expect("issue")
    }

    #[tokio::test]
    async fn payment_succeeded_applies_to_invoice_and_zeroes_balance() {
        let h = harness();
        let customer = seeded(&h).await;
        let invoice = issued_invoice(&h, &customer.id, 9_900).await;
        let handler = BillingWebhookHandler::new(h.billing.clone());

        handler
            .handle(
                &"acme".to_string(),
                &event(
                    "payments.payment.succeeded",
                    json!({
                        "payment_id": "pay_1",
                        "invoice_id": invoice.id,
                        "amount_cents": 9_900,
                        "currency": "USD"
                    }),
                ),
            )
            .await
            .expect("handle");

        let invoice = h
            .billing
            .get_invoice(&"acme".to_string(), &invoice.id)
            .await
            .expect("invoice");
        assert_eq!(invoice.status, InvoiceStatus::Paid);

        let customer = h
            .billing
            .get_customer(&"acme".to_string(), &customer.id)
            .await
            .expect("customer");
        assert_eq!(customer.ar_balance_cents, 0);

        // Exactly one DR Cash / CR Receivable intent.
        let intents = h.publisher.published_on(SUBJECT_POSTING_REQUESTED).await;
        let payment_intents: Vec<_> = intents
            .iter()
            .filter(|envelope| {
                envelope.payload.data["source_doc_type"] == json!("payment")
            })
            .collect();
        assert_eq!(payment_intents.len(), 1);
        let lines = &payment_intents[0].payload.data["lines"];
        assert_eq!(lines[0]["debit_cents"], json!(9_900));
        assert_eq!(lines[1]["credit_cents"], json!(9_900));
    }

    #[tokio::test]
    async fn repeated_payment_failures_walk_the_dunning_ladder() {
        let h = harness();
        let customer = seeded(&h).await;
        let handler = BillingWebhookHandler::new(h.billing.clone());
        let t0 = Utc::now();

        for attempt in 1..=5_u32 {
            handler
                .handle(
                    &"acme".to_string(),
                    &event(
                        "payments.payment.failed",
                        json!({
                            "payment_id": format!("pay_{attempt}"),
                            "customer_external_id": "cu_001",
                            "failure_code": "insufficient_funds"
                        }),
                    ),
                )
                .await
                .expect("handle failure");

            let stored = h
                .billing
                .get_customer(&"acme".to_string(), &customer.id)
                .await
                .expect("customer");
            assert_eq!(stored.payment_retry_count, attempt);
            if attempt < 5 {
                let next = stored.next_retry_at.expect("scheduled retry");
                // Offsets are measured from each failure, so just confirm
                // the schedule stays within the documented day ladder.
                assert!(next > t0);
            } else {
                assert!(stored.next_retry_at.is_none(), "ladder exhausted");
            }

            if attempt >= 3 {
                assert_eq!(stored.delinquency, DelinquencyState::Delinquent);
                assert!(stored.grace_period_end.is_some());
            } else {
                assert_eq!(stored.delinquency, DelinquencyState::None);
            }
        }
    }

    #[tokio::test]
    async fn terminal_failure_stops_retries_immediately() {
        let h = harness();
        let customer = seeded(&h).await;
        let handler = BillingWebhookHandler::new(h.billing.clone());

        handler
            .handle(
                &"acme".to_string(),
                &event(
                    "payments.payment.failed",
                    json!({
                        "customer_external_id": "cu_001",
                        "failure_code": "expired_card"
                    }),
                ),
            )
            .await
            .expect("handle");

        let stored = h
            .billing
            .get_customer(&"acme".to_string(), &customer.id)
            .await
            .expect("customer");
        assert_eq!(stored.payment_retry_count, 1);
        assert!(stored.next_retry_at.is_none());
    }

    #[tokio::test]
    async fn successful_payment_clears_delinquency() {
        let h = harness();
        let customer = seeded(&h).await;
        let invoice = issued_invoice(&h, &customer.id, 2_000).await;
        let handler = BillingWebhookHandler::new(h.billing.clone());

        for attempt in 1..=3 {
            handler
                .handle(
                    &"acme".to_string(),
                    &event(
                        "payments.payment.failed",
                        json!({
                            "payment_id": format!("pay_{attempt}"),
                            "customer_external_id": "cu_001",
                            "failure_code": "insufficient_funds"
                        }),
                    ),
                )
                .await
                .expect("failure");
        }

        handler
            .handle(
                &"acme".to_string(),
                &event(
                    "payments.payment.succeeded",
                    json!({
                        "payment_id": "pay_ok",
                        "invoice_id": invoice.id,
                        "amount_cents": 2_000,
                        "currency": "USD"
                    }),
                ),
            )
            .await
            .expect("success");

        let stored = h
            .billing
            .get_customer(&"acme".to_string(), &customer.id)
            .await
            .expect("customer");
        assert_eq!(stored.delinquency, DelinquencyState::None);
        assert_eq!(stored.payment_retry_count, 0);
        assert!(stored.grace_period_end.is_none());
    }

    #[tokio::test]
    async fn processor_initiated_refund_requires_local_charge() {
        let h = harness();
        let customer = seeded(&h).await;
        let handler = BillingWebhookHandler::new(h.billing.clone());

        // Unknown charge: retriable, the charge may still be committing.
        let err = handler
            .handle(
                &"acme".to_string(),
                &event(
                    "payments.refund.succeeded",
                    json!({
                        "refund_id": "proc_re_1",
                        "charge_id": "proc_ch_missing",
                        "amount_cents": 500,
                        "currency": "USD",
                        "status": "succeeded"
                    }),
                ),
            )
            .await
            .unwrap_err();
        assert!(err.retriable);

        let charge = h
            .billing
            .create_charge(
                &"acme".to_string(),
                CreateChargeRequest {
                    reference_id: "r-1".into(),
                    customer_id: customer.id.clone(),
                    amount_cents: 2_000,
                    currency: "USD".into(),
                },
            )
            .await
            .expect("charge");
        let processor_charge_id = charge.processor_charge_id.expect("processor id");

        let refund_event = event(
            "payments.refund.succeeded",
            json!({
                "refund_id": "proc_re_1",
                "charge_id": processor_charge_id,
                "amount_cents": 500,
                "currency": "USD",
                "status": "succeeded"
            }),
        );
        handler
            .handle(&"acme".to_string(), &refund_event)
            .await
            .expect("refund created");

        let refund = h
            .store
            .refund_by_processor_id(&"acme".to_string(), "proc_re_1")
            .await
            .expect("stored refund");
        assert_eq!(refund.status, RefundStatus::Succeeded);
        assert_eq!(refund.amount_cents, 500);

        // Redelivery (same processor refund id) is a no-op.
        handler
            .handle(&"acme".to_string(), &refund_event)
            .await
            .expect("redelivery");
        let events = h
            .store
            .ledger_events(&"acme".to_string(), &customer.id)
            .await
            .expect("events");
        let refund_events: Vec<_> = events
            .iter()
            .filter(|e| e.event_type == LedgerEventType::RefundRecorded)
            .collect();
        assert_eq!(refund_events.len(), 1);
    }

    #[tokio::test]
    async fn dispute_closed_lost_emits_adjustment_once() {
        let h = harness();
        let customer = seeded(&h).await;
        let handler = BillingWebhookHandler::new(h.billing.clone());
        let charge = h
            .billing
            .create_charge(
                &"acme".to_string(),
                CreateChargeRequest {
                    reference_id: "r-1".into(),
                    customer_id: customer.id.clone(),
                    amount_cents: 2_000,
                    currency: "USD".into(),
                },
            )
            .await
            .expect("charge");
        let processor_charge_id = charge.processor_charge_id.expect("processor id");

        let opened_at = Utc::now();
        handler
            .handle(
                &"acme".to_string(),
                &event(
                    "payments.dispute.opened",
                    json!({
                        "dispute_id": "proc_dp_1",
                        "charge_id": processor_charge_id,
                        "amount_cents": 2_000,
                        "currency": "USD",
                        "status": "opened",
                        "updated_at": opened_at
                    }),
                ),
            )
            .await
            .expect("opened");

        // Opening changes no balances.
        let events = h
            .store
            .ledger_events(&"acme".to_string(), &customer.id)
            .await
            .expect("events");
        assert!(
            events
                .iter()
                .all(|e| e.event_type != LedgerEventType::DisputeLoss)
        );

        let lost_event = event(
            "payments.dispute.closed_lost",
            json!({
                "dispute_id": "proc_dp_1",
                "charge_id": processor_charge_id,
                "amount_cents": 2_000,
                "currency": "USD",
                "status": "closed_lost",
                "updated_at": opened_at + chrono::Duration::days(10)
            }),
        );
        handler
            .handle(&"acme".to_string(), &lost_event)
            .await
            .expect("closed lost");
        handler
            .handle(&"acme".to_string(), &lost_event)
            .await
            .expect("redelivered");

        let events = h
            .store
            .ledger_events(&"acme".to_string(), &customer.id)
            .await
            .expect("events");
        let losses: Vec<_> = events
            .iter()
            .filter(|e| e.event_type == LedgerEventType::DisputeLoss)
            .collect();
        assert_eq!(losses.len(), 1);

        let dispute = h
            .store
            .dispute_by_processor_id(&"acme".to_string(), "proc_dp_1")
            .await
            .expect("dispute");
        assert_eq!(dispute.status, DisputeStatus::ClosedLost);
    }

    #[tokio::test]
    async fn subscription_snapshot_updates_from_events() {
        let h = harness();
        let customer = seeded(&h).await;
        let handler = BillingWebhookHandler::new(h.billing.clone());
        let subscription = h
            .billing
            .create_subscription(
                &"acme".to_string(),
                crate::CreateSubscriptionRequest {
                    customer_id: customer.id.clone(),
                    plan_code: "pro-monthly".into(),
                    payment_method_id: None,
                    billing_cycle: remit_ledger::BillingCycle {
                        interval: remit_ledger::BillingInterval::Monthly,
                        interval_count: 1,
                    },
                    metadata: json!({}),
                    raw_payload: json!({}),
                },
            )
            .await
            .expect("subscription");

        let new_period_end = Utc::now() + chrono::Duration::days(61);
        handler
            .handle(
                &"acme".to_string(),
                &event(
                    "subscription.updated",
                    json!({
                        "subscription_id": subscription.processor_subscription_id,
                        "status": "past_due",
                        "current_period_end": new_period_end,
                        "cancel_at_period_end": true
                    }),
                ),
            )
            .await
            .expect("handle");

        let stored = h
            .billing
            .get_subscription(&"acme".to_string(), &subscription.id)
            .await
            .expect("fetch");
        assert_eq!(stored.status, SubscriptionStatus::PastDue);
        assert!(stored.cancel_at_period_end);
        assert_eq!(stored.current_period_end, new_period_end);
    }
}
