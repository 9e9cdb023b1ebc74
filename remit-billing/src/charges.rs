use chrono::Utc;
use remit_gl::ArTrigger;
use remit_gl::SourceDocType;
use remit_ledger::ArStore;
use remit_ledger::Charge;
use remit_ledger::ChargeId;
use remit_ledger::ChargeStatus;
use remit_ledger::CustomerId;
use remit_ledger::LedgerEventType;
use remit_ledger::Refund;
use remit_ledger::RefundStatus;
use remit_ledger::Upsert;
use remit_ledger::validate_currency_code;
use remit_ledger::validate_positive_cents;
use remit_processor::ProcessorClient;
use uuid::Uuid;

use crate::Billing;
use crate::BillingError;
use crate::BillingResult;
use crate::BusinessCode;
use crate::TenantId;
use crate::postings::FinancialEvent;

const RACE_SETTLE_POLLS: u32 = 50;
const RACE_SETTLE_INTERVAL: std::time::Duration = std::time::Duration::from_millis(20);

#[derive(Debug, Clone, PartialEq)]
pub struct CreateChargeRequest {
    /// Caller-chosen domain idempotency key; required.
    pub reference_id: String,
    pub customer_id: CustomerId,
    pub amount_cents: i64,
    pub currency: String,
}

impl CreateChargeRequest {
    pub fn normalize(mut self) -> BillingResult<Self> {
        self.reference_id = self.reference_id.trim().to_string();
        if self.reference_id.is_empty() {
            return Err(BillingError::Validation("reference_id is required".into()));
        }
        validate_positive_cents(self.amount_cents, "amount_cents")?;
        self.currency = self.currency.trim().to_ascii_uppercase();
        validate_currency_code(&self.currency)?;
        Ok(self)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateRefundRequest {
    pub reference_id: String,
    pub charge_id: ChargeId,
    pub amount_cents: i64,
    pub reason: Option<String>,
}

impl CreateRefundRequest {
    pub fn normalize(mut self) -> BillingResult<Self> {
        self.reference_id = self.reference_id.trim().to_string();
        if self.reference_id.is_empty() {
            return Err(BillingError::Validation("reference_id is required".into()));
        }
        validate_positive_cents(self.amount_cents, "amount_cents")?;
        Ok(self)
    }
}

impl Billing {
    /// One-time charge. The pending row commits before the processor call;
    /// concurrent submissions with the same `reference_id` collapse onto
    /// the first row via the store's unique-constraint race.
    pub async fn create_charge(
        &self,
        tenant: &TenantId,
        request: CreateChargeRequest,
    ) -> BillingResult<Charge> {
        let request = request.normalize()?;
        let mut customer = self.get_customer(tenant, &request.customer_id).await?;

        let default_method_id = customer
            .default_payment_method_id
            .clone()
            .ok_or_else(|| {
                BillingError::business(
                    BusinessCode::NoDefaultPaymentMethod,
                    format!("customer {} has no default payment method", customer.id),
                )
            })?;
        let method = self.store.payment_method(tenant, &default_method_id).await?;
        if !method.is_usable() {
            return Err(BillingError::business(
                BusinessCode::NoDefaultPaymentMethod,
                format!("default payment method {default_method_id} is not active"),
            ));
        }

        let pending = Charge {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant.clone(),
            customer_id: customer.id.clone(),
            reference_id: request.reference_id.clone(),
            payment_method_id: Some(method.id.clone()),
            amount_cents: request.amount_cents,
            currency: request.currency.clone(),
            status: ChargeStatus::Pending,
            processor_charge_id: None,
            failure_code: None,
            failure_message: None,
            created_at: Utc::now(),
            settled_at: None,
        };
        let mut charge = match self.store.insert_charge(pending).await? {
            Upsert::Existing(existing) => {
                tracing::info!(
                    tenant_id = %tenant,
                    charge_id = %existing.id,
                    reference_id = %existing.reference_id,
                    "charge reference replayed; returning existing charge"
                );
                return self.await_settled_charge(tenant, existing).await;
            }
            Upsert::Created(charge) => charge,
        };

        let processor_customer_id = self.ensure_processor_customer(tenant, &mut customer).await?;
        let response = match self
            .processor
            .create_charge(remit_processor::CreateChargeRequest {
                processor_customer_id,
                payment_method_token: method.processor_token.clone(),
                amount_cents: charge.amount_cents,
                currency: charge.currency.clone(),
                reference_id: charge.reference_id.clone(),
            })
            .await
        {
            Ok(response) => response,
            Err(err) => {
                // Persist the attempt before re-raising so retries and
                // reconciliation can see what happened.
                charge.status = ChargeStatus::Failed;
                charge.failure_code = Some(err.code.clone());
                charge.failure_message = err.message.clone();
                self.store.update_charge(charge).await?;
                return Err(err.into());
            }
        };

        charge.processor_charge_id = Some(response.id.clone());
        if response.status == "succeeded" {
            let now = Utc::now();
            charge.status = ChargeStatus::Succeeded;
            charge.settled_at = Some(now);
            let charge = self.store.update_charge(charge).await?;

            self.record_financial_event(
                tenant,
                FinancialEvent {
                    customer_id: &charge.customer_id,
                    invoice_id: None,
                    event_type: LedgerEventType::PaymentApplied,
                    amount_delta_cents: -charge.amount_cents,
                    currency: &charge.currency,
                    source_kind: "payment",
                    source_key: &response.id,
                    gl_trigger: Some(ArTrigger::PaymentApplied),
                    gl_doc_type: SourceDocType::Payment,
                    gl_doc_id: &charge.id,
                    occurred_at: now,
                },
            )
            .await?;
            tracing::info!(
                tenant_id = %tenant,
                charge_id = %charge.id,
                amount_cents = charge.amount_cents,
                "charge succeeded"
            );
            Ok(charge)
        } else {
            charge.status = ChargeStatus::Failed;
            charge.failure_code = response.failure_code.clone();
            let charge = self.store.update_charge(charge).await?;
            tracing::warn!(
                tenant_id = %tenant,
                charge_id = %charge.id,
                failure_code = charge.failure_code.as_deref().unwrap_or("unknown"),
                "charge declined"
            );
            Ok(charge)
        }
    }

    pub async fn get_charge(&self, tenant: &TenantId, id: &ChargeId) -> BillingResult<Charge> {
        Ok(self.store.charge(tenant, id).await?)
    }

    /// The loser of a reference-id race may observe the winner's row while
    /// its processor call is still in flight. Wait briefly for the row to
    /// settle so both callers answer with the same final record.
    async fn await_settled_charge(
        &self,
        tenant: &TenantId,
        mut charge: Charge,
    ) -> BillingResult<Charge> {
        for _ in 0..RACE_SETTLE_POLLS {
            if charge.status != ChargeStatus::Pending {
                return Ok(charge);
            }
            tokio::time::sleep(RACE_SETTLE_INTERVAL).await;
            charge = self.store.charge(tenant, &charge.id).await?;
        }
        Ok(charge)
    }

    async fn await_settled_refund(
        &self,
        tenant: &TenantId,
        mut refund: Refund,
    ) -> BillingResult<Refund> {
        for _ in 0..RACE_SETTLE_POLLS {
            if refund.status != RefundStatus::Pending {
                return Ok(refund);
            }
            tokio::time::sleep(RACE_SETTLE_INTERVAL).await;
            refund = self.store.refund(tenant, &refund.id).await?;
        }
        Ok(refund)
    }

    /// Refund against a settled charge, capped at the unrefunded remainder.
    /// Emits the negative ledger delta and a Sales-returns / Cash intent.
    pub async fn create_refund(
        &self,
        tenant: &TenantId,
        request: CreateRefundRequest,
    ) -> BillingResult<Refund> {
        let request = request.normalize()?;
        let charge = self.store.charge(tenant, &request.charge_id).await?;

        if !charge.is_settled() {
            return Err(BillingError::business(
                BusinessCode::ChargeNotSettled,
                format!("charge {} is not settled", charge.id),
            ));
        }
        let processor_charge_id = charge.processor_charge_id.clone().ok_or_else(|| {
            BillingError::Internal(format!("settled charge {} lacks a processor id", charge.id))
        })?;

        let already_refunded: i64 = self
            .store
            .refunds_for_charge(tenant, &charge.id)
            .await?
            .iter()
            .filter(|refund| refund.status != RefundStatus::Failed)
            .map(|refund| refund.amount_cents)
            .sum();
        if request.amount_cents + already_refunded > charge.amount_cents {
            return Err(BillingError::business(
                BusinessCode::AmountMismatch,
                format!(
                    "refund {} exceeds refundable remainder {} on charge {}",
                    request.amount_cents,
                    charge.amount_cents - already_refunded,
                    charge.id
                ),
            ));
        }

        let pending = Refund {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant.clone(),
            customer_id: charge.customer_id.clone(),
            charge_id: charge.id.clone(),
            reference_id: request.reference_id.clone(),
            amount_cents: request.amount_cents,
            currency: charge.currency.clone(),
            status: RefundStatus::Pending,
            processor_refund_id: None,
            reason: request.reason.clone(),
            created_at: Utc::now(),
        };
        let mut refund = match self.store.insert_refund(pending).await? {
            Upsert::Existing(existing) => {
                tracing::info!(
                    tenant_id = %tenant,
                    refund_id = %existing.id,
                    reference_id = %existing.reference_id,
                    "refund reference replayed; returning existing refund"
                );
                return self.await_settled_refund(tenant, existing).await;
            }
            Upsert::Created(refund) => refund,
        };

        let response = match self
            .processor
            .create_refund(remit_processor::CreateRefundRequest {
                processor_charge_id,
                amount_cents: refund.amount_cents,
                currency: refund.currency.clone(),
                reference_id: refund.reference_id.clone(),
            })
            .await
        {
            Ok(response) => response,
            Err(err) => {
                refund.status = RefundStatus::Failed;
                self.store.update_refund(refund).await?;
                return Err(err.into());
            }
        };

        refund.processor_refund_id = Some(response.id.clone());
        if response.status == "succeeded" {
            let now = Utc::now();
            refund.status = RefundStatus::Succeeded;
            let refund = self.store.update_refund(refund).await?;

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
                    occurred_at: now,
                },
            )
            .await?;
            tracing::info!(
                tenant_id = %tenant,
                refund_id = %refund.id,
                amount_cents = refund.amount_cents,
                "refund succeeded"
            );
            Ok(refund)
        } else {
            refund.status = RefundStatus::Failed;
            let refund = self.store.update_refund(refund).await?;
            tracing::warn!(
                tenant_id = %tenant,
                refund_id = %refund.id,
                failure_code = response.failure_code.as_deref().unwrap_or("unknown"),
                "refund declined"
            );
            Ok(refund)
        }
    }
}
