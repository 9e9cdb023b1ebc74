use std::collections::HashMap;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::AgingBuckets;
use crate::AppliedPayment;
use crate::ApplicationStatus;
use crate::ApplyPaymentRequest;
use crate::ArStore;
use crate::Charge;
use crate::ChargeId;
use crate::CreditMemo;
use crate::Customer;
use crate::CustomerFilter;
use crate::CustomerId;
use crate::Dispute;
use crate::Invoice;
use crate::InvoiceId;
use crate::InvoiceStatus;
use crate::LedgerError;
use crate::LedgerEvent;
use crate::LedgerResult;
use crate::PaymentApplication;
use crate::PaymentMethodId;
use crate::PaymentMethodRef;
use crate::PostEventRequest;
use crate::PostedEvent;
use crate::Refund;
use crate::RefundId;
use crate::Subscription;
use crate::SubscriptionId;
use crate::TenantId;
use crate::Upsert;
use crate::bucket_for_days_past_due;

type Key = (TenantId, String);

fn key(tenant: &TenantId, id: &str) -> Key {
    (tenant.clone(), id.to_string())
}

/// In-memory `ArStore`. A single mutex serializes every operation, which
/// stands in for the row-lock discipline a relational backend would use:
/// each trait call is one atomic check-then-write against the owning
/// aggregate.
#[derive(Default)]
pub struct InMemoryArStore {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    customers: HashMap<Key, Customer>,
    customer_external_ids: HashMap<Key, CustomerId>,
    payment_methods: HashMap<Key, PaymentMethodRef>,
    invoices: HashMap<Key, Invoice>,
    applications: HashMap<Key, PaymentApplication>,
    charges: HashMap<Key, Charge>,
    charge_references: HashMap<Key, ChargeId>,
    charge_processor_ids: HashMap<Key, ChargeId>,
    refunds: HashMap<Key, Refund>,
    refund_references: HashMap<Key, RefundId>,
    refund_processor_ids: HashMap<Key, RefundId>,
    disputes: HashMap<Key, Dispute>,
    credit_memos: HashMap<Key, CreditMemo>,
    subscriptions: HashMap<Key, Subscription>,
    subscription_processor_ids: HashMap<Key, SubscriptionId>,
    events: HashMap<Key, LedgerEvent>,
    event_sources: HashMap<Key, String>,
    event_order: Vec<Key>,
}

impl InMemoryArStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn require_customer<'a>(
        state: &'a State,
        tenant: &TenantId,
        id: &CustomerId,
    ) -> LedgerResult<&'a Customer> {
        state
            .customers
            .get(&key(tenant, id))
            .ok_or_else(|| LedgerError::NotFound(format!("customer {id}")))
    }
}

#[async_trait]
impl ArStore for InMemoryArStore {
    async fn insert_customer(&self, customer: Customer) -> LedgerResult<Customer> {
        let mut state = self.state.lock().await;
        let external_key = key(&customer.tenant_id, &customer.external_id);
        if state.customer_external_ids.contains_key(&external_key) {
            return Err(LedgerError::Conflict(format!(
                "customer with external id {} already exists",
                customer.external_id
            )));
        }
        state
            .customer_external_ids
            .insert(external_key, customer.id.clone());
        state
            .customers
            .insert(key(&customer.tenant_id, &customer.id), customer.clone());
        Ok(customer)
    }

    async fn customer(&self, tenant: &TenantId, id: &CustomerId) -> LedgerResult<Customer> {
        let state = self.state.lock().await;
        Self::require_customer(&state, tenant, id).cloned()
    }

    async fn customer_by_external_id(
        &self,
        tenant: &TenantId,
        external_id: &str,
    ) -> LedgerResult<Customer> {
        let state = self.state.lock().await;
        let id = state
            .customer_external_ids
            .get(&key(tenant, external_id))
            .ok_or_else(|| LedgerError::NotFound(format!("customer {external_id}")))?;
        state
            .customers
            .get(&key(tenant, id))
            .cloned()
            .ok_or_else(|| LedgerError::Internal(format!("dangling external id {external_id}")))
    }

    async fn update_customer(&self, customer: Customer) -> LedgerResult<Customer> {
        let mut state = self.state.lock().await;
        let customer_key = key(&customer.tenant_id, &customer.id);
        if !state.customers.contains_key(&customer_key) {
            return Err(LedgerError::NotFound(format!("customer {}", customer.id)));
        }
        state.customers.insert(customer_key, customer.clone());
        Ok(customer)
    }

    async fn soft_delete_customer(
        &self,
        tenant: &TenantId,
        id: &CustomerId,
        deleted_at: DateTime<Utc>,
    ) -> LedgerResult<Customer> {
        let mut state = self.state.lock().await;
        let customer = state
            .customers
            .get_mut(&key(tenant, id))
            .ok_or_else(|| LedgerError::NotFound(format!("customer {id}")))?;
        if customer.deleted_at.is_none() {
            customer.deleted_at = Some(deleted_at);
        }
        Ok(customer.clone())
    }

    async fn list_customers(
        &self,
        tenant: &TenantId,
        filter: CustomerFilter,
    ) -> LedgerResult<Vec<Customer>> {
        let state = self.state.lock().await;
        let mut customers: Vec<Customer> = state
            .customers
            .values()
            .filter(|customer| &customer.tenant_id == tenant)
            .filter(|customer| filter.include_deleted || customer.deleted_at.is_none())
            .filter(|customer| {
                filter
                    .delinquency
                    .is_none_or(|wanted| customer.delinquency == wanted)
            })
            .cloned()
            .collect();
        customers.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(customers)
    }

    async fn insert_payment_method(
        &self,
        method: PaymentMethodRef,
    ) -> LedgerResult<PaymentMethodRef> {
        let mut state = self.state.lock().await;
        Self::require_customer(&state, &method.tenant_id, &method.customer_id)?;
        state
            .payment_methods
            .insert(key(&method.tenant_id, &method.id), method.clone());
        Ok(method)
    }

    async fn payment_method(
        &self,
        tenant: &TenantId,
        id: &PaymentMethodId,
    ) -> LedgerResult<PaymentMethodRef> {
        let state = self.state.lock().await;
        state
            .payment_methods
            .get(&key(tenant, id))
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("payment method {id}")))
    }

    async fn update_payment_method(
        &self,
        method: PaymentMethodRef,
    ) -> LedgerResult<PaymentMethodRef> {
        let mut state = self.state.lock().await;
        let method_key = key(&method.tenant_id, &method.id);
        if !state.payment_methods.contains_key(&method_key) {
            return Err(LedgerError::NotFound(format!(
                "payment method {}",
                method.id
            )));
        }
        state.payment_methods.insert(method_key, method.clone());
        Ok(method)
    }

    async fn set_default_payment_method(
        &self,
        tenant: &TenantId,
        customer_id: &CustomerId,
        method_id: &PaymentMethodId,
    ) -> LedgerResult<PaymentMethodRef> {
        let mut state = self.state.lock().await;
        let target = state
            .payment_methods
            .get(&key(tenant, method_id))
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("payment method {method_id}")))?;
        if &target.customer_id != customer_id {
            return Err(LedgerError::NotFound(format!("payment method {method_id}")));
        }
        if !target.is_usable() {
            return Err(LedgerError::Validation(format!(
                "payment method {method_id} is not active"
            )));
        }

        for method in state.payment_methods.values_mut() {
            if &method.tenant_id == tenant && &method.customer_id == customer_id {
                method.is_default = method.id == *method_id;
            }
        }
        let customer = state
            .customers
            .get_mut(&key(tenant, customer_id))
            .ok_or_else(|| LedgerError::NotFound(format!("customer {customer_id}")))?;
        customer.default_payment_method_id = Some(method_id.clone());

        state
            .payment_methods
            .get(&key(tenant, method_id))
            .cloned()
            .ok_or_else(|| LedgerError::Internal(format!("payment method {method_id} vanished")))
    }

    async fn list_payment_methods(
        &self,
        tenant: &TenantId,
        customer_id: &CustomerId,
    ) -> LedgerResult<Vec<PaymentMethodRef>> {
        let state = self.state.lock().await;
        let mut methods: Vec<PaymentMethodRef> = state
            .payment_methods
            .values()
            .filter(|method| &method.tenant_id == tenant && &method.customer_id == customer_id)
            .filter(|method| method.deleted_at.is_none())
            .cloned()
            .collect();
        methods.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(methods)
    }

    async fn insert_invoice(&self, invoice: Invoice) -> LedgerResult<Invoice> {
        let mut state = self.state.lock().await;
        Self::require_customer(&state, &invoice.tenant_id, &invoice.customer_id)?;
        state
            .invoices
            .insert(key(&invoice.tenant_id, &invoice.id), invoice.clone());
        Ok(invoice)
    }

    async fn invoice(&self, tenant: &TenantId, id: &InvoiceId) -> LedgerResult<Invoice> {
        let state = self.state.lock().await;
        state
            .invoices
            .get(&key(tenant, id))
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("invoice {id}")))
    }

    async fn update_invoice(&self, invoice: Invoice) -> LedgerResult<Invoice> {
        let mut state = self.state.lock().await;
        let invoice_key = key(&invoice.tenant_id, &invoice.id);
        if !state.invoices.contains_key(&invoice_key) {
            return Err(LedgerError::NotFound(format!("invoice {}", invoice.id)));
        }
        state.invoices.insert(invoice_key, invoice.clone());
        Ok(invoice)
    }

    async fn list_invoices(
        &self,
        tenant: &TenantId,
        customer_id: Option<&CustomerId>,
    ) -> LedgerResult<Vec<Invoice>> {
        let state = self.state.lock().await;
        let mut invoices: Vec<Invoice> = state
            .invoices
            .values()
            .filter(|invoice| &invoice.tenant_id == tenant)
            .filter(|invoice| customer_id.is_none_or(|id| &invoice.customer_id == id))
            .cloned()
            .collect();
        invoices.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(invoices)
    }

    async fn list_open_invoices(&self, tenant: &TenantId) -> LedgerResult<Vec<Invoice>> {
        let state = self.state.lock().await;
        let mut invoices: Vec<Invoice> = state
            .invoices
            .values()
            .filter(|invoice| &invoice.tenant_id == tenant)
            .filter(|invoice| invoice.status.is_collectible() && invoice.outstanding_cents() > 0)
            .cloned()
            .collect();
        invoices.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(invoices)
    }

    async fn apply_payment(&self, request: ApplyPaymentRequest) -> LedgerResult<AppliedPayment> {
        let mut state = self.state.lock().await;
        let invoice_key = key(&request.tenant_id, &request.invoice_id);
        let invoice = state
            .invoices
            .get(&invoice_key)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("invoice {}", request.invoice_id)))?;

        // Replays of the same processor payment against the same invoice are
        // idempotent: return the stored application untouched.
        if let Some(existing) = state.applications.values().find(|application| {
            application.tenant_id == request.tenant_id
                && application.invoice_id == request.invoice_id
                && application.processor_payment_id == request.processor_payment_id
        }) {
            return Ok(AppliedPayment {
                application: existing.clone(),
                invoice,
            });
        }

        if invoice.currency != request.currency {
            return Err(LedgerError::CurrencyMismatch {
                expected: invoice.currency,
                actual: request.currency,
            });
        }
        if !invoice.status.is_collectible() {
            return Err(LedgerError::Validation(format!(
                "invoice {} is not collectible in status {:?}",
                invoice.id, invoice.status
            )));
        }
        if request.amount_cents <= 0 {
            return Err(LedgerError::Validation(
                "allocation must be positive".into(),
            ));
        }
        if request.amount_cents > invoice.outstanding_cents() {
            return Err(LedgerError::Validation(format!(
                "allocation {} exceeds outstanding balance {} on invoice {}",
                request.amount_cents,
                invoice.outstanding_cents(),
                invoice.id
            )));
        }

        let application = PaymentApplication {
            id: Uuid::new_v4().to_string(),
            tenant_id: request.tenant_id.clone(),
            invoice_id: request.invoice_id.clone(),
            customer_id: invoice.customer_id.clone(),
            processor_payment_id: request.processor_payment_id.clone(),
            allocated_cents: request.amount_cents,
            allocation_type: request.allocation_type,
            status: ApplicationStatus::Applied,
            applied_at: request.occurred_at,
        };

        let mut updated = invoice;
        updated.applied_cents += request.amount_cents;
        if updated.applied_cents == updated.total_cents {
            updated.status = InvoiceStatus::Paid;
            updated.paid_at = Some(request.occurred_at);
        } else if updated.status == InvoiceStatus::Issued {
            updated.status = InvoiceStatus::PartiallyPaid;
        }

        state
            .applications
            .insert(key(&application.tenant_id, &application.id), application.clone());
        state.invoices.insert(invoice_key, updated.clone());

        Ok(AppliedPayment {
            application,
            invoice: updated,
        })
    }

    async fn applications_for_invoice(
        &self,
        tenant: &TenantId,
        invoice_id: &InvoiceId,
    ) -> LedgerResult<Vec<PaymentApplication>> {
        let state = self.state.lock().await;
        let mut applications: Vec<PaymentApplication> = state
            .applications
            .values()
            .filter(|application| {
                &application.tenant_id == tenant && &application.invoice_id == invoice_id
            })
            .cloned()
            .collect();
        applications.sort_by(|a, b| a.applied_at.cmp(&b.applied_at).then(a.id.cmp(&b.id)));
        Ok(applications)
    }

    async fn insert_charge(&self, charge: Charge) -> LedgerResult<Upsert<Charge>> {
        let mut state = self.state.lock().await;
        Self::require_customer(&state, &charge.tenant_id, &charge.customer_id)?;
        let reference_key = key(&charge.tenant_id, &charge.reference_id);
        if let Some(existing_id) = state.charge_references.get(&reference_key) {
            let existing = state
                .charges
                .get(&key(&charge.tenant_id, existing_id))
                .cloned()
                .ok_or_else(|| {
                    LedgerError::Internal(format!("dangling charge reference {}", charge.reference_id))
                })?;
            return Ok(Upsert::Existing(existing));
        }
        state.charge_references.insert(reference_key, charge.id.clone());
        if let Some(processor_id) = &charge.processor_charge_id {
            state
                .charge_processor_ids
                .insert(key(&charge.tenant_id, processor_id), charge.id.clone());
        }
        state
            .charges
            .insert(key(&charge.tenant_id, &charge.id), charge.clone());
        Ok(Upsert::Created(charge))
    }

    async fn charge(&self, tenant: &TenantId, id: &ChargeId) -> LedgerResult<Charge> {
        let state = self.state.lock().await;
        state
            .charges
            .get(&key(tenant, id))
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("charge {id}")))
    }

    async fn charge_by_reference(
        &self,
        tenant: &TenantId,
        reference_id: &str,
    ) -> LedgerResult<Charge> {
        let state = self.state.lock().await;
        let id = state
            .charge_references
            .get(&key(tenant, reference_id))
            .ok_or_else(|| LedgerError::NotFound(format!("charge {reference_id}")))?;
        state
            .charges
            .get(&key(tenant, id))
            .cloned()
            .ok_or_else(|| LedgerError::Internal(format!("dangling charge reference {reference_id}")))
    }

    async fn charge_by_processor_id(
        &self,
        tenant: &TenantId,
        processor_charge_id: &str,
    ) -> LedgerResult<Charge> {
        let state = self.state.lock().await;
        let id = state
            .charge_processor_ids
            .get(&key(tenant, processor_charge_id))
            .ok_or_else(|| LedgerError::NotFound(format!("charge {processor_charge_id}")))?;
        state
            .charges
            .get(&key(tenant, id))
            .cloned()
            .ok_or_else(|| {
                LedgerError::Internal(format!("dangling processor charge id {processor_charge_id}"))
            })
    }

    async fn update_charge(&self, charge: Charge) -> LedgerResult<Charge> {
        let mut state = self.state.lock().await;
        let charge_key = key(&charge.tenant_id, &charge.id);
        if !state.charges.contains_key(&charge_key) {
            return Err(LedgerError::NotFound(format!("charge {}", charge.id)));
        }
        if let Some(processor_id) = &charge.processor_charge_id {
            state
                .charge_processor_ids
                .insert(key(&charge.tenant_id, processor_id), charge.id.clone());
        }
        state.charges.insert(charge_key, charge.clone());
        Ok(charge)
    }

    async fn list_charges(&self, tenant: &TenantId) -> LedgerResult<Vec<Charge>> {
        let state = self.state.lock().await;
        let mut charges: Vec<Charge> = state
            .charges
            .values()
            .filter(|charge| &charge.tenant_id == tenant)
            .cloned()
            .collect();
        charges.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(charges)
    }

    async fn insert_refund(&self, refund: Refund) -> LedgerResult<Upsert<Refund>> {
        let mut state = self.state.lock().await;
        Self::require_customer(&state, &refund.tenant_id, &refund.customer_id)?;
        let reference_key = key(&refund.tenant_id, &refund.reference_id);
        if let Some(existing_id) = state.refund_references.get(&reference_key) {
            let existing = state
                .refunds
                .get(&key(&refund.tenant_id, existing_id))
                .cloned()
                .ok_or_else(|| {
                    LedgerError::Internal(format!("dangling refund reference {}", refund.reference_id))
                })?;
            return Ok(Upsert::Existing(existing));
        }
        state.refund_references.insert(reference_key, refund.id.clone());
        if let Some(processor_id) = &refund.processor_refund_id {
            state
                .refund_processor_ids
                .insert(key(&refund.tenant_id, processor_id), refund.id.clone());
        }
        state
            .refunds
            .insert(key(&refund.tenant_id, &refund.id), refund.clone());
        Ok(Upsert::Created(refund))
    }

    async fn refund(&self, tenant: &TenantId, id: &RefundId) -> LedgerResult<Refund> {
        let state = self.state.lock().await;
        state
            .refunds
            .get(&key(tenant, id))
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("refund {id}")))
    }

    async fn refund_by_processor_id(
        &self,
        tenant: &TenantId,
        processor_refund_id: &str,
    ) -> LedgerResult<Refund> {
        let state = self.state.lock().await;
        let id = state
            .refund_processor_ids
            .get(&key(tenant, processor_refund_id))
            .ok_or_else(|| LedgerError::NotFound(format!("refund {processor_refund_id}")))?;
        state
            .refunds
            .get(&key(tenant, id))
            .cloned()
            .ok_or_else(|| {
                LedgerError::Internal(format!("dangling processor refund id {processor_refund_id}"))
            })
    }

    async fn update_refund(&self, refund: Refund) -> LedgerResult<Refund> {
        let mut state = self.state.lock().await;
        let refund_key = key(&refund.tenant_id, &refund.id);
        if !state.refunds.contains_key(&refund_key) {
            return Err(LedgerError::NotFound(format!("refund {}", refund.id)));
        }
        if let Some(processor_id) = &refund.processor_refund_id {
            state
                .refund_processor_ids
                .insert(key(&refund.tenant_id, processor_id), refund.id.clone());
        }
        state.refunds.insert(refund_key, refund.clone());
        Ok(refund)
    }

    async fn refunds_for_charge(
        &self,
        tenant: &TenantId,
        charge_id: &ChargeId,
    ) -> LedgerResult<Vec<Refund>> {
        let state = self.state.lock().await;
        let mut refunds: Vec<Refund> = state
            .refunds
            .values()
            .filter(|refund| &refund.tenant_id == tenant && &refund.charge_id == charge_id)
            .cloned()
            .collect();
        refunds.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(refunds)
    }

    async fn list_refunds(&self, tenant: &TenantId) -> LedgerResult<Vec<Refund>> {
        let state = self.state.lock().await;
        let mut refunds: Vec<Refund> = state
            .refunds
            .values()
            .filter(|refund| &refund.tenant_id == tenant)
            .cloned()
            .collect();
        refunds.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(refunds)
    }

    async fn upsert_dispute(&self, dispute: Dispute) -> LedgerResult<Dispute> {
        let mut state = self.state.lock().await;
        Self::require_customer(&state, &dispute.tenant_id, &dispute.customer_id)?;
        let dispute_key = key(&dispute.tenant_id, &dispute.processor_dispute_id);
        if let Some(existing) = state.disputes.get(&dispute_key) {
            // Keep the snapshot with the later processor timestamp.
            if existing.processor_updated_at >= dispute.processor_updated_at {
                return Ok(existing.clone());
            }
        }
        state.disputes.insert(dispute_key, dispute.clone());
        Ok(dispute)
    }

    async fn dispute_by_processor_id(
        &self,
        tenant: &TenantId,
        processor_dispute_id: &str,
    ) -> LedgerResult<Dispute> {
        let state = self.state.lock().await;
        state
            .disputes
            .get(&key(tenant, processor_dispute_id))
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("dispute {processor_dispute_id}")))
    }

    async fn list_disputes(&self, tenant: &TenantId) -> LedgerResult<Vec<Dispute>> {
        let state = self.state.lock().await;
        let mut disputes: Vec<Dispute> = state
            .disputes
            .values()
            .filter(|dispute| &dispute.tenant_id == tenant)
            .cloned()
            .collect();
        disputes.sort_by(|a, b| a.opened_at.cmp(&b.opened_at).then(a.id.cmp(&b.id)));
        Ok(disputes)
    }

    async fn insert_credit_memo(&self, memo: CreditMemo) -> LedgerResult<CreditMemo> {
        let mut state = self.state.lock().await;
        Self::require_customer(&state, &memo.tenant_id, &memo.customer_id)?;
        state
            .credit_memos
            .insert(key(&memo.tenant_id, &memo.id), memo.clone());
        Ok(memo)
    }

    async fn list_credit_memos(
        &self,
        tenant: &TenantId,
        customer_id: &CustomerId,
    ) -> LedgerResult<Vec<CreditMemo>> {
        let state = self.state.lock().await;
        let mut memos: Vec<CreditMemo> = state
            .credit_memos
            .values()
            .filter(|memo| &memo.tenant_id == tenant && &memo.customer_id == customer_id)
            .cloned()
            .collect();
        memos.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(memos)
    }

    async fn insert_subscription(&self, subscription: Subscription) -> LedgerResult<Subscription> {
        let mut state = self.state.lock().await;
        Self::require_customer(&state, &subscription.tenant_id, &subscription.customer_id)?;
        state.subscription_processor_ids.insert(
            key(&subscription.tenant_id, &subscription.processor_subscription_id),
            subscription.id.clone(),
        );
        state
            .subscriptions
            .insert(key(&subscription.tenant_id, &subscription.id), subscription.clone());
        Ok(subscription)
    }

    async fn subscription(
        &self,
        tenant: &TenantId,
        id: &SubscriptionId,
    ) -> LedgerResult<Subscription> {
        let state = self.state.lock().await;
        state
            .subscriptions
            .get(&key(tenant, id))
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("subscription {id}")))
    }

    async fn subscription_by_processor_id(
        &self,
        tenant: &TenantId,
        processor_subscription_id: &str,
    ) -> LedgerResult<Subscription> {
        let state = self.state.lock().await;
        let id = state
            .subscription_processor_ids
            .get(&key(tenant, processor_subscription_id))
            .ok_or_else(|| {
                LedgerError::NotFound(format!("subscription {processor_subscription_id}"))
            })?;
        state
            .subscriptions
            .get(&key(tenant, id))
            .cloned()
            .ok_or_else(|| {
                LedgerError::Internal(format!(
                    "dangling processor subscription id {processor_subscription_id}"
                ))
            })
    }

    async fn update_subscription(&self, subscription: Subscription) -> LedgerResult<Subscription> {
        let mut state = self.state.lock().await;
        let subscription_key = key(&subscription.tenant_id, &subscription.id);
        if !state.subscriptions.contains_key(&subscription_key) {
            return Err(LedgerError::NotFound(format!(
                "subscription {}",
                subscription.id
            )));
        }
        state
            .subscriptions
            .insert(subscription_key, subscription.clone());
        Ok(subscription)
    }

    async fn list_subscriptions(&self, tenant: &TenantId) -> LedgerResult<Vec<Subscription>> {
        let state = self.state.lock().await;
        let mut subscriptions: Vec<Subscription> = state
            .subscriptions
            .values()
            .filter(|subscription| &subscription.tenant_id == tenant)
            .cloned()
            .collect();
        subscriptions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(subscriptions)
    }

    async fn post_event(&self, request: PostEventRequest) -> LedgerResult<PostedEvent> {
        let mut state = self.state.lock().await;

        let source_key = key(&request.tenant_id, &request.source_event_id);
        if let Some(event_id) = state.event_sources.get(&source_key) {
            let event = state
                .events
                .get(&key(&request.tenant_id, event_id))
                .cloned()
                .ok_or_else(|| {
                    LedgerError::Internal(format!(
                        "dangling source event id {}",
                        request.source_event_id
                    ))
                })?;
            return Ok(PostedEvent {
                event,
                newly_posted: false,
            });
        }

        let customer = state
            .customers
            .get_mut(&key(&request.tenant_id, &request.customer_id))
            .ok_or_else(|| LedgerError::NotFound(format!("customer {}", request.customer_id)))?;

        let balance_before = customer.ar_balance_cents;
        let balance_after = (balance_before + request.amount_delta_cents).max(0);
        let effective_delta = balance_after - balance_before;
        if effective_delta != request.amount_delta_cents {
            tracing::warn!(
                tenant_id = %request.tenant_id,
                customer_id = %request.customer_id,
                requested = request.amount_delta_cents,
                effective = effective_delta,
                "ledger delta clamped at zero balance"
            );
        }
        customer.ar_balance_cents = balance_after;

        let event = LedgerEvent {
            id: Uuid::new_v4().to_string(),
            tenant_id: request.tenant_id.clone(),
            customer_id: request.customer_id.clone(),
            invoice_id: request.invoice_id.clone(),
            event_type: request.event_type,
            amount_delta_cents: effective_delta,
            balance_before_cents: balance_before,
            balance_after_cents: balance_after,
            currency: request.currency.clone(),
            occurred_at: request.occurred_at,
            source_event_id: request.source_event_id.clone(),
        };

        let event_key = key(&event.tenant_id, &event.id);
        state.event_sources.insert(source_key, event.id.clone());
        state.events.insert(event_key.clone(), event.clone());
        state.event_order.push(event_key);

        Ok(PostedEvent {
            event,
            newly_posted: true,
        })
    }

    async fn ledger_events(
        &self,
        tenant: &TenantId,
        customer_id: &CustomerId,
    ) -> LedgerResult<Vec<LedgerEvent>> {
        let state = self.state.lock().await;
        let events = state
            .event_order
            .iter()
            .filter_map(|event_key| state.events.get(event_key))
            .filter(|event| &event.tenant_id == tenant && &event.customer_id == customer_id)
            .cloned()
            .collect();
        Ok(events)
    }

    async fn recompute_aging(
        &self,
        tenant: &TenantId,
        customer_id: &CustomerId,
        as_of: DateTime<Utc>,
    ) -> LedgerResult<AgingBuckets> {
        let mut state = self.state.lock().await;
        Self::require_customer(&state, tenant, customer_id)?;

        let mut buckets = AgingBuckets::default();
        for invoice in state.invoices.values() {
            if &invoice.tenant_id != tenant || &invoice.customer_id != customer_id {
                continue;
            }
            if !invoice.status.is_collectible() {
                continue;
            }
            let outstanding = invoice.outstanding_cents();
            if outstanding == 0 {
                continue;
            }
            let days_past_due = invoice
                .due_at
                .map(|due| (as_of.date_naive() - due.date_naive()).num_days())
                .unwrap_or(0);
            buckets.accumulate(&bucket_for_days_past_due(days_past_due, outstanding));
        }

        let customer = state
            .customers
            .get_mut(&key(tenant, customer_id))
            .ok_or_else(|| LedgerError::NotFound(format!("customer {customer_id}")))?;
        customer.aging = buckets;
        Ok(buckets)
    }
}
