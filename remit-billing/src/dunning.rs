use chrono::DateTime;
use chrono::Utc;
use remit_events::EventEnvelope;
use remit_events::EventPublisher;
use remit_events::VersionedPayload;
use remit_ledger::ArStore;
use remit_ledger::Customer;
use remit_ledger::CustomerFilter;
use remit_ledger::DelinquencyState;
use remit_processor::ProcessorClient;
use remit_retry::RunBudget;

use crate::Billing;
use crate::BillingResult;
use crate::RecordApplicationRequest;
use crate::TenantId;

pub const SUSPENSION_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DunningRunStats {
    pub scanned: usize,
    pub attempted: usize,
    pub collected: usize,
    pub failed: usize,
    pub suspended: usize,
}

impl Billing {
    /// One dunning sweep for a tenant: suspends customers whose grace
    /// period lapsed and re-attempts collection for customers whose
    /// `next_retry_at` has arrived. Cooperative with the run budget
    /// between customers.
    pub async fn run_dunning(
        &self,
        tenant: &TenantId,
        now: DateTime<Utc>,
        budget: RunBudget,
    ) -> BillingResult<DunningRunStats> {
        let customers = self
            .store()
            .list_customers(tenant, CustomerFilter::default())
            .await?;
        let mut stats = DunningRunStats::default();

        for customer in customers {
            if budget.expired(Utc::now()) {
                tracing::info!(
                    tenant_id = %tenant,
                    scanned = stats.scanned,
                    "dunning run stopped at deadline"
                );
                break;
            }
            stats.scanned += 1;

            if customer.delinquency == DelinquencyState::Delinquent
                && customer.grace_period_end.is_some_and(|end| end <= now)
            {
                self.suspend_customer(tenant, customer).await?;
                stats.suspended += 1;
                continue;
            }

            if customer.delinquency == DelinquencyState::Suspended {
                continue;
            }
            if !customer.next_retry_at.is_some_and(|at| at <= now) {
                continue;
            }

            stats.attempted += 1;
            if self.attempt_collection(tenant, &customer, now).await? {
                stats.collected += 1;
            } else {
                stats.failed += 1;
            }
        }

        Ok(stats)
    }

    async fn suspend_customer(&self, tenant: &TenantId, mut customer: Customer) -> BillingResult<()> {
        customer.delinquency = DelinquencyState::Suspended;
        customer.next_retry_at = None;
        let customer = self.store().update_customer(customer).await?;
        tracing::warn!(
            tenant_id = %tenant,
            customer_id = %customer.id,
            "customer suspended after grace period"
        );

        let envelope = EventEnvelope::new(
            tenant.clone(),
            "ar",
            "customer.suspended",
            VersionedPayload {
                schema_version: SUSPENSION_SCHEMA_VERSION,
                data: serde_json::json!({
                    "customer_id": customer.id,
                    "external_id": customer.external_id,
                    "ar_balance_cents": customer.ar_balance_cents,
                }),
            },
        );
        if let Err(err) = self.events.publish(envelope).await {
            // The suspension itself is committed; a lost notification is a
            // delivery concern, not a state concern.
            tracing::warn!(
                tenant_id = %tenant,
                customer_id = %customer.id,
                error = %err,
                "suspension event publish failed"
            );
        }
        Ok(())
    }

    /// Re-attempts collection of the oldest open invoice with the default
    /// method. Success applies the payment; failure walks the ladder via
    /// the shared failure recording.
    async fn attempt_collection(
        &self,
        tenant: &TenantId,
        customer: &Customer,
        now: DateTime<Utc>,
    ) -> BillingResult<bool> {
        let Some(method_id) = customer.default_payment_method_id.clone() else {
            self.record_payment_failure(tenant, &customer.id, "no_payment_method", now)
                .await?;
            return Ok(false);
        };
        let method = self.store().payment_method(tenant, &method_id).await?;
        let open_invoices = self.store().list_invoices(tenant, Some(&customer.id)).await?;
        let Some(invoice) = open_invoices
            .into_iter()
            .find(|invoice| invoice.status.is_collectible() && invoice.outstanding_cents() > 0)
        else {
            // Nothing left to collect; stand down the ladder.
            let mut cleared = customer.clone();
            cleared.next_retry_at = None;
            cleared.payment_retry_count = 0;
            self.store().update_customer(cleared).await?;
            return Ok(true);
        };

        let mut refreshed = customer.clone();
        let processor_customer_id = self
            .ensure_processor_customer(tenant, &mut refreshed)
            .await?;
        let reference = format!(
            "dunning-{}-{}",
            invoice.id,
            customer.payment_retry_count + 1
        );
        let outcome = self
            .processor
            .create_charge(remit_processor::CreateChargeRequest {
                processor_customer_id,
                payment_method_token: method.processor_token.clone(),
                amount_cents: invoice.outstanding_cents(),
                currency: invoice.currency.clone(),
                reference_id: reference,
            })
            .await;

        match outcome {
            Ok(response) if response.status == "succeeded" => {
                self.record_application(
                    tenant,
                    &invoice.id,
                    RecordApplicationRequest {
                        processor_payment_id: response.id,
                        amount_cents: invoice.outstanding_cents(),
                        currency: invoice.currency.clone(),
                        allocation_type: remit_ledger::AllocationType::Auto,
                    },
                )
                .await?;
                self.clear_dunning_for(tenant, &customer.id).await?;
                tracing::info!(
                    tenant_id = %tenant,
                    customer_id = %customer.id,
                    invoice_id = %invoice.id,
                    "dunning retry collected outstanding balance"
                );
                Ok(true)
            }
            Ok(response) => {
                let code = response
                    .failure_code
                    .unwrap_or_else(|| "card_declined".into());
                self.record_payment_failure(tenant, &customer.id, &code, now)
                    .await?;
                Ok(false)
            }
            Err(err) => {
                self.record_payment_failure(tenant, &customer.id, &err.code, now)
                    .await?;
                Ok(false)
            }
        }
    }

    async fn clear_dunning_for(
        &self,
        tenant: &TenantId,
        customer_id: &remit_ledger::CustomerId,
    ) -> BillingResult<()> {
        let mut customer = self.store().customer(tenant, customer_id).await?;
        customer.payment_retry_count = 0;
        customer.next_retry_at = None;
        customer.grace_period_end = None;
        customer.delinquency = DelinquencyState::None;
        self.store().update_customer(customer).await?;
        Ok(())
    }

    /// Nightly aging sweep across a tenant's customers.
    pub async fn run_aging_recompute(
        &self,
        tenant: &TenantId,
        as_of: DateTime<Utc>,
        budget: RunBudget,
    ) -> BillingResult<usize> {
        let customers = self
            .store()
            .list_customers(tenant, CustomerFilter::default())
            .await?;
        let mut recomputed = 0;
        for customer in customers {
            if budget.expired(Utc::now()) {
                break;
            }
            self.store()
                .recompute_aging(tenant, &customer.id, as_of)
                .await?;
            recomputed += 1;
        }
        Ok(recomputed)
    }
}
