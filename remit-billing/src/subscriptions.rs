use chrono::Duration;
use chrono::Utc;
use remit_ledger::ArStore;
use remit_ledger::BillingCycle;
use remit_ledger::BillingInterval;
use remit_ledger::CustomerId;
use remit_ledger::PaymentMethodId;
use remit_ledger::Subscription;
use remit_ledger::SubscriptionId;
use remit_ledger::SubscriptionStatus;
use remit_processor::ProcessorClient;
use uuid::Uuid;

use crate::Billing;
use crate::BillingError;
use crate::BillingResult;
use crate::BusinessCode;
use crate::TenantId;
use crate::pci::ensure_no_pci_fields;

#[derive(Debug, Clone, PartialEq)]
pub struct CreateSubscriptionRequest {
    pub customer_id: CustomerId,
    pub plan_code: String,
    /// Defaults to the customer's default payment method.
    pub payment_method_id: Option<PaymentMethodId>,
    pub billing_cycle: BillingCycle,
    pub metadata: serde_json::Value,
    pub raw_payload: serde_json::Value,
}

impl CreateSubscriptionRequest {
    pub fn normalize(mut self) -> BillingResult<Self> {
        ensure_no_pci_fields(&self.raw_payload)?;
        self.plan_code = self.plan_code.trim().to_string();
        if self.plan_code.is_empty() {
            return Err(BillingError::Validation("plan_code cannot be empty".into()));
        }
        if self.billing_cycle.interval_count == 0 {
            return Err(BillingError::Validation(
                "interval_count must be positive".into(),
            ));
        }
        Ok(self)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct UpdateSubscriptionRequest {
    pub metadata: Option<serde_json::Value>,
    /// Billing-cycle fields are immutable after creation; any attempt to
    /// send them is rejected with `UNSUPPORTED_FIELD`.
    pub interval: Option<BillingInterval>,
    pub interval_count: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelSubscriptionRequest {
    pub at_period_end: bool,
}

fn nominal_period_days(cycle: &BillingCycle) -> i64 {
    let unit = match cycle.interval {
        BillingInterval::Weekly => 7,
        BillingInterval::Monthly => 30,
        BillingInterval::Yearly => 365,
    };
    unit * i64::from(cycle.interval_count)
}

impl Billing {
    /// Creates the subscription with the processor and records the local
    /// snapshot. Renewal math belongs to the processor; the period fields
    /// here are a snapshot that `subscription.*` webhooks keep fresh.
    pub async fn create_subscription(
        &self,
        tenant: &TenantId,
        request: CreateSubscriptionRequest,
    ) -> BillingResult<Subscription> {
        let request = request.normalize()?;
        let mut customer = self.get_customer(tenant, &request.customer_id).await?;

        let method_id = request
            .payment_method_id
            .clone()
            .or_else(|| customer.default_payment_method_id.clone())
            .ok_or_else(|| {
                BillingError::business(
                    BusinessCode::NoDefaultPaymentMethod,
                    format!("customer {} has no payment method to subscribe with", customer.id),
                )
            })?;
        let method = self.store.payment_method(tenant, &method_id).await?;
        if !method.is_usable() {
            return Err(BillingError::business(
                BusinessCode::NoDefaultPaymentMethod,
                format!("payment method {method_id} is not active"),
            ));
        }

        let processor_customer_id = self.ensure_processor_customer(tenant, &mut customer).await?;
        let created = self
            .processor
            .create_subscription(remit_processor::CreateSubscriptionRequest {
                processor_customer_id,
                payment_method_token: method.processor_token.clone(),
                plan_code: request.plan_code.clone(),
                metadata: request.metadata.clone(),
            })
            .await?;

        let now = Utc::now();
        let subscription = Subscription {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant.clone(),
            customer_id: customer.id.clone(),
            processor_subscription_id: created.id,
            plan_code: request.plan_code,
            status: SubscriptionStatus::Active,
            billing_cycle: request.billing_cycle,
            current_period_start: now,
            current_period_end: now + Duration::days(nominal_period_days(&request.billing_cycle)),
            cancel_at_period_end: false,
            canceled_at: None,
            metadata: request.metadata,
            created_at: now,
        };
        let subscription = self.store.insert_subscription(subscription).await?;
        tracing::info!(
            tenant_id = %tenant,
            subscription_id = %subscription.id,
            plan_code = %subscription.plan_code,
            "subscription created"
        );
        Ok(subscription)
    }

    pub async fn get_subscription(
        &self,
        tenant: &TenantId,
        id: &SubscriptionId,
    ) -> BillingResult<Subscription> {
        Ok(self.store.subscription(tenant, id).await?)
    }

    /// Metadata-only updates. The local write is canonical; the mirror to
    /// the processor is best-effort and a failed sync is left for
    /// reconciliation to surface.
    pub async fn update_subscription(
        &self,
        tenant: &TenantId,
        id: &SubscriptionId,
        request: UpdateSubscriptionRequest,
    ) -> BillingResult<Subscription> {
        if request.interval.is_some() || request.interval_count.is_some() {
            return Err(BillingError::business(
                BusinessCode::UnsupportedField,
                "billing-cycle fields are immutable after creation",
            ));
        }

        let mut subscription = self.store.subscription(tenant, id).await?;
        let Some(metadata) = request.metadata else {
            return Ok(subscription);
        };
        ensure_no_pci_fields(&metadata)?;
        subscription.metadata = metadata.clone();
        let subscription = self.store.update_subscription(subscription).await?;

        if let Err(err) = self
            .processor
            .update_subscription(remit_processor::UpdateSubscriptionRequest {
                processor_subscription_id: subscription.processor_subscription_id.clone(),
                metadata,
            })
            .await
        {
            tracing::warn!(
                tenant_id = %tenant,
                subscription_id = %subscription.id,
                processor_subscription_id = %subscription.processor_subscription_id,
                error = %err,
                "subscription metadata sync to processor failed; local state kept"
            );
        }
        Ok(subscription)
    }

    /// Immediate cancel ends the subscription now; end-of-period flags it
    /// and leaves it active until the processor closes the period. The
    /// processor mirror is tolerated to fail — the divergence shows up in
    /// reconciliation rather than rolling back local state.
    pub async fn cancel_subscription(
        &self,
        tenant: &TenantId,
        id: &SubscriptionId,
        request: CancelSubscriptionRequest,
    ) -> BillingResult<Subscription> {
        let mut subscription = self.store.subscription(tenant, id).await?;
        if subscription.status == SubscriptionStatus::Canceled {
            return Err(BillingError::Conflict(format!(
                "subscription {id} is already canceled"
            )));
        }

        if request.at_period_end {
            subscription.cancel_at_period_end = true;
        } else {
            subscription.status = SubscriptionStatus::Canceled;
            subscription.canceled_at = Some(Utc::now());
        }
        let subscription = self.store.update_subscription(subscription).await?;

        if let Err(err) = self
            .processor
            .cancel_subscription(remit_processor::CancelSubscriptionRequest {
                processor_subscription_id: subscription.processor_subscription_id.clone(),
                at_period_end: request.at_period_end,
            })
            .await
        {
            tracing::warn!(
                tenant_id = %tenant,
                subscription_id = %subscription.id,
                at_period_end = request.at_period_end,
                error = %err,
                "subscription cancel mirror to processor failed; local state kept"
            );
        }
        Ok(subscription)
    }

    pub async fn list_subscriptions(&self, tenant: &TenantId) -> BillingResult<Vec<Subscription>> {
        Ok(self.store.list_subscriptions(tenant).await?)
    }
}
