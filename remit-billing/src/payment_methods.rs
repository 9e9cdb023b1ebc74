use chrono::Utc;
use remit_ledger::ArStore;
use remit_ledger::CustomerId;
use remit_ledger::PaymentMethodDetails;
use remit_ledger::PaymentMethodId;
use remit_ledger::PaymentMethodRef;
use remit_ledger::PaymentMethodStatus;
use remit_processor::ProcessorClient;
use uuid::Uuid;

use crate::Billing;
use crate::BillingError;
use crate::BillingResult;
use crate::TenantId;
use crate::pci::ensure_no_pci_fields;

#[derive(Debug, Clone, PartialEq)]
pub struct AttachPaymentMethodRequest {
    pub customer_id: CustomerId,
    /// Opaque token from the frontend tokenizer.
    pub token: String,
    pub set_default: bool,
    /// Original request body, checked for PCI-like fields up front.
    pub raw_payload: serde_json::Value,
}

impl AttachPaymentMethodRequest {
    pub fn normalize(mut self) -> BillingResult<Self> {
        ensure_no_pci_fields(&self.raw_payload)?;
        self.token = self.token.trim().to_string();
        if self.token.is_empty() {
            return Err(BillingError::Validation(
                "payment method token cannot be empty".into(),
            ));
        }
        Ok(self)
    }
}

impl Billing {
    /// Attach flow: pending local row first, then the processor attach,
    /// then metadata fetch and activation. The pending row exists before
    /// any network call so a crash leaves a visible, cleanable artifact
    /// instead of an orphaned processor attachment.
    pub async fn attach_payment_method(
        &self,
        tenant: &TenantId,
        request: AttachPaymentMethodRequest,
    ) -> BillingResult<PaymentMethodRef> {
        let request = request.normalize()?;
        let mut customer = self.get_customer(tenant, &request.customer_id).await?;

        let pending = PaymentMethodRef {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant.clone(),
            customer_id: customer.id.clone(),
            processor_token: request.token.clone(),
            status: PaymentMethodStatus::Pending,
            is_default: false,
            details: PaymentMethodDetails::default(),
            created_at: Utc::now(),
            deleted_at: None,
        };
        let mut method = self.store.insert_payment_method(pending).await?;

        let processor_customer_id = self.ensure_processor_customer(tenant, &mut customer).await?;
        let attached = match self
            .processor
            .attach_payment_method(remit_processor::AttachPaymentMethodRequest {
                processor_customer_id,
                token: request.token.clone(),
            })
            .await
        {
            Ok(attached) => attached,
            Err(err) => {
                method.status = PaymentMethodStatus::SoftDeleted;
                method.deleted_at = Some(Utc::now());
                let _ = self.store.update_payment_method(method).await;
                return Err(err.into());
            }
        };

        method.details = PaymentMethodDetails {
            method_type: attached.method_type,
            brand: attached.brand,
            last4: attached.last4,
            exp_month: attached.exp_month,
            exp_year: attached.exp_year,
            bank_tail: attached.bank_tail,
        };
        method.status = PaymentMethodStatus::Active;
        let method = self.store.update_payment_method(method).await?;

        let needs_default = request.set_default || customer.default_payment_method_id.is_none();
        let method = if needs_default {
            self.store
                .set_default_payment_method(tenant, &customer.id, &method.id)
                .await?
        } else {
            method
        };

        tracing::info!(
            tenant_id = %tenant,
            customer_id = %customer.id,
            payment_method_id = %method.id,
            is_default = method.is_default,
            "payment method attached"
        );
        Ok(method)
    }

    pub async fn set_default_payment_method(
        &self,
        tenant: &TenantId,
        customer_id: &CustomerId,
        method_id: &PaymentMethodId,
    ) -> BillingResult<PaymentMethodRef> {
        self.get_customer(tenant, customer_id).await?;
        Ok(self
            .store
            .set_default_payment_method(tenant, customer_id, method_id)
            .await?)
    }

    pub async fn list_payment_methods(
        &self,
        tenant: &TenantId,
        customer_id: &CustomerId,
    ) -> BillingResult<Vec<PaymentMethodRef>> {
        self.get_customer(tenant, customer_id).await?;
        Ok(self.store.list_payment_methods(tenant, customer_id).await?)
    }

    /// Soft delete by verified local id. The row is re-read and checked
    /// against the tenant inside this call, so a stale or cross-tenant id
    /// cannot detach someone else's instrument.
    pub async fn delete_payment_method(
        &self,
        tenant: &TenantId,
        method_id: &PaymentMethodId,
    ) -> BillingResult<PaymentMethodRef> {
        let mut method = self.store.payment_method(tenant, method_id).await?;
        if method.deleted_at.is_some() {
            return Err(BillingError::NotFound(format!(
                "payment method {method_id}"
            )));
        }

        // Best-effort detach; local truth wins if the processor is down.
        if let Err(err) = self.processor.detach_payment_method(&method.processor_token).await {
            tracing::warn!(
                tenant_id = %tenant,
                payment_method_id = %method_id,
                error = %err,
                "processor detach failed; continuing with local soft delete"
            );
        }

        method.status = PaymentMethodStatus::SoftDeleted;
        method.deleted_at = Some(Utc::now());
        method.is_default = false;
        let method = self.store.update_payment_method(method).await?;

        let mut customer = self.get_customer(tenant, &method.customer_id).await?;
        if customer.default_payment_method_id.as_deref() == Some(method_id.as_str()) {
            customer.default_payment_method_id = None;
            self.store.update_customer(customer).await?;
        }
        Ok(method)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CreateCustomerRequest;
    use crate::testutil::harness;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    async fn seeded_customer(h: &crate::testutil::Harness) -> remit_ledger::Customer {
        h.billing
            .create_customer(
                &"acme".to_string(),
                CreateCustomerRequest {
                    external_id: "cu_001".into(),
                    email: "cu@example.com".into(),
                    display_name: "Customer One".into(),
                },
            )
            .await
            .expect("create customer")
    }

    fn attach(customer_id: &str, token: &str) -> AttachPaymentMethodRequest {
        AttachPaymentMethodRequest {
            customer_id: customer_id.into(),
            token: token.into(),
            set_default: false,
            raw_payload: json!({"token": token}),
        }
    }

    #[tokio::test]
    async fn attach_activates_and_defaults_first_method() {
        let h = harness();
        let customer = seeded_customer(&h).await;

        let method = h
            .billing
            .attach_payment_method(&"acme".to_string(), attach(&customer.id, "pm_test_1"))
            .await
            .expect("attach");
        assert_eq!(method.status, PaymentMethodStatus::Active);
        assert_eq!(method.details.method_type, "card");
        assert_eq!(method.details.last4.as_deref(), Some("4242"));
        // First method becomes the default even without set_default.
        assert!(method.is_default);

        let refreshed = h
            .billing
            .get_customer(&"acme".to_string(), &customer.id)
            .await
            .expect("customer");
        assert_eq!(
            refreshed.default_payment_method_id.as_deref(),
            Some(method.id.as_str())
        );
    }

    #[tokio::test]
    async fn attach_rejects_pci_payloads() {
        let h = harness();
        let customer = seeded_customer(&h).await;
        let err = h
            .billing
            .attach_payment_method(
                &"acme".to_string(),
                AttachPaymentMethodRequest {
                    customer_id: customer.id.clone(),
                    token: "pm_test_1".into(),
                    set_default: false,
                    raw_payload: json!({"token": "pm_test_1", "cvc": "123"}),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::PciViolation(_)));

        let methods = h
            .billing
            .list_payment_methods(&"acme".to_string(), &customer.id)
            .await
            .expect("list");
        assert!(methods.is_empty());
    }

    #[tokio::test]
    async fn attach_failure_soft_deletes_the_pending_row() {
        let h = harness();
        let customer = seeded_customer(&h).await;
        h.processor.set_offline(true).await;

        let err = h
            .billing
            .attach_payment_method(&"acme".to_string(), attach(&customer.id, "pm_test_1"))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Processor(_)));

        let methods = h
            .billing
            .list_payment_methods(&"acme".to_string(), &customer.id)
            .await
            .expect("list");
        assert!(methods.is_empty(), "pending row must not survive as usable");
    }

    #[tokio::test]
    async fn delete_clears_default_and_hides_method() {
        let h = harness();
        let customer = seeded_customer(&h).await;
        let method = h
            .billing
            .attach_payment_method(&"acme".to_string(), attach(&customer.id, "pm_test_1"))
            .await
            .expect("attach");

        h.billing
            .delete_payment_method(&"acme".to_string(), &method.id)
            .await
            .expect("delete");

        let refreshed = h
            .billing
            .get_customer(&"acme".to_string(), &customer.id)
            .await
            .expect("customer");
        assert!(refreshed.default_payment_method_id.is_none());

        let err = h
            .billing
            .delete_payment_method(&"acme".to_string(), &method.id)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::NotFound(_)));
    }

    #[tokio::test]
    async fn second_method_with_set_default_switches_default() {
        let h = harness();
        let customer = seeded_customer(&h).await;
        let first = h
            .billing
            .attach_payment_method(&"acme".to_string(), attach(&customer.id, "pm_test_1"))
            .await
            .expect("attach first");

        let second = h
            .billing
            .attach_payment_method(
                &"acme".to_string(),
                AttachPaymentMethodRequest {
                    customer_id: customer.id.clone(),
                    token: "pm_test_mc_2".into(),
                    set_default: true,
                    raw_payload: json!({"token": "pm_test_mc_2"}),
                },
            )
            .await
            .expect("attach second");
        assert!(second.is_default);

        let methods = h
            .billing
            .list_payment_methods(&"acme".to_string(), &customer.id)
            .await
            .expect("list");
        let first_row = methods
            .iter()
            .find(|m| m.id == first.id)
            .expect("first method");
        assert!(!first_row.is_default);
    }
}
