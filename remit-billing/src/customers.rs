use chrono::Utc;
use remit_ledger::ArStore;
use remit_ledger::Customer;
use remit_ledger::CustomerFilter;
use remit_ledger::CustomerId;
use remit_ledger::DelinquencyState;
use remit_processor::ProcessorClient;
use uuid::Uuid;

use crate::Billing;
use crate::BillingError;
use crate::BillingResult;
use crate::TenantId;
use crate::pci::ensure_no_pci_fields;

#[derive(Debug, Clone, PartialEq)]
pub struct CreateCustomerRequest {
    pub external_id: String,
    pub email: String,
    pub display_name: String,
}

impl CreateCustomerRequest {
    pub fn normalize(mut self) -> BillingResult<Self> {
        if self.external_id.trim().is_empty() {
            return Err(BillingError::Validation(
                "external_id cannot be empty".into(),
            ));
        }
        self.external_id = self.external_id.trim().to_string();

        self.email = self.email.trim().to_ascii_lowercase();
        if !self.email.contains('@') {
            return Err(BillingError::Validation("email must include '@'".into()));
        }

        self.display_name = self.display_name.trim().to_string();
        if self.display_name.is_empty() {
            return Err(BillingError::Validation(
                "display name cannot be empty".into(),
            ));
        }
        Ok(self)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct UpdateCustomerRequest {
    pub email: Option<String>,
    pub display_name: Option<String>,
    /// The raw payload, scanned for PCI-like fields before anything else.
    pub raw_payload: serde_json::Value,
}

impl Billing {
    pub async fn create_customer(
        &self,
        tenant: &TenantId,
        request: CreateCustomerRequest,
    ) -> BillingResult<Customer> {
        let request = request.normalize()?;

        let customer = Customer {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant.clone(),
            external_id: request.external_id,
            email: request.email,
            display_name: request.display_name,
            processor_customer_id: None,
            default_payment_method_id: None,
            ar_balance_cents: 0,
            aging: remit_ledger::AgingBuckets::default(),
            delinquency: DelinquencyState::None,
            payment_retry_count: 0,
            next_retry_at: None,
            grace_period_end: None,
            created_at: Utc::now(),
            deleted_at: None,
        };
        let customer = self.store.insert_customer(customer).await?;
        tracing::info!(
            tenant_id = %tenant,
            customer_id = %customer.id,
            external_id = %customer.external_id,
            "customer created"
        );
        Ok(customer)
    }

    pub async fn get_customer(
        &self,
        tenant: &TenantId,
        id: &CustomerId,
    ) -> BillingResult<Customer> {
        let customer = self.store.customer(tenant, id).await?;
        if customer.is_deleted() {
            return Err(BillingError::NotFound(format!("customer {id}")));
        }
        Ok(customer)
    }

    pub async fn update_customer(
        &self,
        tenant: &TenantId,
        id: &CustomerId,
        request: UpdateCustomerRequest,
    ) -> BillingResult<Customer> {
        ensure_no_pci_fields(&request.raw_payload)?;
        let mut customer = self.get_customer(tenant, id).await?;

        if let Some(email) = request.email {
            let email = email.trim().to_ascii_lowercase();
            if !email.contains('@') {
                return Err(BillingError::Validation("email must include '@'".into()));
            }
            customer.email = email;
        }
        if let Some(display_name) = request.display_name {
            let display_name = display_name.trim().to_string();
            if display_name.is_empty() {
                return Err(BillingError::Validation(
                    "display name cannot be empty".into(),
                ));
            }
            customer.display_name = display_name;
        }

        Ok(self.store.update_customer(customer).await?)
    }

    pub async fn list_customers(
        &self,
        tenant: &TenantId,
        filter: CustomerFilter,
    ) -> BillingResult<Vec<Customer>> {
        Ok(self.store.list_customers(tenant, filter).await?)
    }

    /// Soft delete; financial history is retained and the row stays
    /// reachable for reports that opt in.
    pub async fn delete_customer(
        &self,
        tenant: &TenantId,
        id: &CustomerId,
    ) -> BillingResult<Customer> {
        // Verify visibility first so a second delete reads as NotFound.
        self.get_customer(tenant, id).await?;
        let customer = self
            .store
            .soft_delete_customer(tenant, id, Utc::now())
            .await?;
        tracing::info!(tenant_id = %tenant, customer_id = %id, "customer soft-deleted");
        Ok(customer)
    }

    /// Lazily creates the processor-side mirror for a customer. Called by
    /// flows that need a processor customer id (attach, charge,
    /// subscription).
    pub(crate) async fn ensure_processor_customer(
        &self,
        tenant: &TenantId,
        customer: &mut Customer,
    ) -> BillingResult<String> {
        if let Some(existing) = &customer.processor_customer_id {
            return Ok(existing.clone());
        }
        let created = self
            .processor
            .create_customer(remit_processor::CreateCustomerRequest {
                external_id: customer.external_id.clone(),
                email: customer.email.clone(),
                display_name: customer.display_name.clone(),
            })
            .await?;
        customer.processor_customer_id = Some(created.id.clone());
        *customer = self.store.update_customer(customer.clone()).await?;
        Ok(created.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::harness;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn create_request(external_id: &str) -> CreateCustomerRequest {
        CreateCustomerRequest {
            external_id: external_id.into(),
            email: format!("  {external_id}@Example.COM "),
            display_name: "  Ada Lovelace  ".into(),
        }
    }

    #[tokio::test]
    async fn create_normalizes_and_persists() {
        let h = harness();
        let customer = h
            .billing
            .create_customer(&"acme".to_string(), create_request("cu_001"))
            .await
            .expect("create");
        assert_eq!(customer.email, "cu_001@example.com");
        assert_eq!(customer.display_name, "Ada Lovelace");
        assert_eq!(customer.delinquency, DelinquencyState::None);
        assert_eq!(customer.ar_balance_cents, 0);
    }

    #[tokio::test]
    async fn duplicate_external_id_conflicts() {
        let h = harness();
        h.billing
            .create_customer(&"acme".to_string(), create_request("cu_001"))
            .await
            .expect("create");
        let err = h
            .billing
            .create_customer(&"acme".to_string(), create_request("cu_001"))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Conflict(_)));
    }

    #[tokio::test]
    async fn update_rejects_pci_fields_before_touching_state() {
        let h = harness();
        let customer = h
            .billing
            .create_customer(&"acme".to_string(), create_request("cu_001"))
            .await
            .expect("create");

        let err = h
            .billing
            .update_customer(
                &"acme".to_string(),
                &customer.id,
                UpdateCustomerRequest {
                    email: Some("new@example.com".into()),
                    display_name: None,
                    raw_payload: json!({"email": "new@example.com", "card_number": "4111"}),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::PciViolation(_)));

        let unchanged = h
            .billing
            .get_customer(&"acme".to_string(), &customer.id)
            .await
            .expect("get");
        assert_eq!(unchanged.email, "cu_001@example.com");
    }

    #[tokio::test]
    async fn soft_deleted_customers_read_as_not_found() {
        let h = harness();
        let customer = h
            .billing
            .create_customer(&"acme".to_string(), create_request("cu_001"))
            .await
            .expect("create");
        h.billing
            .delete_customer(&"acme".to_string(), &customer.id)
            .await
            .expect("delete");

        let err = h
            .billing
            .get_customer(&"acme".to_string(), &customer.id)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::NotFound(_)));

        let err = h
            .billing
            .delete_customer(&"acme".to_string(), &customer.id)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::NotFound(_)));
    }

    #[tokio::test]
    async fn ensure_processor_customer_is_lazy_and_sticky() {
        let h = harness();
        let mut customer = h
            .billing
            .create_customer(&"acme".to_string(), create_request("cu_001"))
            .await
            .expect("create");
        assert!(customer.processor_customer_id.is_none());

        let first = h
            .billing
            .ensure_processor_customer(&"acme".to_string(), &mut customer)
            .await
            .expect("mirror");
        let second = h
            .billing
            .ensure_processor_customer(&"acme".to_string(), &mut customer)
            .await
            .expect("cached");
        assert_eq!(first, second);
        assert_eq!(customer.processor_customer_id.as_deref(), Some(first.as_str()));
    }
}
