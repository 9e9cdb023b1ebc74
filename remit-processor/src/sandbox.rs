use std::collections::HashMap;
use std::collections::VecDeque;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::AttachPaymentMethodRequest;
use crate::CancelSubscriptionRequest;
use crate::CreateChargeRequest;
use crate::CreateCustomerRequest;
use crate::CreateRefundRequest;
use crate::CreateSubscriptionRequest;
use crate::ProcessorCharge;
use crate::ProcessorClient;
use crate::ProcessorCustomer;
use crate::ProcessorError;
use crate::ProcessorPaymentMethod;
use crate::ProcessorRefund;
use crate::ProcessorResult;
use crate::ProcessorSubscription;
use crate::UpdateSubscriptionRequest;

/// In-memory stand-in for the real processor. Behaves like the sandbox
/// environment of a payment provider: tokens attach successfully, charges
/// succeed unless a failure has been queued, and everything is observable
/// for assertions.
#[derive(Default)]
pub struct SandboxProcessor {
    state: Mutex<SandboxState>,
}

#[derive(Default)]
struct SandboxState {
    offline: bool,
    customers: HashMap<String, ProcessorCustomer>,
    payment_methods: HashMap<String, ProcessorPaymentMethod>,
    charges: HashMap<String, ProcessorCharge>,
    refunds: HashMap<String, ProcessorRefund>,
    subscriptions: HashMap<String, ProcessorSubscription>,
    queued_charge_failures: VecDeque<String>,
    queued_refund_failures: VecDeque<String>,
    queued_subscription_update_failures: VecDeque<String>,
    charge_count: u64,
    refund_count: u64,
}

impl SandboxProcessor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `create_charge` call returns status `failed` with this code.
    pub async fn fail_next_charge(&self, failure_code: impl Into<String>) {
        let mut state = self.state.lock().await;
        state.queued_charge_failures.push_back(failure_code.into());
    }

    pub async fn fail_next_refund(&self, failure_code: impl Into<String>) {
        let mut state = self.state.lock().await;
        state.queued_refund_failures.push_back(failure_code.into());
    }

    pub async fn fail_next_subscription_update(&self, message: impl Into<String>) {
        let mut state = self.state.lock().await;
        state
            .queued_subscription_update_failures
            .push_back(message.into());
    }

    /// While offline every call fails with a retriable network error.
    pub async fn set_offline(&self, offline: bool) {
        let mut state = self.state.lock().await;
        state.offline = offline;
    }

    pub async fn charge_count(&self) -> u64 {
        self.state.lock().await.charge_count
    }

    pub async fn refund_count(&self) -> u64 {
        self.state.lock().await.refund_count
    }

    fn ensure_online(state: &SandboxState) -> ProcessorResult<()> {
        if state.offline {
            Err(ProcessorError::network("sandbox processor offline"))
        } else {
            Ok(())
        }
    }

    /// Derives plausible display metadata from the token suffix so tests can
    /// steer brands without a real tokenizer.
    fn method_from_token(token: &str) -> ProcessorPaymentMethod {
        if token.contains("bank") {
            ProcessorPaymentMethod {
                token: token.to_string(),
                method_type: "bank_account".into(),
                brand: None,
                last4: None,
                exp_month: None,
                exp_year: None,
                bank_tail: Some("6789".into()),
            }
        } else {
            let brand = if token.contains("mc") { "mastercard" } else { "visa" };
            ProcessorPaymentMethod {
                token: token.to_string(),
                method_type: "card".into(),
                brand: Some(brand.into()),
                last4: Some("4242".into()),
                exp_month: Some(12),
                exp_year: Some(2030),
                bank_tail: None,
            }
        }
    }
}

#[async_trait]
impl ProcessorClient for SandboxProcessor {
    async fn create_customer(
        &self,
        request: CreateCustomerRequest,
    ) -> ProcessorResult<ProcessorCustomer> {
        let mut state = self.state.lock().await;
        Self::ensure_online(&state)?;
        let customer = ProcessorCustomer {
            id: format!("sbx_cus_{}", Uuid::new_v4().simple()),
        };
        let _ = request;
        state.customers.insert(customer.id.clone(), customer.clone());
        Ok(customer)
    }

    async fn attach_payment_method(
        &self,
        request: AttachPaymentMethodRequest,
    ) -> ProcessorResult<ProcessorPaymentMethod> {
        let mut state = self.state.lock().await;
        Self::ensure_online(&state)?;
        if !state.customers.contains_key(&request.processor_customer_id) {
            return Err(ProcessorError {
                code: "customer_not_found".into(),
                message: Some(format!(
                    "unknown processor customer {}",
                    request.processor_customer_id
                )),
                retriable: false,
            });
        }
        let method = Self::method_from_token(&request.token);
        state
            .payment_methods
            .insert(request.token.clone(), method.clone());
        Ok(method)
    }

    async fn detach_payment_method(&self, token: &str) -> ProcessorResult<()> {
        let mut state = self.state.lock().await;
        Self::ensure_online(&state)?;
        state.payment_methods.remove(token);
        Ok(())
    }

    async fn get_payment_method(&self, token: &str) -> ProcessorResult<ProcessorPaymentMethod> {
        let state = self.state.lock().await;
        Self::ensure_online(&state)?;
        state
            .payment_methods
            .get(token)
            .cloned()
            .ok_or_else(|| ProcessorError {
                code: "payment_method_not_found".into(),
                message: Some(format!("unknown token {token}")),
                retriable: false,
            })
    }

    async fn create_charge(&self, request: CreateChargeRequest) -> ProcessorResult<ProcessorCharge> {
        let mut state = self.state.lock().await;
        Self::ensure_online(&state)?;
        state.charge_count += 1;
        let charge = match state.queued_charge_failures.pop_front() {
            Some(failure_code) => ProcessorCharge {
                id: format!("sbx_ch_{}", Uuid::new_v4().simple()),
                status: "failed".into(),
                failure_code: Some(failure_code),
                amount_cents: Some(request.amount_cents),
            },
            None => ProcessorCharge {
                id: format!("sbx_ch_{}", Uuid::new_v4().simple()),
                status: "succeeded".into(),
                failure_code: None,
                amount_cents: Some(request.amount_cents),
            },
        };
        state.charges.insert(charge.id.clone(), charge.clone());
        Ok(charge)
    }

    async fn get_charge(&self, processor_charge_id: &str) -> ProcessorResult<ProcessorCharge> {
        let state = self.state.lock().await;
        Self::ensure_online(&state)?;
        state
            .charges
            .get(processor_charge_id)
            .cloned()
            .ok_or_else(|| ProcessorError {
                code: "charge_not_found".into(),
                message: Some(format!("unknown processor charge {processor_charge_id}")),
                retriable: false,
            })
    }

    async fn create_refund(&self, request: CreateRefundRequest) -> ProcessorResult<ProcessorRefund> {
        let mut state = self.state.lock().await;
        Self::ensure_online(&state)?;
        if !state.charges.contains_key(&request.processor_charge_id) {
            return Err(ProcessorError {
                code: "charge_not_found".into(),
                message: Some(format!(
                    "unknown processor charge {}",
                    request.processor_charge_id
                )),
                retriable: false,
            });
        }
        state.refund_count += 1;
        let refund = match state.queued_refund_failures.pop_front() {
            Some(failure_code) => ProcessorRefund {
                id: format!("sbx_re_{}", Uuid::new_v4().simple()),
                status: "failed".into(),
                failure_code: Some(failure_code),
                amount_cents: Some(request.amount_cents),
            },
            None => ProcessorRefund {
                id: format!("sbx_re_{}", Uuid::new_v4().simple()),
                status: "succeeded".into(),
                failure_code: None,
                amount_cents: Some(request.amount_cents),
            },
        };
        state.refunds.insert(refund.id.clone(), refund.clone());
        Ok(refund)
    }

    async fn get_refund(&self, processor_refund_id: &str) -> ProcessorResult<ProcessorRefund> {
        let state = self.state.lock().await;
        Self::ensure_online(&state)?;
        state
            .refunds
            .get(processor_refund_id)
            .cloned()
            .ok_or_else(|| ProcessorError {
                code: "refund_not_found".into(),
                message: Some(format!("unknown processor refund {processor_refund_id}")),
                retriable: false,
            })
    }

    async fn create_subscription(
        &self,
        request: CreateSubscriptionRequest,
    ) -> ProcessorResult<ProcessorSubscription> {
        let mut state = self.state.lock().await;
        Self::ensure_online(&state)?;
        if !state.customers.contains_key(&request.processor_customer_id) {
            return Err(ProcessorError {
                code: "customer_not_found".into(),
                message: Some(format!(
                    "unknown processor customer {}",
                    request.processor_customer_id
                )),
                retriable: false,
            });
        }
        let subscription = ProcessorSubscription {
            id: format!("sbx_sub_{}", Uuid::new_v4().simple()),
            status: "active".into(),
        };
        state
            .subscriptions
            .insert(subscription.id.clone(), subscription.clone());
        Ok(subscription)
    }

    async fn update_subscription(
        &self,
        request: UpdateSubscriptionRequest,
    ) -> ProcessorResult<ProcessorSubscription> {
        let mut state = self.state.lock().await;
        Self::ensure_online(&state)?;
        if let Some(message) = state.queued_subscription_update_failures.pop_front() {
            return Err(ProcessorError::upstream("subscription_update_failed", message));
        }
        state
            .subscriptions
            .get(&request.processor_subscription_id)
            .cloned()
            .ok_or_else(|| ProcessorError {
                code: "subscription_not_found".into(),
                message: Some(format!(
                    "unknown processor subscription {}",
                    request.processor_subscription_id
                )),
                retriable: false,
            })
    }

    async fn cancel_subscription(
        &self,
        request: CancelSubscriptionRequest,
    ) -> ProcessorResult<ProcessorSubscription> {
        let mut state = self.state.lock().await;
        Self::ensure_online(&state)?;
        let subscription = state
            .subscriptions
            .get_mut(&request.processor_subscription_id)
            .ok_or_else(|| ProcessorError {
                code: "subscription_not_found".into(),
                message: Some(format!(
                    "unknown processor subscription {}",
                    request.processor_subscription_id
                )),
                retriable: false,
            })?;
        if !request.at_period_end {
            subscription.status = "canceled".into();
        }
        Ok(subscription.clone())
    }

    async fn get_subscription(
        &self,
        processor_subscription_id: &str,
    ) -> ProcessorResult<ProcessorSubscription> {
        let state = self.state.lock().await;
        Self::ensure_online(&state)?;
        state
            .subscriptions
            .get(processor_subscription_id)
            .cloned()
            .ok_or_else(|| ProcessorError {
                code: "subscription_not_found".into(),
                message: Some(format!(
                    "unknown processor subscription {processor_subscription_id}"
                )),
                retriable: false,
            })
    }
}
