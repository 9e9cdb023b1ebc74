#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Abstraction over the external payment processor. The engine never links a
//! vendor SDK; command services talk to `ProcessorClient` and the sandbox
//! implementation stands in for it in tests and demo deployments.

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

pub mod signature;

mod sandbox;

pub use sandbox::SandboxProcessor;

pub type ProcessorResult<T> = Result<T, ProcessorError>;

/// Failure codes the processor reports on declined charges that will never
/// succeed on retry. Everything network-shaped or 5xx-shaped is retriable.
pub const TERMINAL_DECLINE_CODES: [&str; 4] = [
    "expired_card",
    "invalid_card",
    "fraudulent",
    "account_closed",
];

#[derive(Debug, Clone, thiserror::Error)]
#[error("processor error {code}: {}", message.as_deref().unwrap_or("(no message)"))]
pub struct ProcessorError {
    /// Processor-assigned category, e.g. `card_declined` or `network_error`.
    pub code: String,
    pub message: Option<String>,
    pub retriable: bool,
}

impl ProcessorError {
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            code: "network_error".into(),
            message: Some(message.into()),
            retriable: true,
        }
    }

    #[must_use]
    pub fn upstream(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: Some(message.into()),
            retriable: true,
        }
    }

    #[must_use]
    pub fn declined(code: impl Into<String>, message: Option<String>) -> Self {
        let code = code.into();
        let retriable = !TERMINAL_DECLINE_CODES.contains(&code.as_str());
        Self {
            code,
            message,
            retriable,
        }
    }

    #[must_use]
    pub fn is_terminal_decline(&self) -> bool {
        TERMINAL_DECLINE_CODES.contains(&self.code.as_str())
    }
}

/// Per-tenant credentials resolved from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantCredentials {
    pub account_id: String,
    pub secret_key: String,
    pub webhook_secret: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateCustomerRequest {
    pub external_id: String,
    pub email: String,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorCustomer {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachPaymentMethodRequest {
    pub processor_customer_id: String,
    /// Opaque token minted by the frontend tokenizer; the engine never sees
    /// raw instrument data.
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorPaymentMethod {
    pub token: String,
    pub method_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brand: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last4: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp_month: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp_year: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bank_tail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateChargeRequest {
    pub processor_customer_id: String,
    pub payment_method_token: String,
    pub amount_cents: i64,
    pub currency: String,
    /// Forwarded so the processor can dedupe on its side too.
    pub reference_id: String,
}

/// Guaranteed response shape on money movement: an opaque id, a status
/// string, and an optional failure code. Amounts are echoed where the
/// processor provides them; reconciliation uses them to spot drift.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorCharge {
    pub id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount_cents: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRefundRequest {
    pub processor_charge_id: String,
    pub amount_cents: i64,
    pub currency: String,
    pub reference_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorRefund {
    pub id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount_cents: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateSubscriptionRequest {
    pub processor_customer_id: String,
    pub payment_method_token: String,
    pub plan_code: String,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorSubscription {
    pub id: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateSubscriptionRequest {
    pub processor_subscription_id: String,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelSubscriptionRequest {
    pub processor_subscription_id: String,
    pub at_period_end: bool,
}

/// The full capability set the engine requires from any processor adapter.
#[async_trait]
pub trait ProcessorClient: Send + Sync {
    async fn create_customer(
        &self,
        request: CreateCustomerRequest,
    ) -> ProcessorResult<ProcessorCustomer>;

    async fn attach_payment_method(
        &self,
        request: AttachPaymentMethodRequest,
    ) -> ProcessorResult<ProcessorPaymentMethod>;

    async fn detach_payment_method(&self, token: &str) -> ProcessorResult<()>;

    async fn get_payment_method(&self, token: &str) -> ProcessorResult<ProcessorPaymentMethod>;

    async fn create_charge(&self, request: CreateChargeRequest) -> ProcessorResult<ProcessorCharge>;

    /// Read-back used by reconciliation; mirrors the create response.
    async fn get_charge(&self, processor_charge_id: &str) -> ProcessorResult<ProcessorCharge>;

    async fn create_refund(&self, request: CreateRefundRequest) -> ProcessorResult<ProcessorRefund>;

    async fn get_refund(&self, processor_refund_id: &str) -> ProcessorResult<ProcessorRefund>;

    async fn create_subscription(
        &self,
        request: CreateSubscriptionRequest,
    ) -> ProcessorResult<ProcessorSubscription>;

    async fn update_subscription(
        &self,
        request: UpdateSubscriptionRequest,
    ) -> ProcessorResult<ProcessorSubscription>;

    async fn cancel_subscription(
        &self,
        request: CancelSubscriptionRequest,
    ) -> ProcessorResult<ProcessorSubscription>;

    async fn get_subscription(
        &self,
        processor_subscription_id: &str,
    ) -> ProcessorResult<ProcessorSubscription>;

    /// Inbound event authentication. The default delegates to
    /// [`signature::verify`]; adapters with a different scheme override it.
    fn verify_webhook_signature(
        &self,
        raw_body: &[u8],
        signature_header: &str,
        webhook_secret: &str,
        now: DateTime<Utc>,
        tolerance_seconds: i64,
    ) -> Result<(), signature::SignatureError> {
        signature::verify(
            webhook_secret.as_bytes(),
            signature_header,
            raw_body,
            now,
            tolerance_seconds,
        )
    }
}
