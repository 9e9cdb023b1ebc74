#![deny(clippy::print_stdout, clippy::print_stderr)]

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

mod memory;

pub use memory::InMemoryArStore;

pub type TenantId = String;
pub type CustomerId = String;
pub type PaymentMethodId = String;
pub type InvoiceId = String;
pub type ApplicationId = String;
pub type ChargeId = String;
pub type RefundId = String;
pub type DisputeId = String;
pub type CreditMemoId = String;
pub type SubscriptionId = String;
pub type LedgerEventId = String;
pub type CurrencyCode = String;

pub type LedgerResult<T> = Result<T, LedgerError>;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("currency mismatch: expected {expected}, got {actual}")]
    CurrencyMismatch {
        expected: CurrencyCode,
        actual: CurrencyCode,
    },
    #[error("internal error: {0}")]
    Internal(String),
}

/// Outcome of a first-write-wins insert keyed by a caller-supplied unique
/// token. Concurrent duplicates land on `Existing` and see the winner's row.
#[derive(Debug, Clone, PartialEq)]
pub enum Upsert<T> {
    Created(T),
    Existing(T),
}

impl<T> Upsert<T> {
    pub fn into_inner(self) -> T {
        match self {
            Upsert::Created(value) | Upsert::Existing(value) => value,
        }
    }

    #[must_use]
    pub fn is_created(&self) -> bool {
        matches!(self, Upsert::Created(_))
    }
}

pub fn validate_currency_code(code: &str) -> LedgerResult<()> {
    if code.len() == 3 && code.chars().all(|ch| ch.is_ascii_uppercase()) {
        Ok(())
    } else {
        Err(LedgerError::Validation(format!(
            "invalid ISO-4217 currency code {code}"
        )))
    }
}

pub fn validate_positive_cents(amount_cents: i64, field: &str) -> LedgerResult<()> {
    if amount_cents > 0 {
        Ok(())
    } else {
        Err(LedgerError::Validation(format!(
            "{field} must be a positive amount in minor units"
        )))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelinquencyState {
    None,
    Delinquent,
    Grace,
    Suspended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AgingBuckets {
    pub current_cents: i64,
    pub days_1_30_cents: i64,
    pub days_31_60_cents: i64,
    pub days_61_90_cents: i64,
    pub days_over_90_cents: i64,
}

impl AgingBuckets {
    #[must_use]
    pub fn total_cents(&self) -> i64 {
        self.current_cents
            + self.days_1_30_cents
            + self.days_31_60_cents
            + self.days_61_90_cents
            + self.days_over_90_cents
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: CustomerId,
    pub tenant_id: TenantId,
    pub external_id: String,
    pub email: String,
    pub display_name: String,
    /// Mirror of the processor-side customer record, set once the first
    /// processor call for this customer succeeds.
    pub processor_customer_id: Option<String>,
    pub default_payment_method_id: Option<PaymentMethodId>,
    pub ar_balance_cents: i64,
    pub aging: AgingBuckets,
    pub delinquency: DelinquencyState,
    pub payment_retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub grace_period_end: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Customer {
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethodStatus {
    Pending,
    Active,
    SoftDeleted,
}

/// Non-PCI display metadata fetched from the processor after attach.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PaymentMethodDetails {
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

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentMethodRef {
    pub id: PaymentMethodId,
    pub tenant_id: TenantId,
    pub customer_id: CustomerId,
    pub processor_token: String,
    pub status: PaymentMethodStatus,
    pub is_default: bool,
    pub details: PaymentMethodDetails,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl PaymentMethodRef {
    #[must_use]
    pub fn is_usable(&self) -> bool {
        self.status == PaymentMethodStatus::Active && self.deleted_at.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Issued,
    PartiallyPaid,
    Paid,
    Voided,
    Disputed,
    WrittenOff,
    Uncollectible,
}

impl InvoiceStatus {
    /// Terminal states admit no further transition.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InvoiceStatus::Paid | InvoiceStatus::Voided | InvoiceStatus::WrittenOff
        )
    }

    #[must_use]
    pub fn is_collectible(self) -> bool {
        matches!(
            self,
            InvoiceStatus::Issued | InvoiceStatus::PartiallyPaid | InvoiceStatus::Disputed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceLine {
    pub description: String,
    pub quantity: u32,
    pub unit_price_cents: i64,
    pub amount_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: InvoiceId,
    pub tenant_id: TenantId,
    pub customer_id: CustomerId,
    pub status: InvoiceStatus,
    pub currency: CurrencyCode,
    pub subtotal_cents: i64,
    pub tax_cents: i64,
    pub total_cents: i64,
    pub applied_cents: i64,
    pub lines: Vec<InvoiceLine>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_end: Option<DateTime<Utc>>,
    pub issued_at: Option<DateTime<Utc>>,
    pub due_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Invoice {
    /// total = subtotal + tax and subtotal = Σ line amounts. Lines are frozen
    /// at issue time, so this only has to hold from `issue` onwards.
    pub fn validate_totals(&self) -> LedgerResult<()> {
        let line_sum: i64 = self.lines.iter().map(|line| line.amount_cents).sum();
        if line_sum != self.subtotal_cents {
            return Err(LedgerError::Validation(format!(
                "invoice {} line sum {line_sum} does not match subtotal {}",
                self.id, self.subtotal_cents
            )));
        }
        if self.subtotal_cents + self.tax_cents != self.total_cents {
            return Err(LedgerError::Validation(format!(
                "invoice {} subtotal {} + tax {} does not match total {}",
                self.id, self.subtotal_cents, self.tax_cents, self.total_cents
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn outstanding_cents(&self) -> i64 {
        (self.total_cents - self.applied_cents).max(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationType {
    Auto,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationStatus {
    PendingApply,
    Applied,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentApplication {
    pub id: ApplicationId,
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub customer_id: CustomerId,
    pub processor_payment_id: String,
    pub allocated_cents: i64,
    pub allocation_type: AllocationType,
    pub status: ApplicationStatus,
    pub applied_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeStatus {
    Pending,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Charge {
    pub id: ChargeId,
    pub tenant_id: TenantId,
    pub customer_id: CustomerId,
    /// Caller-supplied domain idempotency key, unique per tenant.
    pub reference_id: String,
    pub payment_method_id: Option<PaymentMethodId>,
    pub amount_cents: i64,
    pub currency: CurrencyCode,
    pub status: ChargeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processor_charge_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl Charge {
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.status == ChargeStatus::Succeeded
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    Pending,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Refund {
    pub id: RefundId,
    pub tenant_id: TenantId,
    pub customer_id: CustomerId,
    pub charge_id: ChargeId,
    pub reference_id: String,
    pub amount_cents: i64,
    pub currency: CurrencyCode,
    pub status: RefundStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processor_refund_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeStatus {
    Opened,
    EvidenceSubmitted,
    Expired,
    ClosedWon,
    ClosedLost,
    ClosedAccepted,
}

impl DisputeStatus {
    #[must_use]
    pub fn is_closed(self) -> bool {
        matches!(
            self,
            DisputeStatus::ClosedWon | DisputeStatus::ClosedLost | DisputeStatus::ClosedAccepted
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dispute {
    pub id: DisputeId,
    pub tenant_id: TenantId,
    pub customer_id: CustomerId,
    pub charge_id: Option<ChargeId>,
    pub processor_dispute_id: String,
    pub amount_cents: i64,
    pub currency: CurrencyCode,
    pub status: DisputeStatus,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    /// Processor-side timestamp of the snapshot; out-of-order deliveries are
    /// resolved by keeping the later one.
    pub processor_updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditReason {
    DuplicateBilling,
    Goodwill,
    ServiceFailure,
    WriteOff,
    DisputeLoss,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditMemo {
    pub id: CreditMemoId,
    pub tenant_id: TenantId,
    pub customer_id: CustomerId,
    pub invoice_id: Option<InvoiceId>,
    pub amount_cents: i64,
    pub currency: CurrencyCode,
    pub reason: CreditReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    PastDue,
    Canceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
    Weekly,
    Monthly,
    Yearly,
}

/// Billing-cycle fields are immutable after creation; attempts to change
/// them are rejected upstream with `UNSUPPORTED_FIELD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingCycle {
    pub interval: BillingInterval,
    pub interval_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub tenant_id: TenantId,
    pub customer_id: CustomerId,
    pub processor_subscription_id: String,
    pub plan_code: String,
    pub status: SubscriptionStatus,
    pub billing_cycle: BillingCycle,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEventType {
    InvoiceIssued,
    PaymentApplied,
    RefundRecorded,
    CreditIssued,
    WriteOff,
    DisputeLoss,
    Adjustment,
}

/// Immutable append-only audit line. The (before, after) pair is the
/// authoritative trail; `source_event_id` is unique per tenant, which makes
/// replayed postings free.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub id: LedgerEventId,
    pub tenant_id: TenantId,
    pub customer_id: CustomerId,
    pub invoice_id: Option<InvoiceId>,
    pub event_type: LedgerEventType,
    pub amount_delta_cents: i64,
    pub balance_before_cents: i64,
    pub balance_after_cents: i64,
    pub currency: CurrencyCode,
    pub occurred_at: DateTime<Utc>,
    pub source_event_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PostEventRequest {
    pub tenant_id: TenantId,
    pub customer_id: CustomerId,
    pub invoice_id: Option<InvoiceId>,
    pub event_type: LedgerEventType,
    pub amount_delta_cents: i64,
    pub currency: CurrencyCode,
    pub source_event_id: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PostedEvent {
    pub event: LedgerEvent,
    /// False when `source_event_id` had already been posted; the stored
    /// event is returned and no balance change happened.
    pub newly_posted: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApplyPaymentRequest {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub processor_payment_id: String,
    pub amount_cents: i64,
    pub currency: CurrencyCode,
    pub allocation_type: AllocationType,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppliedPayment {
    pub application: PaymentApplication,
    pub invoice: Invoice,
}

#[derive(Debug, Clone, Default)]
pub struct CustomerFilter {
    pub include_deleted: bool,
    pub delinquency: Option<DelinquencyState>,
}

/// Tenant-scoped persistence contract. Every call carries the tenant key;
/// lookups that cross tenants come back as `NotFound`, indistinguishable
/// from absence. Operations that check-then-write are atomic per call.
#[async_trait]
pub trait ArStore: Send + Sync {
    // Customers
    async fn insert_customer(&self, customer: Customer) -> LedgerResult<Customer>;
    async fn customer(&self, tenant: &TenantId, id: &CustomerId) -> LedgerResult<Customer>;
    async fn customer_by_external_id(
        &self,
        tenant: &TenantId,
        external_id: &str,
    ) -> LedgerResult<Customer>;
    async fn update_customer(&self, customer: Customer) -> LedgerResult<Customer>;
    async fn soft_delete_customer(
        &self,
        tenant: &TenantId,
        id: &CustomerId,
        deleted_at: DateTime<Utc>,
    ) -> LedgerResult<Customer>;
    async fn list_customers(
        &self,
        tenant: &TenantId,
        filter: CustomerFilter,
    ) -> LedgerResult<Vec<Customer>>;

    // Payment methods
    async fn insert_payment_method(
        &self,
        method: PaymentMethodRef,
    ) -> LedgerResult<PaymentMethodRef>;
    async fn payment_method(
        &self,
        tenant: &TenantId,
        id: &PaymentMethodId,
    ) -> LedgerResult<PaymentMethodRef>;
    async fn update_payment_method(
        &self,
        method: PaymentMethodRef,
    ) -> LedgerResult<PaymentMethodRef>;
    /// Sets `is_default` on one active method and clears it on every other
    /// method of the same customer, in one atomic step.
    async fn set_default_payment_method(
        &self,
        tenant: &TenantId,
        customer_id: &CustomerId,
        method_id: &PaymentMethodId,
    ) -> LedgerResult<PaymentMethodRef>;
    async fn list_payment_methods(
        &self,
        tenant: &TenantId,
        customer_id: &CustomerId,
    ) -> LedgerResult<Vec<PaymentMethodRef>>;

    // Invoices
    async fn insert_invoice(&self, invoice: Invoice) -> LedgerResult<Invoice>;
    async fn invoice(&self, tenant: &TenantId, id: &InvoiceId) -> LedgerResult<Invoice>;
    async fn update_invoice(&self, invoice: Invoice) -> LedgerResult<Invoice>;
    async fn list_invoices(
        &self,
        tenant: &TenantId,
        customer_id: Option<&CustomerId>,
    ) -> LedgerResult<Vec<Invoice>>;
    async fn list_open_invoices(&self, tenant: &TenantId) -> LedgerResult<Vec<Invoice>>;

    // Payment applications
    /// Validates currency and outstanding balance under the invoice lock,
    /// records the application, and flips the invoice to
    /// `partially_paid`/`paid` as the allocation accumulates.
    async fn apply_payment(&self, request: ApplyPaymentRequest) -> LedgerResult<AppliedPayment>;
    async fn applications_for_invoice(
        &self,
        tenant: &TenantId,
        invoice_id: &InvoiceId,
    ) -> LedgerResult<Vec<PaymentApplication>>;

    // Charges
    /// First write wins on (tenant, reference_id); the loser of the race
    /// receives `Upsert::Existing` with the stored row.
    async fn insert_charge(&self, charge: Charge) -> LedgerResult<Upsert<Charge>>;
    async fn charge(&self, tenant: &TenantId, id: &ChargeId) -> LedgerResult<Charge>;
    async fn charge_by_reference(
        &self,
        tenant: &TenantId,
        reference_id: &str,
    ) -> LedgerResult<Charge>;
    async fn charge_by_processor_id(
        &self,
        tenant: &TenantId,
        processor_charge_id: &str,
    ) -> LedgerResult<Charge>;
    async fn update_charge(&self, charge: Charge) -> LedgerResult<Charge>;
    async fn list_charges(&self, tenant: &TenantId) -> LedgerResult<Vec<Charge>>;

    // Refunds
    async fn insert_refund(&self, refund: Refund) -> LedgerResult<Upsert<Refund>>;
    async fn refund(&self, tenant: &TenantId, id: &RefundId) -> LedgerResult<Refund>;
    async fn refund_by_processor_id(
        &self,
        tenant: &TenantId,
        processor_refund_id: &str,
    ) -> LedgerResult<Refund>;
    async fn update_refund(&self, refund: Refund) -> LedgerResult<Refund>;
    async fn refunds_for_charge(
        &self,
        tenant: &TenantId,
        charge_id: &ChargeId,
    ) -> LedgerResult<Vec<Refund>>;
    async fn list_refunds(&self, tenant: &TenantId) -> LedgerResult<Vec<Refund>>;

    // Disputes
    /// Upsert keyed on (tenant, processor_dispute_id). A snapshot older than
    /// the stored `processor_updated_at` is ignored and the stored row
    /// returned.
    async fn upsert_dispute(&self, dispute: Dispute) -> LedgerResult<Dispute>;
    async fn dispute_by_processor_id(
        &self,
        tenant: &TenantId,
        processor_dispute_id: &str,
    ) -> LedgerResult<Dispute>;
    async fn list_disputes(&self, tenant: &TenantId) -> LedgerResult<Vec<Dispute>>;

    // Credit memos
    async fn insert_credit_memo(&self, memo: CreditMemo) -> LedgerResult<CreditMemo>;
    async fn list_credit_memos(
        &self,
        tenant: &TenantId,
        customer_id: &CustomerId,
    ) -> LedgerResult<Vec<CreditMemo>>;

    // Subscriptions
    async fn insert_subscription(&self, subscription: Subscription) -> LedgerResult<Subscription>;
    async fn subscription(
        &self,
        tenant: &TenantId,
        id: &SubscriptionId,
    ) -> LedgerResult<Subscription>;
    async fn subscription_by_processor_id(
        &self,
        tenant: &TenantId,
        processor_subscription_id: &str,
    ) -> LedgerResult<Subscription>;
    async fn update_subscription(&self, subscription: Subscription) -> LedgerResult<Subscription>;
    async fn list_subscriptions(&self, tenant: &TenantId) -> LedgerResult<Vec<Subscription>>;

    // Ledger
    /// The single bookkeeping entry point. Loads the customer balance under
    /// its lock, computes before/after, inserts the event unless
    /// `source_event_id` was already posted, and updates the denormalized
    /// balance. Negative deltas clamp the balance at zero; the recorded
    /// delta is the effective one so the event stream always sums to the
    /// stored balance.
    async fn post_event(&self, request: PostEventRequest) -> LedgerResult<PostedEvent>;
    async fn ledger_events(
        &self,
        tenant: &TenantId,
        customer_id: &CustomerId,
    ) -> LedgerResult<Vec<LedgerEvent>>;

    // Aging
    /// Buckets outstanding invoice balances by days past due and writes the
    /// result to the customer row atomically. The bucket sum equals the
    /// customer's receivable balance.
    async fn recompute_aging(
        &self,
        tenant: &TenantId,
        customer_id: &CustomerId,
        as_of: DateTime<Utc>,
    ) -> LedgerResult<AgingBuckets>;
}

/// Partition one outstanding amount into an aging bucket by days past due.
#[must_use]
pub fn bucket_for_days_past_due(days: i64, amount_cents: i64) -> AgingBuckets {
    let mut buckets = AgingBuckets::default();
    if days <= 0 {
        buckets.current_cents = amount_cents;
    } else if days <= 30 {
        buckets.days_1_30_cents = amount_cents;
    } else if days <= 60 {
        buckets.days_31_60_cents = amount_cents;
    } else if days <= 90 {
        buckets.days_61_90_cents = amount_cents;
    } else {
        buckets.days_over_90_cents = amount_cents;
    }
    buckets
}

impl AgingBuckets {
    pub fn accumulate(&mut self, other: &AgingBuckets) {
        self.current_cents += other.current_cents;
        self.days_1_30_cents += other.days_1_30_cents;
        self.days_31_60_cents += other.days_31_60_cents;
        self.days_61_90_cents += other.days_61_90_cents;
        self.days_over_90_cents += other.days_over_90_cents;
    }
}
