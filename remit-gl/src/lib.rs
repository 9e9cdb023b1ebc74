#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Journal intents for the external general-ledger service. The engine owns
//! the double-entry shape of every AR event; the GL service owns the chart
//! of accounts and may still reject an intent, in which case the rejection
//! is parked for reconciliation — receivable truth never rewinds.

use chrono::NaiveDate;
use serde::Deserialize;
use serde::Serialize;

mod queue;

pub use queue::GlEmitter;
pub use queue::GlPostingQueue;
pub use queue::InMemoryGlPostingQueue;
pub use queue::PostingOutcome;
pub use queue::PostingQueueEntry;
pub use queue::PostingStatus;
pub use queue::SUBJECT_POSTING_ACCEPTED;
pub use queue::SUBJECT_POSTING_REJECTED;
pub use queue::SUBJECT_POSTING_REQUESTED;

pub type TenantId = String;
pub type GlResult<T> = Result<T, GlError>;

#[derive(Debug, thiserror::Error)]
pub enum GlError {
    /// An unbalanced intent is a bug in the calling service, never an
    /// external failure.
    #[error("unbalanced journal intent: {0}")]
    Unbalanced(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Publish(#[from] remit_events::EventError),
}

/// Tenant-configurable account codes. The GL service owns the real chart;
/// these defaults let a tenant go live without mapping anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountMapping {
    pub receivable: String,
    pub revenue: String,
    pub cash: String,
    pub sales_returns: String,
    pub bad_debt: String,
    pub dispute_loss: String,
}

impl Default for AccountMapping {
    fn default() -> Self {
        Self {
            receivable: "1100".into(),
            revenue: "4000".into(),
            cash: "1000".into(),
            sales_returns: "4100".into(),
            bad_debt: "6100".into(),
            dispute_loss: "6200".into(),
        }
    }
}

/// The AR events that trigger a posting, with their debit/credit pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArTrigger {
    InvoiceIssued,
    PaymentApplied,
    CreditIssued,
    WriteOff,
    RefundRecorded,
    DisputeLost,
}

impl ArTrigger {
    /// (debit account, credit account) for this trigger.
    #[must_use]
    pub fn accounts<'a>(&self, mapping: &'a AccountMapping) -> (&'a str, &'a str) {
        match self {
            ArTrigger::InvoiceIssued => (&mapping.receivable, &mapping.revenue),
            ArTrigger::PaymentApplied => (&mapping.cash, &mapping.receivable),
            ArTrigger::CreditIssued => (&mapping.sales_returns, &mapping.receivable),
            ArTrigger::WriteOff => (&mapping.bad_debt, &mapping.receivable),
            ArTrigger::RefundRecorded => (&mapping.sales_returns, &mapping.cash),
            ArTrigger::DisputeLost => (&mapping.dispute_loss, &mapping.receivable),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceDocType {
    Invoice,
    Payment,
    Refund,
    CreditMemo,
    Dispute,
    Adjustment,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalLine {
    pub account_code: String,
    pub debit_cents: i64,
    pub credit_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalIntent {
    /// Idempotency key for emission; unique per tenant and stable across
    /// redeliveries.
    pub posting_event_id: String,
    pub tenant_id: TenantId,
    pub posting_date: NaiveDate,
    pub currency: String,
    pub source_doc_type: SourceDocType,
    pub source_doc_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub lines: Vec<JournalLine>,
}

impl JournalIntent {
    /// Two-line intent from the default trigger table.
    #[must_use]
    pub fn for_trigger(
        posting_event_id: impl Into<String>,
        tenant_id: impl Into<String>,
        trigger: ArTrigger,
        mapping: &AccountMapping,
        amount_cents: i64,
        currency: impl Into<String>,
        posting_date: NaiveDate,
        source_doc_type: SourceDocType,
        source_doc_id: impl Into<String>,
    ) -> Self {
        let (debit_account, credit_account) = trigger.accounts(mapping);
        Self {
            posting_event_id: posting_event_id.into(),
            tenant_id: tenant_id.into(),
            posting_date,
            currency: currency.into(),
            source_doc_type,
            source_doc_id: source_doc_id.into(),
            description: None,
            lines: vec![
                JournalLine {
                    account_code: debit_account.to_string(),
                    debit_cents: amount_cents,
                    credit_cents: 0,
                },
                JournalLine {
                    account_code: credit_account.to_string(),
                    debit_cents: 0,
                    credit_cents: amount_cents,
                },
            ],
        }
    }

    #[must_use]
    pub fn total_debits_cents(&self) -> i64 {
        self.lines.iter().map(|line| line.debit_cents).sum()
    }

    #[must_use]
    pub fn total_credits_cents(&self) -> i64 {
        self.lines.iter().map(|line| line.credit_cents).sum()
    }

    /// Σ debits == Σ credits, at least two lines, no negative or two-sided
    /// lines. Must hold before emission.
    pub fn validate(&self) -> GlResult<()> {
        if self.lines.len() < 2 {
            return Err(GlError::Validation(format!(
                "intent {} needs at least two lines",
                self.posting_event_id
            )));
        }
        for line in &self.lines {
            if line.debit_cents < 0 || line.credit_cents < 0 {
                return Err(GlError::Validation(format!(
                    "intent {} carries a negative line amount",
                    self.posting_event_id
                )));
            }
            if line.debit_cents != 0 && line.credit_cents != 0 {
                return Err(GlError::Validation(format!(
                    "intent {} has a line posting both sides",
                    self.posting_event_id
                )));
            }
        }
        let debits = self.total_debits_cents();
        let credits = self.total_credits_cents();
        if debits != credits {
            return Err(GlError::Unbalanced(format!(
                "intent {}: debits {debits} != credits {credits}",
                self.posting_event_id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 1).expect("valid date")
    }

    #[test]
    fn trigger_table_matches_default_postings() {
        let mapping = AccountMapping::default();
        let expectations = [
            (ArTrigger::InvoiceIssued, "1100", "4000"),
            (ArTrigger::PaymentApplied, "1000", "1100"),
            (ArTrigger::CreditIssued, "4100", "1100"),
            (ArTrigger::WriteOff, "6100", "1100"),
            (ArTrigger::RefundRecorded, "4100", "1000"),
            (ArTrigger::DisputeLost, "6200", "1100"),
        ];
        for (trigger, debit, credit) in expectations {
            let (dr, cr) = trigger.accounts(&mapping);
            assert_eq!((dr, cr), (debit, credit), "{trigger:?}");
        }
    }

    #[test]
    fn trigger_intents_balance() {
        let mapping = AccountMapping::default();
        let intent = JournalIntent::for_trigger(
            "pe-1",
            "acme",
            ArTrigger::PaymentApplied,
            &mapping,
            9_900,
            "USD",
            date(),
            SourceDocType::Payment,
            "pay-1",
        );
        intent.validate().expect("balanced");
        assert_eq!(intent.total_debits_cents(), 9_900);
        assert_eq!(intent.total_credits_cents(), 9_900);
        assert_eq!(intent.lines[0].account_code, "1000");
        assert_eq!(intent.lines[1].account_code, "1100");
    }

    #[test]
    fn unbalanced_intent_is_rejected_locally() {
        let mut intent = JournalIntent::for_trigger(
            "pe-1",
            "acme",
            ArTrigger::InvoiceIssued,
            &AccountMapping::default(),
            9_900,
            "USD",
            date(),
            SourceDocType::Invoice,
            "inv-1",
        );
        intent.lines[1].credit_cents = 9_000;
        assert!(matches!(intent.validate(), Err(GlError::Unbalanced(_))));
    }

    #[test]
    fn negative_and_two_sided_lines_are_invalid() {
        let mut intent = JournalIntent::for_trigger(
            "pe-1",
            "acme",
            ArTrigger::InvoiceIssued,
            &AccountMapping::default(),
            1_000,
            "USD",
            date(),
            SourceDocType::Invoice,
            "inv-1",
        );
        intent.lines[0].credit_cents = 1_000;
        assert!(matches!(intent.validate(), Err(GlError::Validation(_))));

        intent.lines[0].credit_cents = 0;
        intent.lines[0].debit_cents = -1_000;
        assert!(matches!(intent.validate(), Err(GlError::Validation(_))));
    }

    #[test]
    fn single_line_intent_is_invalid() {
        let intent = JournalIntent {
            posting_event_id: "pe-1".into(),
            tenant_id: "acme".into(),
            posting_date: date(),
            currency: "USD".into(),
            source_doc_type: SourceDocType::Adjustment,
            source_doc_id: "adj-1".into(),
            description: None,
            lines: vec![JournalLine {
                account_code: "1100".into(),
                debit_cents: 0,
                credit_cents: 0,
            }],
        };
        assert!(matches!(intent.validate(), Err(GlError::Validation(_))));
    }
}
