//! Retry policy for GL posting delivery. Transient failures get one
//! immediate retry and then a five-minute backoff; business-rule rejections
//! from the GL service are never retried, because the receivable side does
//! not roll back — the rejection surfaces for a human in the
//! reconciliation queue instead.

use std::time::Duration;

pub const RETRY_DELAY_AFTER_IMMEDIATE: Duration = Duration::from_secs(300);

/// Rejection reasons that indicate the intent itself is wrong for the
/// target ledger. Redelivering the same payload cannot succeed.
pub const BUSINESS_REJECTION_CODES: [&str; 4] = [
    "UNBALANCED_ENTRY",
    "INVALID_ACCOUNT",
    "PERIOD_CLOSED",
    "INVALID_CURRENCY",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlRetryDecision {
    /// Try again without waiting.
    RetryNow,
    /// Try again after the delay.
    RetryAfter(Duration),
    /// Record the rejection; a follow-up command or write-off resolves it.
    Park,
}

#[must_use]
pub fn is_business_rejection(code: &str) -> bool {
    BUSINESS_REJECTION_CODES.contains(&code)
}

/// Decides the follow-up after a failed publish or an explicit rejection.
/// `attempts_so_far` counts completed attempts including the failing one.
#[must_use]
pub fn after_failure(attempts_so_far: u32, rejection_code: Option<&str>) -> GlRetryDecision {
    if let Some(code) = rejection_code {
        if is_business_rejection(code) {
            return GlRetryDecision::Park;
        }
    }
    match attempts_so_far {
        0 | 1 => GlRetryDecision::RetryNow,
        2 => GlRetryDecision::RetryAfter(RETRY_DELAY_AFTER_IMMEDIATE),
        _ => GlRetryDecision::Park,
    }
}
