//! Payment retry (dunning) schedule and failure classification.
//!
//! The first collection attempt happens when the invoice issues; each
//! subsequent failure schedules the next attempt on a day ladder. Three
//! failures mark the customer delinquent with a grace period; once grace
//! expires the account suspends. Terminal card failures abort the ladder
//! immediately.

use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;

/// Days until the next attempt, indexed by how many attempts have failed.
/// With the initial attempt at issue this yields 5 attempts total.
pub const DEFAULT_SCHEDULE_DAYS: [i64; 4] = [1, 3, 7, 7];

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Failures to go from `none` to `delinquent`.
pub const DELINQUENT_AFTER_FAILURES: u32 = 3;

/// Grace window granted when a customer turns delinquent before the account
/// suspends.
pub const GRACE_PERIOD_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Declines that can clear on their own (balance, velocity limits).
    Soft,
    /// Declines that need customer action but may still clear on retry.
    Hard,
    /// Declines that will never succeed; retrying is pointless.
    Terminal,
}

/// Pins the processor-specific failure-code set for the stock adapter. A
/// new adapter supplies its own mapping here rather than scattering string
/// matches through the handlers.
#[must_use]
pub fn classify_failure_code(code: &str) -> FailureClass {
    match code {
        "expired_card" | "invalid_card" | "fraudulent" | "account_closed" => FailureClass::Terminal,
        "card_declined" | "do_not_honor" | "pickup_card" => FailureClass::Hard,
        _ => FailureClass::Soft,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DunningSchedule {
    offsets_days: Vec<i64>,
    max_attempts: u32,
}

impl Default for DunningSchedule {
    fn default() -> Self {
        Self {
            offsets_days: DEFAULT_SCHEDULE_DAYS.to_vec(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DunningDecision {
    /// Schedule another attempt at the given time.
    RetryAt(DateTime<Utc>),
    /// The ladder is exhausted or the failure is terminal.
    GiveUp,
}

impl DunningSchedule {
    #[must_use]
    pub fn new(offsets_days: Vec<i64>, max_attempts: u32) -> Self {
        Self {
            offsets_days,
            max_attempts: max_attempts.max(1),
        }
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decides the follow-up for the `failed_attempts`-th failure observed
    /// at `now`.
    #[must_use]
    pub fn after_failure(
        &self,
        failed_attempts: u32,
        failure_code: &str,
        now: DateTime<Utc>,
    ) -> DunningDecision {
        if classify_failure_code(failure_code) == FailureClass::Terminal {
            return DunningDecision::GiveUp;
        }
        if failed_attempts == 0 || failed_attempts >= self.max_attempts {
            return DunningDecision::GiveUp;
        }
        let index = (failed_attempts as usize - 1).min(self.offsets_days.len().saturating_sub(1));
        match self.offsets_days.get(index) {
            Some(days) => DunningDecision::RetryAt(now + Duration::days(*days)),
            None => DunningDecision::GiveUp,
        }
    }

    /// True once the failure count crosses the delinquency threshold.
    #[must_use]
    pub fn is_delinquent(&self, failed_attempts: u32) -> bool {
        failed_attempts >= DELINQUENT_AFTER_FAILURES
    }

    #[must_use]
    pub fn grace_period_end(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + Duration::days(GRACE_PERIOD_DAYS)
    }
}
