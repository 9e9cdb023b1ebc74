#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Scheduling truth for the three retry surfaces: webhook redelivery,
//! payment dunning, and GL posting. Each surface owns its scan loop; this
//! crate owns the ladders, jitter, failure classification, and run
//! deadlines so there is exactly one source of `next_attempt_at` math.

use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use rand::Rng;

pub mod dunning;
pub mod gl;

/// Default webhook redelivery ladder, in order of attempt: one minute, five
/// minutes, thirty minutes, two hours. After the ladder is exhausted the
/// record dead-letters.
pub const WEBHOOK_BACKOFF_MS: [u64; 4] = [60_000, 300_000, 1_800_000, 7_200_000];

pub const DEFAULT_WEBHOOK_MAX_ATTEMPTS: u32 = 5;

pub const DEFAULT_JITTER_RATIO: f64 = 0.10;

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffLadder {
    steps: Vec<Duration>,
    max_attempts: u32,
    jitter_ratio: f64,
}

impl Default for BackoffLadder {
    fn default() -> Self {
        Self::webhook()
    }
}

impl BackoffLadder {
    #[must_use]
    pub fn new(steps: Vec<Duration>, max_attempts: u32, jitter_ratio: f64) -> Self {
        Self {
            steps,
            max_attempts: max_attempts.max(1),
            jitter_ratio: jitter_ratio.clamp(0.0, 1.0),
        }
    }

    #[must_use]
    pub fn webhook() -> Self {
        Self::new(
            WEBHOOK_BACKOFF_MS.iter().map(|ms| Duration::from_millis(*ms)).collect(),
            DEFAULT_WEBHOOK_MAX_ATTEMPTS,
            DEFAULT_JITTER_RATIO,
        )
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Base delay before the next attempt, given how many attempts have
    /// already failed. `None` means the ladder is exhausted and the item
    /// should dead-letter. A ladder shorter than `max_attempts` repeats its
    /// final rung.
    #[must_use]
    pub fn base_delay(&self, attempts_so_far: u32) -> Option<Duration> {
        if attempts_so_far == 0 || attempts_so_far >= self.max_attempts {
            return None;
        }
        let index = (attempts_so_far as usize - 1).min(self.steps.len().saturating_sub(1));
        self.steps.get(index).copied()
    }

    /// Same as [`Self::base_delay`] with ± jitter applied, so that a burst
    /// of failures does not reschedule into a thundering herd.
    #[must_use]
    pub fn delay(&self, attempts_so_far: u32, rng: &mut impl Rng) -> Option<Duration> {
        self.base_delay(attempts_so_far)
            .map(|base| jittered(base, self.jitter_ratio, rng))
    }

    #[must_use]
    pub fn next_attempt_at(
        &self,
        attempts_so_far: u32,
        now: DateTime<Utc>,
        rng: &mut impl Rng,
    ) -> Option<DateTime<Utc>> {
        self.delay(attempts_so_far, rng).map(|delay| {
            now + chrono::Duration::milliseconds(delay.as_millis().min(i64::MAX as u128) as i64)
        })
    }

    /// The closed interval a jittered delay may land in, used by tests and
    /// monitoring to validate stored `next_attempt_at` values.
    #[must_use]
    pub fn delay_bounds(&self, attempts_so_far: u32) -> Option<(Duration, Duration)> {
        self.base_delay(attempts_so_far).map(|base| {
            let spread = base.mul_f64(self.jitter_ratio);
            (base.saturating_sub(spread), base + spread)
        })
    }
}

/// Spreads the delay by up to ±ratio. Built from the same `spread` value
/// as [`BackoffLadder::delay_bounds`], so a jittered delay always lands
/// inside the documented interval.
#[must_use]
pub fn jittered(base: Duration, ratio: f64, rng: &mut impl Rng) -> Duration {
    if ratio <= f64::EPSILON {
        return base;
    }
    let spread = base.mul_f64(ratio);
    let fraction: f64 = rng.random_range(-1.0..=1.0);
    if fraction >= 0.0 {
        base + spread.mul_f64(fraction)
    } else {
        base.saturating_sub(spread.mul_f64(-fraction))
    }
}

/// Cooperative cancellation for a retry run. Engines check the budget at
/// loop boundaries; an expired budget stops the batch without interrupting
/// the in-flight item.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunBudget {
    deadline: Option<DateTime<Utc>>,
}

impl RunBudget {
    #[must_use]
    pub fn unbounded() -> Self {
        Self { deadline: None }
    }

    #[must_use]
    pub fn until(deadline: DateTime<Utc>) -> Self {
        Self {
            deadline: Some(deadline),
        }
    }

    #[must_use]
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn webhook_ladder_follows_documented_steps() {
        let ladder = BackoffLadder::webhook();
        assert_eq!(ladder.base_delay(1), Some(Duration::from_millis(60_000)));
        assert_eq!(ladder.base_delay(2), Some(Duration::from_millis(300_000)));
        assert_eq!(ladder.base_delay(3), Some(Duration::from_millis(1_800_000)));
        assert_eq!(ladder.base_delay(4), Some(Duration::from_millis(7_200_000)));
        assert_eq!(ladder.base_delay(5), None, "fifth failure dead-letters");
    }

    #[test]
    fn jittered_delay_stays_within_ten_percent() {
        let ladder = BackoffLadder::webhook();
        let mut rng = rand::rng();
        for attempts in 1..=4 {
            let (lower, upper) = ladder.delay_bounds(attempts).expect("bounds");
            for _ in 0..64 {
                let delay = ladder.delay(attempts, &mut rng).expect("delay");
                assert!(delay >= lower, "{delay:?} below {lower:?}");
                assert!(delay <= upper, "{delay:?} above {upper:?}");
            }
        }
    }

    #[test]
    fn short_ladder_repeats_final_rung() {
        let ladder = BackoffLadder::new(vec![Duration::from_secs(10)], 4, 0.0);
        assert_eq!(ladder.base_delay(1), Some(Duration::from_secs(10)));
        assert_eq!(ladder.base_delay(3), Some(Duration::from_secs(10)));
        assert_eq!(ladder.base_delay(4), None);
    }

    #[test]
    fn zero_attempts_never_schedules() {
        let ladder = BackoffLadder::webhook();
        assert_eq!(ladder.base_delay(0), None);
    }

    #[test]
    fn next_attempt_at_is_in_the_future() {
        let ladder = BackoffLadder::webhook();
        let now = Utc::now();
        let mut rng = rand::rng();
        let at = ladder.next_attempt_at(1, now, &mut rng).expect("scheduled");
        assert!(at > now);
    }

    #[test]
    fn run_budget_expiry() {
        let now = Utc::now();
        assert!(!RunBudget::unbounded().expired(now));
        assert!(RunBudget::until(now).expired(now));
        assert!(!RunBudget::until(now + chrono::Duration::seconds(1)).expired(now));
    }
}
