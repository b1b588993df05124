//! Pure retry decision function (spec §4.7). No side effects, no channels —
//! callers (the [`crate::worker`] dispatch logic) act on the returned
//! [`RetryDecision`].

use std::time::Duration;

use crate::config::RetryConfig;

const BASE_MINUTES: u64 = 1;

/// Next action for a story after a failed fetcher attempt, given its
/// post-increment `attempts` count.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Requeue after `delay`; ordinary retry, silent (no notification).
    RequeueAfter(Duration),
    /// All normal retries exhausted; emit a "penultimate failure"
    /// notification and schedule one more attempt after `delay`, promoted to
    /// `force` (subject to the update-mode override in spec §4.8).
    FinalAttemptAfter(Duration),
    /// No further attempts; emit a "give up" notification.
    GiveUp,
}

/// Decide the next action for a story whose `attempts` counter has already
/// been incremented for this failure (spec §4.7).
pub fn decide(attempts: u32, policy: &RetryConfig) -> RetryDecision {
    if attempts < policy.max_normal_retries {
        let minutes = attempts as u64 * BASE_MINUTES;
        RetryDecision::RequeueAfter(Duration::from_secs(minutes * 60))
    } else if attempts == policy.max_normal_retries && policy.final_attempt_enabled {
        let seconds = (policy.final_attempt_wait_hours * 3600.0).round() as u64;
        RetryDecision::FinalAttemptAfter(Duration::from_secs(seconds))
    } else {
        RetryDecision::GiveUp
    }
}
