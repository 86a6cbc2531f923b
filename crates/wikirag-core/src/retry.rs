//! Retry policy as an explicit state machine.
//!
//! A [`RetryState`] counts attempts and decides, after each failure, whether
//! to try again and how long to wait. The caller owns the loop and the
//! sleeping; this module owns the arithmetic.
//!
//! # Strategy
//!
//! - [`ErrorClass::Transient`] (timeout, rate limit, 5xx, network) → retry
//!   with exponential backoff until the attempt budget is spent.
//! - [`ErrorClass::Permanent`] (bad request, rejected content) → give up
//!   immediately.
//! - Backoff doubles from `base_delay` and is capped at `max_delay`:
//!   1s, 2s, 4s, 8s, 16s, 32s, 32s, … with the defaults.
//!
//! ```rust
//! use std::time::Duration;
//! use wikirag_core::retry::{ErrorClass, RetryDecision, RetryPolicy};
//!
//! let policy = RetryPolicy::new(2, Duration::from_secs(1), Duration::from_secs(32));
//! let mut state = policy.start();
//!
//! state.begin_attempt();
//! assert_eq!(
//!     state.on_failure(ErrorClass::Transient),
//!     RetryDecision::RetryAfter(Duration::from_secs(1))
//! );
//! state.begin_attempt();
//! assert_eq!(
//!     state.on_failure(ErrorClass::Transient),
//!     RetryDecision::RetryAfter(Duration::from_secs(2))
//! );
//! state.begin_attempt();
//! assert_eq!(
//!     state.on_failure(ErrorClass::Transient),
//!     RetryDecision::GiveUp { attempts: 3, exhausted: true }
//! );
//! ```

use std::time::Duration;

/// Whether a failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep for the given delay, then attempt again.
    RetryAfter(Duration),
    /// Stop. `exhausted` is `true` when the budget ran out, `false` for a
    /// permanent failure.
    GiveUp { attempts: u32, exhausted: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts = `max_retries + 1`.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(32),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    /// A policy that never waits; used by tests and dry runs.
    pub fn immediate(max_retries: u32) -> Self {
        Self::new(max_retries, Duration::ZERO, Duration::ZERO)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(16);
        self.base_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn start(&self) -> RetryState {
        RetryState {
            policy: *self,
            attempts: 0,
        }
    }
}

/// Attempt counter for one logical operation.
#[derive(Debug, Clone)]
pub struct RetryState {
    policy: RetryPolicy,
    attempts: u32,
}

impl RetryState {
    /// Record the start of an attempt; returns its 1-based number.
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Decide what follows a failed attempt.
    pub fn on_failure(&mut self, class: ErrorClass) -> RetryDecision {
        match class {
            ErrorClass::Permanent => RetryDecision::GiveUp {
                attempts: self.attempts,
                exhausted: false,
            },
            ErrorClass::Transient if self.attempts >= self.policy.max_attempts() => {
                RetryDecision::GiveUp {
                    attempts: self.attempts,
                    exhausted: true,
                }
            }
            ErrorClass::Transient => RetryDecision::RetryAfter(self.policy.delay_for(self.attempts)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let p = RetryPolicy::default();
        let delays: Vec<u64> = (1..=8).map(|n| p.delay_for(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 32, 32]);
    }

    #[test]
    fn huge_retry_numbers_do_not_overflow() {
        let p = RetryPolicy::new(100, Duration::from_secs(3600), Duration::from_secs(60));
        assert_eq!(p.delay_for(90), Duration::from_secs(60));
    }

    #[test]
    fn permanent_failure_stops_at_once() {
        let mut state = RetryPolicy::default().start();
        state.begin_attempt();
        assert_eq!(
            state.on_failure(ErrorClass::Permanent),
            RetryDecision::GiveUp {
                attempts: 1,
                exhausted: false
            }
        );
    }

    #[test]
    fn budget_counts_total_attempts() {
        let policy = RetryPolicy::immediate(3);
        let mut state = policy.start();
        let mut retries = 0;
        loop {
            state.begin_attempt();
            match state.on_failure(ErrorClass::Transient) {
                RetryDecision::RetryAfter(d) => {
                    assert_eq!(d, Duration::ZERO);
                    retries += 1;
                }
                RetryDecision::GiveUp {
                    attempts,
                    exhausted,
                } => {
                    assert!(exhausted);
                    assert_eq!(attempts, 4);
                    break;
                }
            }
        }
        assert_eq!(retries, 3);
    }

    #[test]
    fn zero_retries_means_single_attempt() {
        let mut state = RetryPolicy::immediate(0).start();
        state.begin_attempt();
        assert!(matches!(
            state.on_failure(ErrorClass::Transient),
            RetryDecision::GiveUp {
                attempts: 1,
                exhausted: true
            }
        ));
    }
}
