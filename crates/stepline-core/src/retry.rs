// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Retry policies consulted after a stage reports a retryable failure.
//!
//! A policy only looks at the attempt number, never at the failure itself.
//! Attempt numbers are 1-based and name the attempt that just failed, so
//! `decide(1)` answers "the first try failed, should there be a second?".

use std::time::Duration;

use rand::Rng;

/// Attempt bound used by [`RetryPolicy::exponential`].
pub const DEFAULT_MAX_ATTEMPTS: u32 = 30;

/// Outcome of consulting a [`RetryPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait this long, then run the action again.
    Retry(Duration),
    /// Treat the failure as final.
    GiveUp,
}

/// How a stage is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryPolicy {
    /// Fail on the first retryable error.
    #[default]
    None,

    /// Retry up to `max_retries` times, waiting `interval` each time.
    /// A stage that always fails is attempted `max_retries + 1` times.
    FixedDelay {
        /// Number of retries after the first attempt.
        max_retries: u32,
        /// Wait between attempts.
        interval: Duration,
    },

    /// Double the wait after each attempt, capped at `max_interval`, and
    /// give up once the total wait would exceed `max_elapsed` or after
    /// `max_attempts` attempts, whichever comes first.
    ExponentialBackoff {
        /// Wait before the second attempt.
        initial: Duration,
        /// Upper bound on a single wait.
        max_interval: Duration,
        /// Upper bound on the sum of all waits.
        max_elapsed: Duration,
        /// Total attempts, including the first.
        max_attempts: u32,
    },

    /// Wait a random time in `[0, base * min(attempt, max_multiplier))`,
    /// for at most `max_attempts` attempts in total. Spreads out instances
    /// contending for the same resource.
    RandomBackoff {
        /// Wait increment per attempt.
        base: Duration,
        /// Total attempts, including the first.
        max_attempts: u32,
        /// Cap on the attempt multiplier.
        max_multiplier: u32,
    },
}

impl RetryPolicy {
    /// Fixed delay convenience constructor.
    pub fn fixed(max_retries: u32, interval: Duration) -> Self {
        Self::FixedDelay {
            max_retries,
            interval,
        }
    }

    /// Exponential backoff convenience constructor, allowing up to
    /// [`DEFAULT_MAX_ATTEMPTS`] attempts.
    pub fn exponential(initial: Duration, max_interval: Duration, max_elapsed: Duration) -> Self {
        Self::exponential_with_attempts(initial, max_interval, max_elapsed, DEFAULT_MAX_ATTEMPTS)
    }

    /// Exponential backoff with an explicit attempt bound.
    pub fn exponential_with_attempts(
        initial: Duration,
        max_interval: Duration,
        max_elapsed: Duration,
        max_attempts: u32,
    ) -> Self {
        Self::ExponentialBackoff {
            initial,
            max_interval,
            max_elapsed,
            max_attempts,
        }
    }

    /// Random backoff convenience constructor.
    pub fn random(base: Duration, max_attempts: u32, max_multiplier: u32) -> Self {
        Self::RandomBackoff {
            base,
            max_attempts,
            max_multiplier,
        }
    }

    /// Decide what to do after `attempt` failed.
    pub fn decide(&self, attempt: u32) -> RetryDecision {
        self.decide_with_rng(attempt, &mut rand::thread_rng())
    }

    /// As [`decide`](Self::decide), drawing random delays from `rng`.
    pub fn decide_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> RetryDecision {
        let attempt = attempt.max(1);
        match *self {
            Self::None => RetryDecision::GiveUp,

            Self::FixedDelay {
                max_retries,
                interval,
            } => {
                if attempt <= max_retries {
                    RetryDecision::Retry(interval)
                } else {
                    RetryDecision::GiveUp
                }
            }

            Self::ExponentialBackoff {
                initial,
                max_interval,
                max_elapsed,
                max_attempts,
            } => {
                if attempt >= max_attempts {
                    return RetryDecision::GiveUp;
                }
                let elapsed = backoff_elapsed(initial, max_interval, attempt - 1);
                let next = backoff_delay(initial, max_interval, attempt);
                if elapsed.saturating_add(next) > max_elapsed {
                    RetryDecision::GiveUp
                } else {
                    RetryDecision::Retry(next)
                }
            }

            Self::RandomBackoff {
                base,
                max_attempts,
                max_multiplier,
            } => {
                if attempt >= max_attempts {
                    return RetryDecision::GiveUp;
                }
                let multiplier = attempt.min(max_multiplier.max(1));
                let ceiling_ms = (base.as_millis() as u64).saturating_mul(multiplier as u64);
                let delay_ms = if ceiling_ms == 0 {
                    0
                } else {
                    rng.gen_range(0..ceiling_ms)
                };
                RetryDecision::Retry(Duration::from_millis(delay_ms))
            }
        }
    }
}

fn backoff_delay(initial: Duration, max_interval: Duration, attempt: u32) -> Duration {
    let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
    initial.saturating_mul(multiplier).min(max_interval)
}

/// Sum of the first `retries` backoff delays.
///
/// Only the doubling phase is walked; once a delay reaches `max_interval`
/// the rest are added in one step.
fn backoff_elapsed(initial: Duration, max_interval: Duration, retries: u32) -> Duration {
    let mut elapsed = Duration::ZERO;
    let mut delay = initial.min(max_interval);
    let mut n = 0;
    while n < retries && delay < max_interval {
        if delay.is_zero() {
            return Duration::ZERO;
        }
        elapsed = elapsed.saturating_add(delay);
        delay = delay.saturating_mul(2).min(max_interval);
        n += 1;
    }
    elapsed.saturating_add(delay.saturating_mul(retries - n))
}
