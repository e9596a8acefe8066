//! Retry policy for email delivery.
//!
//! Delay for attempt `n` (1-based) is `min(2^n s, 10 min)` plus up to 500 ms
//! of jitter. After `MAX_ATTEMPTS` total attempts the item is abandoned.

use std::time::Duration;

use rand::RngExt;

/// Total delivery attempts per item, including the first.
pub const MAX_ATTEMPTS: u32 = 5;

/// Upper bound on the exponential part of the delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(10 * 60);

/// Jitter is drawn uniformly from `[0, MAX_JITTER_MS)`.
pub const MAX_JITTER_MS: u64 = 500;

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { next_attempt: u32, delay: Duration },
    Abandon { attempts: u32 },
}

/// Un-jittered delay before attempt `attempt`.
pub fn base_delay(attempt: u32) -> Duration {
    // Checked shift so large attempts saturate instead of overflowing.
    let secs = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    Duration::from_secs(secs).min(MAX_BACKOFF)
}

pub fn backoff_delay(attempt: u32) -> Duration {
    let jitter_ms = rand::rng().random_range(0..MAX_JITTER_MS);
    base_delay(attempt) + Duration::from_millis(jitter_ms)
}

/// Decide the follow-up for an item whose zero-based `failed_attempt` failed.
pub fn decide(failed_attempt: u32) -> RetryDecision {
    let next_attempt = failed_attempt + 1;
    if next_attempt >= MAX_ATTEMPTS {
        RetryDecision::Abandon {
            attempts: next_attempt,
        }
    } else {
        RetryDecision::Retry {
            next_attempt,
            delay: backoff_delay(next_attempt),
        }
    }
}
