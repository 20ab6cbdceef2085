//! Retry delays for failed jobs and for queue/store operations.

use rand::{Rng, thread_rng};
use std::time::Duration;

use crate::config::RetryPolicyConfig;

/// Delay before a failed job becomes visible again.
///
/// `base * 2^failures`, capped at `max`, plus up to `jitter_factor` of the
/// capped value.
pub fn failure_backoff(policy: &RetryPolicyConfig, failures: i32) -> Duration {
    let base_seconds = policy.base_seconds as f64;
    let max_seconds = policy.max_seconds as f64;
    let exponent = failures.clamp(0, 30);

    let backoff = (base_seconds * 2_f64.powi(exponent)).min(max_seconds);

    let jitter_range = policy.jitter_factor * backoff;
    let jitter = if jitter_range > 0.0 {
        thread_rng().gen_range(0.0..jitter_range)
    } else {
        0.0
    };

    Duration::from_secs_f64(backoff + jitter)
}

/// Delay before retrying a queue or store call that hit an unavailable backend.
pub fn operation_backoff(base: Duration, retry: u32) -> Duration {
    let factor = 2_u32.saturating_pow(retry.min(16));
    let delay = base.saturating_mul(factor);
    let jitter_ms = delay.as_millis() as u64 / 10;
    let jitter = if jitter_ms > 0 {
        thread_rng().gen_range(0..jitter_ms)
    } else {
        0
    };
    delay + Duration::from_millis(jitter)
}
