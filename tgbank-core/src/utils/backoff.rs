//! Retry delay schedules.

use std::time::Duration;

/// Linear schedule: `attempt * base`, where `attempt` starts at 1.
pub fn linear_delay(attempt: u32, base: Duration) -> Duration {
    base.saturating_mul(attempt.max(1))
}

/// Exponential schedule: `initial * 2^attempt`, capped at `max`.
///
/// `attempt` starts at 0, so the first delay is `initial`.
pub fn exponential_delay(attempt: u32, initial: Duration, max: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(31));
    initial.saturating_mul(factor).min(max)
}

/// Add up to `ratio` of random jitter on top of `delay`.
pub fn with_jitter(delay: Duration, ratio: f64) -> Duration {
    if delay.is_zero() || ratio <= 0.0 {
        return delay;
    }
    let spread = delay.as_secs_f64() * ratio;
    delay + Duration::from_secs_f64(rand::random::<f64>() * spread)
}
