//! Retry strategy catalog (§6).
//!
//! Grounded on the teacher's `RetryConfig::delay_for_attempt`
//! (`agent/runtime/impls/retry.rs`) and the `EffortlessMetrics` host retry
//! layer's `compute_delay` (jittered exponential backoff): pure functions of
//! a 1-based attempt number returning a [`Duration`], stored behind `Arc<dyn
//! Fn>` so callers can also supply an arbitrary closure.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

/// A retry delay function: `attempt` is 1-based (the first retry is
/// attempt 1), per §4.2 step 4 (`retryDelay(attempt)`).
pub type RetryDelayFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Constant delay regardless of attempt number.
pub fn fixed(delay: Duration) -> RetryDelayFn {
    Arc::new(move |_attempt| delay)
}

/// `min(base * 2^(attempt-1), max)`.
pub fn exponential(base: Duration, max: Option<Duration>) -> RetryDelayFn {
    Arc::new(move |attempt| {
        let exp = attempt.saturating_sub(1).min(32);
        let scaled = base.saturating_mul(1u32.checked_shl(exp).unwrap_or(u32::MAX));
        match max {
            Some(m) => scaled.min(m),
            None => scaled,
        }
    })
}

/// `min(base + inc*(attempt-1), max)`.
pub fn linear(base: Duration, inc: Duration, max: Option<Duration>) -> RetryDelayFn {
    Arc::new(move |attempt| {
        let steps = attempt.saturating_sub(1);
        let scaled = base + inc.saturating_mul(steps);
        match max {
            Some(m) => scaled.min(m),
            None => scaled,
        }
    })
}

/// `base*2^(attempt-1) + base*2^(attempt-1)*factor*rand()`.
pub fn jitter(base: Duration, factor: f64) -> RetryDelayFn {
    Arc::new(move |attempt| {
        let exp = attempt.saturating_sub(1).min(32);
        let nominal = base.saturating_mul(1u32.checked_shl(exp).unwrap_or(u32::MAX));
        let rand_component: f64 = rand::thread_rng().gen_range(0.0..1.0);
        let jitter_ms = nominal.as_secs_f64() * factor * rand_component * 1000.0;
        nominal + Duration::from_millis(jitter_ms.round() as u64)
    })
}
