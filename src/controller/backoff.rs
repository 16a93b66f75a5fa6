//! Per-Service retry backoff
//!
//! The controller runtime only knows "requeue after". This tracks how often a
//! Service key failed in a row so the error policy can grow the delay and
//! give up once the retry budget is spent.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Default per-key backoff base
const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);

/// Default per-key backoff cap
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Per-key exponential backoff: `base * 2^failures`, capped at `max`
#[derive(Debug)]
pub struct RetryBackoff {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<String, u32>>,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

impl RetryBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Delay before `key` may be retried; records one more failure
    pub fn next_delay(&self, key: &str) -> Duration {
        let mut failures = lock(&self.failures);
        let attempt = failures.entry(key.to_string()).or_insert(0);
        let delay = calculate_backoff(*attempt, self.base, self.max);
        *attempt = attempt.saturating_add(1);
        delay
    }

    /// Consecutive failures recorded for `key`
    pub fn retries(&self, key: &str) -> u32 {
        lock(&self.failures).get(key).copied().unwrap_or(0)
    }

    pub fn forget(&self, key: &str) {
        lock(&self.failures).remove(key);
    }
}

/// Exponential: base * 2^attempt, capped at max
pub fn calculate_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2_u32.checked_pow(attempt).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
