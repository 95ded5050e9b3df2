use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Delay between agent attempts within one phase execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base_ms: u64,
    pub max_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self { base_ms: 250, max_ms: 10_000 }
    }
}

/// Attempt 1 runs immediately; attempt n waits base * 2^(n-2), capped at max.
pub fn backoff_delay(policy: &BackoffPolicy, attempt_number: u32) -> Duration {
    let ms = match attempt_number {
        0 | 1 => 0,
        n => {
            let shift = (n - 2).min(32);
            policy.base_ms.saturating_mul(1u64 << shift).min(policy.max_ms)
        }
    };
    Duration::from_millis(ms)
}
