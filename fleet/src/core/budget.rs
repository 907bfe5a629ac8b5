//! Bounded budgets for orchestration: review-request creation and retry backoff.

use std::time::Duration;

/// Per-run allowance for opening review requests.
///
/// Pushing is never budgeted; only request creation is. Once exhausted,
/// callers defer request creation to a later run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewBudget {
    limit: u32,
    used: u32,
}

impl ReviewBudget {
    pub fn new(limit: u32) -> Self {
        Self { limit, used: 0 }
    }

    /// Consume one unit. Returns `false` (and consumes nothing) when exhausted.
    pub fn try_take(&mut self) -> bool {
        if self.used >= self.limit {
            return false;
        }
        self.used += 1;
        true
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.used)
    }
}

/// Exponential retry backoff: `base * 2^retry_count`, capped at `max`.
pub fn backoff_delay(base: Duration, max: Duration, retry_count: u32) -> Duration {
    let factor = 1u32.checked_shl(retry_count).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}

/// Whether another restart is allowed under the retry ceiling.
pub fn can_retry(retry_count: u32, ceiling: u32) -> bool {
    retry_count < ceiling
}
