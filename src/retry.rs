//! Retry policy keyed on [`ErrorClass`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::chain::ErrorClass;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first failed attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay_ms: u64,
    /// Each subsequent delay is multiplied by this.
    pub backoff_multiplier: f64,
    /// Extra factor applied on top of the backoff when the provider throttles us.
    pub throttle_multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            throttle_multiplier: 3.0,
            max_delay_ms: 30_000,
        }
    }
}

/// What must be re-fetched before the next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refresh {
    None,
    FeeQuote,
    Sequence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration, refresh: Refresh },
    GiveUp,
}

impl RetryPolicy {
    /// Decides how to continue after failed attempt number `attempt` (1-based).
    ///
    /// `stale_retried` tells whether a stale-sequence retry was already spent on this operation.
    pub fn decide(&self, attempt: u32, class: ErrorClass, stale_retried: bool) -> RetryDecision {
        if class.is_terminal() || attempt > self.max_retries {
            return RetryDecision::GiveUp;
        }
        let backoff = self.backoff(attempt);
        match class {
            ErrorClass::StaleSequence if stale_retried => RetryDecision::GiveUp,
            ErrorClass::StaleSequence => RetryDecision::Retry {
                delay: backoff,
                refresh: Refresh::Sequence,
            },
            ErrorClass::Throttle => RetryDecision::Retry {
                delay: self.cap(backoff.mul_f64(self.throttle_multiplier.max(1.0))),
                refresh: Refresh::None,
            },
            ErrorClass::Underpriced => RetryDecision::Retry {
                delay: backoff,
                refresh: Refresh::FeeQuote,
            },
            _ => RetryDecision::Retry {
                delay: backoff,
                refresh: Refresh::None,
            },
        }
    }

    /// `base × multiplier^(attempt − 1)`, capped at `max_delay_ms`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let millis = self.base_delay_ms as f64 * self.backoff_multiplier.max(1.0).powi(exponent);
        self.cap(Duration::from_millis(millis.min(u64::MAX as f64) as u64))
    }

    fn cap(&self, delay: Duration) -> Duration {
        delay.min(Duration::from_millis(self.max_delay_ms))
    }
}
