use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::DurationMs;
use crate::strategy::JitterStrategy;

/// Exponential retry curve bounded by `[first, max]`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffStrategy {
    #[serde(default)]
    pub jitter: JitterStrategy,
    pub first_ms: DurationMs,
    pub max_ms: DurationMs,
    pub factor: f64,
}

impl BackoffStrategy {
    pub fn first(&self) -> Duration {
        Duration::from_millis(self.first_ms)
    }

    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms.max(self.first_ms))
    }

    /// Interval that follows `current`, clamped to `[first, max]`.
    pub fn next(&self, current: Duration) -> Duration {
        let factor = if self.factor.is_finite() && self.factor >= 1.0 {
            self.factor
        } else {
            1.0
        };
        let grown = current.as_secs_f64() * factor;
        let capped = grown.min(self.max().as_secs_f64());
        Duration::from_secs_f64(capped).max(self.first())
    }
}
