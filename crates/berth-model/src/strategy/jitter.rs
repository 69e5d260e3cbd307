use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, ModelResult};

/// How randomness is folded into a retry delay.
///
/// Spreading retries keeps a fleet of agents from hitting a freshly
/// elected controller at the same instant.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JitterStrategy {
    /// Use the base delay as is.
    #[default]
    None,
    /// Uniform in `[0, base]`.
    Full,
    /// Uniform in `[base / 2, base]`.
    Equal,
}

impl JitterStrategy {
    /// Applies the strategy to `base` given a uniform sample in `[0, 1)`.
    pub fn apply(&self, base: Duration, sample: f64) -> Duration {
        let sample = sample.clamp(0.0, 1.0);
        match self {
            JitterStrategy::None => base,
            JitterStrategy::Full => base.mul_f64(sample),
            JitterStrategy::Equal => {
                let half = base / 2;
                half + half.mul_f64(sample)
            }
        }
    }
}

impl FromStr for JitterStrategy {
    type Err = ModelError;
    fn from_str(s: &str) -> ModelResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(JitterStrategy::None),
            "full" => Ok(JitterStrategy::Full),
            "equal" => Ok(JitterStrategy::Equal),
            other => Err(ModelError::UnknownJitter(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_bounds() {
        let base = Duration::from_secs(8);
        assert_eq!(JitterStrategy::None.apply(base, 0.3), base);
        assert_eq!(JitterStrategy::Full.apply(base, 0.0), Duration::ZERO);
        assert_eq!(JitterStrategy::Full.apply(base, 0.5), Duration::from_secs(4));
        assert_eq!(JitterStrategy::Equal.apply(base, 0.0), Duration::from_secs(4));
        assert_eq!(JitterStrategy::Equal.apply(base, 1.0), base);
    }

    #[test]
    fn parses_names() {
        assert_eq!("FULL".parse::<JitterStrategy>().unwrap(), JitterStrategy::Full);
        assert_eq!("".parse::<JitterStrategy>().unwrap(), JitterStrategy::None);
        assert!("decorrelated".parse::<JitterStrategy>().is_err());
    }
}
