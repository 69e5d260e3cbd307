use std::io::IsTerminal;

use serde::{Deserialize, Serialize};

use super::{LoggerFormat, LoggerLevel};

/// Logger section of the daemon configuration. Every field has a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoggerConfig {
    pub format: LoggerFormat,
    /// `EnvFilter` expression such as `info` or `berth_core=debug,info`.
    pub level: LoggerLevel,
    /// Include the event's target (module path) in text and json output.
    pub with_targets: bool,
    /// Colour text output. Only honoured when stdout is a terminal.
    pub use_color: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            format: LoggerFormat::default(),
            level: LoggerLevel::default(),
            with_targets: true,
            use_color: true,
        }
    }
}

impl LoggerConfig {
    /// Whether ANSI colours should be written right now.
    pub fn should_use_color(&self) -> bool {
        self.format == LoggerFormat::Text && self.use_color && std::io::stdout().is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_takes_every_default() {
        let config: LoggerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, LoggerConfig::default());
        assert_eq!(config.format, LoggerFormat::Text);
        assert_eq!(config.level.as_str(), "info");
        assert!(config.with_targets);
        assert!(config.use_color);
    }

    #[test]
    fn partial_object_keeps_the_rest() {
        let config: LoggerConfig =
            serde_json::from_str(r#"{"format": "json", "level": "berth_core=debug,warn", "withTargets": false}"#)
                .unwrap();
        assert_eq!(config.format, LoggerFormat::Json);
        assert_eq!(config.level.as_str(), "berth_core=debug,warn");
        assert!(!config.with_targets);
        assert!(config.use_color);
    }

    #[test]
    fn json_never_uses_color() {
        let config = LoggerConfig {
            format: LoggerFormat::Json,
            ..LoggerConfig::default()
        };
        assert!(!config.should_use_color());
    }

    #[test]
    fn bad_level_is_rejected_at_parse_time() {
        let parsed = serde_json::from_str::<LoggerConfig>(r#"{"level": "berth_core=loud"}"#);
        assert!(parsed.is_err());
    }
}
