use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::LoggerError;

/// Where and how log lines are written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LoggerFormat {
    /// Human-readable lines on stdout.
    #[default]
    Text,
    /// One JSON object per line on stdout.
    Json,
    /// systemd-journald, Linux only.
    Journald,
}

impl FromStr for LoggerFormat {
    type Err = LoggerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            "journald" | "journal" if cfg!(target_os = "linux") => Ok(Self::Journald),
            "journald" | "journal" => Err(LoggerError::JournaldNotSupported),
            _ => Err(LoggerError::InvalidFormat(s.to_string())),
        }
    }
}

impl TryFrom<String> for LoggerFormat {
    type Error = LoggerError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<LoggerFormat> for String {
    fn from(f: LoggerFormat) -> Self {
        f.to_string()
    }
}

impl fmt::Display for LoggerFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LoggerFormat::Text => "text",
            LoggerFormat::Json => "json",
            LoggerFormat::Journald => "journald",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parsing_ignores_case_and_whitespace() {
        assert_eq!(" TEXT ".parse::<LoggerFormat>().unwrap(), LoggerFormat::Text);
        assert_eq!("Json".parse::<LoggerFormat>().unwrap(), LoggerFormat::Json);
    }

    #[test]
    fn unknown_formats_are_rejected() {
        for input in ["", "xml", "logfmt", "text-json"] {
            assert!(
                matches!(input.parse::<LoggerFormat>(), Err(LoggerError::InvalidFormat(_))),
                "{input:?} should not parse"
            );
        }
    }

    #[test]
    fn journald_depends_on_platform() {
        let parsed = serde_json::from_str::<LoggerFormat>(r#""journald""#);
        if cfg!(target_os = "linux") {
            assert_eq!(parsed.unwrap(), LoggerFormat::Journald);
        } else {
            assert!(parsed.is_err());
        }
    }

    #[test]
    fn serialises_to_canonical_name() {
        assert_eq!(serde_json::to_string(&LoggerFormat::Json).unwrap(), r#""json""#);
    }
}
