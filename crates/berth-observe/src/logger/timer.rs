use std::fmt;

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;

/// RFC 3339 timestamps in UTC.
#[derive(Debug, Clone, Copy, Default)]
pub struct UtcRfc3339;

impl FormatTime for UtcRfc3339 {
    fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result {
        match OffsetDateTime::now_utc().format(&Rfc3339) {
            Ok(ts) => write!(w, "{ts}"),
            Err(_) => write!(w, "<invalid-time>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_a_utc_timestamp() {
        let mut out = String::new();
        UtcRfc3339.format_time(&mut Writer::new(&mut out)).unwrap();
        assert!(out.ends_with('Z'), "{out}");
        assert!(OffsetDateTime::parse(&out, &Rfc3339).is_ok());
    }
}
