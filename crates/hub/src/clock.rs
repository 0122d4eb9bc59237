//! Wall-clock access and the textual timestamp form persisted in settings.
//!
//! Timestamps are stored as RFC 3339 strings in UTC so they sort and compare
//! lexically. Parsing never fails loudly: anything unreadable is "no signal".

use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, UtcOffset};

pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

/// The real clock, always UTC.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Format a timestamp as RFC 3339 in UTC.
///
/// Formatting only fails for years outside 0..=9999; those degrade to an
/// empty string, which `parse_ts` reads back as "unknown".
pub fn format_ts(ts: OffsetDateTime) -> String {
    ts.to_offset(UtcOffset::UTC)
        .format(&Rfc3339)
        .unwrap_or_default()
}

/// Parse a stored timestamp. Empty, blank or malformed input yields `None`.
pub fn parse_ts(raw: &str) -> Option<OffsetDateTime> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    OffsetDateTime::parse(raw, &Rfc3339).ok()
}
