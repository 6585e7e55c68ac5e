//! Relative expiry parsing. Accepts unit sequences with or without spaces,
//! including fractional amounts: `"1h 30m"`, `"1h30m"`, `"1.5h"`, `"300ms"`.

use chrono::{DateTime, Duration, Utc};
use segments_core::{SegmentError, SegmentResult};

/// Parse a relative duration. Blank input means "no expiry".
pub fn parse_relative(raw: &str) -> SegmentResult<Option<Duration>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let parsed = humantime::parse_duration(trimmed)
        .map_err(|e| SegmentError::Validation(format!("invalid expiry '{raw}': {e}")))?;
    Duration::from_std(parsed)
        .map(Some)
        .map_err(|_| SegmentError::Validation(format!("expiry '{raw}' is too large")))
}

/// Absolute expiry instant for a relative duration measured from `now`.
pub fn expiry_from(now: DateTime<Utc>, raw: Option<&str>) -> SegmentResult<Option<DateTime<Utc>>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    match parse_relative(raw)? {
        None => Ok(None),
        Some(duration) => now
            .checked_add_signed(duration)
            .map(Some)
            .ok_or_else(|| SegmentError::Validation(format!("expiry '{raw}' is too large"))),
    }
}
