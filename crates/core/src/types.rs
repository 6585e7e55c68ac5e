use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{SegmentError, SegmentResult};

/// Users are identified by a positive integer.
pub type UserId = i64;

/// Maximum segment name length, matching the `VARCHAR(255)` of the schema.
pub const MAX_SEGMENT_NAME_LEN: usize = 255;

/// Kind of membership mutation recorded in the operation log.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Add,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Add => "add",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = SegmentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "add" => Ok(Operation::Add),
            "delete" => Ok(Operation::Delete),
            other => Err(SegmentError::Validation(format!(
                "unknown operation '{other}'"
            ))),
        }
    }
}

/// One requested addition: a segment name plus an optional relative expiry
/// such as `"1h"`, `"1h30m"`, `"1.5h"`, `"300ms"` or `"7days"`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddSegment {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire: Option<String>,
}

impl AddSegment {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            expire: None,
        }
    }

    pub fn expiring(name: impl Into<String>, expire: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            expire: Some(expire.into()),
        }
    }
}

/// A segment as listed to callers. `auto_percentage` is set for segments
/// produced by random cohort assignment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SegmentInfo {
    pub name: String,
    pub auto_percentage: Option<f64>,
}

/// A stored (user, segment) relationship. An expiry in the past means the
/// membership is logically dead until the sweeper removes the row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Membership {
    pub user_id: UserId,
    pub segment_name: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Membership {
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |expiry| expiry >= now)
    }
}

/// Immutable audit record of one membership mutation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEntry {
    pub sequence: i64,
    pub user_id: UserId,
    pub segment_name: String,
    pub operation: Operation,
    pub operation_time: DateTime<Utc>,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}, {}, {})",
            self.user_id,
            self.segment_name,
            self.operation,
            self.operation_time.to_rfc3339_opts(SecondsFormat::Secs, true)
        )
    }
}

/// A calendar month in UTC, parsed from `YYYY-MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct YearMonth {
    first_day: NaiveDate,
}

impl YearMonth {
    pub fn new(year: i32, month: u32) -> SegmentResult<Self> {
        NaiveDate::from_ymd_opt(year, month, 1)
            .map(|first_day| Self { first_day })
            .ok_or_else(|| SegmentError::Validation(format!("invalid month {year}-{month}")))
    }

    /// First instant of the month.
    pub fn start(&self) -> DateTime<Utc> {
        Utc.from_utc_datetime(&self.first_day.and_hms_opt(0, 0, 0).unwrap_or_default())
    }

    /// First instant of the following month (exclusive upper bound).
    pub fn end(&self) -> DateTime<Utc> {
        let (year, month) = if self.first_day.month() == 12 {
            (self.first_day.year() + 1, 1)
        } else {
            (self.first_day.year(), self.first_day.month() + 1)
        };
        let next = NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(self.first_day);
        Utc.from_utc_datetime(&next.and_hms_opt(0, 0, 0).unwrap_or_default())
    }
}

impl FromStr for YearMonth {
    type Err = SegmentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SegmentError::Validation(format!("month must be YYYY-MM, got '{s}'"));
        let (year, month) = s.split_once('-').ok_or_else(invalid)?;
        if year.len() != 4 || month.len() != 2 {
            return Err(invalid());
        }
        let year: i32 = year.parse().map_err(|_| invalid())?;
        let month: u32 = month.parse().map_err(|_| invalid())?;
        Self::new(year, month).map_err(|_| invalid())
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.first_day.format("%Y-%m"))
    }
}

pub fn validate_user_id(user_id: UserId) -> SegmentResult<()> {
    if user_id <= 0 {
        return Err(SegmentError::Validation(format!(
            "user id must be a positive integer, got {user_id}"
        )));
    }
    Ok(())
}

pub fn validate_segment_name(name: &str) -> SegmentResult<()> {
    if name.is_empty() {
        return Err(SegmentError::Validation(
            "segment name must not be empty".to_string(),
        ));
    }
    if name.chars().count() > MAX_SEGMENT_NAME_LEN {
        return Err(SegmentError::Validation(format!(
            "segment name exceeds {MAX_SEGMENT_NAME_LEN} characters"
        )));
    }
    Ok(())
}

pub fn validate_percentage(percentage: f64) -> SegmentResult<()> {
    if !percentage.is_finite() || !(0.0..=100.0).contains(&percentage) {
        return Err(SegmentError::Validation(format!(
            "percentage must be within 0..=100, got {percentage}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_year_month_bounds() {
        let month: YearMonth = "2023-12".parse().unwrap();
        assert_eq!(month.start(), Utc.with_ymd_and_hms(2023, 12, 1, 0, 0, 0).unwrap());
        assert_eq!(month.end(), Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(month.to_string(), "2023-12");
    }

    #[test]
    fn test_year_month_rejects_garbage() {
        for input in ["2023", "2023-13", "23-01", "2023-1", "abcd-ef", ""] {
            let err = input.parse::<YearMonth>().unwrap_err();
            assert!(matches!(err, SegmentError::Validation(_)), "{input}");
        }
    }

    #[test]
    fn test_log_entry_format() {
        let entry = LogEntry {
            sequence: 1,
            user_id: 42,
            segment_name: "AVITO_VOICE_MESSAGES".to_string(),
            operation: Operation::Add,
            operation_time: Utc.with_ymd_and_hms(2023, 8, 31, 12, 0, 5).unwrap(),
        };
        assert_eq!(
            entry.to_string(),
            "(42, AVITO_VOICE_MESSAGES, add, 2023-08-31T12:00:05Z)"
        );
    }

    #[test]
    fn test_validation_helpers() {
        assert!(validate_user_id(1).is_ok());
        assert!(validate_user_id(0).is_err());
        assert!(validate_segment_name("seg!@ment").is_ok());
        assert!(validate_segment_name("").is_err());
        assert!(validate_segment_name(&"x".repeat(256)).is_err());
        assert!(validate_percentage(0.0).is_ok());
        assert!(validate_percentage(100.0).is_ok());
        assert!(validate_percentage(100.5).is_err());
        assert!(validate_percentage(f64::NAN).is_err());
    }

    #[test]
    fn test_operation_round_trip_through_str() {
        assert_eq!("add".parse::<Operation>().unwrap(), Operation::Add);
        assert_eq!(Operation::Delete.as_str(), "delete");
        assert!("upsert".parse::<Operation>().is_err());
    }
}
