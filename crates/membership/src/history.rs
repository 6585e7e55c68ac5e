//! Read side of the operation log.

use std::sync::Arc;

use rusqlite::params;
use segments_core::types::{LogEntry, Operation, UserId, YearMonth};
use segments_core::SegmentResult;

use crate::store::{from_millis, to_millis, StoreResultExt};
use crate::Store;

pub struct OperationHistory {
    store: Arc<Store>,
}

impl OperationHistory {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Log entries for `user_id` in append order, optionally restricted to
    /// one calendar month (UTC, start inclusive, end exclusive). Entries
    /// survive deletion of the user, so an unknown id yields an empty list.
    pub fn user_operations(
        &self,
        user_id: UserId,
        month: Option<YearMonth>,
    ) -> SegmentResult<Vec<LogEntry>> {
        let (from, until) = match month {
            Some(month) => (to_millis(month.start()), to_millis(month.end())),
            None => (i64::MIN, i64::MAX),
        };

        self.store.read(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, segment_name, operation, operation_time
                     FROM user_segments_log
                     WHERE user_id = ?1 AND operation_time >= ?2 AND operation_time < ?3
                     ORDER BY id",
                )
                .store_err()?;
            let rows = stmt
                .query_map(params![user_id, from, until], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                })
                .store_err()?
                .collect::<rusqlite::Result<Vec<_>>>()
                .store_err()?;

            rows.into_iter()
                .map(|(sequence, segment_name, operation, at)| -> SegmentResult<LogEntry> {
                    Ok(LogEntry {
                        sequence,
                        user_id,
                        segment_name,
                        operation: operation.parse::<Operation>()?,
                        operation_time: from_millis(at)?,
                    })
                })
                .collect()
        })
    }

    /// [`Self::user_operations`] rendered one entry per line.
    pub fn user_operation_lines(
        &self,
        user_id: UserId,
        month: Option<YearMonth>,
    ) -> SegmentResult<Vec<String>> {
        Ok(self
            .user_operations(user_id, month)?
            .iter()
            .map(ToString::to_string)
            .collect())
    }
}

/// File name of an exported history report: `<user>.csv` or
/// `<user>_<YYYY-MM>.csv`.
pub fn report_file_name(user_id: UserId, month: Option<YearMonth>) -> String {
    match month {
        Some(month) => format!("{user_id}_{month}.csv"),
        None => format!("{user_id}.csv"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MembershipEngine;
    use chrono::{TimeZone, Utc};
    use segments_core::types::AddSegment;
    use segments_core::ManualClock;

    fn setup() -> (Arc<ManualClock>, MembershipEngine, OperationHistory) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2023, 8, 31, 23, 59, 59).unwrap(),
        ));
        let store = Arc::new(Store::open_in_memory(clock.clone()).unwrap());
        let engine = MembershipEngine::new(store.clone());
        engine.create_user(42).unwrap();
        engine.create_segment("A").unwrap();
        engine.create_segment("B").unwrap();
        (clock, engine, OperationHistory::new(store))
    }

    #[test]
    fn test_month_filter_bounds() {
        let (clock, engine, history) = setup();
        engine.mutate(42, &[AddSegment::new("A")], &[]).unwrap();
        clock.set(Utc.with_ymd_and_hms(2023, 9, 1, 0, 0, 0).unwrap());
        engine.mutate(42, &[AddSegment::new("B")], &[]).unwrap();
        clock.set(Utc.with_ymd_and_hms(2023, 10, 1, 0, 0, 0).unwrap());
        engine.mutate(42, &[], &["A".to_string()]).unwrap();

        let august = history
            .user_operations(42, Some("2023-08".parse().unwrap()))
            .unwrap();
        assert_eq!(august.len(), 1);
        assert_eq!(august[0].segment_name, "A");

        let september = history
            .user_operations(42, Some("2023-09".parse().unwrap()))
            .unwrap();
        assert_eq!(september.len(), 1);
        assert_eq!(september[0].segment_name, "B");

        let all = history.user_operations(42, None).unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].sequence < w[1].sequence));
    }

    #[test]
    fn test_lines_are_formatted() {
        let (_clock, engine, history) = setup();
        engine.mutate(42, &[AddSegment::new("A")], &[]).unwrap();
        let lines = history.user_operation_lines(42, None).unwrap();
        assert_eq!(lines, vec!["(42, A, add, 2023-08-31T23:59:59Z)".to_string()]);
    }

    #[test]
    fn test_history_outlives_user() {
        let (_clock, engine, history) = setup();
        engine.mutate(42, &[AddSegment::new("A")], &[]).unwrap();
        engine.delete_user(42).unwrap();
        assert_eq!(history.user_operations(42, None).unwrap().len(), 2);
        assert!(history.user_operations(7, None).unwrap().is_empty());
    }

    #[test]
    fn test_report_file_name() {
        assert_eq!(report_file_name(5, None), "5.csv");
        assert_eq!(
            report_file_name(5, Some("2023-09".parse().unwrap())),
            "5_2023-09.csv"
        );
    }
}
