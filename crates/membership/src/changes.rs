//! Transactional plumbing shared by every membership writer.
//!
//! [`apply_changes`] writes a batch of membership inserts/deletes together
//! with one log row per change. Functions here take the open transaction and
//! never commit; the caller's [`Store::write`](crate::Store::write) decides.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use segments_core::types::{Operation, UserId};
use segments_core::{SegmentError, SegmentResult};

use crate::store::{is_duplicate_key, to_millis, StoreResultExt};

/// One membership mutation: (user, segment, operation, optional expiry).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipChange {
    pub user_id: UserId,
    pub segment_name: String,
    pub operation: Operation,
    pub expires_at: Option<DateTime<Utc>>,
}

impl MembershipChange {
    pub fn add(
        user_id: UserId,
        segment_name: impl Into<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            user_id,
            segment_name: segment_name.into(),
            operation: Operation::Add,
            expires_at,
        }
    }

    pub fn delete(user_id: UserId, segment_name: impl Into<String>) -> Self {
        Self {
            user_id,
            segment_name: segment_name.into(),
            operation: Operation::Delete,
            expires_at: None,
        }
    }
}

/// Row counts produced by one [`apply_changes`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppliedChanges {
    /// Membership rows inserted or overwritten.
    pub upserted: usize,
    /// Membership rows physically deleted.
    pub deleted: usize,
    /// Log rows appended (always one per change).
    pub logged: usize,
}

/// Apply `changes` in order. Each change writes its membership row and then
/// its log row; deletes are logged even when no row matched.
pub fn apply_changes(
    tx: &Connection,
    now: DateTime<Utc>,
    changes: &[MembershipChange],
) -> SegmentResult<AppliedChanges> {
    let mut applied = AppliedChanges::default();

    for change in changes {
        match change.operation {
            Operation::Add => {
                applied.upserted += tx
                    .execute(
                        "INSERT INTO user_segments (user_id, segment_name, expires_at)
                         VALUES (?1, ?2, ?3)
                         ON CONFLICT (user_id, segment_name)
                         DO UPDATE SET expires_at = excluded.expires_at",
                        params![
                            change.user_id,
                            change.segment_name,
                            change.expires_at.map(to_millis)
                        ],
                    )
                    .store_err()?;
            }
            Operation::Delete => {
                applied.deleted += tx
                    .execute(
                        "DELETE FROM user_segments WHERE user_id = ?1 AND segment_name = ?2",
                        params![change.user_id, change.segment_name],
                    )
                    .store_err()?;
            }
        }

        append_log(
            tx,
            change.user_id,
            &change.segment_name,
            change.operation,
            now,
        )?;
        applied.logged += 1;
    }

    Ok(applied)
}

/// Append one row to the operation log.
pub fn append_log(
    tx: &Connection,
    user_id: UserId,
    segment_name: &str,
    operation: Operation,
    at: DateTime<Utc>,
) -> SegmentResult<()> {
    tx.execute(
        "INSERT INTO user_segments_log (user_id, segment_name, operation, operation_time)
         VALUES (?1, ?2, ?3, ?4)",
        params![user_id, segment_name, operation.as_str(), to_millis(at)],
    )
    .store_err()?;
    Ok(())
}

pub fn ensure_user_exists(tx: &Connection, user_id: UserId) -> SegmentResult<()> {
    let found: Option<i64> = tx
        .query_row("SELECT id FROM users WHERE id = ?1", [user_id], |row| {
            row.get(0)
        })
        .optional()
        .store_err()?;
    found
        .map(|_| ())
        .ok_or_else(|| SegmentError::user_not_found(user_id))
}

pub fn ensure_segment_exists(tx: &Connection, name: &str) -> SegmentResult<()> {
    let found: Option<String> = tx
        .query_row("SELECT name FROM segments WHERE name = ?1", [name], |row| {
            row.get(0)
        })
        .optional()
        .store_err()?;
    found
        .map(|_| ())
        .ok_or_else(|| SegmentError::segment_not_found(name))
}

pub fn insert_segment(
    tx: &Connection,
    name: &str,
    auto_percentage: Option<f64>,
) -> SegmentResult<()> {
    tx.execute(
        "INSERT INTO segments (name, auto_percentage) VALUES (?1, ?2)",
        params![name, auto_percentage],
    )
    .map_err(|e| {
        if is_duplicate_key(&e) {
            SegmentError::segment_exists(name)
        } else {
            crate::store::map_sqlite_error(e)
        }
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Store;
    use segments_core::SystemClock;
    use std::sync::Arc;

    fn seeded_store() -> Store {
        let store = Store::open_in_memory(Arc::new(SystemClock)).unwrap();
        store
            .execute_batch(
                "INSERT INTO users (id) VALUES (1), (2);
                 INSERT INTO segments (name) VALUES ('a'), ('b');",
            )
            .unwrap();
        store
    }

    fn log_rows(store: &Store) -> Vec<(i64, String, String)> {
        store
            .read(|conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT user_id, segment_name, operation FROM user_segments_log ORDER BY id",
                    )
                    .store_err()?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
                    .store_err()?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .store_err()?;
                Ok(rows)
            })
            .unwrap()
    }

    #[test]
    fn test_apply_changes_logs_every_change() {
        let store = seeded_store();
        let now = store.now();
        let applied = store
            .write(|tx| {
                apply_changes(
                    tx,
                    now,
                    &[
                        MembershipChange::add(1, "a", None),
                        MembershipChange::add(2, "a", None),
                        MembershipChange::delete(1, "b"),
                    ],
                )
            })
            .unwrap();

        assert_eq!(
            applied,
            AppliedChanges {
                upserted: 2,
                deleted: 0,
                logged: 3
            }
        );
        let log = log_rows(&store);
        assert_eq!(log.len(), 3);
        assert_eq!(log[2], (1, "b".to_string(), "delete".to_string()));
    }

    #[test]
    fn test_add_overwrites_expiry() {
        let store = seeded_store();
        let now = store.now();
        let later = now + chrono::Duration::hours(2);
        store
            .write(|tx| {
                apply_changes(tx, now, &[MembershipChange::add(1, "a", Some(later))])?;
                apply_changes(tx, now, &[MembershipChange::add(1, "a", None)])
            })
            .unwrap();

        let expires: Option<i64> = store
            .read(|conn| {
                conn.query_row(
                    "SELECT expires_at FROM user_segments WHERE user_id = 1 AND segment_name = 'a'",
                    [],
                    |row| row.get(0),
                )
                .store_err()
            })
            .unwrap();
        assert_eq!(expires, None);
        assert_eq!(log_rows(&store).len(), 2);
    }

    #[test]
    fn test_existence_checks() {
        let store = seeded_store();
        store
            .read(|conn| {
                ensure_user_exists(conn, 1)?;
                ensure_segment_exists(conn, "a")?;
                Ok(())
            })
            .unwrap();

        let err = store.read(|conn| ensure_user_exists(conn, 99)).unwrap_err();
        assert_eq!(err, SegmentError::user_not_found(99));
        let err = store
            .read(|conn| ensure_segment_exists(conn, "zzz"))
            .unwrap_err();
        assert_eq!(err, SegmentError::segment_not_found("zzz"));
    }

    #[test]
    fn test_insert_segment_conflict() {
        let store = seeded_store();
        let err = store
            .write(|tx| insert_segment(tx, "a", None))
            .unwrap_err();
        assert_eq!(err, SegmentError::segment_exists("a"));
    }
}
