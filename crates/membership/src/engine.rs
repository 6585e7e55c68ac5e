//! Membership engine: user/segment lifecycle and atomic per-user mutations.

use std::sync::Arc;

use rusqlite::Connection;
use segments_core::types::{
    validate_segment_name, validate_user_id, AddSegment, Membership, Operation, SegmentInfo,
    UserId,
};
use segments_core::{SegmentError, SegmentResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::changes::{
    append_log, apply_changes, ensure_segment_exists, ensure_user_exists, insert_segment,
    MembershipChange,
};
use crate::duration::expiry_from;
use crate::store::{from_millis, is_duplicate_key, map_sqlite_error, StoreResultExt};
use crate::Store;

/// Outcome of one [`MembershipEngine::mutate`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationSummary {
    pub added: usize,
    /// Rows physically removed; removals of segments the user did not hold
    /// are still logged but not counted here.
    pub removed: usize,
    pub logged: usize,
}

pub struct MembershipEngine {
    store: Arc<Store>,
}

impl MembershipEngine {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    // ─── Users ─────────────────────────────────────────────────────────────

    pub fn create_user(&self, user_id: UserId) -> SegmentResult<()> {
        validate_user_id(user_id)?;
        self.store.write(|tx| {
            tx.execute("INSERT INTO users (id) VALUES (?1)", [user_id])
                .map_err(|e| {
                    if is_duplicate_key(&e) {
                        SegmentError::user_exists(user_id)
                    } else {
                        map_sqlite_error(e)
                    }
                })?;
            Ok(())
        })?;
        info!(user_id, "User created");
        Ok(())
    }

    /// Delete a user. Each membership removed by the cascade gets a delete
    /// log entry. Returns the number of memberships removed.
    pub fn delete_user(&self, user_id: UserId) -> SegmentResult<usize> {
        let removed = self.store.write(|tx| {
            ensure_user_exists(tx, user_id)?;
            let now = self.store.now();
            let segments = segment_names_of(tx, user_id)?;
            tx.execute("DELETE FROM users WHERE id = ?1", [user_id])
                .store_err()?;
            for segment in &segments {
                append_log(tx, user_id, segment, Operation::Delete, now)?;
            }
            Ok(segments.len())
        })?;
        info!(user_id, removed, "User deleted");
        Ok(removed)
    }

    // ─── Segments ──────────────────────────────────────────────────────────

    pub fn create_segment(&self, name: &str) -> SegmentResult<()> {
        validate_segment_name(name)?;
        self.store.write(|tx| insert_segment(tx, name, None))?;
        info!(segment = %name, "Segment created");
        Ok(())
    }

    /// Delete a segment. Each membership removed by the cascade gets a delete
    /// log entry. Returns the number of memberships removed.
    pub fn delete_segment(&self, name: &str) -> SegmentResult<usize> {
        let removed = self.store.write(|tx| {
            ensure_segment_exists(tx, name)?;
            let now = self.store.now();
            let members = member_ids_of(tx, name)?;
            tx.execute("DELETE FROM segments WHERE name = ?1", [name])
                .store_err()?;
            for user_id in &members {
                append_log(tx, *user_id, name, Operation::Delete, now)?;
            }
            Ok(members.len())
        })?;
        info!(segment = %name, removed, "Segment deleted");
        Ok(removed)
    }

    pub fn list_segments(&self) -> SegmentResult<Vec<SegmentInfo>> {
        self.store.read(|conn| {
            let mut stmt = conn
                .prepare("SELECT name, auto_percentage FROM segments ORDER BY name")
                .store_err()?;
            let segments = stmt
                .query_map([], |row| {
                    Ok(SegmentInfo {
                        name: row.get(0)?,
                        auto_percentage: row.get(1)?,
                    })
                })
                .store_err()?
                .collect::<rusqlite::Result<Vec<_>>>()
                .store_err()?;
            Ok(segments)
        })
    }

    // ─── Memberships ───────────────────────────────────────────────────────

    /// Atomically apply `additions` then `removals` for one user.
    ///
    /// Additions run first in caller order, then removals in caller order, so
    /// a segment named in both lists ends up removed. Any failure (unknown
    /// user or segment, malformed expiry, store error) rolls back the whole
    /// call.
    pub fn mutate(
        &self,
        user_id: UserId,
        additions: &[AddSegment],
        removals: &[String],
    ) -> SegmentResult<MutationSummary> {
        let summary = self.store.write(|tx| {
            let now = self.store.now();
            ensure_user_exists(tx, user_id)?;

            let mut changes = Vec::with_capacity(additions.len() + removals.len());
            for addition in additions {
                ensure_segment_exists(tx, &addition.name)?;
                let expires_at = expiry_from(now, addition.expire.as_deref())?;
                changes.push(MembershipChange::add(user_id, &addition.name, expires_at));
            }
            for name in removals {
                ensure_segment_exists(tx, name)?;
                changes.push(MembershipChange::delete(user_id, name));
            }

            let applied = apply_changes(tx, now, &changes)?;
            Ok(MutationSummary {
                added: applied.upserted,
                removed: applied.deleted,
                logged: applied.logged,
            })
        })?;

        metrics::counter!("membership.mutations").increment(1);
        debug!(
            user_id,
            added = summary.added,
            removed = summary.removed,
            logged = summary.logged,
            "User segments updated"
        );
        Ok(summary)
    }

    /// Names of the segments the user currently belongs to. Memberships whose
    /// expiry has passed are excluded even before the sweeper removes them.
    pub fn user_segments(&self, user_id: UserId) -> SegmentResult<Vec<String>> {
        let now = self.store.now();
        let memberships = self.user_memberships(user_id)?;
        Ok(memberships
            .into_iter()
            .filter(|m| m.is_live_at(now))
            .map(|m| m.segment_name)
            .collect())
    }

    /// Every stored membership row for the user, including expired rows that
    /// have not been swept yet.
    pub fn user_memberships(&self, user_id: UserId) -> SegmentResult<Vec<Membership>> {
        self.store.read(|conn| {
            ensure_user_exists(conn, user_id)?;
            let mut stmt = conn
                .prepare(
                    "SELECT segment_name, expires_at FROM user_segments
                     WHERE user_id = ?1 ORDER BY segment_name",
                )
                .store_err()?;
            let rows = stmt
                .query_map([user_id], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, Option<i64>>(1)?))
                })
                .store_err()?
                .collect::<rusqlite::Result<Vec<_>>>()
                .store_err()?;

            rows.into_iter()
                .map(|(segment_name, expires_at)| -> SegmentResult<Membership> {
                    Ok(Membership {
                        user_id,
                        segment_name,
                        expires_at: expires_at.map(from_millis).transpose()?,
                    })
                })
                .collect()
        })
    }
}

fn segment_names_of(conn: &Connection, user_id: UserId) -> SegmentResult<Vec<String>> {
    let mut stmt = conn
        .prepare("SELECT segment_name FROM user_segments WHERE user_id = ?1 ORDER BY segment_name")
        .store_err()?;
    let names = stmt
        .query_map([user_id], |row| row.get(0))
        .store_err()?
        .collect::<rusqlite::Result<Vec<String>>>()
        .store_err()?;
    Ok(names)
}

fn member_ids_of(conn: &Connection, segment: &str) -> SegmentResult<Vec<UserId>> {
    let mut stmt = conn
        .prepare("SELECT user_id FROM user_segments WHERE segment_name = ?1 ORDER BY user_id")
        .store_err()?;
    let ids = stmt
        .query_map([segment], |row| row.get(0))
        .store_err()?
        .collect::<rusqlite::Result<Vec<UserId>>>()
        .store_err()?;
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::OperationHistory;
    use chrono::{Duration, TimeZone, Utc};
    use segments_core::types::LogEntry;
    use segments_core::{Clock, ManualClock};

    struct Fixture {
        clock: Arc<ManualClock>,
        engine: MembershipEngine,
        history: OperationHistory,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        ));
        let store = Arc::new(Store::open_in_memory(clock.clone()).unwrap());
        Fixture {
            clock,
            engine: MembershipEngine::new(store.clone()),
            history: OperationHistory::new(store),
        }
    }

    fn ops(entries: &[LogEntry]) -> Vec<(String, Operation)> {
        entries
            .iter()
            .map(|e| (e.segment_name.clone(), e.operation))
            .collect()
    }

    #[test]
    fn test_add_then_remove_leaves_two_log_entries() {
        let f = fixture();
        f.engine.create_user(1).unwrap();
        f.engine.create_segment("S").unwrap();

        f.engine.mutate(1, &[AddSegment::new("S")], &[]).unwrap();
        assert_eq!(f.engine.user_segments(1).unwrap(), vec!["S".to_string()]);

        f.engine.mutate(1, &[], &["S".to_string()]).unwrap();
        assert!(f.engine.user_memberships(1).unwrap().is_empty());

        let log = f.history.user_operations(1, None).unwrap();
        assert_eq!(
            ops(&log),
            vec![
                ("S".to_string(), Operation::Add),
                ("S".to_string(), Operation::Delete)
            ]
        );
    }

    #[test]
    fn test_removing_unheld_segment_still_logs() {
        let f = fixture();
        f.engine.create_user(1).unwrap();
        f.engine.create_segment("S").unwrap();

        let summary = f.engine.mutate(1, &[], &["S".to_string()]).unwrap();
        assert_eq!(
            summary,
            MutationSummary {
                added: 0,
                removed: 0,
                logged: 1
            }
        );
        let log = f.history.user_operations(1, None).unwrap();
        assert_eq!(ops(&log), vec![("S".to_string(), Operation::Delete)]);
    }

    #[test]
    fn test_add_and_remove_same_segment_nets_to_delete() {
        let f = fixture();
        f.engine.create_user(1).unwrap();
        f.engine.create_segment("S").unwrap();

        let summary = f
            .engine
            .mutate(1, &[AddSegment::new("S")], &["S".to_string()])
            .unwrap();
        assert_eq!(summary.added, 1);
        assert_eq!(summary.removed, 1);
        assert!(f.engine.user_memberships(1).unwrap().is_empty());

        let log = f.history.user_operations(1, None).unwrap();
        assert_eq!(
            ops(&log),
            vec![
                ("S".to_string(), Operation::Add),
                ("S".to_string(), Operation::Delete)
            ]
        );
    }

    #[test]
    fn test_expiry_is_stored_as_absolute_instant() {
        let f = fixture();
        let start = f.clock.now();
        f.engine.create_user(1).unwrap();
        f.engine.create_segment("S").unwrap();

        f.engine
            .mutate(1, &[AddSegment::expiring("S", "1h")], &[])
            .unwrap();

        let memberships = f.engine.user_memberships(1).unwrap();
        assert_eq!(memberships.len(), 1);
        assert_eq!(memberships[0].expires_at, Some(start + Duration::hours(1)));

        f.clock.advance(Duration::hours(2));
        assert!(f.engine.user_segments(1).unwrap().is_empty());
        assert_eq!(f.engine.user_memberships(1).unwrap().len(), 1);
    }

    #[test]
    fn test_unknown_user_is_not_found() {
        let f = fixture();
        f.engine.create_segment("S").unwrap();
        let err = f.engine.mutate(5, &[AddSegment::new("S")], &[]).unwrap_err();
        assert_eq!(err, SegmentError::user_not_found(5));
        assert!(f.history.user_operations(5, None).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_segment_aborts_whole_call() {
        let f = fixture();
        f.engine.create_user(1).unwrap();
        f.engine.create_segment("A").unwrap();

        let err = f
            .engine
            .mutate(1, &[AddSegment::new("A"), AddSegment::new("missing")], &[])
            .unwrap_err();
        assert_eq!(err, SegmentError::segment_not_found("missing"));
        assert!(f.engine.user_memberships(1).unwrap().is_empty());
        assert!(f.history.user_operations(1, None).unwrap().is_empty());
    }

    #[test]
    fn test_bad_expiry_rolls_back() {
        let f = fixture();
        f.engine.create_user(1).unwrap();
        f.engine.create_segment("A").unwrap();
        f.engine.create_segment("B").unwrap();

        let err = f
            .engine
            .mutate(
                1,
                &[AddSegment::new("A"), AddSegment::expiring("B", "whenever")],
                &[],
            )
            .unwrap_err();
        assert!(matches!(err, SegmentError::Validation(_)));
        assert!(f.engine.user_memberships(1).unwrap().is_empty());
        assert!(f.history.user_operations(1, None).unwrap().is_empty());
    }

    #[test]
    fn test_failed_log_insert_rolls_back_earlier_additions() {
        let f = fixture();
        f.engine.create_user(1).unwrap();
        f.engine.create_segment("first").unwrap();
        f.engine.create_segment("poison").unwrap();
        f.engine
            .store()
            .execute_batch(
                "CREATE TEMP TRIGGER reject_poison_log
                 BEFORE INSERT ON user_segments_log
                 WHEN NEW.segment_name = 'poison'
                 BEGIN SELECT RAISE(ABORT, 'log write rejected'); END;",
            )
            .unwrap();

        let err = f
            .engine
            .mutate(
                1,
                &[AddSegment::new("first"), AddSegment::new("poison")],
                &[],
            )
            .unwrap_err();
        assert!(matches!(err, SegmentError::Store(_)));
        assert!(f.engine.user_memberships(1).unwrap().is_empty());
        assert!(f.history.user_operations(1, None).unwrap().is_empty());
    }

    #[test]
    fn test_create_conflicts() {
        let f = fixture();
        f.engine.create_user(1).unwrap();
        assert_eq!(
            f.engine.create_user(1).unwrap_err(),
            SegmentError::user_exists(1)
        );
        f.engine.create_segment("S").unwrap();
        assert_eq!(
            f.engine.create_segment("S").unwrap_err(),
            SegmentError::segment_exists("S")
        );
        assert!(matches!(
            f.engine.create_user(0).unwrap_err(),
            SegmentError::Validation(_)
        ));
        assert!(matches!(
            f.engine.create_segment("").unwrap_err(),
            SegmentError::Validation(_)
        ));
    }

    #[test]
    fn test_delete_segment_cascades_and_logs() {
        let f = fixture();
        for id in 1..=3 {
            f.engine.create_user(id).unwrap();
        }
        f.engine.create_segment("S").unwrap();
        f.engine.create_segment("T").unwrap();
        f.engine.mutate(1, &[AddSegment::new("S"), AddSegment::new("T")], &[]).unwrap();
        f.engine.mutate(2, &[AddSegment::new("S")], &[]).unwrap();

        assert_eq!(f.engine.delete_segment("S").unwrap(), 2);
        assert_eq!(f.engine.user_segments(1).unwrap(), vec!["T".to_string()]);
        assert!(f.engine.user_segments(2).unwrap().is_empty());

        let log = f.history.user_operations(2, None).unwrap();
        assert_eq!(
            ops(&log),
            vec![
                ("S".to_string(), Operation::Add),
                ("S".to_string(), Operation::Delete)
            ]
        );
        assert_eq!(
            f.engine.delete_segment("S").unwrap_err(),
            SegmentError::segment_not_found("S")
        );
        let names: Vec<String> = f
            .engine
            .list_segments()
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["T".to_string()]);
    }

    #[test]
    fn test_delete_user_cascades_and_logs() {
        let f = fixture();
        f.engine.create_user(1).unwrap();
        f.engine.create_segment("S").unwrap();
        f.engine.mutate(1, &[AddSegment::new("S")], &[]).unwrap();

        assert_eq!(f.engine.delete_user(1).unwrap(), 1);
        assert_eq!(
            f.engine.user_segments(1).unwrap_err(),
            SegmentError::user_not_found(1)
        );
        let log = f.history.user_operations(1, None).unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].operation, Operation::Delete);
    }
}
