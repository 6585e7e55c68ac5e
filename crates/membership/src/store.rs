//! SQLite-backed membership store.
//!
//! One connection behind a mutex; every write runs in a `BEGIN IMMEDIATE`
//! transaction, which gives serializable isolation and lets read-then-write
//! sequences (count-then-sample, select-then-delete) run under one write lock.
//! All calls are blocking; async callers go through `spawn_blocking`.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{ffi, Connection, Transaction, TransactionBehavior};
use segments_core::config::DatabaseConfig;
use segments_core::{Clock, SegmentError, SegmentResult};
use tracing::info;

use crate::schema::SCHEMA_SQL;

pub struct Store {
    conn: Mutex<Connection>,
    clock: Arc<dyn Clock>,
    committed: AtomicU64,
}

impl Store {
    /// Open (or create) the database file described by `config`.
    pub fn open(config: &DatabaseConfig, clock: Arc<dyn Clock>) -> SegmentResult<Self> {
        let conn = Connection::open(Path::new(&config.path)).store_err()?;
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))
            .store_err()?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").store_err()?;
        let store = Self::init(conn, clock)?;
        info!(path = %config.path, "Membership store opened");
        Ok(store)
    }

    /// Private in-memory database, used by tests and ephemeral runs.
    pub fn open_in_memory(clock: Arc<dyn Clock>) -> SegmentResult<Self> {
        let conn = Connection::open_in_memory().store_err()?;
        Self::init(conn, clock)
    }

    fn init(conn: Connection, clock: Arc<dyn Clock>) -> SegmentResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;").store_err()?;
        conn.execute_batch(SCHEMA_SQL).store_err()?;
        Ok(Self {
            conn: Mutex::new(conn),
            clock,
            committed: AtomicU64::new(0),
        })
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Number of write transactions committed since the store was opened.
    pub fn committed_transactions(&self) -> u64 {
        self.committed.load(Ordering::Relaxed)
    }

    /// Run `f` inside one immediate transaction. The transaction commits only
    /// if `f` succeeds; on any error it is rolled back when dropped.
    pub fn write<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> SegmentResult<T>,
    ) -> SegmentResult<T> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .store_err()?;
        let value = f(&tx)?;
        tx.commit().store_err()?;
        self.committed.fetch_add(1, Ordering::Relaxed);
        Ok(value)
    }

    /// Run a read-only closure against the connection.
    pub fn read<T>(&self, f: impl FnOnce(&Connection) -> SegmentResult<T>) -> SegmentResult<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> SegmentResult<()> {
        self.conn.lock().execute_batch(sql).store_err()
    }
}

pub(crate) fn to_millis(instant: DateTime<Utc>) -> i64 {
    instant.timestamp_millis()
}

pub(crate) fn from_millis(millis: i64) -> SegmentResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| SegmentError::Store(format!("timestamp out of range: {millis}")))
}

/// True for primary-key and unique constraint failures.
pub(crate) fn is_duplicate_key(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                || failure.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

/// Translate a driver error into the service taxonomy. Callers that know
/// which entity a constraint protects map duplicates themselves first.
pub(crate) fn map_sqlite_error(err: rusqlite::Error) -> SegmentError {
    if is_duplicate_key(&err) {
        return SegmentError::Conflict {
            entity: "row",
            key: err.to_string(),
        };
    }
    if let rusqlite::Error::SqliteFailure(failure, _) = &err {
        if failure.extended_code == ffi::SQLITE_CONSTRAINT_FOREIGNKEY {
            return SegmentError::NotFound {
                entity: "reference",
                key: err.to_string(),
            };
        }
    }
    SegmentError::Store(err.to_string())
}

pub(crate) trait StoreResultExt<T> {
    fn store_err(self) -> SegmentResult<T>;
}

impl<T> StoreResultExt<T> for rusqlite::Result<T> {
    fn store_err(self) -> SegmentResult<T> {
        self.map_err(map_sqlite_error)
    }
}
