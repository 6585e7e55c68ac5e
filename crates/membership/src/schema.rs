//! SQLite schema for users, segments, memberships and the operation log.
//!
//! Timestamps are stored as UTC milliseconds since the Unix epoch.

pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY NOT NULL CHECK (id > 0)
);

CREATE TABLE IF NOT EXISTS segments (
    name TEXT PRIMARY KEY NOT NULL,
    auto_percentage REAL
);

CREATE TABLE IF NOT EXISTS user_segments (
    user_id INTEGER NOT NULL,
    segment_name TEXT NOT NULL,
    expires_at INTEGER DEFAULT NULL,
    CONSTRAINT user_segments_pkey PRIMARY KEY (user_id, segment_name),
    CONSTRAINT user_segments_user_id_fkey FOREIGN KEY (user_id)
        REFERENCES users (id) ON DELETE CASCADE,
    CONSTRAINT user_segments_segment_name_fkey FOREIGN KEY (segment_name)
        REFERENCES segments (name) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_user_segments_segment
    ON user_segments (segment_name);

CREATE INDEX IF NOT EXISTS idx_user_segments_expires_at
    ON user_segments (expires_at) WHERE expires_at IS NOT NULL;

CREATE TABLE IF NOT EXISTS user_segments_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    segment_name TEXT NOT NULL,
    operation TEXT NOT NULL CHECK (operation IN ('add', 'delete')),
    operation_time INTEGER NOT NULL
        DEFAULT (CAST((julianday('now') - 2440587.5) * 86400000 AS INTEGER))
);

CREATE INDEX IF NOT EXISTS idx_user_segments_log_user
    ON user_segments_log (user_id, operation_time);

CREATE TRIGGER IF NOT EXISTS user_segments_log_no_update
BEFORE UPDATE ON user_segments_log
BEGIN
    SELECT RAISE(ABORT, 'user_segments_log is append-only');
END;

CREATE TRIGGER IF NOT EXISTS user_segments_log_no_delete
BEFORE DELETE ON user_segments_log
BEGIN
    SELECT RAISE(ABORT, 'user_segments_log is append-only');
END;
"#;
