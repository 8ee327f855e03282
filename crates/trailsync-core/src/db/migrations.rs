//! Database migrations

use crate::error::{Error, Result};
use rusqlite::Connection;

/// Current schema version
pub const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations
pub fn run(conn: &mut Connection) -> Result<()> {
    let version = get_version(conn)?;

    if version > CURRENT_VERSION {
        return Err(Error::StorageUnavailable(format!(
            "store schema version {version} is newer than supported version {CURRENT_VERSION}"
        )));
    }

    if version < 1 {
        migrate_v1(conn)?;
    }
    if version < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Get the current schema version
pub fn get_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}

/// Drop every table, including the version marker
pub fn drop_all(conn: &mut Connection) -> Result<()> {
    apply(
        conn,
        &[
            "DROP TABLE IF EXISTS queue",
            "DROP TABLE IF EXISTS failed_events",
            "DROP TABLE IF EXISTS sync_metadata",
            "DROP TABLE IF EXISTS progress",
            "DROP TABLE IF EXISTS schema_version",
        ],
    )
}

fn apply(conn: &mut Connection, statements: &[&str]) -> Result<()> {
    let tx = conn.transaction()?;
    for stmt in statements {
        tx.execute(stmt, [])?;
    }
    tx.commit()?;
    Ok(())
}

/// Migration to version 1: queue, dead letters and sync metadata
fn migrate_v1(conn: &mut Connection) -> Result<()> {
    apply(
        conn,
        &[
            // Schema version tracking
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            )",
            // Pending events
            "CREATE TABLE IF NOT EXISTS queue (
                id TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                queued_at INTEGER NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_attempt_at INTEGER,
                last_error TEXT,
                priority INTEGER NOT NULL,
                partition_key TEXT
            )",
            "CREATE INDEX IF NOT EXISTS idx_queue_order ON queue(priority, queued_at, id)",
            "CREATE INDEX IF NOT EXISTS idx_queue_queued_at ON queue(queued_at)",
            // Dead letters
            "CREATE TABLE IF NOT EXISTS failed_events (
                id TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                queued_at INTEGER NOT NULL,
                attempts INTEGER NOT NULL,
                last_attempt_at INTEGER,
                last_error TEXT,
                priority INTEGER NOT NULL,
                partition_key TEXT,
                failed_at INTEGER NOT NULL,
                reviewed INTEGER NOT NULL DEFAULT 0
            )",
            "CREATE INDEX IF NOT EXISTS idx_failed_failed_at ON failed_events(failed_at)",
            "CREATE INDEX IF NOT EXISTS idx_failed_reviewed ON failed_events(reviewed, failed_at)",
            // Singleton sync bookkeeping
            "CREATE TABLE IF NOT EXISTS sync_metadata (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                last_sync_at INTEGER,
                last_sync_error TEXT,
                consecutive_failures INTEGER NOT NULL DEFAULT 0,
                is_syncing INTEGER NOT NULL DEFAULT 0,
                total_synced INTEGER NOT NULL DEFAULT 0,
                total_failed INTEGER NOT NULL DEFAULT 0
            )",
            "INSERT INTO schema_version (version) VALUES (1)",
        ],
    )?;

    tracing::info!("Migrated store to version 1");
    Ok(())
}

/// Migration to version 2: progress cache and partition scoping
fn migrate_v2(conn: &mut Connection) -> Result<()> {
    apply(
        conn,
        &[
            "CREATE TABLE IF NOT EXISTS progress (
                key TEXT PRIMARY KEY,
                actor_id TEXT NOT NULL,
                activity_id TEXT NOT NULL,
                progress REAL NOT NULL,
                score REAL,
                completed INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL,
                synced INTEGER NOT NULL DEFAULT 0
            )",
            "CREATE INDEX IF NOT EXISTS idx_progress_synced ON progress(synced)",
            "CREATE INDEX IF NOT EXISTS idx_queue_partition ON queue(partition_key, priority, queued_at)",
            "INSERT INTO schema_version (version) VALUES (2)",
        ],
    )?;

    tracing::info!("Migrated store to version {CURRENT_VERSION}");
    Ok(())
}
