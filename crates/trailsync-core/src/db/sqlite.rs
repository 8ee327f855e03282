//! `SQLite` store backend

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};

use super::{migrations, EventScan, QueueTally, Store, Table, Transaction, TxMode, TxScope};
use crate::error::{Error, Result};
use crate::models::{EventId, FailedEvent, Priority, ProgressEntry, QueuedEvent, SyncMetadata};

const EVENT_COLUMNS: &str =
    "id, payload, queued_at, attempts, last_attempt_at, last_error, priority, partition_key";

/// On-device store backed by a single `SQLite` file.
///
/// One connection is shared behind a mutex; a transaction holds the lock
/// from `BEGIN` until commit or rollback.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open a store at the given path, creating it and running migrations as needed
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|error| {
                Error::StorageUnavailable(format!("cannot create {}: {error}", parent.display()))
            })?;
        }

        let conn = Connection::open(path).map_err(|error| {
            Error::StorageUnavailable(format!("cannot open {}: {error}", path.display()))
        })?;
        let store = Self::from_connection(conn, Some(path.to_path_buf()))?;
        tracing::debug!("Opened store at {}", path.display());
        Ok(store)
    }

    /// Open an in-memory store (useful for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|error| Error::StorageUnavailable(error.to_string()))?;
        Self::from_connection(conn, None)
    }

    fn from_connection(mut conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        Self::configure(&conn);
        migrations::run(&mut conn).map_err(|error| match error {
            Error::Database(inner) => Error::StorageUnavailable(inner.to_string()),
            other => other,
        })?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Configure `SQLite` for a local write-heavy queue
    fn configure(conn: &Connection) {
        // In-memory databases refuse WAL; the queue still works without it
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })
        .ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.busy_timeout(Duration::from_secs(5)).ok();
    }

    /// Location of the database file, `None` for in-memory stores
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::StorageUnavailable("store connection lock poisoned".into()))
    }
}

impl Store for SqliteStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    fn begin(&self, tables: &[Table], mode: TxMode) -> Result<Box<dyn Transaction + '_>> {
        let conn = self.lock()?;
        let begin = match mode {
            TxMode::ReadOnly => "BEGIN DEFERRED",
            TxMode::ReadWrite => "BEGIN IMMEDIATE",
        };
        conn.execute_batch(begin)
            .map_err(|error| Error::TransactionAborted(error.to_string()))?;

        Ok(Box::new(SqliteTransaction {
            conn,
            scope: TxScope::new(tables, mode),
            open: true,
        }))
    }

    fn delete_store(&self) -> Result<()> {
        let mut conn = self.lock()?;
        migrations::drop_all(&mut conn)?;
        migrations::run(&mut conn)?;
        tracing::warn!("Store contents deleted");
        Ok(())
    }
}

struct SqliteTransaction<'a> {
    conn: MutexGuard<'a, Connection>,
    scope: TxScope,
    open: bool,
}

impl Drop for SqliteTransaction<'_> {
    fn drop(&mut self) {
        if self.open {
            if let Err(error) = self.conn.execute_batch("ROLLBACK") {
                tracing::warn!("Rollback failed: {}", error);
            }
        }
    }
}

/// Map write failures, turning a full disk into an aborted transaction
fn write_error(error: rusqlite::Error) -> Error {
    if error.sqlite_error_code() == Some(ErrorCode::DiskFull) {
        Error::TransactionAborted(format!("storage quota exceeded: {error}"))
    } else {
        Error::Database(error)
    }
}

fn to_sql_count(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_sql_count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

fn sql_limit(limit: Option<usize>) -> i64 {
    limit.map_or(-1, |limit| i64::try_from(limit).unwrap_or(i64::MAX))
}

fn parse_priority(row: &Row<'_>, index: usize) -> rusqlite::Result<Priority> {
    let rank: i64 = row.get(index)?;
    Priority::from_rank(rank)
        .map_err(|error| rusqlite::Error::FromSqlConversionFailure(index, Type::Integer, Box::new(error)))
}

fn parse_event(row: &Row<'_>) -> rusqlite::Result<QueuedEvent> {
    Ok(QueuedEvent {
        id: EventId::from(row.get::<_, String>(0)?),
        payload: row.get(1)?,
        queued_at: row.get(2)?,
        attempts: row.get(3)?,
        last_attempt_at: row.get(4)?,
        last_error: row.get(5)?,
        priority: parse_priority(row, 6)?,
        partition_key: row.get(7)?,
    })
}

fn parse_failed(row: &Row<'_>) -> rusqlite::Result<FailedEvent> {
    Ok(FailedEvent {
        event: parse_event(row)?,
        failed_at: row.get(8)?,
        reviewed: row.get::<_, i32>(9)? != 0,
    })
}

fn parse_progress(row: &Row<'_>) -> rusqlite::Result<ProgressEntry> {
    Ok(ProgressEntry {
        actor_id: row.get(0)?,
        activity_id: row.get(1)?,
        progress: row.get(2)?,
        score: row.get(3)?,
        completed: row.get::<_, i32>(4)? != 0,
        updated_at: row.get(5)?,
        synced: row.get::<_, i32>(6)? != 0,
    })
}

impl Transaction for SqliteTransaction<'_> {
    fn get_event(&mut self, id: &EventId) -> Result<Option<QueuedEvent>> {
        self.scope.check_read(Table::Queue)?;
        let event = self
            .conn
            .query_row(
                &format!("SELECT {EVENT_COLUMNS} FROM queue WHERE id = ?"),
                params![id.as_str()],
                parse_event,
            )
            .optional()?;
        Ok(event)
    }

    fn put_event(&mut self, event: &QueuedEvent) -> Result<()> {
        self.scope.check_write(Table::Queue)?;
        self.conn
            .execute(
                &format!("INSERT OR REPLACE INTO queue ({EVENT_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)"),
                params![
                    event.id.as_str(),
                    event.payload,
                    event.queued_at,
                    event.attempts,
                    event.last_attempt_at,
                    event.last_error,
                    event.priority.rank(),
                    event.partition_key
                ],
            )
            .map_err(write_error)?;
        Ok(())
    }

    fn delete_event(&mut self, id: &EventId) -> Result<bool> {
        self.scope.check_write(Table::Queue)?;
        let rows = self
            .conn
            .execute("DELETE FROM queue WHERE id = ?", params![id.as_str()])
            .map_err(write_error)?;
        Ok(rows > 0)
    }

    fn scan_events(&mut self, scan: EventScan<'_>) -> Result<Vec<QueuedEvent>> {
        self.scope.check_read(Table::Queue)?;
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS}
             FROM queue
             WHERE (?1 IS NULL OR partition_key = ?1)
             ORDER BY priority ASC, queued_at ASC, id ASC
             LIMIT ?2"
        ))?;

        let events = stmt
            .query_map(params![scan.partition_key, sql_limit(scan.limit)], parse_event)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    fn count_events(&mut self) -> Result<usize> {
        self.scope.check_read(Table::Queue)?;
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM queue", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    fn tally_events(&mut self) -> Result<Vec<QueueTally>> {
        self.scope.check_read(Table::Queue)?;
        let mut stmt = self.conn.prepare(
            "SELECT priority, attempts > 0, COUNT(*), MIN(queued_at)
             FROM queue
             GROUP BY priority, attempts > 0",
        )?;

        let tally = stmt
            .query_map([], |row| {
                Ok(QueueTally {
                    priority: parse_priority(row, 0)?,
                    retrying: row.get::<_, i32>(1)? != 0,
                    count: usize::try_from(row.get::<_, i64>(2)?).unwrap_or_default(),
                    oldest_queued_at: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tally)
    }

    fn eviction_candidates(&mut self, count: usize) -> Result<Vec<EventId>> {
        self.scope.check_read(Table::Queue)?;
        let mut stmt = self.conn.prepare(
            "SELECT id FROM queue
             ORDER BY priority DESC, queued_at ASC, id ASC
             LIMIT ?",
        )?;

        let ids = stmt
            .query_map(params![sql_limit(Some(count))], |row| {
                row.get::<_, String>(0).map(EventId::from)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    fn get_failed(&mut self, id: &EventId) -> Result<Option<FailedEvent>> {
        self.scope.check_read(Table::FailedEvents)?;
        let event = self
            .conn
            .query_row(
                &format!("SELECT {EVENT_COLUMNS}, failed_at, reviewed FROM failed_events WHERE id = ?"),
                params![id.as_str()],
                parse_failed,
            )
            .optional()?;
        Ok(event)
    }

    fn put_failed(&mut self, failed: &FailedEvent) -> Result<()> {
        self.scope.check_write(Table::FailedEvents)?;
        let event = &failed.event;
        self.conn
            .execute(
                &format!(
                    "INSERT OR REPLACE INTO failed_events ({EVENT_COLUMNS}, failed_at, reviewed)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
                ),
                params![
                    event.id.as_str(),
                    event.payload,
                    event.queued_at,
                    event.attempts,
                    event.last_attempt_at,
                    event.last_error,
                    event.priority.rank(),
                    event.partition_key,
                    failed.failed_at,
                    i32::from(failed.reviewed)
                ],
            )
            .map_err(write_error)?;
        Ok(())
    }

    fn delete_failed(&mut self, id: &EventId) -> Result<bool> {
        self.scope.check_write(Table::FailedEvents)?;
        let rows = self
            .conn
            .execute("DELETE FROM failed_events WHERE id = ?", params![id.as_str()])
            .map_err(write_error)?;
        Ok(rows > 0)
    }

    fn scan_failed(&mut self, reviewed: Option<bool>) -> Result<Vec<FailedEvent>> {
        self.scope.check_read(Table::FailedEvents)?;
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS}, failed_at, reviewed
             FROM failed_events
             WHERE (?1 IS NULL OR reviewed = ?1)
             ORDER BY failed_at ASC, id ASC"
        ))?;

        let events = stmt
            .query_map(params![reviewed.map(i32::from)], parse_failed)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    fn count_failed(&mut self, reviewed: Option<bool>) -> Result<usize> {
        self.scope.check_read(Table::FailedEvents)?;
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM failed_events WHERE (?1 IS NULL OR reviewed = ?1)",
            params![reviewed.map(i32::from)],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    fn get_progress(&mut self, key: &str) -> Result<Option<ProgressEntry>> {
        self.scope.check_read(Table::Progress)?;
        let entry = self
            .conn
            .query_row(
                "SELECT actor_id, activity_id, progress, score, completed, updated_at, synced
                 FROM progress WHERE key = ?",
                params![key],
                parse_progress,
            )
            .optional()?;
        Ok(entry)
    }

    fn put_progress(&mut self, entry: &ProgressEntry) -> Result<()> {
        self.scope.check_write(Table::Progress)?;
        self.conn
            .execute(
                "INSERT OR REPLACE INTO progress
                 (key, actor_id, activity_id, progress, score, completed, updated_at, synced)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    entry.key(),
                    entry.actor_id,
                    entry.activity_id,
                    entry.progress,
                    entry.score,
                    i32::from(entry.completed),
                    entry.updated_at,
                    i32::from(entry.synced)
                ],
            )
            .map_err(write_error)?;
        Ok(())
    }

    fn scan_progress(&mut self, synced: Option<bool>) -> Result<Vec<ProgressEntry>> {
        self.scope.check_read(Table::Progress)?;
        let mut stmt = self.conn.prepare(
            "SELECT actor_id, activity_id, progress, score, completed, updated_at, synced
             FROM progress
             WHERE (?1 IS NULL OR synced = ?1)
             ORDER BY updated_at ASC, key ASC",
        )?;

        let entries = stmt
            .query_map(params![synced.map(i32::from)], parse_progress)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    fn get_metadata(&mut self) -> Result<Option<SyncMetadata>> {
        self.scope.check_read(Table::SyncMetadata)?;
        let metadata = self
            .conn
            .query_row(
                "SELECT last_sync_at, last_sync_error, consecutive_failures, is_syncing,
                        total_synced, total_failed
                 FROM sync_metadata WHERE id = 1",
                [],
                |row| {
                    Ok(SyncMetadata {
                        last_sync_at: row.get(0)?,
                        last_sync_error: row.get(1)?,
                        consecutive_failures: row.get(2)?,
                        is_syncing: row.get::<_, i32>(3)? != 0,
                        total_synced: from_sql_count(row.get(4)?),
                        total_failed: from_sql_count(row.get(5)?),
                    })
                },
            )
            .optional()?;
        Ok(metadata)
    }

    fn put_metadata(&mut self, metadata: &SyncMetadata) -> Result<()> {
        self.scope.check_write(Table::SyncMetadata)?;
        self.conn
            .execute(
                "INSERT OR REPLACE INTO sync_metadata
                 (id, last_sync_at, last_sync_error, consecutive_failures, is_syncing,
                  total_synced, total_failed)
                 VALUES (1, ?, ?, ?, ?, ?, ?)",
                params![
                    metadata.last_sync_at,
                    metadata.last_sync_error,
                    metadata.consecutive_failures,
                    i32::from(metadata.is_syncing),
                    to_sql_count(metadata.total_synced),
                    to_sql_count(metadata.total_failed)
                ],
            )
            .map_err(write_error)?;
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        // On failure `open` stays set and Drop rolls back
        self.conn
            .execute_batch("COMMIT")
            .map_err(|error| Error::TransactionAborted(format!("commit failed: {error}")))?;
        self.open = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::StoreExt;
    use crate::models::NewEvent;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_open_creates_parent_directories() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("nested").join("queue.db");

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.path(), Some(path.as_path()));
        assert!(path.exists());
    }

    #[test]
    fn test_open_on_directory_is_unavailable() {
        let tmp = tempdir().unwrap();
        let result = SqliteStore::open(tmp.path());
        assert!(matches!(result, Err(Error::StorageUnavailable(_))));
    }

    #[test]
    fn test_events_survive_reopen() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("queue.db");
        let event = QueuedEvent::from_new(
            NewEvent::new(json!({"verb": {"id": "completed"}})).with_id("stmt-1"),
            Priority::High,
            100,
        );

        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .run_transaction(&[Table::Queue], TxMode::ReadWrite, |tx| tx.put_event(&event))
                .unwrap();
        }

        let reopened = SqliteStore::open(&path).unwrap();
        let loaded = reopened
            .run_transaction(&[Table::Queue], TxMode::ReadOnly, |tx| {
                tx.get_event(&EventId::from("stmt-1"))
            })
            .unwrap();
        assert_eq!(loaded, Some(event));
    }

    #[test]
    fn test_uncommitted_transaction_is_rolled_back_on_drop() {
        let store = SqliteStore::open_in_memory().unwrap();
        {
            let mut tx = store.begin(&[Table::Queue], TxMode::ReadWrite).unwrap();
            let event = QueuedEvent::from_new(NewEvent::new(json!({})).with_id("a"), Priority::Low, 1);
            tx.put_event(&event).unwrap();
        }

        let count = store
            .run_transaction(&[Table::Queue], TxMode::ReadOnly, |tx| tx.count_events())
            .unwrap();
        assert_eq!(count, 0);
    }
}
