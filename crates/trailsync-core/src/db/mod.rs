//! Durable storage layer for trailsync
//!
//! The store exposes four logical tables (pending queue, progress cache, sync
//! metadata, dead letters) behind a transactional interface. Backends only
//! implement the storage contract; ordering and retry policy live in the
//! queue manager.

mod memory;
mod migrations;
mod sqlite;

use std::fmt;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::{Error, Result};
use crate::models::{EventId, FailedEvent, Priority, ProgressEntry, QueuedEvent, SyncMetadata};

/// Logical tables a transaction can be scoped to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Queue,
    Progress,
    SyncMetadata,
    FailedEvents,
}

impl Table {
    pub const ALL: [Self; 4] = [
        Self::Queue,
        Self::Progress,
        Self::SyncMetadata,
        Self::FailedEvents,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Self::Queue => "queue",
            Self::Progress => "progress",
            Self::SyncMetadata => "sync_metadata",
            Self::FailedEvents => "failed_events",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Transaction access mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    ReadOnly,
    ReadWrite,
}

/// Tables and mode a transaction was opened with.
///
/// Every table operation checks the scope first; a violation aborts the
/// transaction instead of touching data it did not declare.
#[derive(Debug, Clone)]
pub struct TxScope {
    tables: Vec<Table>,
    mode: TxMode,
}

impl TxScope {
    pub fn new(tables: &[Table], mode: TxMode) -> Self {
        Self {
            tables: tables.to_vec(),
            mode,
        }
    }

    pub const fn mode(&self) -> TxMode {
        self.mode
    }

    pub fn check_read(&self, table: Table) -> Result<()> {
        if self.tables.contains(&table) {
            Ok(())
        } else {
            Err(Error::TransactionAborted(format!(
                "table '{table}' is outside the transaction scope"
            )))
        }
    }

    pub fn check_write(&self, table: Table) -> Result<()> {
        self.check_read(table)?;
        if self.mode == TxMode::ReadOnly {
            return Err(Error::TransactionAborted(format!(
                "write to '{table}' inside a read-only transaction"
            )));
        }
        Ok(())
    }
}

/// Filter for ordered queue scans
#[derive(Debug, Clone, Copy, Default)]
pub struct EventScan<'a> {
    /// Restrict to one partition
    pub partition_key: Option<&'a str>,
    /// Maximum rows returned
    pub limit: Option<usize>,
}

/// Queued events sharing a priority band and retry state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueTally {
    pub priority: Priority,
    /// At least one failed attempt
    pub retrying: bool,
    pub count: usize,
    pub oldest_queued_at: i64,
}

/// Table operations available inside a transaction.
///
/// Nothing is visible to other transactions until [`Transaction::commit`];
/// dropping an uncommitted transaction rolls it back.
pub trait Transaction {
    /// Get a queued event by ID
    fn get_event(&mut self, id: &EventId) -> Result<Option<QueuedEvent>>;

    /// Insert or replace a queued event
    fn put_event(&mut self, event: &QueuedEvent) -> Result<()>;

    /// Delete a queued event, returning whether it existed
    fn delete_event(&mut self, id: &EventId) -> Result<bool>;

    /// Queued events ordered by priority, then `queued_at`, then id
    fn scan_events(&mut self, scan: EventScan<'_>) -> Result<Vec<QueuedEvent>>;

    /// Number of queued events
    fn count_events(&mut self) -> Result<usize>;

    /// Per-band counts of queued events, without loading payloads
    fn tally_events(&mut self) -> Result<Vec<QueueTally>>;

    /// Up to `count` ids in eviction order: lowest priority first, oldest first
    fn eviction_candidates(&mut self, count: usize) -> Result<Vec<EventId>>;

    /// Get a dead-lettered event by ID
    fn get_failed(&mut self, id: &EventId) -> Result<Option<FailedEvent>>;

    /// Insert or replace a dead-lettered event
    fn put_failed(&mut self, event: &FailedEvent) -> Result<()>;

    /// Delete a dead-lettered event, returning whether it existed
    fn delete_failed(&mut self, id: &EventId) -> Result<bool>;

    /// Dead-lettered events ordered by `failed_at`, optionally filtered by review flag
    fn scan_failed(&mut self, reviewed: Option<bool>) -> Result<Vec<FailedEvent>>;

    /// Number of dead-lettered events, optionally filtered by review flag
    fn count_failed(&mut self, reviewed: Option<bool>) -> Result<usize>;

    /// Get a cached progress row by key
    fn get_progress(&mut self, key: &str) -> Result<Option<ProgressEntry>>;

    /// Insert or replace a cached progress row
    fn put_progress(&mut self, entry: &ProgressEntry) -> Result<()>;

    /// Cached progress rows, optionally filtered by sync flag
    fn scan_progress(&mut self, synced: Option<bool>) -> Result<Vec<ProgressEntry>>;

    /// Load the sync metadata singleton, if it was ever written
    fn get_metadata(&mut self) -> Result<Option<SyncMetadata>>;

    /// Write the sync metadata singleton
    fn put_metadata(&mut self, metadata: &SyncMetadata) -> Result<()>;

    /// Commit every write made in this transaction
    fn commit(self: Box<Self>) -> Result<()>;
}

/// A transactional key/value store backing the queue
pub trait Store: Send + Sync {
    /// Short backend name used in logs
    fn backend(&self) -> &'static str;

    /// Begin a transaction with exclusive access to `tables`
    fn begin(&self, tables: &[Table], mode: TxMode) -> Result<Box<dyn Transaction + '_>>;

    /// Drop every table's contents. Test and reset flows only.
    fn delete_store(&self) -> Result<()>;
}

/// Closure-style transactions on top of [`Store::begin`]
pub trait StoreExt: Store {
    /// Run `body` inside a transaction; its writes commit atomically or not at all
    fn run_transaction<T>(
        &self,
        tables: &[Table],
        mode: TxMode,
        body: impl FnOnce(&mut dyn Transaction) -> Result<T>,
    ) -> Result<T> {
        let mut tx = self.begin(tables, mode)?;
        let value = body(tx.as_mut())?;
        tx.commit()?;
        Ok(value)
    }
}

impl<S: Store + ?Sized> StoreExt for S {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewEvent, Priority};
    use serde_json::json;

    fn event(id: &str, priority: Priority, queued_at: i64) -> QueuedEvent {
        QueuedEvent::from_new(
            NewEvent::new(json!({ "id": id })).with_id(id),
            priority,
            queued_at,
        )
    }

    fn stores() -> Vec<Box<dyn Store>> {
        vec![
            Box::new(MemoryStore::new()),
            Box::new(SqliteStore::open_in_memory().unwrap()),
        ]
    }

    #[test]
    fn test_scope_rejects_undeclared_table() {
        for store in stores() {
            let result = store.run_transaction(&[Table::Queue], TxMode::ReadWrite, |tx| {
                tx.get_metadata()
            });
            assert!(
                matches!(result, Err(Error::TransactionAborted(_))),
                "{} allowed an undeclared table",
                store.backend()
            );
        }
    }

    #[test]
    fn test_read_only_rejects_writes() {
        for store in stores() {
            let result = store.run_transaction(&[Table::Queue], TxMode::ReadOnly, |tx| {
                tx.put_event(&event("a", Priority::Normal, 1))
            });
            assert!(matches!(result, Err(Error::TransactionAborted(_))));
            let count = store
                .run_transaction(&[Table::Queue], TxMode::ReadOnly, |tx| tx.count_events())
                .unwrap();
            assert_eq!(count, 0);
        }
    }

    #[test]
    fn test_failed_body_rolls_back() {
        for store in stores() {
            let result: Result<()> =
                store.run_transaction(&[Table::Queue], TxMode::ReadWrite, |tx| {
                    tx.put_event(&event("a", Priority::Normal, 1))?;
                    Err(Error::InvalidInput("boom".into()))
                });
            assert!(result.is_err());

            let found = store
                .run_transaction(&[Table::Queue], TxMode::ReadOnly, |tx| {
                    tx.get_event(&EventId::from("a"))
                })
                .unwrap();
            assert!(found.is_none(), "{} kept a rolled back write", store.backend());
        }
    }

    #[test]
    fn test_scan_orders_by_priority_then_age() {
        for store in stores() {
            store
                .run_transaction(&[Table::Queue], TxMode::ReadWrite, |tx| {
                    tx.put_event(&event("low-old", Priority::Low, 1))?;
                    tx.put_event(&event("normal-new", Priority::Normal, 9))?;
                    tx.put_event(&event("high-new", Priority::High, 8))?;
                    tx.put_event(&event("normal-old", Priority::Normal, 2))?;
                    Ok(())
                })
                .unwrap();

            let ids: Vec<String> = store
                .run_transaction(&[Table::Queue], TxMode::ReadOnly, |tx| {
                    tx.scan_events(EventScan::default())
                })
                .unwrap()
                .into_iter()
                .map(|event| event.id.to_string())
                .collect();
            assert_eq!(ids, ["high-new", "normal-old", "normal-new", "low-old"]);

            let evict: Vec<String> = store
                .run_transaction(&[Table::Queue], TxMode::ReadOnly, |tx| {
                    tx.eviction_candidates(2)
                })
                .unwrap()
                .into_iter()
                .map(|id| id.to_string())
                .collect();
            assert_eq!(evict, ["low-old", "normal-old"]);
        }
    }

    #[test]
    fn test_tally_groups_by_band_and_retry_state() {
        for store in stores() {
            store
                .run_transaction(&[Table::Queue, Table::FailedEvents], TxMode::ReadWrite, |tx| {
                    tx.put_event(&event("high", Priority::High, 7))?;
                    tx.put_event(&event("low-a", Priority::Low, 3))?;
                    tx.put_event(&event("low-b", Priority::Low, 5))?;
                    let mut retried = event("low-c", Priority::Low, 1);
                    retried.attempts = 2;
                    tx.put_event(&retried)?;
                    let mut reviewed =
                        FailedEvent::from_exhausted(event("dead-a", Priority::Normal, 1), 10);
                    reviewed.reviewed = true;
                    tx.put_failed(&reviewed)?;
                    tx.put_failed(&FailedEvent::from_exhausted(
                        event("dead-b", Priority::Normal, 2),
                        11,
                    ))
                })
                .unwrap();

            let (mut tally, unreviewed, failed) = store
                .run_transaction(&[Table::Queue, Table::FailedEvents], TxMode::ReadOnly, |tx| {
                    Ok((tx.tally_events()?, tx.count_failed(Some(false))?, tx.count_failed(None)?))
                })
                .unwrap();
            tally.sort_by_key(|row| (row.priority.rank(), row.retrying));
            assert_eq!(
                tally,
                vec![
                    QueueTally {
                        priority: Priority::High,
                        retrying: false,
                        count: 1,
                        oldest_queued_at: 7,
                    },
                    QueueTally {
                        priority: Priority::Low,
                        retrying: false,
                        count: 2,
                        oldest_queued_at: 3,
                    },
                    QueueTally {
                        priority: Priority::Low,
                        retrying: true,
                        count: 1,
                        oldest_queued_at: 1,
                    },
                ],
                "{} tallied the queue wrong",
                store.backend()
            );
            assert_eq!((unreviewed, failed), (1, 2));
        }
    }

    #[test]
    fn test_scan_filters_partition_and_limit() {
        for store in stores() {
            store
                .run_transaction(&[Table::Queue], TxMode::ReadWrite, |tx| {
                    let mut a = event("a", Priority::Normal, 1);
                    a.partition_key = Some("org-1".into());
                    let mut b = event("b", Priority::Normal, 2);
                    b.partition_key = Some("org-2".into());
                    let mut c = event("c", Priority::Normal, 3);
                    c.partition_key = Some("org-1".into());
                    tx.put_event(&a)?;
                    tx.put_event(&b)?;
                    tx.put_event(&c)
                })
                .unwrap();

            let scoped = store
                .run_transaction(&[Table::Queue], TxMode::ReadOnly, |tx| {
                    tx.scan_events(EventScan {
                        partition_key: Some("org-1"),
                        limit: Some(1),
                    })
                })
                .unwrap();
            assert_eq!(scoped.len(), 1);
            assert_eq!(scoped[0].id.as_str(), "a");
        }
    }

    #[test]
    fn test_metadata_and_failed_round_trip() {
        for store in stores() {
            let metadata = SyncMetadata {
                last_sync_at: Some(5),
                consecutive_failures: 2,
                total_synced: 10,
                ..SyncMetadata::default()
            };
            store
                .run_transaction(
                    &[Table::SyncMetadata, Table::FailedEvents],
                    TxMode::ReadWrite,
                    |tx| {
                        tx.put_metadata(&metadata)?;
                        tx.put_failed(&FailedEvent::from_exhausted(
                            event("dead", Priority::High, 1),
                            42,
                        ))
                    },
                )
                .unwrap();

            let (loaded, unreviewed) = store
                .run_transaction(
                    &[Table::SyncMetadata, Table::FailedEvents],
                    TxMode::ReadOnly,
                    |tx| Ok((tx.get_metadata()?, tx.scan_failed(Some(false))?)),
                )
                .unwrap();
            assert_eq!(loaded, Some(metadata));
            assert_eq!(unreviewed.len(), 1);
            assert_eq!(unreviewed[0].failed_at, 42);
        }
    }

    #[test]
    fn test_delete_store_empties_tables() {
        for store in stores() {
            store
                .run_transaction(&[Table::Queue], TxMode::ReadWrite, |tx| {
                    tx.put_event(&event("a", Priority::Normal, 1))
                })
                .unwrap();
            store.delete_store().unwrap();
            let count = store
                .run_transaction(&[Table::Queue], TxMode::ReadOnly, |tx| tx.count_events())
                .unwrap();
            assert_eq!(count, 0);
        }
    }
}
