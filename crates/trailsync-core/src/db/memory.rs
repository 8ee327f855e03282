//! In-memory store backend
//!
//! Transactions work on a snapshot of all tables and swap it in on commit,
//! so a failed or dropped transaction leaves no trace. Commit failures can be
//! injected to exercise the abort paths of callers.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::{EventScan, QueueTally, Store, Table, Transaction, TxMode, TxScope};
use crate::error::{Error, Result};
use crate::models::{EventId, FailedEvent, ProgressEntry, QueuedEvent, SyncMetadata};

#[derive(Debug, Clone, Default)]
struct Tables {
    queue: BTreeMap<EventId, QueuedEvent>,
    failed: BTreeMap<EventId, FailedEvent>,
    progress: BTreeMap<String, ProgressEntry>,
    metadata: Option<SyncMetadata>,
}

impl Tables {
    fn row_count(&self) -> usize {
        self.queue.len() + self.failed.len() + self.progress.len() + usize::from(self.metadata.is_some())
    }
}

/// Ephemeral store for tests and hosts without persistent storage
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    capacity: Option<usize>,
    failing_commits: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that aborts any commit leaving more than `max_rows` rows in total
    pub fn with_capacity(max_rows: usize) -> Self {
        Self {
            capacity: Some(max_rows),
            ..Self::default()
        }
    }

    /// Make the next `count` commits abort
    pub fn fail_next_commits(&self, count: usize) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| Error::StorageUnavailable("memory store lock poisoned".into()))
    }
}

impl Store for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    fn begin(&self, tables: &[Table], mode: TxMode) -> Result<Box<dyn Transaction + '_>> {
        let guard = self.lock()?;
        let working = guard.clone();
        Ok(Box::new(MemoryTransaction {
            guard,
            working,
            scope: TxScope::new(tables, mode),
            store: self,
        }))
    }

    fn delete_store(&self) -> Result<()> {
        *self.lock()? = Tables::default();
        Ok(())
    }
}

struct MemoryTransaction<'a> {
    guard: MutexGuard<'a, Tables>,
    working: Tables,
    scope: TxScope,
    store: &'a MemoryStore,
}

impl Transaction for MemoryTransaction<'_> {
    fn get_event(&mut self, id: &EventId) -> Result<Option<QueuedEvent>> {
        self.scope.check_read(Table::Queue)?;
        Ok(self.working.queue.get(id).cloned())
    }

    fn put_event(&mut self, event: &QueuedEvent) -> Result<()> {
        self.scope.check_write(Table::Queue)?;
        self.working.queue.insert(event.id.clone(), event.clone());
        Ok(())
    }

    fn delete_event(&mut self, id: &EventId) -> Result<bool> {
        self.scope.check_write(Table::Queue)?;
        Ok(self.working.queue.remove(id).is_some())
    }

    fn scan_events(&mut self, scan: EventScan<'_>) -> Result<Vec<QueuedEvent>> {
        self.scope.check_read(Table::Queue)?;
        let mut events: Vec<&QueuedEvent> = self
            .working
            .queue
            .values()
            .filter(|event| {
                scan.partition_key
                    .map_or(true, |key| event.partition_key.as_deref() == Some(key))
            })
            .collect();
        events.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
        Ok(events
            .into_iter()
            .take(scan.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    fn count_events(&mut self) -> Result<usize> {
        self.scope.check_read(Table::Queue)?;
        Ok(self.working.queue.len())
    }

    fn tally_events(&mut self) -> Result<Vec<QueueTally>> {
        self.scope.check_read(Table::Queue)?;
        let mut groups: BTreeMap<(i64, bool), QueueTally> = BTreeMap::new();
        for event in self.working.queue.values() {
            let retrying = event.attempts > 0;
            groups
                .entry((event.priority.rank(), retrying))
                .and_modify(|tally| {
                    tally.count += 1;
                    tally.oldest_queued_at = tally.oldest_queued_at.min(event.queued_at);
                })
                .or_insert(QueueTally {
                    priority: event.priority,
                    retrying,
                    count: 1,
                    oldest_queued_at: event.queued_at,
                });
        }
        Ok(groups.into_values().collect())
    }

    fn eviction_candidates(&mut self, count: usize) -> Result<Vec<EventId>> {
        self.scope.check_read(Table::Queue)?;
        let mut events: Vec<&QueuedEvent> = self.working.queue.values().collect();
        events.sort_by(|a, b| {
            b.priority
                .rank()
                .cmp(&a.priority.rank())
                .then(a.queued_at.cmp(&b.queued_at))
                .then(a.id.cmp(&b.id))
        });
        Ok(events
            .into_iter()
            .take(count)
            .map(|event| event.id.clone())
            .collect())
    }

    fn get_failed(&mut self, id: &EventId) -> Result<Option<FailedEvent>> {
        self.scope.check_read(Table::FailedEvents)?;
        Ok(self.working.failed.get(id).cloned())
    }

    fn put_failed(&mut self, event: &FailedEvent) -> Result<()> {
        self.scope.check_write(Table::FailedEvents)?;
        self.working.failed.insert(event.id().clone(), event.clone());
        Ok(())
    }

    fn delete_failed(&mut self, id: &EventId) -> Result<bool> {
        self.scope.check_write(Table::FailedEvents)?;
        Ok(self.working.failed.remove(id).is_some())
    }

    fn scan_failed(&mut self, reviewed: Option<bool>) -> Result<Vec<FailedEvent>> {
        self.scope.check_read(Table::FailedEvents)?;
        let mut events: Vec<FailedEvent> = self
            .working
            .failed
            .values()
            .filter(|event| reviewed.map_or(true, |flag| event.reviewed == flag))
            .cloned()
            .collect();
        events.sort_by(|a, b| a.failed_at.cmp(&b.failed_at).then_with(|| a.id().cmp(b.id())));
        Ok(events)
    }

    fn count_failed(&mut self, reviewed: Option<bool>) -> Result<usize> {
        self.scope.check_read(Table::FailedEvents)?;
        Ok(self
            .working
            .failed
            .values()
            .filter(|event| reviewed.map_or(true, |flag| event.reviewed == flag))
            .count())
    }

    fn get_progress(&mut self, key: &str) -> Result<Option<ProgressEntry>> {
        self.scope.check_read(Table::Progress)?;
        Ok(self.working.progress.get(key).cloned())
    }

    fn put_progress(&mut self, entry: &ProgressEntry) -> Result<()> {
        self.scope.check_write(Table::Progress)?;
        self.working.progress.insert(entry.key(), entry.clone());
        Ok(())
    }

    fn scan_progress(&mut self, synced: Option<bool>) -> Result<Vec<ProgressEntry>> {
        self.scope.check_read(Table::Progress)?;
        let mut entries: Vec<ProgressEntry> = self
            .working
            .progress
            .values()
            .filter(|entry| synced.map_or(true, |flag| entry.synced == flag))
            .cloned()
            .collect();
        entries.sort_by_key(|entry| entry.updated_at);
        Ok(entries)
    }

    fn get_metadata(&mut self) -> Result<Option<SyncMetadata>> {
        self.scope.check_read(Table::SyncMetadata)?;
        Ok(self.working.metadata.clone())
    }

    fn put_metadata(&mut self, metadata: &SyncMetadata) -> Result<()> {
        self.scope.check_write(Table::SyncMetadata)?;
        self.working.metadata = Some(metadata.clone());
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        let injected = self
            .store
            .failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::TransactionAborted("injected commit failure".into()));
        }

        if let Some(capacity) = self.store.capacity {
            let rows = self.working.row_count();
            if rows > capacity {
                return Err(Error::TransactionAborted(format!(
                    "storage quota exceeded ({rows} rows, capacity {capacity})"
                )));
            }
        }

        let working = std::mem::take(&mut self.working);
        *self.guard = working;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::StoreExt;
    use crate::models::{NewEvent, Priority};
    use serde_json::json;

    fn put(store: &MemoryStore, id: &str) -> Result<()> {
        store.run_transaction(&[Table::Queue], TxMode::ReadWrite, |tx| {
            tx.put_event(&QueuedEvent::from_new(
                NewEvent::new(json!({})).with_id(id),
                Priority::Normal,
                1,
            ))
        })
    }

    fn count(store: &MemoryStore) -> usize {
        store
            .run_transaction(&[Table::Queue], TxMode::ReadOnly, |tx| tx.count_events())
            .unwrap()
    }

    #[test]
    fn test_injected_commit_failure_discards_writes() {
        let store = MemoryStore::new();
        store.fail_next_commits(1);

        assert!(matches!(put(&store, "a"), Err(Error::TransactionAborted(_))));
        assert_eq!(count(&store), 0);

        put(&store, "a").unwrap();
        assert_eq!(count(&store), 1);
    }

    #[test]
    fn test_capacity_aborts_commit() {
        let store = MemoryStore::with_capacity(1);
        put(&store, "a").unwrap();

        assert!(matches!(put(&store, "b"), Err(Error::TransactionAborted(_))));
        assert_eq!(count(&store), 1);
    }
}
