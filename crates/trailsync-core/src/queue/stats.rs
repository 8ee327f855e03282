//! Queue statistics

use serde::Serialize;

use super::QueueManager;
use crate::db::{StoreExt, Table, TxMode};
use crate::error::Result;
use crate::models::Priority;

/// Pending events per priority band
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PriorityCounts {
    pub high: usize,
    pub normal: usize,
    pub low: usize,
}

impl PriorityCounts {
    fn add(&mut self, priority: Priority, count: usize) {
        match priority {
            Priority::High => self.high += count,
            Priority::Normal => self.normal += count,
            Priority::Low => self.low += count,
        }
    }
}

/// Snapshot of queue and dead-letter counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Pending events
    pub total: usize,
    /// Pending events never attempted
    pub fresh: usize,
    /// Pending events with at least one failed attempt
    pub retrying: usize,
    pub by_priority: PriorityCounts,
    /// Events in the dead-letter table
    pub failed: usize,
    /// Dead letters nobody has reviewed yet
    pub unreviewed_failed: usize,
    /// Enqueue time of the oldest pending event (Unix ms)
    pub oldest_queued_at: Option<i64>,
}

impl QueueManager {
    /// Count pending and dead-lettered events in one read transaction
    pub fn queue_stats(&self) -> Result<QueueStats> {
        let (tally, failed, unreviewed_failed) = self.store.run_transaction(
            &[Table::Queue, Table::FailedEvents],
            TxMode::ReadOnly,
            |tx| {
                Ok((
                    tx.tally_events()?,
                    tx.count_failed(None)?,
                    tx.count_failed(Some(false))?,
                ))
            },
        )?;

        let mut stats = QueueStats {
            failed,
            unreviewed_failed,
            ..QueueStats::default()
        };
        for group in tally {
            stats.total += group.count;
            if group.retrying {
                stats.retrying += group.count;
            } else {
                stats.fresh += group.count;
            }
            stats.by_priority.add(group.priority, group.count);
            stats.oldest_queued_at = Some(
                stats
                    .oldest_queued_at
                    .map_or(group.oldest_queued_at, |oldest| oldest.min(group.oldest_queued_at)),
            );
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryStore, SqliteStore};
    use crate::models::EventId;
    use crate::queue::tests::{manual_clock, statement};
    use crate::queue::QueueConfig;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    #[test]
    fn test_stats_of_empty_queue() {
        let queue = QueueManager::new(Arc::new(MemoryStore::new()), QueueConfig::default());
        assert_eq!(queue.queue_stats().unwrap(), QueueStats::default());
    }

    #[test]
    fn test_stats_buckets() {
        let (clock, now) = manual_clock(50);
        let queue = QueueManager::new(
            Arc::new(MemoryStore::new()),
            QueueConfig {
                max_retries: 2,
                ..QueueConfig::default()
            },
        )
        .with_clock(clock);

        queue.enqueue(statement("a"), Priority::High).unwrap();
        now.store(60, Ordering::SeqCst);
        queue.enqueue(statement("b"), Priority::Low).unwrap();
        queue.enqueue(statement("c"), Priority::Low).unwrap();
        queue.enqueue(statement("d"), Priority::Normal).unwrap();

        queue
            .record_failed_attempt(&EventId::from("b"), "timeout")
            .unwrap();
        queue.record_failed_attempt(&EventId::from("d"), "503").unwrap();
        queue.record_failed_attempt(&EventId::from("d"), "503").unwrap();

        let stats = queue.queue_stats().unwrap();
        assert_eq!(
            stats,
            QueueStats {
                total: 3,
                fresh: 2,
                retrying: 1,
                by_priority: PriorityCounts {
                    high: 1,
                    normal: 0,
                    low: 2,
                },
                failed: 1,
                unreviewed_failed: 1,
                oldest_queued_at: Some(50),
            }
        );
    }

    #[test]
    fn test_stats_from_sqlite_store() {
        let (clock, now) = manual_clock(100);
        let queue = QueueManager::new(
            Arc::new(SqliteStore::open_in_memory().unwrap()),
            QueueConfig {
                max_retries: 1,
                ..QueueConfig::default()
            },
        )
        .with_clock(clock);

        queue.enqueue(statement("a"), Priority::Normal).unwrap();
        now.store(200, Ordering::SeqCst);
        queue.enqueue(statement("b"), Priority::Normal).unwrap();
        queue.enqueue(statement("c"), Priority::High).unwrap();
        assert!(queue
            .record_failed_attempt(&EventId::from("a"), "HTTP 400")
            .unwrap());
        queue.mark_reviewed(&EventId::from("a")).unwrap();

        let stats = queue.queue_stats().unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.fresh, 2);
        assert_eq!(stats.by_priority.high, 1);
        assert_eq!(stats.by_priority.normal, 1);
        assert_eq!((stats.failed, stats.unreviewed_failed), (1, 0));
        assert_eq!(stats.oldest_queued_at, Some(200));
    }
}
