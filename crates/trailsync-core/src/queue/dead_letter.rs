//! Dead-letter review operations

use super::{enforce_cap, QueueChange, QueueManager};
use crate::db::{StoreExt, Table, TxMode};
use crate::error::{Error, Result};
use crate::models::{EventId, FailedEvent, QueuedEvent};

impl QueueManager {
    /// All dead letters, oldest promotion first
    pub fn failed_events(&self) -> Result<Vec<FailedEvent>> {
        self.scan_failed(None)
    }

    /// Dead letters not yet marked as reviewed
    pub fn unreviewed_failed_events(&self) -> Result<Vec<FailedEvent>> {
        self.scan_failed(Some(false))
    }

    fn scan_failed(&self, reviewed: Option<bool>) -> Result<Vec<FailedEvent>> {
        self.store
            .run_transaction(&[Table::FailedEvents], TxMode::ReadOnly, |tx| {
                tx.scan_failed(reviewed)
            })
    }

    /// Flag a dead letter as looked at
    pub fn mark_reviewed(&self, id: &EventId) -> Result<FailedEvent> {
        let failed = self
            .store
            .run_transaction(&[Table::FailedEvents], TxMode::ReadWrite, |tx| {
                let mut failed = tx
                    .get_failed(id)?
                    .ok_or_else(|| Error::NotFound(format!("failed event {id}")))?;
                failed.reviewed = true;
                tx.put_failed(&failed)?;
                Ok(failed)
            })?;

        self.notify(&QueueChange::FailedReviewed { id: id.clone() });
        Ok(failed)
    }

    /// Move a dead letter back into the queue with a fresh retry budget.
    ///
    /// Refused with [`Error::InvalidInput`] when an event with the same id is
    /// already queued, or when the queue cap would evict the retried event
    /// straight away. In both cases the dead letter stays where it is.
    pub fn retry_failed_event(&self, id: &EventId) -> Result<QueuedEvent> {
        let queued_at = self.stamp();
        let max_queue_size = self.config.max_queue_size;

        let (queued, evicted) = self.store.run_transaction(
            &[Table::Queue, Table::FailedEvents],
            TxMode::ReadWrite,
            |tx| {
                let failed = tx
                    .get_failed(id)?
                    .ok_or_else(|| Error::NotFound(format!("failed event {id}")))?;
                if tx.get_event(id)?.is_some() {
                    return Err(Error::InvalidInput(format!(
                        "event {id} is already queued; delete the dead letter instead"
                    )));
                }
                tx.delete_failed(id)?;

                let queued = QueuedEvent {
                    queued_at,
                    attempts: 0,
                    last_attempt_at: None,
                    ..failed.event
                };
                tx.put_event(&queued)?;
                let evicted = enforce_cap(tx, max_queue_size)?;
                if evicted.contains(id) {
                    return Err(Error::InvalidInput(format!(
                        "queue is full; retrying {id} would evict it immediately"
                    )));
                }
                Ok((queued, evicted))
            },
        )?;

        tracing::info!("Dead letter {} returned to the queue", id);
        self.notify(&QueueChange::FailedRetried { id: id.clone() });
        if !evicted.is_empty() {
            tracing::warn!("Queue over capacity; evicted {} event(s)", evicted.len());
            self.notify(&QueueChange::Enqueued {
                ids: Vec::new(),
                evicted,
            });
        }
        Ok(queued)
    }

    /// Purge a dead letter. Missing ids are not an error.
    pub fn delete_failed_event(&self, id: &EventId) -> Result<bool> {
        let deleted = self
            .store
            .run_transaction(&[Table::FailedEvents], TxMode::ReadWrite, |tx| {
                tx.delete_failed(id)
            })?;

        if deleted {
            self.notify(&QueueChange::FailedDeleted { id: id.clone() });
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use crate::db::MemoryStore;
    use crate::error::Error;
    use crate::models::{EventId, Priority};
    use crate::queue::tests::{manual_clock, statement};
    use crate::queue::{QueueConfig, QueueManager};
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    fn setup_with_dead_letter() -> (QueueManager, EventId, Arc<std::sync::atomic::AtomicI64>) {
        let (clock, now) = manual_clock(10);
        let queue = QueueManager::new(
            Arc::new(MemoryStore::new()),
            QueueConfig {
                max_retries: 1,
                ..QueueConfig::default()
            },
        )
        .with_clock(clock);
        let event = queue.enqueue(statement("doomed"), Priority::High).unwrap();
        assert!(queue.record_failed_attempt(&event.id, "HTTP 400").unwrap());
        (queue, event.id, now)
    }

    #[test]
    fn test_mark_reviewed() {
        let (queue, id, _) = setup_with_dead_letter();
        assert_eq!(queue.unreviewed_failed_events().unwrap().len(), 1);

        let reviewed = queue.mark_reviewed(&id).unwrap();
        assert!(reviewed.reviewed);
        assert!(queue.unreviewed_failed_events().unwrap().is_empty());
        assert_eq!(queue.failed_events().unwrap().len(), 1);
    }

    #[test]
    fn test_retry_resets_attempts_and_timestamp() {
        let (queue, id, now) = setup_with_dead_letter();
        now.store(5_000, Ordering::SeqCst);

        let queued = queue.retry_failed_event(&id).unwrap();
        assert_eq!(queued.attempts, 0);
        assert_eq!(queued.queued_at, 5_000);
        assert_eq!(queued.priority, Priority::High);
        assert_eq!(queued.last_error.as_deref(), Some("HTTP 400"));
        assert!(queue.failed_events().unwrap().is_empty());
        assert_eq!(queue.queue_size().unwrap(), 1);
    }

    #[test]
    fn test_retry_refused_while_same_id_is_queued() {
        let (queue, id, _) = setup_with_dead_letter();
        let replacement = queue.enqueue(statement("doomed"), Priority::Low).unwrap();
        assert_eq!(replacement.id, id);

        assert!(matches!(
            queue.retry_failed_event(&id),
            Err(Error::InvalidInput(_))
        ));
        assert_eq!(queue.get(&id).unwrap().unwrap().priority, Priority::Low);
        assert_eq!(queue.failed_events().unwrap().len(), 1);
    }

    #[test]
    fn test_retry_refused_when_cap_would_evict_it() {
        let (clock, _) = manual_clock(10);
        let queue = QueueManager::new(
            Arc::new(MemoryStore::new()),
            QueueConfig {
                max_retries: 1,
                max_queue_size: 1,
                ..QueueConfig::default()
            },
        )
        .with_clock(clock);
        let doomed = queue.enqueue(statement("doomed"), Priority::Low).unwrap();
        assert!(queue.record_failed_attempt(&doomed.id, "HTTP 400").unwrap());
        queue.enqueue(statement("keeper"), Priority::High).unwrap();

        assert!(matches!(
            queue.retry_failed_event(&doomed.id),
            Err(Error::InvalidInput(_))
        ));
        assert_eq!(queue.failed_events().unwrap().len(), 1);
        assert!(queue.get(&EventId::from("keeper")).unwrap().is_some());
        assert_eq!(queue.queue_size().unwrap(), 1);
    }

    #[test]
    fn test_missing_dead_letter_is_not_found() {
        let queue = QueueManager::new(Arc::new(MemoryStore::new()), QueueConfig::default());
        let missing = EventId::from("missing");

        assert!(matches!(queue.mark_reviewed(&missing), Err(Error::NotFound(_))));
        assert!(matches!(
            queue.retry_failed_event(&missing),
            Err(Error::NotFound(_))
        ));
        assert!(!queue.delete_failed_event(&missing).unwrap());
    }

    #[test]
    fn test_delete_failed_event_is_idempotent() {
        let (queue, id, _) = setup_with_dead_letter();
        assert!(queue.delete_failed_event(&id).unwrap());
        assert!(!queue.delete_failed_event(&id).unwrap());
        assert!(queue.failed_events().unwrap().is_empty());
    }
}
