//! Priority FIFO queue of pending statements
//!
//! The queue manager is the only component that mutates queue and
//! dead-letter rows. Every operation is a single store transaction, and
//! change listeners run after the commit, never inside it.

mod dead_letter;
mod progress;
mod stats;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

pub use stats::{PriorityCounts, QueueStats};

use crate::db::{EventScan, Store, StoreExt, Table, Transaction, TxMode};
use crate::error::Result;
use crate::models::{EventId, FailedEvent, NewEvent, Priority, QueuedEvent};
use crate::observer::{ListenerRegistry, Subscription};
use crate::util::{system_clock, Clock};

/// Default retry budget before an event is dead-lettered
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default cap on pending events
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 1000;

/// Queue limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// Failed attempts after which an event moves to the dead-letter table
    pub max_retries: u32,
    /// Pending events kept before low-priority backlog is evicted
    pub max_queue_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
        }
    }
}

/// Committed mutation reported to queue listeners
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueChange {
    Enqueued {
        ids: Vec<EventId>,
        /// Entries dropped to get back under the size cap
        evicted: Vec<EventId>,
    },
    Removed {
        ids: Vec<EventId>,
    },
    AttemptFailed {
        id: EventId,
        attempts: u32,
    },
    DeadLettered {
        id: EventId,
    },
    FailedReviewed {
        id: EventId,
    },
    FailedRetried {
        id: EventId,
    },
    FailedDeleted {
        id: EventId,
    },
    Cleared {
        partition_key: Option<String>,
        count: usize,
    },
}

/// FIFO-with-priority queue on top of a [`Store`]
pub struct QueueManager {
    store: Arc<dyn Store>,
    config: QueueConfig,
    listeners: ListenerRegistry<QueueChange>,
    clock: Clock,
    last_stamp: AtomicI64,
}

impl QueueManager {
    /// Create a queue manager over the given store
    pub fn new(store: Arc<dyn Store>, config: QueueConfig) -> Self {
        Self {
            store,
            config,
            listeners: ListenerRegistry::new(),
            clock: system_clock(),
            last_stamp: AtomicI64::new(i64::MIN),
        }
    }

    /// Replace the wall clock (tests and simulations)
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub const fn config(&self) -> QueueConfig {
        self.config
    }

    pub(crate) fn now(&self) -> i64 {
        (self.clock)()
    }

    /// Enqueue timestamp, strictly increasing within this manager so that
    /// entries enqueued in the same millisecond keep their call order
    fn stamp(&self) -> i64 {
        let now = self.now();
        let previous = self
            .last_stamp
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last.saturating_add(1)))
            })
            .unwrap_or(now);
        now.max(previous.saturating_add(1))
    }

    /// Register a listener for committed queue mutations
    pub fn on_queue_change(
        &self,
        listener: impl Fn(&QueueChange) + Send + Sync + 'static,
    ) -> Subscription {
        self.listeners.subscribe(listener)
    }

    fn notify(&self, change: &QueueChange) {
        self.listeners.notify(change);
    }

    /// Enqueue one event; see [`QueueManager::enqueue_batch`]
    pub fn enqueue(&self, event: NewEvent, priority: Priority) -> Result<QueuedEvent> {
        let mut stored = self.enqueue_batch(vec![event], priority)?;
        Ok(stored.remove(0))
    }

    /// Upsert events in one transaction, then enforce the size cap.
    ///
    /// A new id gets a fresh `queued_at`. An id already in the queue keeps its
    /// original `queued_at` and retry history; only payload, priority and
    /// partition are refreshed.
    pub fn enqueue_batch(
        &self,
        events: Vec<NewEvent>,
        priority: Priority,
    ) -> Result<Vec<QueuedEvent>> {
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let max_queue_size = self.config.max_queue_size;
        let (stored, evicted) =
            self.store
                .run_transaction(&[Table::Queue], TxMode::ReadWrite, |tx| {
                    let mut stored = Vec::with_capacity(events.len());
                    for event in events {
                        let existing = match &event.id {
                            Some(id) => tx.get_event(id)?,
                            None => None,
                        };
                        let queued = match existing {
                            Some(existing) => QueuedEvent {
                                payload: event.payload,
                                priority,
                                partition_key: event.partition_key.or(existing.partition_key),
                                ..existing
                            },
                            None => QueuedEvent::from_new(event, priority, self.stamp()),
                        };
                        tx.put_event(&queued)?;
                        stored.push(queued);
                    }
                    let evicted = enforce_cap(tx, max_queue_size)?;
                    Ok((stored, evicted))
                })?;

        if !evicted.is_empty() {
            tracing::warn!(
                "Queue over capacity ({}); evicted {} low-priority event(s)",
                max_queue_size,
                evicted.len()
            );
        }
        tracing::debug!("Enqueued {} event(s) at {} priority", stored.len(), priority);

        self.notify(&QueueChange::Enqueued {
            ids: stored.iter().map(|event| event.id.clone()).collect(),
            evicted,
        });
        Ok(stored)
    }

    /// Peek up to `limit` events in delivery order without removing them.
    ///
    /// Removal is a separate step so nothing leaves the queue before the
    /// collector acknowledged it.
    pub fn dequeue_batch(&self, limit: usize) -> Result<Vec<QueuedEvent>> {
        self.peek(EventScan {
            partition_key: None,
            limit: Some(limit),
        })
    }

    /// Like [`QueueManager::dequeue_batch`], scoped to one partition
    pub fn dequeue_partition(&self, partition_key: &str, limit: usize) -> Result<Vec<QueuedEvent>> {
        self.peek(EventScan {
            partition_key: Some(partition_key),
            limit: Some(limit),
        })
    }

    fn peek(&self, scan: EventScan<'_>) -> Result<Vec<QueuedEvent>> {
        if scan.limit == Some(0) {
            return Ok(Vec::new());
        }
        self.store
            .run_transaction(&[Table::Queue], TxMode::ReadOnly, |tx| tx.scan_events(scan))
    }

    /// Get a queued event by ID
    pub fn get(&self, id: &EventId) -> Result<Option<QueuedEvent>> {
        self.store
            .run_transaction(&[Table::Queue], TxMode::ReadOnly, |tx| tx.get_event(id))
    }

    /// Delete delivered events. Ids no longer in the queue are ignored.
    pub fn remove_successful(&self, ids: &[EventId]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let removed = self
            .store
            .run_transaction(&[Table::Queue], TxMode::ReadWrite, |tx| {
                let mut removed = Vec::new();
                for id in ids {
                    if tx.delete_event(id)? {
                        removed.push(id.clone());
                    }
                }
                Ok(removed)
            })?;

        let count = removed.len();
        if count > 0 {
            self.notify(&QueueChange::Removed { ids: removed });
        }
        Ok(count)
    }

    /// Record a failed delivery attempt.
    ///
    /// Returns `true` when this attempt exhausted the retry budget and the
    /// event was moved to the dead-letter table in the same transaction.
    /// Unknown ids are ignored and return `false`.
    pub fn record_failed_attempt(&self, id: &EventId, error: &str) -> Result<bool> {
        let now = self.now();
        let max_retries = self.config.max_retries;

        let outcome = self.store.run_transaction(
            &[Table::Queue, Table::FailedEvents],
            TxMode::ReadWrite,
            |tx| {
                let Some(mut event) = tx.get_event(id)? else {
                    return Ok(None);
                };
                event.attempts = event.attempts.saturating_add(1);
                event.last_attempt_at = Some(now);
                event.last_error = Some(error.to_string());

                if event.attempts >= max_retries {
                    let attempts = event.attempts;
                    tx.delete_event(id)?;
                    tx.put_failed(&FailedEvent::from_exhausted(event, now))?;
                    Ok(Some((attempts, true)))
                } else {
                    let attempts = event.attempts;
                    tx.put_event(&event)?;
                    Ok(Some((attempts, false)))
                }
            },
        )?;

        match outcome {
            None => {
                tracing::debug!("Ignoring failed attempt for unknown event {}", id);
                Ok(false)
            }
            Some((attempts, true)) => {
                tracing::info!(
                    "Event {} moved to dead-letter after {} attempts: {}",
                    id,
                    attempts,
                    error
                );
                self.notify(&QueueChange::DeadLettered { id: id.clone() });
                Ok(true)
            }
            Some((attempts, false)) => {
                self.notify(&QueueChange::AttemptFailed {
                    id: id.clone(),
                    attempts,
                });
                Ok(false)
            }
        }
    }

    /// Number of pending events
    pub fn queue_size(&self) -> Result<usize> {
        self.store
            .run_transaction(&[Table::Queue], TxMode::ReadOnly, |tx| tx.count_events())
    }

    /// Drop every pending event of one partition
    pub fn clear_partition(&self, partition_key: &str) -> Result<usize> {
        self.clear_where(Some(partition_key))
    }

    /// Drop every pending event
    pub fn clear(&self) -> Result<usize> {
        self.clear_where(None)
    }

    fn clear_where(&self, partition_key: Option<&str>) -> Result<usize> {
        let count = self
            .store
            .run_transaction(&[Table::Queue], TxMode::ReadWrite, |tx| {
                let events = tx.scan_events(EventScan {
                    partition_key,
                    limit: None,
                })?;
                for event in &events {
                    tx.delete_event(&event.id)?;
                }
                Ok(events.len())
            })?;

        tracing::info!("Cleared {} queued event(s)", count);
        self.notify(&QueueChange::Cleared {
            partition_key: partition_key.map(str::to_string),
            count,
        });
        Ok(count)
    }
}

/// Evict lowest-priority, oldest entries until the queue fits `max_queue_size`
fn enforce_cap(tx: &mut dyn Transaction, max_queue_size: usize) -> Result<Vec<EventId>> {
    let count = tx.count_events()?;
    if count <= max_queue_size {
        return Ok(Vec::new());
    }

    let evicted = tx.eviction_candidates(count - max_queue_size)?;
    for id in &evicted {
        tx.delete_event(id)?;
    }
    Ok(evicted)
}
