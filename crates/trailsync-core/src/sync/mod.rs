//! Sync service: batched delivery of queued statements to the collector
//!
//! One cycle at a time drains the queue in batches. Each batch is resolved
//! against server copies, sent as one request, and then either removed from
//! the queue or charged one failed attempt per event. Failed batches back off
//! exponentially before the next try.

mod backoff;
mod connectivity;
mod status;
mod transport;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

pub use backoff::{Backoff, DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX};
pub use connectivity::{Connectivity, HttpConnectivity, ManualConnectivity};
pub use status::{SyncOutcome, SyncPhase, SyncReport, SyncStatus};
pub use transport::{
    HttpTransport, HttpTransportConfig, OutgoingBatch, TransmitError, TransmitResult, Transport,
    TENANT_HEADER, XAPI_VERSION, XAPI_VERSION_HEADER,
};

use crate::conflict::ConflictResolver;
use crate::db::{Store, StoreExt, Table, TxMode};
use crate::error::Result;
use crate::models::{
    ConflictAction, ConflictResolution, EventId, ProgressEntry, QueuedEvent, SyncMetadata,
};
use crate::observer::{ListenerRegistry, Subscription};
use crate::queue::QueueManager;

/// Default number of events per request
pub const DEFAULT_BATCH_SIZE: usize = 25;
/// Default period of the background timer
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Sync service tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncConfig {
    pub batch_size: usize,
    pub sync_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Start a cycle as soon as connectivity comes back
    pub sync_on_reconnect: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            sync_interval: DEFAULT_SYNC_INTERVAL,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_max: DEFAULT_BACKOFF_MAX,
            sync_on_reconnect: true,
        }
    }
}

/// Collaborators of the sync service
pub struct SyncParts {
    pub store: Arc<dyn Store>,
    pub queue: Arc<QueueManager>,
    pub resolver: Arc<ConflictResolver>,
    pub transport: Arc<dyn Transport>,
    pub connectivity: Arc<dyn Connectivity>,
}

struct Inner {
    store: Arc<dyn Store>,
    queue: Arc<QueueManager>,
    resolver: Arc<ConflictResolver>,
    transport: Arc<dyn Transport>,
    connectivity: Arc<dyn Connectivity>,
    config: SyncConfig,
    syncing: AtomicBool,
    stop_requested: AtomicBool,
    stop_signal: Notify,
    phase: Mutex<SyncPhase>,
    backoff: Mutex<Backoff>,
    listeners: ListenerRegistry<SyncStatus>,
}

/// Delivers queued statements whenever the client is online
pub struct SyncService {
    inner: Arc<Inner>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

/// Holds the in-process cycle flag; releases it when dropped
struct CycleGuard<'a>(&'a AtomicBool);

impl<'a> CycleGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SyncService {
    /// Build the service, clearing a syncing flag left behind by a crashed process
    pub fn new(parts: SyncParts, config: SyncConfig) -> Result<Self> {
        let inner = Arc::new(Inner {
            store: parts.store,
            queue: parts.queue,
            resolver: parts.resolver,
            transport: parts.transport,
            connectivity: parts.connectivity,
            config,
            syncing: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            stop_signal: Notify::new(),
            phase: Mutex::new(SyncPhase::Idle),
            backoff: Mutex::new(Backoff::new(config.backoff_base, config.backoff_max)),
            listeners: ListenerRegistry::new(),
        });

        let stale = inner.update_metadata(|metadata| {
            let stale = metadata.is_syncing;
            metadata.is_syncing = false;
            stale
        })?;
        if stale {
            tracing::warn!("Cleared stale syncing flag left by an interrupted cycle");
        }

        Ok(Self {
            inner,
            driver: Mutex::new(None),
        })
    }

    pub fn config(&self) -> SyncConfig {
        self.inner.config
    }

    /// Run one sync cycle now.
    ///
    /// After [`SyncService::stop`] every cycle ends before its first batch
    /// until [`SyncService::start`] is called again.
    pub async fn sync(&self) -> Result<SyncOutcome> {
        Inner::sync(&self.inner).await
    }

    /// Current aggregate status
    pub fn status(&self) -> Result<SyncStatus> {
        self.inner.status()
    }

    /// Persisted sync bookkeeping
    pub fn metadata(&self) -> Result<SyncMetadata> {
        self.inner.metadata()
    }

    /// Register a listener for status changes
    pub fn on_status_change(
        &self,
        listener: impl Fn(&SyncStatus) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.listeners.subscribe(listener)
    }

    /// Spawn the background driver: periodic timer plus connectivity watcher.
    ///
    /// Must be called inside a tokio runtime. Calling it again while the
    /// driver runs has no effect.
    pub fn start(&self) {
        let Ok(mut driver) = self.driver.lock() else {
            return;
        };
        if driver.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        self.inner.stop_requested.store(false, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        *driver = Some(tokio::spawn(Inner::drive(inner)));
        tracing::info!(
            "Background sync started (every {}s)",
            self.inner.config.sync_interval.as_secs()
        );
    }

    /// Stop the driver and ask a running cycle to end after its in-flight batch.
    ///
    /// Does not wait for the cycle.
    pub fn stop(&self) {
        if let Ok(mut driver) = self.driver.lock() {
            if let Some(handle) = driver.take() {
                handle.abort();
                tracing::info!("Background sync stopped");
            }
        }
        self.inner.stop_requested.store(true, Ordering::SeqCst);
        self.inner.stop_signal.notify_waiters();
    }

    pub fn is_running(&self) -> bool {
        self.driver
            .lock()
            .map(|driver| driver.as_ref().is_some_and(|handle| !handle.is_finished()))
            .unwrap_or(false)
    }
}

impl Drop for SyncService {
    fn drop(&mut self) {
        if let Ok(mut driver) = self.driver.lock() {
            if let Some(handle) = driver.take() {
                handle.abort();
            }
        }
    }
}

impl Inner {
    async fn sync(inner: &Arc<Self>) -> Result<SyncOutcome> {
        if !inner.connectivity.is_online() {
            tracing::debug!("Skipping sync: offline");
            return Ok(SyncOutcome::Offline);
        }
        let Some(guard) = CycleGuard::acquire(&inner.syncing) else {
            tracing::debug!("Skipping sync: a cycle is already running");
            return Ok(SyncOutcome::AlreadySyncing);
        };

        inner.update_metadata(|metadata| metadata.is_syncing = true)?;
        inner.set_phase(SyncPhase::Running);

        let cycle = inner.run_cycle().await;
        let finished = inner.finish_cycle(&cycle);
        drop(guard);
        inner.set_phase(SyncPhase::Idle);

        let report = cycle?;
        finished?;
        tracing::info!(
            "Sync cycle finished: {} sent, {} settled, {} failed attempt(s), {} dead-lettered",
            report.sent,
            report.settled,
            report.failed_attempts,
            report.dead_lettered
        );
        Ok(SyncOutcome::Completed(report))
    }

    async fn run_cycle(&self) -> Result<SyncReport> {
        let mut report = SyncReport::default();

        loop {
            if self.stop_requested.load(Ordering::SeqCst) {
                report.stopped = true;
                break;
            }
            if !self.connectivity.is_online() {
                tracing::info!("Went offline; ending sync cycle");
                break;
            }

            let batch = self.next_batch()?;
            let Some(head) = batch.first() else {
                break;
            };
            let partition_key = head.partition_key.clone();

            let plan = self.resolve_batch(&batch).await;
            let (to_send, settled): (Vec<_>, Vec<_>) = plan
                .into_iter()
                .partition(|(_, resolution)| resolution.action.needs_transmission());

            if !settled.is_empty() {
                let ids: Vec<EventId> = settled.into_iter().map(|(id, _)| id).collect();
                report.settled += self.queue.remove_successful(&ids)?;
            }
            if to_send.is_empty() {
                continue;
            }

            let (ids, payloads): (Vec<EventId>, Vec<_>) = to_send
                .into_iter()
                .filter_map(|(id, resolution)| resolution.resolved.map(|payload| (id, payload)))
                .unzip();
            let outgoing = OutgoingBatch {
                partition_key,
                payloads,
            };

            report.batches += 1;
            tracing::debug!("Sending batch of {} statement(s)", ids.len());
            match self.transport.send_batch(&outgoing).await {
                Ok(()) => {
                    let delivered = ids.len();
                    self.queue.remove_successful(&ids)?;
                    self.with_backoff(Backoff::reset);
                    self.update_metadata(|metadata| {
                        metadata.consecutive_failures = 0;
                        metadata.total_synced += delivered as u64;
                    })?;
                    report.sent += delivered;
                    report.last_error = None;
                }
                Err(error) => {
                    tracing::warn!("Batch of {} statement(s) failed: {}", ids.len(), error);
                    report.record_error(&error);
                    let dead = self.charge_failed_batch(&ids, &error.to_string(), &mut report);
                    self.update_metadata(|metadata| {
                        metadata.consecutive_failures = metadata.consecutive_failures.saturating_add(1);
                        metadata.total_failed += dead as u64;
                        metadata.last_sync_error = Some(error.to_string());
                    })?;

                    if self.queue.queue_size()? == 0 {
                        break;
                    }
                    if !self.wait_backoff().await {
                        report.stopped = true;
                        break;
                    }
                }
            }
        }

        Ok(report)
    }

    /// Head-of-queue events sharing the partition of the first one
    fn next_batch(&self) -> Result<Vec<QueuedEvent>> {
        let mut batch = self.queue.dequeue_batch(self.config.batch_size.max(1))?;
        if let Some(partition) = batch.first().map(|event| event.partition_key.clone()) {
            batch.retain(|event| event.partition_key == partition);
        }
        Ok(batch)
    }

    async fn resolve_batch(&self, batch: &[QueuedEvent]) -> Vec<(EventId, ConflictResolution)> {
        let mut plan = Vec::with_capacity(batch.len());
        let mut kept: Vec<&QueuedEvent> = Vec::with_capacity(batch.len());

        for event in batch {
            if let Some(original) = kept
                .iter()
                .find(|original| self.resolver.is_duplicate(original, event))
            {
                plan.push((event.id.clone(), self.resolver.skip_duplicate(event, original)));
                continue;
            }

            let remote = if self.transport.supports_remote_lookup() {
                match self
                    .transport
                    .fetch_remote(&event.id, event.partition_key.as_deref())
                    .await
                {
                    Ok(remote) => remote,
                    Err(error) => {
                        tracing::warn!("Remote lookup for {} failed: {}", event.id, error);
                        None
                    }
                }
            } else {
                None
            };

            let resolution = self.resolver.resolve(event, remote.as_ref());
            if resolution.action != ConflictAction::Skip {
                kept.push(event);
            }
            plan.push((event.id.clone(), resolution));
        }
        plan
    }

    /// One failed attempt per event; bookkeeping errors are logged, not propagated
    fn charge_failed_batch(&self, ids: &[EventId], error: &str, report: &mut SyncReport) -> usize {
        let mut dead = 0;
        for id in ids {
            match self.queue.record_failed_attempt(id, error) {
                Ok(true) => dead += 1,
                Ok(false) => report.failed_attempts += 1,
                Err(storage) => {
                    tracing::warn!("Could not record failed attempt for {}: {}", id, storage);
                }
            }
        }
        report.dead_lettered += dead;
        dead
    }

    /// Sleep out the backoff delay; `false` when `stop()` interrupted it
    async fn wait_backoff(&self) -> bool {
        let delay = self.with_backoff(Backoff::next_delay);
        self.set_phase(SyncPhase::Backoff);
        tracing::debug!("Backing off for {:?}", delay);

        let stop = self.stop_signal.notified();
        tokio::pin!(stop);
        stop.as_mut().enable();
        let completed = if self.stop_requested.load(Ordering::SeqCst) {
            false
        } else {
            tokio::select! {
                () = tokio::time::sleep(delay) => true,
                () = &mut stop => false,
            }
        };

        self.set_phase(SyncPhase::Running);
        completed
    }

    fn finish_cycle(&self, cycle: &Result<SyncReport>) -> Result<()> {
        let now = self.queue.now();
        let last_error = match cycle {
            Ok(report) => report.last_error.clone(),
            Err(error) => Some(error.to_string()),
        };

        self.update_metadata(|metadata| {
            metadata.is_syncing = false;
            metadata.last_sync_at = Some(now);
            metadata.last_sync_error = last_error;
        })?;

        // A drained queue means every cached progress row is backed by
        // delivered statements
        if matches!(cycle, Ok(report) if report.last_error.is_none()) && self.queue.queue_size()? == 0 {
            let keys: Vec<String> = self
                .queue
                .unsynced_progress()?
                .iter()
                .map(ProgressEntry::key)
                .collect();
            if !keys.is_empty() {
                self.queue.mark_progress_synced(&keys)?;
            }
        }
        Ok(())
    }

    async fn drive(inner: Arc<Self>) {
        let mut online = inner.connectivity.watch();
        let mut ticker = tokio::time::interval(inner.config.sync_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => Self::spawn_cycle(&inner),
                changed = online.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let is_online = *online.borrow_and_update();
                    tracing::info!("Connectivity changed: {}", if is_online { "online" } else { "offline" });
                    inner.publish_status();
                    if is_online && inner.config.sync_on_reconnect {
                        Self::spawn_cycle(&inner);
                    }
                }
            }
        }
    }

    /// Run a cycle on its own task so aborting the driver leaves it running
    fn spawn_cycle(inner: &Arc<Self>) {
        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            if let Err(error) = Self::sync(&inner).await {
                tracing::warn!("Background sync failed: {}", error);
            }
        });
    }

    fn with_backoff<T>(&self, f: impl FnOnce(&mut Backoff) -> T) -> T {
        match self.backoff.lock() {
            Ok(mut backoff) => f(&mut backoff),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    fn set_phase(&self, phase: SyncPhase) {
        if let Ok(mut current) = self.phase.lock() {
            *current = phase;
        }
        self.publish_status();
    }

    fn phase(&self) -> SyncPhase {
        self.phase.lock().map(|phase| *phase).unwrap_or_default()
    }

    fn publish_status(&self) {
        if self.listeners.is_empty() {
            return;
        }
        match self.status() {
            Ok(status) => self.listeners.notify(&status),
            Err(error) => tracing::warn!("Could not build sync status: {}", error),
        }
    }

    fn status(&self) -> Result<SyncStatus> {
        let metadata = self.metadata()?;
        let stats = self.queue.queue_stats()?;
        Ok(SyncStatus {
            online: self.connectivity.is_online(),
            phase: self.phase(),
            is_syncing: self.syncing.load(Ordering::SeqCst),
            queue_size: stats.total,
            failed_count: stats.failed,
            last_sync_at: metadata.last_sync_at,
            last_error: metadata.last_sync_error,
            consecutive_failures: metadata.consecutive_failures,
        })
    }

    fn metadata(&self) -> Result<SyncMetadata> {
        self.store
            .run_transaction(&[Table::SyncMetadata], TxMode::ReadOnly, |tx| {
                Ok(tx.get_metadata()?.unwrap_or_default())
            })
    }

    /// Read-modify-write of the metadata singleton, created on first use
    fn update_metadata<T>(&self, update: impl FnOnce(&mut SyncMetadata) -> T) -> Result<T> {
        self.store
            .run_transaction(&[Table::SyncMetadata], TxMode::ReadWrite, |tx| {
                let mut metadata = tx.get_metadata()?.unwrap_or_default();
                let value = update(&mut metadata);
                tx.put_metadata(&metadata)?;
                Ok(value)
            })
    }
}
