//! Engine factory wiring store, queue, resolver and sync service together

use std::sync::Arc;

use serde_json::Value;

use crate::config::EngineConfig;
use crate::conflict::{ConflictResolver, ResolutionStrategy};
use crate::db::{MemoryStore, SqliteStore, Store, StoreExt, Table, TxMode};
use crate::error::{Error, Result};
use crate::models::{NewEvent, Priority, QueuedEvent, SyncMetadata};
use crate::observer::Subscription;
use crate::queue::{QueueManager, QueueStats};
use crate::sync::{
    Connectivity, HttpTransport, SyncOutcome, SyncParts, SyncPhase, SyncService, SyncStatus,
    Transport,
};

/// Explicit collaborators for [`SyncEngine::with_parts`]
pub struct EngineParts {
    pub store: Arc<dyn Store>,
    /// `None` leaves the engine queue-only; `sync()` then fails with `NotConfigured`
    pub transport: Option<Arc<dyn Transport>>,
    pub connectivity: Arc<dyn Connectivity>,
    /// Overrides the strategy selected in the configuration
    pub strategy: Option<Box<dyn ResolutionStrategy>>,
}

/// Producer-facing entry point owning every engine component
pub struct SyncEngine {
    config: EngineConfig,
    store: Arc<dyn Store>,
    queue: Arc<QueueManager>,
    resolver: Arc<ConflictResolver>,
    connectivity: Arc<dyn Connectivity>,
    sync: Option<SyncService>,
}

impl SyncEngine {
    /// Open the SQLite store at `config.db_path`, with an HTTP transport when a
    /// collector URL is configured
    pub fn open(config: EngineConfig, connectivity: Arc<dyn Connectivity>) -> Result<Self> {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&config.db_path)?);
        tracing::debug!("Opened store at {}", config.db_path.display());
        Self::with_default_transport(config, store, connectivity)
    }

    /// Engine over an ephemeral in-memory store
    pub fn in_memory(config: EngineConfig, connectivity: Arc<dyn Connectivity>) -> Result<Self> {
        Self::with_default_transport(config, Arc::new(MemoryStore::new()), connectivity)
    }

    fn with_default_transport(
        config: EngineConfig,
        store: Arc<dyn Store>,
        connectivity: Arc<dyn Connectivity>,
    ) -> Result<Self> {
        let transport = match config.transport_config() {
            Some(transport_config) => Some(Arc::new(
                HttpTransport::new(transport_config)
                    .map_err(|error| Error::InvalidInput(error.to_string()))?,
            ) as Arc<dyn Transport>),
            None => None,
        };
        Self::with_parts(
            config,
            EngineParts {
                store,
                transport,
                connectivity,
                strategy: None,
            },
        )
    }

    pub fn with_parts(config: EngineConfig, parts: EngineParts) -> Result<Self> {
        let queue = Arc::new(QueueManager::new(Arc::clone(&parts.store), config.queue_config()));
        let strategy = parts
            .strategy
            .unwrap_or_else(|| config.conflict_strategy.build(config.tie_break));
        let resolver = Arc::new(ConflictResolver::new(strategy, config.resolver_config()));

        let sync = match parts.transport {
            Some(transport) => Some(SyncService::new(
                SyncParts {
                    store: Arc::clone(&parts.store),
                    queue: Arc::clone(&queue),
                    resolver: Arc::clone(&resolver),
                    transport,
                    connectivity: Arc::clone(&parts.connectivity),
                },
                config.sync_config(),
            )?),
            None => None,
        };

        Ok(Self {
            config,
            store: parts.store,
            queue,
            resolver,
            connectivity: parts.connectivity,
            sync,
        })
    }

    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<QueueManager> {
        &self.queue
    }

    pub fn resolver(&self) -> &Arc<ConflictResolver> {
        &self.resolver
    }

    pub fn connectivity(&self) -> &Arc<dyn Connectivity> {
        &self.connectivity
    }

    /// The sync service, if a transport is configured
    pub fn sync_service(&self) -> Result<&SyncService> {
        self.sync.as_ref().ok_or_else(|| {
            Error::NotConfigured("no collector configured (set TRAILSYNC_COLLECTOR_URL)".into())
        })
    }

    pub fn enqueue(&self, payload: Value, priority: Priority) -> Result<QueuedEvent> {
        self.queue.enqueue(NewEvent::new(payload), priority)
    }

    pub fn enqueue_batch(
        &self,
        events: Vec<NewEvent>,
        priority: Priority,
    ) -> Result<Vec<QueuedEvent>> {
        self.queue.enqueue_batch(events, priority)
    }

    pub fn queue_stats(&self) -> Result<QueueStats> {
        self.queue.queue_stats()
    }

    /// Run one sync cycle now
    pub async fn sync(&self) -> Result<SyncOutcome> {
        self.sync_service()?.sync().await
    }

    /// Start background sync; no-op without a transport
    pub fn start(&self) {
        if let Some(sync) = &self.sync {
            sync.start();
        }
    }

    pub fn stop(&self) {
        if let Some(sync) = &self.sync {
            sync.stop();
        }
    }

    pub fn status(&self) -> Result<SyncStatus> {
        if let Some(sync) = &self.sync {
            return sync.status();
        }

        let metadata = self
            .store
            .run_transaction(&[Table::SyncMetadata], TxMode::ReadOnly, |tx| {
                Ok(tx.get_metadata()?.unwrap_or_default())
            })?;
        let stats = self.queue.queue_stats()?;
        Ok(SyncStatus {
            online: self.connectivity.is_online(),
            phase: SyncPhase::Idle,
            is_syncing: false,
            queue_size: stats.total,
            failed_count: stats.failed,
            last_sync_at: metadata.last_sync_at,
            last_error: metadata.last_sync_error,
            consecutive_failures: metadata.consecutive_failures,
        })
    }

    pub fn metadata(&self) -> Result<SyncMetadata> {
        self.store
            .run_transaction(&[Table::SyncMetadata], TxMode::ReadOnly, |tx| {
                Ok(tx.get_metadata()?.unwrap_or_default())
            })
    }

    /// Subscribe to status changes; without a transport the status never changes
    pub fn on_status_change(
        &self,
        listener: impl Fn(&SyncStatus) + Send + Sync + 'static,
    ) -> Option<Subscription> {
        self.sync.as_ref().map(|sync| sync.on_status_change(listener))
    }

    /// Destroy all persisted state
    pub fn delete_store(&self) -> Result<()> {
        self.stop();
        self.store.delete_store()?;
        tracing::warn!("Deleted {} store", self.store.backend());
        Ok(())
    }
}
