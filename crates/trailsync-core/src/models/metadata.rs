//! Sync metadata model

use serde::{Deserialize, Serialize};

/// Process-wide sync bookkeeping, persisted as a singleton row.
///
/// Written only by the sync service; read by status displays.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMetadata {
    /// Completion time of the last sync cycle (Unix ms)
    pub last_sync_at: Option<i64>,
    /// Error of the last cycle, cleared by a clean cycle
    pub last_sync_error: Option<String>,
    /// Failed batches since the last successful one
    pub consecutive_failures: u32,
    /// Mirror of the in-process cycle flag, for other processes sharing the store
    pub is_syncing: bool,
    /// Events acknowledged by the collector, all time
    pub total_synced: u64,
    /// Events promoted to the dead-letter table, all time
    pub total_failed: u64,
}
