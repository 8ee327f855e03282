//! Sync status published to hosts

use serde::Serialize;
use std::fmt;

use crate::sync::transport::TransmitError;

/// Where the sync cycle currently is
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    #[default]
    Idle,
    Running,
    /// Waiting out the delay after a failed batch
    Backoff,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Backoff => "backoff",
        })
    }
}

/// Aggregate state for status displays
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub online: bool,
    pub phase: SyncPhase,
    pub is_syncing: bool,
    pub queue_size: usize,
    /// Events in the dead-letter table
    pub failed_count: usize,
    pub last_sync_at: Option<i64>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

/// What one sync cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Requests sent to the collector
    pub batches: usize,
    /// Events acknowledged by the collector
    pub sent: usize,
    /// Events settled without transmission (remote copy won, or duplicate)
    pub settled: usize,
    /// Failed attempts recorded for events that stay queued
    pub failed_attempts: usize,
    /// Events moved to the dead-letter table during this cycle
    pub dead_lettered: usize,
    /// Error of the last failed batch, unless a later batch went through
    pub last_error: Option<String>,
    /// The cycle ended early because `stop()` was called
    pub stopped: bool,
}

impl SyncReport {
    pub(crate) fn record_error(&mut self, error: &TransmitError) {
        self.last_error = Some(error.to_string());
    }
}

/// Result of a [`crate::sync::SyncService::sync`] call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    Completed(SyncReport),
    /// Client is offline; nothing was attempted
    Offline,
    /// Another cycle is running; nothing was attempted
    AlreadySyncing,
}
