//! Conflict resolution models

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use super::event::EventId;

/// Which version of an event survives a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictAction {
    UseLocal,
    UseRemote,
    Merge,
    Skip,
}

impl ConflictAction {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UseLocal => "use_local",
            Self::UseRemote => "use_remote",
            Self::Merge => "merge",
            Self::Skip => "skip",
        }
    }

    /// Whether the resolved payload still has to be sent to the collector
    pub const fn needs_transmission(self) -> bool {
        matches!(self, Self::UseLocal | Self::Merge)
    }
}

impl fmt::Display for ConflictAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of resolving one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub action: ConflictAction,
    /// Local payload as queued
    pub local: Value,
    /// Remote counterpart, when one existed
    pub remote: Option<Value>,
    /// Payload that survives; `None` for [`ConflictAction::Skip`]
    pub resolved: Option<Value>,
    /// Human-readable explanation
    pub reason: String,
}

/// Audit entry for a resolution that involved a real remote counterpart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub event_id: EventId,
    /// Name of the strategy that decided
    pub strategy: String,
    pub resolution: ConflictResolution,
    /// When the decision was made (Unix ms)
    pub recorded_at: i64,
}
