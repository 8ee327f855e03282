//! Data models for trailsync

mod conflict;
mod event;
mod metadata;
mod progress;

pub use conflict::{AuditRecord, ConflictAction, ConflictResolution};
pub use event::{EventId, FailedEvent, NewEvent, Priority, QueuedEvent};
pub use metadata::SyncMetadata;
pub use progress::{progress_key, ProgressEntry};
