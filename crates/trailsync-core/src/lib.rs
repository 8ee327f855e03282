//! trailsync-core - Offline durability and sync engine for learning telemetry
//!
//! Statements recorded while a learner is offline are persisted in a durable
//! priority queue, reconciled against the collector's copies, and delivered in
//! batches with retry, backoff and dead-lettering once connectivity returns.

pub mod config;
pub mod conflict;
pub mod db;
pub mod engine;
pub mod error;
pub mod models;
pub mod observer;
pub mod queue;
pub mod sync;
pub mod util;

pub use config::{ConfigError, EngineConfig};
pub use engine::{EngineParts, SyncEngine};
pub use error::{Error, Result};
pub use models::{EventId, FailedEvent, NewEvent, Priority, ProgressEntry, QueuedEvent};
pub use queue::{QueueManager, QueueStats};
pub use sync::{SyncOutcome, SyncService, SyncStatus};
