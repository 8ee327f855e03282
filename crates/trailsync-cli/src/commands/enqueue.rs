use trailsync_core::{NewEvent, Priority, SyncEngine};

use crate::commands::common::resolve_statement;
use crate::error::CliError;

pub fn run_enqueue(
    engine: &SyncEngine,
    statement: Option<&str>,
    priority: Priority,
    partition: Option<&str>,
) -> Result<(), CliError> {
    let payload = resolve_statement(statement)?;
    let mut event = NewEvent::new(payload);
    if let Some(partition) = partition.map(str::trim).filter(|key| !key.is_empty()) {
        event = event.with_partition(partition);
    }

    let queued = engine.queue().enqueue(event, priority)?;
    println!("{}", queued.id);
    Ok(())
}
