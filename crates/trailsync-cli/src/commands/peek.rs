use trailsync_core::SyncEngine;

use crate::commands::common::{format_queued_lines, print_json, queued_to_item, QueuedItem};
use crate::error::CliError;

pub fn run_peek(engine: &SyncEngine, limit: usize, as_json: bool) -> Result<(), CliError> {
    let events = engine.queue().dequeue_batch(limit)?;

    if as_json {
        let items = events.iter().map(queued_to_item).collect::<Vec<QueuedItem>>();
        return print_json(&items);
    }

    if events.is_empty() {
        println!("Queue is empty.");
        return Ok(());
    }
    for line in format_queued_lines(&events) {
        println!("{line}");
    }
    Ok(())
}
