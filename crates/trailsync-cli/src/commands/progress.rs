use trailsync_core::{ProgressEntry, SyncEngine};

use crate::commands::common::{format_timestamp, print_json};
use crate::error::CliError;

pub fn run_progress(engine: &SyncEngine, as_json: bool) -> Result<(), CliError> {
    let entries = engine.queue().unsynced_progress()?;

    if as_json {
        return print_json(&entries);
    }

    if entries.is_empty() {
        println!("All cached progress is synced.");
        return Ok(());
    }
    for line in format_progress_lines(&entries) {
        println!("{line}");
    }
    Ok(())
}

pub fn format_progress_lines(entries: &[ProgressEntry]) -> Vec<String> {
    entries
        .iter()
        .map(|entry| {
            let percent = entry.progress * 100.0;
            let score = entry
                .score
                .map_or_else(|| "-".to_string(), |score| format!("{score:.2}"));
            let done = if entry.completed { "completed" } else { "" };
            format!(
                "{}  {}  {}  {percent:>5.1}%  score={score}  {done}",
                format_timestamp(entry.updated_at),
                entry.actor_id,
                entry.activity_id,
            )
            .trim_end()
            .to_string()
        })
        .collect()
}
