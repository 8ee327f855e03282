use trailsync_core::{Error, SyncEngine};

use crate::cli::FailedCommands;
use crate::commands::common::{
    failed_to_item, format_failed_lines, normalize_event_id, print_json, FailedItem,
};
use crate::error::CliError;

pub fn run_failed(engine: &SyncEngine, command: FailedCommands) -> Result<(), CliError> {
    match command {
        FailedCommands::List { unreviewed, json } => run_failed_list(engine, unreviewed, json),
        FailedCommands::Review { id } => run_failed_review(engine, &id),
        FailedCommands::Retry { id } => run_failed_retry(engine, &id),
        FailedCommands::Delete { id } => run_failed_delete(engine, &id),
    }
}

fn run_failed_list(engine: &SyncEngine, unreviewed: bool, as_json: bool) -> Result<(), CliError> {
    let failed = if unreviewed {
        engine.queue().unreviewed_failed_events()?
    } else {
        engine.queue().failed_events()?
    };

    if as_json {
        let items = failed.iter().map(failed_to_item).collect::<Vec<FailedItem>>();
        return print_json(&items);
    }

    if failed.is_empty() {
        println!("No dead-lettered statements.");
        return Ok(());
    }
    for line in format_failed_lines(&failed) {
        println!("{line}");
    }
    Ok(())
}

fn run_failed_review(engine: &SyncEngine, id: &str) -> Result<(), CliError> {
    let id = normalize_event_id(id)?;
    let reviewed = engine.queue().mark_reviewed(&id).map_err(|error| match error {
        Error::NotFound(_) => CliError::FailedEventNotFound(id.to_string()),
        other => other.into(),
    })?;
    println!("{}", reviewed.id());
    Ok(())
}

fn run_failed_retry(engine: &SyncEngine, id: &str) -> Result<(), CliError> {
    let id = normalize_event_id(id)?;
    let requeued = engine
        .queue()
        .retry_failed_event(&id)
        .map_err(|error| match error {
            Error::NotFound(_) => CliError::FailedEventNotFound(id.to_string()),
            other => other.into(),
        })?;
    println!("{}", requeued.id);
    Ok(())
}

fn run_failed_delete(engine: &SyncEngine, id: &str) -> Result<(), CliError> {
    let id = normalize_event_id(id)?;
    if engine.queue().delete_failed_event(&id)? {
        println!("{id}");
    } else {
        println!("No dead-lettered statement with id {id}; nothing deleted.");
    }
    Ok(())
}
