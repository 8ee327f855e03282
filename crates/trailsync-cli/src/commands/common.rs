use std::io::{self, IsTerminal, Read};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use trailsync_core::conflict::StatementView;
use trailsync_core::sync::{Connectivity, ManualConnectivity};
use trailsync_core::{EngineConfig, EventId, FailedEvent, QueuedEvent, SyncEngine};

use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct QueuedItem {
    pub id: String,
    pub priority: String,
    pub summary: String,
    pub attempts: u32,
    pub queued_at: i64,
    pub relative_time: String,
    pub partition_key: Option<String>,
    pub last_error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct FailedItem {
    pub id: String,
    pub summary: String,
    pub attempts: u32,
    pub failed_at: i64,
    pub failed_at_iso: String,
    pub reviewed: bool,
    pub last_error: Option<String>,
}

/// Engine configuration from the environment, with the `--db-path` override applied
pub fn load_config(cli_db_path: Option<PathBuf>) -> Result<EngineConfig, CliError> {
    let mut config = EngineConfig::from_env()?;
    if let Some(path) = cli_db_path {
        config.db_path = path;
    }
    Ok(config)
}

/// Open the engine assuming the network is reachable.
///
/// One-shot commands try the collector directly; a failed request is charged
/// to the batch like any other transmission error.
pub fn open_engine(config: EngineConfig) -> Result<SyncEngine, CliError> {
    let connectivity: Arc<dyn Connectivity> = Arc::new(ManualConnectivity::new(true));
    Ok(SyncEngine::open(config, connectivity)?)
}

pub fn queued_to_item(event: &QueuedEvent) -> QueuedItem {
    let now_ms = Utc::now().timestamp_millis();
    QueuedItem {
        id: event.id.to_string(),
        priority: event.priority.to_string(),
        summary: statement_summary(&event.payload, 80),
        attempts: event.attempts,
        queued_at: event.queued_at,
        relative_time: format_relative_time(event.queued_at, now_ms),
        partition_key: event.partition_key.clone(),
        last_error: event.last_error.clone(),
    }
}

pub fn failed_to_item(failed: &FailedEvent) -> FailedItem {
    FailedItem {
        id: failed.id().to_string(),
        summary: statement_summary(&failed.event.payload, 80),
        attempts: failed.event.attempts,
        failed_at: failed.failed_at,
        failed_at_iso: format_timestamp(failed.failed_at),
        reviewed: failed.reviewed,
        last_error: failed.event.last_error.clone(),
    }
}

pub fn format_queued_lines(events: &[QueuedEvent]) -> Vec<String> {
    let now_ms = Utc::now().timestamp_millis();
    events
        .iter()
        .map(|event| {
            let short_id = short_id(&event.id);
            let summary = statement_summary(&event.payload, 40);
            let relative_time = format_relative_time(event.queued_at, now_ms);
            let priority = event.priority.as_str();

            if event.attempts == 0 {
                format!("{short_id:<13}  {priority:<6}  {summary:<40}  {relative_time}")
            } else {
                format!(
                    "{short_id:<13}  {priority:<6}  {summary:<40}  {relative_time:<10}  attempts={}",
                    event.attempts
                )
            }
        })
        .collect()
}

pub fn format_failed_lines(events: &[FailedEvent]) -> Vec<String> {
    events
        .iter()
        .map(|failed| {
            let marker = if failed.reviewed { "reviewed" } else { "new" };
            let error = failed.event.last_error.as_deref().unwrap_or("-");
            format!(
                "{}  {:<13}  {marker:<8}  {}  error={error}",
                format_timestamp(failed.failed_at),
                short_id(failed.id()),
                statement_summary(&failed.event.payload, 40),
            )
        })
        .collect()
}

pub fn short_id(id: &EventId) -> String {
    id.as_str().chars().take(13).collect()
}

/// One-line description of a statement: verb and object, falling back to the raw JSON
pub fn statement_summary(payload: &Value, max_chars: usize) -> String {
    let view = StatementView::new(payload);
    let summary = match (view.verb_id(), view.object_id()) {
        (Some(verb), Some(object)) => format!("{} {object}", last_segment(verb)),
        (Some(verb), None) => last_segment(verb).to_string(),
        _ => payload.to_string(),
    };
    truncate(&summary, max_chars)
}

fn last_segment(iri: &str) -> &str {
    iri.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty())
        .unwrap_or(iri)
}

pub fn truncate(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");

    if collapsed.chars().count() <= max_chars {
        collapsed
    } else {
        let take_len = max_chars.saturating_sub(3);
        let mut truncated = collapsed.chars().take(take_len).collect::<String>();
        truncated.push_str("...");
        truncated
    }
}

pub fn format_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else {
        format!("{}w ago", diff / week)
    }
}

/// Statement from the argument, or from piped stdin when the argument is absent
pub fn resolve_statement(argument: Option<&str>) -> Result<Value, CliError> {
    let raw = match argument.and_then(normalize_content) {
        Some(raw) => raw,
        None => read_piped_stdin()?.ok_or(CliError::EmptyStatement)?,
    };
    parse_statement(&raw)
}

pub fn parse_statement(raw: &str) -> Result<Value, CliError> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|error| CliError::InvalidStatement(error.to_string()))?;
    if value.is_object() {
        Ok(value)
    } else {
        Err(CliError::InvalidStatement(format!(
            "expected an object, got {}",
            truncate(raw, 40)
        )))
    }
}

pub fn normalize_content(content: &str) -> Option<String> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub fn normalize_event_id(id: &str) -> Result<EventId, CliError> {
    id.parse::<EventId>().map_err(|_| CliError::EmptyEventId)
}

pub fn read_piped_stdin() -> Result<Option<String>, CliError> {
    let stdin = io::stdin();
    if stdin.is_terminal() {
        return Ok(None);
    }

    let mut buffer = String::new();
    stdin.lock().read_to_string(&mut buffer)?;
    Ok(normalize_content(&buffer))
}

pub fn print_json(value: &impl Serialize) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
