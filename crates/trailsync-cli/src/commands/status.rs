use trailsync_core::sync::SyncStatus;
use trailsync_core::{QueueStats, SyncEngine};

use crate::commands::common::{format_relative_time, format_timestamp, print_json};
use crate::error::CliError;

pub fn run_status(engine: &SyncEngine, as_json: bool) -> Result<(), CliError> {
    let status = engine.status()?;
    if as_json {
        return print_json(&status);
    }

    for line in format_status_lines(&status, engine.config().collector_url.as_deref()) {
        println!("{line}");
    }
    Ok(())
}

pub fn run_stats(engine: &SyncEngine, as_json: bool) -> Result<(), CliError> {
    let stats = engine.queue_stats()?;
    if as_json {
        return print_json(&stats);
    }

    for line in format_stats_lines(&stats, chrono::Utc::now().timestamp_millis()) {
        println!("{line}");
    }
    Ok(())
}

pub fn format_status_lines(status: &SyncStatus, collector: Option<&str>) -> Vec<String> {
    let mut lines = vec![
        format!("collector: {}", collector.unwrap_or("not configured")),
        format!("phase: {}", status.phase),
        format!("queued: {}", status.queue_size),
        format!("failed: {}", status.failed_count),
        format!(
            "last sync: {}",
            status
                .last_sync_at
                .map_or_else(|| "never".to_string(), format_timestamp)
        ),
    ];
    if status.consecutive_failures > 0 {
        lines.push(format!(
            "consecutive failures: {}",
            status.consecutive_failures
        ));
    }
    if let Some(error) = &status.last_error {
        lines.push(format!("last error: {error}"));
    }
    lines
}

pub fn format_stats_lines(stats: &QueueStats, now_ms: i64) -> Vec<String> {
    let mut lines = vec![
        format!(
            "queued: {} (high {}, normal {}, low {})",
            stats.total, stats.by_priority.high, stats.by_priority.normal, stats.by_priority.low
        ),
        format!("fresh: {}  retrying: {}", stats.fresh, stats.retrying),
        format!(
            "failed: {} ({} unreviewed)",
            stats.failed, stats.unreviewed_failed
        ),
    ];
    if let Some(oldest) = stats.oldest_queued_at {
        lines.push(format!(
            "oldest: {}",
            format_relative_time(oldest, now_ms)
        ));
    }
    lines
}
