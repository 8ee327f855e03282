use std::sync::Arc;
use std::time::Duration;

use trailsync_core::sync::{Connectivity, HttpConnectivity, SyncReport};
use trailsync_core::{EngineConfig, SyncEngine, SyncOutcome};

use crate::commands::common::print_json;
use crate::error::CliError;

pub async fn run_sync(engine: &SyncEngine, as_json: bool) -> Result<(), CliError> {
    let outcome = engine.sync().await?;

    if as_json {
        return print_json(&outcome);
    }
    println!("{}", describe_outcome(&outcome));
    Ok(())
}

pub fn describe_outcome(outcome: &SyncOutcome) -> String {
    match outcome {
        SyncOutcome::Offline => "Offline; nothing sent".to_string(),
        SyncOutcome::AlreadySyncing => "Another sync is already running".to_string(),
        SyncOutcome::Completed(report) => describe_report(report),
    }
}

fn describe_report(report: &SyncReport) -> String {
    let mut summary = format!(
        "Sync {}: sent {} in {} batch(es), settled {}",
        if report.stopped { "stopped" } else { "completed" },
        report.sent,
        report.batches,
        report.settled
    );
    if report.failed_attempts > 0 || report.dead_lettered > 0 {
        summary.push_str(&format!(
            ", {} failed attempt(s), {} dead-lettered",
            report.failed_attempts, report.dead_lettered
        ));
    }
    if let Some(error) = &report.last_error {
        summary.push_str(&format!(" (last error: {error})"));
    }
    summary
}

/// Run background sync with a polling connectivity monitor until Ctrl-C
pub async fn run_watch(
    config: EngineConfig,
    check_url: Option<String>,
    check_interval: Duration,
) -> Result<(), CliError> {
    let check_url = check_url
        .or_else(|| config.collector_url.clone())
        .ok_or_else(|| {
            CliError::Connectivity(
                "no connectivity URL (set TRAILSYNC_COLLECTOR_URL or --check-url)".into(),
            )
        })?;
    let connectivity: Arc<dyn Connectivity> = Arc::new(
        HttpConnectivity::spawn(check_url, check_interval, config.request_timeout)
            .map_err(|error| CliError::Connectivity(error.to_string()))?,
    );

    let engine = SyncEngine::open(config, connectivity)?;
    engine.sync_service()?;

    let _subscription = engine.on_status_change(|status| {
        tracing::info!(
            phase = %status.phase,
            online = status.online,
            queued = status.queue_size,
            failed = status.failed_count,
            "Sync status changed"
        );
    });

    engine.start();
    println!("Watching; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    engine.stop();
    println!("Stopped");
    Ok(())
}
