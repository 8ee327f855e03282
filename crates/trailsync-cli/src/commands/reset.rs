use trailsync_core::SyncEngine;

use crate::error::CliError;

pub fn run_reset(engine: &SyncEngine, confirmed: bool) -> Result<(), CliError> {
    if !confirmed {
        return Err(CliError::ResetNotConfirmed);
    }

    engine.delete_store()?;
    println!("Reset {}", engine.config().db_path.display());
    Ok(())
}
