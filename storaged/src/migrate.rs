use std::error::Error;

use crate::cli::MigrateCmd;

/// Runs the `migrate-crawler-state` subcommand (spec.md §4.J): detects a
/// legacy pickled state file and rewrites it as JSON, in place. A no-op
/// (and success) if the file is already JSON, so the command is safe to
/// run more than once.
pub async fn migrate_crawler_state(cmd: &MigrateCmd) -> Result<(), Box<dyn Error>> {
    let migrated = storage_crawler::migrate_legacy_pickle_file(&cmd.state_path)?;
    if migrated {
        log::info!("migrated {} from pickle to JSON", cmd.state_path.display());
    } else {
        log::info!("{} is already JSON, nothing to do", cmd.state_path.display());
    }
    Ok(())
}
