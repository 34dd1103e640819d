use crate::backup::{self, BACKUP_TIMESTAMP};
use crate::config::Config;
use crate::error::Result;
use crate::io;
use crate::paths;
use chrono::{DateTime, Local};
use std::path::PathBuf;

/// Copy whatever persistent data `stack` left behind into
/// `<backup_dir>/archives/<stack>-<timestamp>`. Sources that no longer exist
/// are skipped.
pub fn archive_stack(config: &Config, stack: &str, now: DateTime<Local>) -> Result<PathBuf> {
    let dest = paths::archive_dir(
        &config.backup_dir(),
        stack,
        &now.format(BACKUP_TIMESTAMP).to_string(),
    );
    io::ensure_dir(&dest)?;
    let copied = backup::copy_stack_data(config, stack, &dest)?;
    tracing::info!(stack, dest = %dest.display(), entries = copied.len(), "stack archived");
    Ok(dest)
}
