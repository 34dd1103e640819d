//! Copies of a stack's persistent data: the `config`, `dashboards` and
//! `dynamic` directories next to its definition, plus its directory in every
//! storage pool (stored as `pool_<name>`).

use crate::config::Config;
use crate::definition;
use crate::error::Result;
use crate::io;
use crate::paths;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::path::{Path, PathBuf};

pub const BACKUP_TIMESTAMP: &str = "%Y%m%d_%H%M%S";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupReport {
    pub stack: String,
    pub destination: PathBuf,
    /// Names of the copied entries under `destination`.
    pub copied: Vec<String>,
}

/// Copy every existing data source of `stack` into `dest`. Missing sources
/// are skipped.
pub fn copy_stack_data(config: &Config, stack: &str, dest: &Path) -> Result<Vec<String>> {
    let stack_dir = paths::stack_dir(&config.stacks_dir, stack);
    let mut sources: Vec<(PathBuf, String)> = paths::PERSISTENT_DIRS
        .iter()
        .map(|d| (stack_dir.join(d), d.to_string()))
        .collect();
    for (name, dir) in definition::pool_dirs(config, stack)? {
        sources.push((dir, format!("pool_{}", name.to_lowercase())));
    }

    let mut copied = Vec::new();
    for (src, name) in sources {
        if io::copy_dir_if_exists(&src, &dest.join(&name))? {
            tracing::debug!(stack, source = %src.display(), "copied");
            copied.push(name);
        }
    }
    Ok(copied)
}

/// Copy the stack's data into `<backup_dir>/<YYYYMMDD_HHMMSS>/<stack>`.
pub fn backup(config: &Config, stack: &str, now: DateTime<Local>) -> Result<BackupReport> {
    let destination = paths::backup_dest(
        &config.backup_dir(),
        &now.format(BACKUP_TIMESTAMP).to_string(),
        stack,
    );
    io::ensure_dir(&destination)?;
    let copied = copy_stack_data(config, stack, &destination)?;
    tracing::info!(stack, dest = %destination.display(), entries = copied.len(), "backup complete");
    Ok(BackupReport {
        stack: stack.to_string(),
        destination,
        copied,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvOverrides;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[test]
    fn copies_existing_sources_only() {
        let dir = TempDir::new().unwrap();
        let pool = dir.path().join("hdd");
        std::fs::create_dir_all(dir.path().join("stacks/media/config/sub")).unwrap();
        std::fs::write(dir.path().join("stacks/media/config/sub/app.ini"), "k=v").unwrap();
        std::fs::create_dir_all(pool.join("media")).unwrap();
        std::fs::write(pool.join("media/db.sqlite"), "data").unwrap();
        std::fs::write(
            dir.path().join(".stackr.yaml"),
            format!("paths:\n  pools:\n    hdd: {}\n    ssd: /nonexistent\n", pool.display()),
        )
        .unwrap();
        let config = Config::load(dir.path(), &EnvOverrides::default()).unwrap();

        let now = Local.with_ymd_and_hms(2024, 5, 1, 10, 30, 0).unwrap();
        let report = backup(&config, "media", now).unwrap();
        assert_eq!(report.copied, vec!["config", "pool_hdd"]);
        assert_eq!(
            report.destination,
            dir.path().join("backups/20240501_103000/media")
        );
        assert_eq!(
            std::fs::read_to_string(report.destination.join("config/sub/app.ini")).unwrap(),
            "k=v"
        );
        assert!(report.destination.join("pool_hdd/db.sqlite").is_file());
    }
}
