use super::job::Job;
use crate::error::Result;
use crate::io;
use crate::paths;
use chrono::{DateTime, Local};
use std::io::Write;
use std::path::{Path, PathBuf};

const LOG_TIMESTAMP: &str = "%Y-%m-%d_%H-%M-%S";

/// Per-run log files: image pull output and the run itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobLogs {
    pub build: PathBuf,
    pub exec: PathBuf,
}

impl JobLogs {
    /// Create both files under `<logs_dir>/<stack>/`, each starting with a
    /// header block.
    pub fn create(logs_dir: &Path, job: &Job, now: DateTime<Local>) -> Result<Self> {
        let dir = paths::job_log_dir(logs_dir, &job.stack);
        io::ensure_dir(&dir)?;
        let stamp = now.format(LOG_TIMESTAMP);
        let logs = Self {
            build: dir.join(format!("{}-{stamp}.build.log", job.service)),
            exec: dir.join(format!("{}-{stamp}.exec.log", job.service)),
        };
        write_header(&logs.build, job, "build", now)?;
        write_header(&logs.exec, job, "exec", now)?;
        Ok(logs)
    }
}

fn write_header(path: &Path, job: &Job, phase: &str, now: DateTime<Local>) -> Result<()> {
    let schedule = if job.is_manual() { "manual" } else { job.schedule.as_str() };
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "=== stackr job {phase} ===")?;
    writeln!(file, "stack:    {}", job.stack)?;
    writeln!(file, "service:  {}", job.service)?;
    writeln!(file, "schedule: {schedule}")?;
    writeln!(file, "started:  {}", now.to_rfc3339())?;
    writeln!(file, "===")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[test]
    fn creates_both_files_with_headers() {
        let dir = TempDir::new().unwrap();
        let job = Job {
            stack: "media".into(),
            service: "backup".into(),
            schedule: "0 3 * * *".into(),
            profile: None,
            run_on_deploy: false,
            compose_path: PathBuf::from("/x"),
        };
        let now = Local.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let logs = JobLogs::create(dir.path(), &job, now).unwrap();
        assert_eq!(
            logs.exec,
            dir.path().join("media/backup-2024-01-02_03-04-05.exec.log")
        );
        let build = std::fs::read_to_string(&logs.build).unwrap();
        assert!(build.starts_with("=== stackr job build ===\nstack:    media\n"));
        assert!(build.contains("schedule: 0 3 * * *\n"));
    }
}
