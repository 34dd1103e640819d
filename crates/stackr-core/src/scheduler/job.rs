use crate::compose::{self, ComposeFile};
use crate::error::{Result, StackrError};
use crate::stack::{Resolver, Stack};
use cron::Schedule;
use serde::Serialize;
use std::path::PathBuf;
use std::str::FromStr;

/// Marks the generated container names of job runs.
pub const CRON_MARKER: &str = "-cron-";

/// A service annotated with `stackr.cron.schedule`. An empty schedule makes
/// a manual-only job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Job {
    pub stack: String,
    pub service: String,
    pub schedule: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    pub run_on_deploy: bool,
    pub compose_path: PathBuf,
}

impl Job {
    pub fn key(&self) -> String {
        format!("{}/{}", self.stack, self.service)
    }

    pub fn is_manual(&self) -> bool {
        self.schedule.trim().is_empty()
    }

    /// `<stack>-<service>-cron-<unix seconds>`
    pub fn container_name(&self, unix_secs: i64) -> String {
        format!("{}-{}{CRON_MARKER}{unix_secs}", self.stack, self.service)
    }

    /// Parsed schedule, `None` for manual-only jobs.
    pub fn parse_schedule(&self) -> Result<Option<Schedule>> {
        if self.is_manual() {
            return Ok(None);
        }
        let expr = normalize_schedule(&self.schedule);
        Schedule::from_str(&expr)
            .map(Some)
            .map_err(|e| StackrError::InvalidSchedule {
                stack: self.stack.clone(),
                service: self.service.clone(),
                reason: format!("'{}': {e}", self.schedule.trim()),
            })
    }
}

/// Standard 5-field expressions gain a leading seconds field; `@` descriptors
/// and 6/7-field expressions pass through.
pub fn normalize_schedule(expr: &str) -> String {
    let expr = expr.trim();
    if expr.starts_with('@') {
        return expr.to_string();
    }
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

/// Jobs declared by one stack's definition file.
pub fn jobs_for_stack(stack: &Stack) -> Result<Vec<Job>> {
    let file = ComposeFile::load(&stack.compose_path)?;
    let mut jobs = Vec::new();
    for (service, meta) in &file.services {
        let Some(schedule) = meta.label(compose::LABEL_CRON_SCHEDULE) else {
            continue;
        };
        let run_on_deploy = match meta.label(compose::LABEL_RUN_ON_DEPLOY) {
            None => false,
            Some(raw) => compose::parse_bool(raw).unwrap_or_else(|| {
                tracing::warn!(
                    stack = %stack.name,
                    service = %service,
                    value = raw,
                    "invalid {} value, treating as false",
                    compose::LABEL_RUN_ON_DEPLOY
                );
                false
            }),
        };
        jobs.push(Job {
            stack: stack.name.clone(),
            service: service.clone(),
            schedule: schedule.trim().to_string(),
            profile: meta.profile().map(str::to_string),
            run_on_deploy,
            compose_path: stack.compose_path.clone(),
        });
    }
    Ok(jobs)
}

/// Every job across all stacks. Stacks whose definition is missing (an
/// uncloned remote) or unreadable are skipped with a warning; an ambiguous
/// stack directory fails the whole pass.
pub fn discover(resolver: &Resolver) -> Result<Vec<Job>> {
    let mut jobs = Vec::new();
    for stack in resolver.discover_all()? {
        if !stack.compose_path.is_file() {
            tracing::debug!(stack = %stack.name, "no definition file, skipping job discovery");
            continue;
        }
        match jobs_for_stack(&stack) {
            Ok(found) => jobs.extend(found),
            Err(e) => tracing::warn!(stack = %stack.name, error = %e, "skipping stack"),
        }
    }
    Ok(jobs)
}

/// Split a job container name into its `<stack>-<service>` prefix and
/// timestamp.
pub fn parse_container_name(name: &str) -> Option<(&str, i64)> {
    let idx = name.rfind(CRON_MARKER)?;
    let ts = name[idx + CRON_MARKER.len()..].parse().ok()?;
    Some((&name[..idx], ts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths;
    use tempfile::TempDir;

    fn job(schedule: &str) -> Job {
        Job {
            stack: "media".into(),
            service: "backup".into(),
            schedule: schedule.into(),
            profile: None,
            run_on_deploy: false,
            compose_path: PathBuf::from("/x/docker-compose.yml"),
        }
    }

    #[test]
    fn schedules_parse_or_name_the_job() {
        assert!(job("*/5 * * * *").parse_schedule().unwrap().is_some());
        assert!(job("@daily").parse_schedule().unwrap().is_some());
        assert!(job("").parse_schedule().unwrap().is_none());
        let err = job("every tuesday").parse_schedule().unwrap_err();
        let text = err.to_string();
        assert!(text.contains("stack=media service=backup"), "{text}");
    }

    #[test]
    fn container_names_round_trip() {
        let name = job("@daily").container_name(1_700_000_000);
        assert_eq!(name, "media-backup-cron-1700000000");
        assert_eq!(parse_container_name(&name), Some(("media-backup", 1_700_000_000)));
        assert_eq!(parse_container_name("media-web-1"), None);
        assert_eq!(parse_container_name("x-cron-notanumber"), None);
    }

    #[test]
    fn discovers_labelled_services() {
        let dir = TempDir::new().unwrap();
        let stacks = dir.path().join("stacks");
        for (name, def) in [
            (
                "media",
                "services:\n  web:\n    image: a\n  backup:\n    image: b\n    profiles: [cron]\n    labels:\n      stackr.cron.schedule: \"0 3 * * *\"\n      stackr.cron.run_on_deploy: \"yes please\"\n  manual:\n    image: c\n    labels: [\"stackr.cron.schedule=\"]\n",
            ),
            ("broken", "services: [nope"),
        ] {
            std::fs::create_dir_all(stacks.join(name)).unwrap();
            std::fs::write(stacks.join(name).join(paths::COMPOSE_FILE), def).unwrap();
        }
        let resolver = Resolver::new(&stacks, dir.path().join(".stackr-repos"));

        let jobs = discover(&resolver).unwrap();
        let keys: Vec<String> = jobs.iter().map(Job::key).collect();
        assert_eq!(keys, vec!["media/backup", "media/manual"]);
        assert_eq!(jobs[0].profile.as_deref(), Some("cron"));
        assert!(!jobs[0].run_on_deploy);
        assert!(jobs[1].is_manual());
    }
}
