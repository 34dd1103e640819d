use super::job::{parse_container_name, CRON_MARKER};
use crate::error::Result;
use crate::runtime::{RunOptions, StackRuntime};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub kept: usize,
    pub removed: Vec<String>,
}

/// Names of job containers to remove so that at most `retention` remain per
/// `<stack>-<service>`, newest by embedded timestamp first.
pub fn select_for_removal(names: &[String], retention: usize) -> Vec<String> {
    let mut groups: BTreeMap<&str, Vec<(i64, &String)>> = BTreeMap::new();
    for name in names {
        if let Some((prefix, ts)) = parse_container_name(name) {
            groups.entry(prefix).or_default().push((ts, name));
        }
    }
    let mut doomed = Vec::new();
    for (_, mut runs) in groups {
        runs.sort_by(|a, b| b.0.cmp(&a.0));
        doomed.extend(runs.into_iter().skip(retention).map(|(_, n)| n.clone()));
    }
    doomed
}

/// Remove job containers beyond the retention count. A retention of zero
/// disables cleanup.
pub async fn cleanup_containers(runtime: &dyn StackRuntime, retention: usize) -> Result<CleanupReport> {
    if retention == 0 {
        return Ok(CleanupReport::default());
    }
    let quiet = RunOptions::default();
    let listing = runtime
        .docker(
            &[
                "ps".to_string(),
                "-a".to_string(),
                "--filter".to_string(),
                format!("name={CRON_MARKER}"),
                "--format".to_string(),
                "{{.Names}}".to_string(),
            ],
            &quiet,
        )
        .await?;
    let names: Vec<String> = listing
        .stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();

    let doomed = select_for_removal(&names, retention);
    let considered = names
        .iter()
        .filter(|n| parse_container_name(n).is_some())
        .count();
    let mut removed = Vec::with_capacity(doomed.len());
    for name in doomed {
        match runtime.docker(&["rm".to_string(), name.clone()], &quiet).await {
            Ok(_) => removed.push(name),
            Err(err) => tracing::warn!(container = %name, error = %err, "failed to remove job container"),
        }
    }
    if !removed.is_empty() {
        tracing::info!(removed = removed.len(), retention, "removed old job containers");
    }
    Ok(CleanupReport {
        kept: considered - removed.len(),
        removed,
    })
}
