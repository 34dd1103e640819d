//! Runtime teardown for a stack that has left the stacks directory.

use crate::compose::PROJECT_LABEL;
use crate::config::Config;
use crate::definition;
use crate::error::Result;
use crate::paths;
use crate::runtime::{RunOptions, StackRuntime};
use std::path::PathBuf;
use std::time::Duration;

pub const CLEANUP_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// How a stack's resources were removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupMethod {
    /// `compose down --volumes --remove-orphans` against a surviving file.
    ComposeDown,
    /// Resources located by the compose project label.
    ProjectLabel,
}

/// Definition files that may still describe `stack`: the local one, then the
/// root of a remote working copy.
fn surviving_definition(config: &Config, stack: &str) -> Option<PathBuf> {
    [
        paths::compose_path(&config.stacks_dir, stack),
        paths::remote_compose_path(&config.remote_root, stack, "."),
    ]
    .into_iter()
    .find(|p| p.is_file())
}

pub async fn cleanup_stack(
    config: &Config,
    runtime: &dyn StackRuntime,
    stack: &str,
    timeout: Duration,
) -> Result<CleanupMethod> {
    let opts = RunOptions::captured(timeout);
    if let Some(compose_path) = surviving_definition(config, stack) {
        tracing::info!(stack, "running compose down for removed stack");
        let def = definition::for_teardown(config, stack, &compose_path)?;
        let args = ["down", "--volumes", "--remove-orphans"].map(String::from);
        runtime.compose(&def, &args, &opts).await?;
        return Ok(CleanupMethod::ComposeDown);
    }

    tracing::info!(stack, "definition file gone, cleaning by project label");
    let filter = format!("label={PROJECT_LABEL}={stack}");
    remove_listed(runtime, &opts, &["ps", "-aq"], &["rm", "-f"], &filter, stack, "containers").await?;
    remove_listed(
        runtime,
        &opts,
        &["volume", "ls", "-q"],
        &["volume", "rm", "-f"],
        &filter,
        stack,
        "volumes",
    )
    .await?;
    // Networks still attached elsewhere refuse removal; that is not fatal.
    if let Err(e) = remove_listed(
        runtime,
        &opts,
        &["network", "ls", "-q"],
        &["network", "rm"],
        &filter,
        stack,
        "networks",
    )
    .await
    {
        tracing::warn!(stack, error = %e, "failed to remove some networks");
    }
    Ok(CleanupMethod::ProjectLabel)
}

async fn remove_listed(
    runtime: &dyn StackRuntime,
    opts: &RunOptions,
    list: &[&str],
    remove: &[&str],
    filter: &str,
    stack: &str,
    kind: &str,
) -> Result<usize> {
    let mut args: Vec<String> = list.iter().map(|a| a.to_string()).collect();
    args.push("--filter".to_string());
    args.push(filter.to_string());
    let listing = runtime.docker(&args, opts).await?;
    let ids: Vec<String> = listing.stdout.split_whitespace().map(str::to_string).collect();
    if ids.is_empty() {
        tracing::debug!(stack, kind, "nothing to remove");
        return Ok(0);
    }

    let mut args: Vec<String> = remove.iter().map(|a| a.to_string()).collect();
    args.extend(ids.iter().cloned());
    runtime.docker(&args, opts).await?;
    tracing::info!(stack, kind, count = ids.len(), "removed");
    Ok(ids.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvOverrides;
    use crate::runtime::tests::FakeRuntime;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> Config {
        std::fs::create_dir_all(dir.path().join("stacks")).unwrap();
        Config::load(dir.path(), &EnvOverrides::default()).unwrap()
    }

    #[tokio::test]
    async fn surviving_file_uses_compose_down() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        std::fs::create_dir_all(dir.path().join(".stackr-repos/app")).unwrap();
        std::fs::write(
            dir.path().join(".stackr-repos/app").join(paths::COMPOSE_FILE),
            "services: {}\n",
        )
        .unwrap();
        let runtime = FakeRuntime::default();

        let method = cleanup_stack(&config, &runtime, "app", CLEANUP_TIMEOUT).await.unwrap();
        assert_eq!(method, CleanupMethod::ComposeDown);
        assert_eq!(runtime.calls(), vec!["compose[app] down --volumes --remove-orphans"]);
    }

    #[tokio::test]
    async fn label_fallback_tolerates_busy_networks() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let runtime = FakeRuntime::default();
        runtime.reply("docker ps", "c1\nc2\n");
        runtime.reply("docker volume ls", "");
        runtime.reply("docker network ls", "n1\n");
        runtime.fail("docker network rm", 1);

        let method = cleanup_stack(&config, &runtime, "gone", CLEANUP_TIMEOUT).await.unwrap();
        assert_eq!(method, CleanupMethod::ProjectLabel);
        assert_eq!(
            runtime.calls(),
            vec![
                "docker ps -aq --filter label=com.docker.compose.project=gone",
                "docker rm -f c1 c2",
                "docker volume ls -q --filter label=com.docker.compose.project=gone",
                "docker network ls -q --filter label=com.docker.compose.project=gone",
                "docker network rm n1",
            ]
        );
    }

    #[tokio::test]
    async fn container_removal_failure_is_an_error() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let runtime = FakeRuntime::default();
        runtime.reply("docker ps", "c1\n");
        runtime.fail("docker rm", 1);
        assert!(cleanup_stack(&config, &runtime, "gone", CLEANUP_TIMEOUT).await.is_err());
    }
}
