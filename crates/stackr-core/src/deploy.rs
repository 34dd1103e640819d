//! Deploy a new image tag to a stack.
//!
//! Sequence: snapshot env file, write the tag variable, resolve the stack,
//! sync its working copy if remote, update it under a deadline. Any failure
//! after the write restores the snapshot, so a reader of the env file sees
//! either the new tag with the stack updated or the file exactly as before.

use crate::envfile::{self, Snapshot};
use crate::error::{Result, StackrError};
use crate::locks::StackLocks;
use crate::process::{CommandOutput, ProcessError};
use crate::remote::RemoteSync;
use crate::runner::StackRunner;
use crate::runtime::RunOptions;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

pub const DEPLOY_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// `<STACK>_IMAGE_TAG`, with characters invalid in a variable name mapped
/// to `_`.
pub fn default_tag_var(stack: &str) -> String {
    let upper: String = stack
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{upper}_IMAGE_TAG")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeployResult {
    pub status: String,
    pub stack: String,
    pub tag: String,
    pub previous_tag: String,
    pub stdout: String,
    /// Non-fatal problems, such as a remote stack deployed from a stale
    /// working copy because the refresh failed.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// A deploy that failed after the env file was touched. The env file has
/// already been restored when this is returned.
#[derive(Debug, Clone, Error, Serialize)]
#[error("{error}: {cause}")]
pub struct DeployError {
    pub error: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    #[serde(skip)]
    pub cause: String,
}

impl DeployError {
    fn new(stack: &str, cause: &StackrError) -> Self {
        let (exit_code, output) = match cause {
            StackrError::Process(p) => (p.exit_code(), p.output().cloned()),
            _ => (1, None),
        };
        let output = output.unwrap_or_else(|| CommandOutput {
            stderr: cause.to_string(),
            ..Default::default()
        });
        Self {
            error: format!("deployment failed for stack={stack}"),
            exit_code: if exit_code == 0 { 1 } else { exit_code },
            stdout: output.stdout,
            stderr: output.stderr,
            cause: cause.to_string(),
        }
    }
}

pub struct Deployer {
    runner: Arc<StackRunner>,
    remote: RemoteSync,
    locks: StackLocks,
    timeout: Duration,
    serial: Mutex<()>,
}

impl Deployer {
    pub fn new(runner: Arc<StackRunner>, remote: RemoteSync, locks: StackLocks) -> Self {
        Self {
            runner,
            remote,
            locks,
            timeout: DEPLOY_TIMEOUT,
            serial: Mutex::new(()),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set `tag_var` (default [`default_tag_var`]) to `tag` and update the
    /// stack. Failures before the env file is written are returned as-is;
    /// later failures roll the file back and come back as
    /// [`StackrError::Deploy`].
    pub async fn deploy(&self, stack: &str, tag_var: Option<&str>, tag: &str) -> Result<DeployResult> {
        let _serial = self.serial.lock().await;
        let _stack_guard = self.locks.acquire(stack).await;

        let env_file = &self.runner.config().env_file;
        let snapshot = Snapshot::capture(env_file)?;
        let tag_var = tag_var
            .map(str::to_string)
            .unwrap_or_else(|| default_tag_var(stack));

        tracing::info!(stack, tag, var = %tag_var, "deploy started");
        let outcome = match envfile::update(env_file, &tag_var, tag) {
            Ok(previous) => self.execute(stack).await.map(|(out, warnings)| (previous, out, warnings)),
            Err(e) => Err(e),
        };

        match outcome {
            Ok((previous_tag, out, warnings)) => {
                tracing::info!(stack, tag, previous_tag = %previous_tag, "deploy succeeded");
                Ok(DeployResult {
                    status: "ok".to_string(),
                    stack: stack.to_string(),
                    tag: tag.to_string(),
                    previous_tag,
                    stdout: out.stdout,
                    warnings,
                })
            }
            Err(cause) => {
                tracing::error!(stack, tag, error = %cause, "deploy failed, restoring env file");
                if let Err(e) = snapshot.restore() {
                    tracing::error!(stack, error = %e, "failed to restore env file");
                }
                Err(DeployError::new(stack, &cause).into())
            }
        }
    }

    async fn execute(&self, name: &str) -> Result<(CommandOutput, Vec<String>)> {
        let stack = self.remote.resolver().resolve(name)?;
        let mut warnings = Vec::new();

        if stack.is_remote() {
            let env = envfile::read_values(&self.runner.config().env_file)?;
            match self.remote.ensure_synced(&stack, &env).await {
                Ok(outcome) if !outcome.cloned && !outcome.refreshed => {
                    tracing::warn!(stack = name, "remote refresh failed, deploying cached working copy");
                    warnings.push("remote refresh failed, deployed cached working copy".to_string());
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(stack = name, error = %e, "remote sync failed, deploying cached working copy");
                    warnings.push(format!("remote sync failed, deployed cached working copy: {e}"));
                }
            }
        }

        let opts = RunOptions::captured(self.timeout);
        match tokio::time::timeout(self.timeout, self.runner.update(&stack, &opts)).await {
            Ok(result) => result.map(|out| (out, warnings)),
            Err(_) => Err(StackrError::Process(ProcessError::TimedOut {
                command: format!("deploy {name}"),
                timeout: self.timeout,
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, EnvOverrides};
    use crate::paths;
    use crate::remote::retry::RetryPolicy;
    use crate::remote::tests::{remote_stack_fixture, FakeGit};
    use crate::runtime::tests::FakeRuntime;
    use crate::stack::Resolver;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    const ENV: &str = "# tags\nWEB_IMAGE_TAG=v1.0.0\n\n# secrets\nexport DB_PASSWORD=\"s3cret\"\nAPP_IMAGE_TAG=v0.9.0\nAPP_VERSION=v1.0.0\n";

    fn setup(runtime: Arc<FakeRuntime>, git: Arc<FakeGit>) -> (TempDir, Deployer) {
        let dir = TempDir::new().unwrap();
        remote_stack_fixture(dir.path(), "myapp", "tag", "${APP_VERSION}");
        let web = dir.path().join("stacks/web");
        std::fs::create_dir_all(&web).unwrap();
        std::fs::write(
            web.join(paths::COMPOSE_FILE),
            "services:\n  web:\n    image: nginx:${WEB_IMAGE_TAG}\n",
        )
        .unwrap();
        std::fs::write(dir.path().join(".env"), ENV).unwrap();

        let config = Arc::new(Config::load(dir.path(), &EnvOverrides::default()).unwrap());
        let runner = Arc::new(StackRunner::new(config.clone(), runtime).with_pull_retry(RetryPolicy::none()));
        let remote = RemoteSync::new(Resolver::from_config(&config), git);
        (dir, Deployer::new(runner, remote, StackLocks::new()))
    }

    #[test]
    fn tag_var_naming() {
        assert_eq!(default_tag_var("web"), "WEB_IMAGE_TAG");
        assert_eq!(default_tag_var("my-app.v2"), "MY_APP_V2_IMAGE_TAG");
    }

    #[tokio::test]
    async fn success_commits_new_tag() {
        let runtime = Arc::new(FakeRuntime::default());
        runtime.reply("compose[web] up -d", "Started\n");
        let (dir, deployer) = setup(runtime, Arc::new(FakeGit::default()));

        let result = deployer.deploy("web", None, "v1.1.0").await.unwrap();
        assert_eq!(result.status, "ok");
        assert_eq!(result.previous_tag, "v1.0.0");
        assert_eq!(result.stdout, "Started\n");
        let env = std::fs::read_to_string(dir.path().join(".env")).unwrap();
        assert!(env.contains("WEB_IMAGE_TAG=v1.1.0\n"));
        assert!(env.contains("export DB_PASSWORD=\"s3cret\"\n"));
    }

    #[tokio::test]
    async fn failure_restores_env_file_byte_for_byte() {
        let runtime = Arc::new(FakeRuntime::default());
        runtime.fail("compose[web] up -d", 17);
        let (dir, deployer) = setup(runtime, Arc::new(FakeGit::default()));
        let env_path = dir.path().join(".env");
        let before = std::fs::read(&env_path).unwrap();

        let err = deployer.deploy("web", None, "v2.0.0").await.unwrap_err();
        let StackrError::Deploy(failure) = err else {
            panic!("expected deploy error, got {err}");
        };
        assert_eq!(failure.error, "deployment failed for stack=web");
        assert_eq!(failure.exit_code, 17);
        assert_eq!(failure.stderr, "boom\n");
        assert!(failure.stdout.contains("up -d"));
        assert_eq!(std::fs::read(&env_path).unwrap(), before);
    }

    #[tokio::test]
    async fn unknown_stack_rolls_back_new_variable() {
        let (dir, deployer) = setup(Arc::new(FakeRuntime::default()), Arc::new(FakeGit::default()));
        let env_path = dir.path().join(".env");
        let before = std::fs::read(&env_path).unwrap();

        let err = deployer.deploy("ghost", None, "v1.0.0").await.unwrap_err();
        assert!(matches!(err, StackrError::Deploy(_)));
        assert_eq!(std::fs::read(&env_path).unwrap(), before);
    }

    #[tokio::test]
    async fn unreadable_env_file_fails_before_any_change() {
        let runtime = Arc::new(FakeRuntime::default());
        let (dir, deployer) = setup(runtime.clone(), Arc::new(FakeGit::default()));
        std::fs::remove_file(dir.path().join(".env")).unwrap();

        let err = deployer.deploy("web", None, "v1.0.0").await.unwrap_err();
        assert!(matches!(err, StackrError::EnvFileUnreadable { .. }));
        assert!(!dir.path().join(".env").exists());
        assert!(runtime.calls().is_empty());
    }

    #[tokio::test]
    async fn remote_deploy_clones_checks_out_and_updates() {
        let runtime = Arc::new(FakeRuntime::default());
        let git = Arc::new(FakeGit::default());
        let (dir, deployer) = setup(runtime.clone(), git.clone());

        let result = deployer
            .deploy("myapp", Some("APP_IMAGE_TAG"), "v1.0.0")
            .await
            .unwrap();
        assert_eq!(result.previous_tag, "v0.9.0");
        assert!(result.warnings.is_empty());
        assert!(git.calls().contains(&"checkout v1.0.0".to_string()));
        assert!(runtime.calls().contains(&"compose[myapp] up -d".to_string()));
        let env = std::fs::read_to_string(dir.path().join(".env")).unwrap();
        assert!(env.contains("APP_IMAGE_TAG=v1.0.0\n"));
    }

    #[tokio::test]
    async fn remote_deploy_degrades_to_cached_copy() {
        let runtime = Arc::new(FakeRuntime::default());
        let git = Arc::new(FakeGit::default());
        let (_dir, deployer) = setup(runtime.clone(), git.clone());
        deployer
            .deploy("myapp", Some("APP_IMAGE_TAG"), "v1.0.0")
            .await
            .unwrap();

        git.offline.store(true, Ordering::SeqCst);
        let result = deployer
            .deploy("myapp", Some("APP_IMAGE_TAG"), "v1.0.1")
            .await
            .unwrap();
        assert_eq!(result.previous_tag, "v1.0.0");
        assert_eq!(
            result.warnings,
            vec!["remote refresh failed, deployed cached working copy"]
        );
        let calls = git.calls();
        assert_eq!(calls[calls.len() - 2..], ["fetch", "checkout v1.0.0"]);
        let ups = runtime
            .calls()
            .iter()
            .filter(|c| c.as_str() == "compose[myapp] up -d")
            .count();
        assert_eq!(ups, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_a_failure() {
        struct Slow;
        #[async_trait::async_trait]
        impl crate::runtime::StackRuntime for Slow {
            async fn compose(
                &self,
                _def: &crate::runtime::StackDefinition,
                _args: &[String],
                _opts: &RunOptions,
            ) -> std::result::Result<CommandOutput, ProcessError> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(CommandOutput::default())
            }
            async fn docker(
                &self,
                _args: &[String],
                _opts: &RunOptions,
            ) -> std::result::Result<CommandOutput, ProcessError> {
                Ok(CommandOutput::default())
            }
        }

        let dir = TempDir::new().unwrap();
        let web = dir.path().join("stacks/web");
        std::fs::create_dir_all(&web).unwrap();
        std::fs::write(web.join(paths::COMPOSE_FILE), "services:\n  web:\n    image: nginx\n").unwrap();
        std::fs::write(dir.path().join(".env"), "WEB_IMAGE_TAG=v1\n").unwrap();
        let config = Arc::new(Config::load(dir.path(), &EnvOverrides::default()).unwrap());
        let runner = Arc::new(StackRunner::new(config.clone(), Arc::new(Slow)));
        let remote = RemoteSync::new(Resolver::from_config(&config), Arc::new(FakeGit::default()));
        let deployer =
            Deployer::new(runner, remote, StackLocks::new()).with_timeout(Duration::from_secs(60));

        let err = deployer.deploy("web", None, "v2").await.unwrap_err();
        assert!(err.to_string().contains("timed out"), "{err}");
        assert_eq!(
            std::fs::read_to_string(dir.path().join(".env")).unwrap(),
            "WEB_IMAGE_TAG=v1\n"
        );
    }
}
