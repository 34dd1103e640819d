//! Stack operations on top of a [`StackRuntime`]: update, up, down,
//! passthrough and one-off service runs.

use crate::backup::{self, BackupReport};
use crate::config::Config;
use crate::definition;
use crate::envfile;
use crate::error::{Result, StackrError};
use crate::io;
use crate::process::{CommandOutput, ProcessError};
use crate::remote::retry::{self, RetryPolicy};
use crate::runtime::{RunOptions, StackDefinition, StackRuntime};
use crate::stack::Stack;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Required-variable check for one stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VarsReport {
    pub stack: String,
    pub required: Vec<String>,
    pub missing: Vec<String>,
    /// Whether placeholders were appended to the env file.
    pub added: bool,
}

#[derive(Clone)]
pub struct StackRunner {
    config: Arc<Config>,
    runtime: Arc<dyn StackRuntime>,
    pull_retry: RetryPolicy,
}

impl StackRunner {
    pub fn new(config: Arc<Config>, runtime: Arc<dyn StackRuntime>) -> Self {
        Self {
            config,
            runtime,
            pull_retry: RetryPolicy::default(),
        }
    }

    /// Policy for image pulls during `update`.
    pub fn with_pull_retry(mut self, policy: RetryPolicy) -> Self {
        self.pull_retry = policy;
        self
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn runtime(&self) -> &Arc<dyn StackRuntime> {
        &self.runtime
    }

    pub fn definition(&self, stack: &Stack) -> Result<StackDefinition> {
        if !stack.compose_path.is_file() {
            return Err(StackrError::MissingDefinition {
                stack: stack.name.clone(),
                path: stack.compose_path.clone(),
            });
        }
        definition::build(&self.config, stack)
    }

    // -----------------------------------------------------------------------
    // Required variables
    // -----------------------------------------------------------------------

    /// Compare the variables the definition references with the stack's
    /// environment and add placeholders for missing ones to the env file.
    pub fn get_vars(&self, stack: &Stack) -> Result<VarsReport> {
        let def = self.definition(stack)?;
        self.check_vars(stack, &def)
    }

    fn check_vars(&self, stack: &Stack, def: &StackDefinition) -> Result<VarsReport> {
        let text = std::fs::read_to_string(&def.compose_path)?;
        let required: Vec<String> = envfile::required_vars(&text)
            .into_iter()
            .filter(|v| !envfile::is_storage_var(v))
            .collect();
        let missing: Vec<String> = required
            .iter()
            .filter(|v| def.env.get(*v).map_or(true, |val| val.trim().is_empty()))
            .cloned()
            .collect();

        let env_file = &self.config.env_file;
        let mut added = false;
        if !missing.is_empty() {
            let file = envfile::EnvFile::load(env_file)?;
            let absent: Vec<String> = missing
                .iter()
                .filter(|k| !file.contains_key(k))
                .cloned()
                .collect();
            if let Some(updated) = envfile::add_stack_vars(&file.render(), &stack.name, &absent) {
                io::atomic_write(env_file, updated.as_bytes())?;
                added = true;
            }
        }

        Ok(VarsReport {
            stack: stack.name.clone(),
            required,
            missing,
            added,
        })
    }

    /// Fail with [`StackrError::MissingVars`] unless every referenced
    /// variable is set. Also creates the stack's pool directories.
    fn prepare(&self, stack: &Stack) -> Result<StackDefinition> {
        let def = self.definition(stack)?;
        let report = self.check_vars(stack, &def)?;
        if !report.missing.is_empty() {
            return Err(StackrError::MissingVars {
                stack: stack.name.clone(),
                vars: report.missing,
                env_file: self.config.env_file.clone(),
            });
        }

        let text = std::fs::read_to_string(&def.compose_path)?;
        for (pool, dir) in definition::pool_dirs(&self.config, &stack.name)? {
            if text.contains(&definition::pool_var(&pool)) {
                io::ensure_dir(&dir)?;
            }
        }
        Ok(def)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Pull fresh images and recreate the stack. A fully running stack is
    /// brought down first.
    pub async fn update(&self, stack: &Stack, opts: &RunOptions) -> Result<CommandOutput> {
        let def = self.prepare(stack)?;
        let mut log = CommandOutput::default();

        if self.all_running(&def).await {
            tracing::info!(stack = %stack.name, "stopping running stack before update");
            append(&mut log, self.compose_args(&def, &["down"], opts).await?);
        }

        let pulled = retry::with_backoff(&self.pull_retry, std::future::pending(), |attempt| {
            let def = &def;
            async move {
                tracing::debug!(stack = %def.name, attempt, "pulling images");
                self.compose_args(def, &["pull"], opts).await
            }
        })
        .await
        .map_err(|e| StackrError::Process(e.into_last()))?;
        append(&mut log, pulled);

        append(&mut log, self.compose_args(&def, &["up", "-d"], opts).await?);
        tracing::info!(stack = %stack.name, "stack updated");
        Ok(log)
    }

    /// Start the stack with the images already present.
    pub async fn up(&self, stack: &Stack, opts: &RunOptions) -> Result<CommandOutput> {
        let def = self.prepare(stack)?;
        let out = self.compose_args(&def, &["up", "-d"], opts).await?;
        tracing::info!(stack = %stack.name, "stack up");
        Ok(out)
    }

    pub async fn down(&self, stack: &Stack, opts: &RunOptions) -> Result<CommandOutput> {
        let def = self.definition(stack)?;
        let out = self.compose_args(&def, &["down"], opts).await?;
        tracing::info!(stack = %stack.name, "stack down");
        Ok(out)
    }

    /// Arbitrary compose arguments with the stack's environment.
    pub async fn compose(
        &self,
        stack: &Stack,
        args: &[String],
        opts: &RunOptions,
    ) -> Result<CommandOutput> {
        let def = self.definition(stack)?;
        Ok(self.runtime.compose(&def, args, opts).await?)
    }

    /// One-off `compose run` of `service` in a container named `container`.
    /// The container is kept after exit so it can be inspected.
    pub async fn run_service(
        &self,
        def: &StackDefinition,
        service: &str,
        container: &str,
        command: &[String],
        opts: &RunOptions,
    ) -> std::result::Result<CommandOutput, ProcessError> {
        let mut args = vec![
            "run".to_string(),
            "--name".to_string(),
            container.to_string(),
            service.to_string(),
        ];
        args.extend(command.iter().cloned());
        self.runtime.compose(def, &args, opts).await
    }

    pub fn backup(&self, stack: &Stack) -> Result<BackupReport> {
        backup::backup(&self.config, &stack.name, chrono::Local::now())
    }

    async fn compose_args(
        &self,
        def: &StackDefinition,
        args: &[&str],
        opts: &RunOptions,
    ) -> std::result::Result<CommandOutput, ProcessError> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        self.runtime.compose(def, &args, opts).await
    }

    /// True when the definition has services and all of them are running.
    async fn all_running(&self, def: &StackDefinition) -> bool {
        let quiet = RunOptions::default();
        let Ok(declared) = self
            .compose_args(def, &["config", "--services"], &quiet)
            .await
        else {
            return false;
        };
        let Ok(running) = self
            .compose_args(def, &["ps", "--services", "--filter", "status=running"], &quiet)
            .await
        else {
            return false;
        };
        let declared: BTreeSet<&str> = lines(&declared.stdout).collect();
        let running: BTreeSet<&str> = lines(&running.stdout).collect();
        !declared.is_empty() && declared.is_subset(&running)
    }
}

fn lines(text: &str) -> impl Iterator<Item = &str> {
    text.lines().map(str::trim).filter(|l| !l.is_empty())
}

fn append(log: &mut CommandOutput, out: CommandOutput) {
    log.stdout.push_str(&out.stdout);
    log.stderr.push_str(&out.stderr);
    log.exit_code = out.exit_code;
}
