//! The container-runtime seam. Engines describe what to run; a
//! [`StackRuntime`] decides how. [`ComposeRuntime`] shells out to
//! `docker compose`.

use crate::process::{self, CommandOutput, CommandSpec, OutputMode, ProcessError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// A definition file plus the exact environment it is evaluated with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackDefinition {
    pub name: String,
    pub compose_path: PathBuf,
    pub project_dir: PathBuf,
    pub env: BTreeMap<String, String>,
    /// Activated with `--profile` when set.
    pub profile: Option<String>,
}

impl StackDefinition {
    pub fn with_profile(mut self, profile: Option<&str>) -> Self {
        self.profile = profile.map(str::to_string);
        self
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub timeout: Option<Duration>,
    pub output: OutputMode,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            output: OutputMode::Capture,
        }
    }
}

impl RunOptions {
    pub fn captured(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            output: OutputMode::Capture,
        }
    }

    pub fn inherited() -> Self {
        Self {
            timeout: None,
            output: OutputMode::Inherit,
        }
    }
}

#[async_trait]
pub trait StackRuntime: Send + Sync {
    /// `docker compose` scoped to one stack's project.
    async fn compose(
        &self,
        def: &StackDefinition,
        args: &[String],
        opts: &RunOptions,
    ) -> Result<CommandOutput, ProcessError>;

    /// Plain `docker` for resources that outlive their definition file.
    async fn docker(&self, args: &[String], opts: &RunOptions)
        -> Result<CommandOutput, ProcessError>;
}

/// [`StackRuntime`] backed by the docker CLI.
#[derive(Debug, Clone)]
pub struct ComposeRuntime {
    binary: String,
}

impl Default for ComposeRuntime {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }
}

impl ComposeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails early with a clear message when docker is not installed.
    pub fn detect() -> Result<Self, ProcessError> {
        let path = process::require_binary("docker")?;
        Ok(Self {
            binary: path.to_string_lossy().into_owned(),
        })
    }

    fn spec(&self, args: Vec<String>, opts: &RunOptions) -> CommandSpec {
        let mut spec = CommandSpec::new(self.binary.clone(), args).output(opts.output.clone());
        if let Some(limit) = opts.timeout {
            spec = spec.timeout(limit);
        }
        spec
    }
}

/// Arguments preceding the compose subcommand.
pub fn compose_prefix(def: &StackDefinition) -> Vec<String> {
    let mut args = vec![
        "compose".to_string(),
        "-f".to_string(),
        def.compose_path.to_string_lossy().into_owned(),
        "--project-directory".to_string(),
        def.project_dir.to_string_lossy().into_owned(),
        "-p".to_string(),
        def.name.clone(),
    ];
    if let Some(ref profile) = def.profile {
        args.push("--profile".to_string());
        args.push(profile.clone());
    }
    args
}

#[async_trait]
impl StackRuntime for ComposeRuntime {
    async fn compose(
        &self,
        def: &StackDefinition,
        args: &[String],
        opts: &RunOptions,
    ) -> Result<CommandOutput, ProcessError> {
        let mut full = compose_prefix(def);
        full.extend(args.iter().cloned());
        let spec = self
            .spec(full, opts)
            .cwd(&def.project_dir)
            .env(def.env.clone());
        process::run(&spec).await
    }

    async fn docker(
        &self,
        args: &[String],
        opts: &RunOptions,
    ) -> Result<CommandOutput, ProcessError> {
        process::run(&self.spec(args.to_vec(), opts)).await
    }
}
