use crate::process::{self, CommandSpec, ProcessError};
use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound for any single git invocation.
pub const GIT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

// ---------------------------------------------------------------------------
// GitError
// ---------------------------------------------------------------------------

/// A failed git invocation, tagged with the logical operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitError {
    pub operation: String,
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    /// `None` when git never ran to completion (spawn failure, timeout).
    pub exit_code: Option<i32>,
}

impl fmt::Display for GitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return write!(f, "git {} failed: {}", self.operation, stderr);
        }
        match self.exit_code {
            Some(code) => write!(f, "git {} failed with exit code {code}", self.operation),
            None => write!(f, "git {} failed", self.operation),
        }
    }
}

impl std::error::Error for GitError {}

impl GitError {
    pub fn new(operation: &str, stderr: impl Into<String>) -> Self {
        Self {
            operation: operation.to_string(),
            command: format!("git {operation}"),
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code: None,
        }
    }

    fn from_process(operation: &str, command: String, err: ProcessError) -> Self {
        match err {
            ProcessError::Failed { command, output } => Self {
                operation: operation.to_string(),
                command,
                stdout: output.stdout,
                stderr: output.stderr,
                exit_code: Some(output.exit_code),
            },
            other => Self {
                operation: operation.to_string(),
                command,
                stdout: String::new(),
                stderr: other.to_string(),
                exit_code: None,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// GitBackend
// ---------------------------------------------------------------------------

/// Version-control operations needed to maintain remote working copies.
#[async_trait]
pub trait GitBackend: Send + Sync {
    /// Shallow, single-branch clone into `dest`.
    async fn clone_repo(&self, url: &str, branch: &str, dest: &Path) -> Result<(), GitError>;
    async fn fetch_tags(&self, repo: &Path) -> Result<(), GitError>;
    async fn pull(&self, repo: &Path) -> Result<(), GitError>;
    async fn checkout(&self, repo: &Path, reference: &str) -> Result<(), GitError>;
    async fn current_commit(&self, repo: &Path) -> Result<String, GitError>;
    /// Branch name, or `HEAD` when detached.
    async fn current_ref(&self, repo: &Path) -> Result<String, GitError>;
    async fn is_clean(&self, repo: &Path) -> Result<bool, GitError>;
}

/// [`GitBackend`] backed by the `git` binary.
#[derive(Debug, Clone)]
pub struct GitClient {
    binary: PathBuf,
    timeout: Duration,
}

impl Default for GitClient {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("git"),
            timeout: GIT_TIMEOUT,
        }
    }
}

impl GitClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn git(&self, operation: &str, args: Vec<String>) -> Result<String, GitError> {
        let mut env: std::collections::BTreeMap<String, String> = std::env::vars().collect();
        // Never block on an interactive credential prompt.
        env.insert("GIT_TERMINAL_PROMPT".into(), "0".into());

        let spec = CommandSpec::new(self.binary.to_string_lossy(), args)
            .env(env)
            .timeout(self.timeout);
        let command = spec.display();
        match process::run(&spec).await {
            Ok(out) => Ok(out.stdout),
            Err(e) => Err(GitError::from_process(operation, command, e)),
        }
    }

    async fn git_in(
        &self,
        repo: &Path,
        operation: &str,
        args: &[&str],
    ) -> Result<String, GitError> {
        let mut full = vec!["-C".to_string(), repo.to_string_lossy().into_owned()];
        full.extend(args.iter().map(|a| a.to_string()));
        self.git(operation, full).await
    }
}

#[async_trait]
impl GitBackend for GitClient {
    async fn clone_repo(&self, url: &str, branch: &str, dest: &Path) -> Result<(), GitError> {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                GitError::new("clone", format!("failed to create {}: {e}", parent.display()))
            })?;
        }
        let args = vec![
            "clone".to_string(),
            "--branch".to_string(),
            branch.to_string(),
            "--depth".to_string(),
            "1".to_string(),
            url.to_string(),
            dest.to_string_lossy().into_owned(),
        ];
        self.git("clone", args).await.map(|_| ())
    }

    async fn fetch_tags(&self, repo: &Path) -> Result<(), GitError> {
        self.git_in(repo, "fetch", &["fetch", "--tags"])
            .await
            .map(|_| ())
    }

    async fn pull(&self, repo: &Path) -> Result<(), GitError> {
        self.git_in(repo, "pull", &["pull"]).await.map(|_| ())
    }

    async fn checkout(&self, repo: &Path, reference: &str) -> Result<(), GitError> {
        self.git_in(repo, "checkout", &["checkout", reference])
            .await
            .map(|_| ())
    }

    async fn current_commit(&self, repo: &Path) -> Result<String, GitError> {
        let out = self.git_in(repo, "rev-parse", &["rev-parse", "HEAD"]).await?;
        Ok(out.trim().to_string())
    }

    async fn current_ref(&self, repo: &Path) -> Result<String, GitError> {
        let out = self
            .git_in(repo, "rev-parse", &["rev-parse", "--abbrev-ref", "HEAD"])
            .await?;
        Ok(out.trim().to_string())
    }

    async fn is_clean(&self, repo: &Path) -> Result<bool, GitError> {
        let out = self
            .git_in(repo, "status", &["status", "--porcelain"])
            .await?;
        Ok(out.trim().is_empty())
    }
}

/// Working copies are identified solely by a `.git` directory.
pub fn is_cloned(dir: &Path) -> bool {
    dir.join(".git").is_dir()
}
