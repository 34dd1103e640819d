pub mod compose;
pub mod daemon;
pub mod deploy;
pub mod init;
pub mod jobs;
pub mod lifecycle;
pub mod remote;
pub mod stacks;

use anyhow::{bail, Context};
use stackr_core::config::{Config, EnvOverrides};
use stackr_core::git::{GitBackend, GitClient};
use stackr_core::runner::StackRunner;
use stackr_core::runtime::{ComposeRuntime, StackRuntime};
use stackr_core::stack::{Resolver, Stack};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

pub(crate) fn load_config(root: &Path) -> anyhow::Result<Arc<Config>> {
    let config = Config::load(root, &EnvOverrides::from_env())
        .with_context(|| format!("failed to load stackr config from {}", root.display()))?;
    Ok(Arc::new(config))
}

/// Drive one async operation to completion on a fresh runtime.
pub(crate) fn block_on<F: Future>(fut: F) -> anyhow::Result<F::Output> {
    let rt = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    Ok(rt.block_on(fut))
}

/// Runtime for commands that invoke docker. Fails up front when the binary
/// is missing.
pub(crate) fn docker() -> anyhow::Result<Arc<dyn StackRuntime>> {
    Ok(Arc::new(ComposeRuntime::detect()?))
}

/// Runtime for commands that only read definitions and never spawn docker.
pub(crate) fn offline() -> Arc<dyn StackRuntime> {
    Arc::new(ComposeRuntime::new())
}

pub(crate) fn git() -> Arc<dyn GitBackend> {
    Arc::new(GitClient::new())
}

pub(crate) fn runner(config: &Arc<Config>, runtime: Arc<dyn StackRuntime>) -> Arc<StackRunner> {
    Arc::new(StackRunner::new(Arc::clone(config), runtime))
}

/// The stacks a multi-stack command applies to: the named ones in order, or
/// every discovered stack with `--all`.
pub(crate) fn select_stacks(
    resolver: &Resolver,
    names: &[String],
    all: bool,
) -> anyhow::Result<Vec<Stack>> {
    match (all, names.is_empty()) {
        (true, false) => bail!("pass stack names or --all, not both"),
        (true, true) => Ok(resolver.discover_all()?),
        (false, true) => bail!("no stacks given (pass stack names or --all)"),
        (false, false) => names
            .iter()
            .map(|name| resolver.resolve(name).map_err(anyhow::Error::from))
            .collect(),
    }
}
