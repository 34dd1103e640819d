use anyhow::Context;
use stackr_core::config::{self, Config, EnvOverrides, DEFAULT_DAEMON_REPO_ROOT};
use std::path::Path;

/// Without `--root` the daemon serves the fixed deployment root rather than
/// searching upward from the working directory.
pub fn run(explicit_root: Option<&Path>) -> anyhow::Result<()> {
    let root = config::resolve_repo_root(explicit_root, Path::new(DEFAULT_DAEMON_REPO_ROOT))?;
    let config = Config::load_for_daemon(&root, &EnvOverrides::from_env())
        .with_context(|| format!("failed to load stackr config from {}", root.display()))?;

    tracing::info!(root = %root.display(), "starting stackr daemon");
    super::block_on(stackr_server::daemon::run(config))?
}
