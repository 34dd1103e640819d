//! Remote stacks: working copies of external repositories checked out at a
//! release resolved from the env file.
//!
//! `RemoteSync::ensure_synced` is the only entry point that mutates a working
//! copy. Clone and checkout failures are fatal; a failed refresh of an
//! existing copy is logged and the stale copy is used.

pub mod error;
pub mod retry;

pub use error::{CloneFailure, RemoteError, RemoteOperation};
pub use retry::{with_backoff, RetryError, RetryPolicy};

use crate::error::{Result, StackrError};
use crate::git::{self, GitBackend};
use crate::paths;
use crate::stack::{ReleaseKind, RemoteDescriptor, Resolver, Stack};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

/// Shortest commit ref treated as an abbreviated hash. Anything shorter must
/// match the full commit exactly before checkout is skipped.
const MIN_COMMIT_PREFIX: usize = 7;

// ---------------------------------------------------------------------------
// Release ref resolution
// ---------------------------------------------------------------------------

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap())
}

/// Substitute `${VAR}` placeholders in `reference` from `env`. A literal ref
/// is returned trimmed and otherwise unchanged.
pub fn resolve_version_ref(reference: &str, env: &BTreeMap<String, String>) -> Result<String> {
    let reference = reference.trim();
    if reference.is_empty() {
        return Err(StackrError::EmptyVersionRef);
    }

    let mut resolved = String::with_capacity(reference.len());
    let mut last = 0;
    for caps in placeholder_re().captures_iter(reference) {
        let Some(whole) = caps.get(0) else { continue };
        let name = &caps[1];
        let value = env
            .get(name)
            .ok_or_else(|| StackrError::UnresolvedVersionRef(name.to_string()))?;
        resolved.push_str(&reference[last..whole.start()]);
        resolved.push_str(value);
        last = whole.end();
    }
    resolved.push_str(&reference[last..]);

    let resolved = resolved.trim().to_string();
    if resolved.is_empty() {
        return Err(StackrError::EmptyVersionRef);
    }
    Ok(resolved)
}

// ---------------------------------------------------------------------------
// Deployment override file
// ---------------------------------------------------------------------------

#[derive(Deserialize, Default)]
struct DeploymentOverride {
    #[serde(default)]
    env: BTreeMap<String, serde_yaml::Value>,
}

fn scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        serde_yaml::Value::Null => Some(String::new()),
        _ => None,
    }
}

/// Layer the working copy's `.stackr-deployment.yaml` `env` map over `base`.
/// The override wins; a missing file leaves `base` unchanged.
pub fn merged_environment(
    stack: &Stack,
    mut base: BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>> {
    let Some(dir) = stack.compose_path.parent() else {
        return Ok(base);
    };
    let path = dir.join(paths::DEPLOYMENT_OVERRIDE_FILE);
    let text = match std::fs::read_to_string(&path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(base),
        Err(e) => return Err(e.into()),
    };
    if text.trim().is_empty() {
        return Ok(base);
    }
    let parsed: DeploymentOverride = serde_yaml::from_str(&text).map_err(|e| {
        StackrError::InvalidConfig(format!("{}: {e}", path.display()))
    })?;
    for (key, value) in parsed.env {
        match scalar_to_string(&value) {
            Some(v) => {
                base.insert(key, v);
            }
            None => tracing::warn!(
                stack = %stack.name,
                key = %key,
                "ignoring non-scalar value in deployment override"
            ),
        }
    }
    Ok(base)
}

// ---------------------------------------------------------------------------
// RemoteSync
// ---------------------------------------------------------------------------

/// What a successful sync did to the working copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncOutcome {
    pub stack: String,
    pub reference: String,
    pub cloned: bool,
    /// False when fetch or pull failed and the existing copy was used.
    pub refreshed: bool,
    pub checked_out: bool,
    pub commit: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteStatus {
    pub stack: String,
    pub url: String,
    pub branch: String,
    pub path: String,
    pub release_type: ReleaseKind,
    pub configured_ref: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_ref: Option<String>,
    pub cloned: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_commit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dirty: Option<bool>,
    pub working_copy: PathBuf,
}

#[derive(Clone)]
pub struct RemoteSync {
    resolver: Resolver,
    git: Arc<dyn GitBackend>,
}

impl RemoteSync {
    pub fn new(resolver: Resolver, git: Arc<dyn GitBackend>) -> Self {
        Self { resolver, git }
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    pub fn working_copy(&self, stack: &str) -> PathBuf {
        paths::working_copy_dir(self.resolver.remote_root(), stack)
    }

    /// Bring the stack's working copy to the release selected by `env`.
    pub async fn ensure_synced(
        &self,
        stack: &Stack,
        env: &BTreeMap<String, String>,
    ) -> Result<SyncOutcome> {
        let descriptor = stack
            .remote
            .as_ref()
            .ok_or_else(|| StackrError::NotRemote(stack.name.clone()))?;
        let reference = resolve_version_ref(&descriptor.release.reference, env)
            .map_err(|e| RemoteError::version_ref(&stack.name, e))?;
        let dir = self.working_copy(&stack.name);

        let mut cloned = false;
        let mut refreshed = true;
        if !git::is_cloned(&dir) {
            tracing::info!(stack = %stack.name, url = %descriptor.url, "cloning remote stack");
            self.git
                .clone_repo(&descriptor.url, &descriptor.branch, &dir)
                .await
                .map_err(|e| {
                    RemoteError::clone_failed(&stack.name, &descriptor.url, &descriptor.branch, e)
                })?;
            cloned = true;
            if let Err(e) = self.git.fetch_tags(&dir).await {
                tracing::warn!(stack = %stack.name, error = %e, "fetching tags after clone failed");
            }
        } else {
            let refresh = async {
                self.git.fetch_tags(&dir).await?;
                self.git.pull(&dir).await
            };
            if let Err(e) = refresh.await {
                let err = RemoteError::pull_failed(&stack.name, e);
                tracing::warn!(stack = %stack.name, error = %err, "using cached working copy");
                refreshed = false;
            }
        }

        let current = self.git.current_commit(&dir).await.unwrap_or_default();
        let already_there = descriptor.release.kind == ReleaseKind::Commit
            && !current.is_empty()
            && (current == reference
                || (reference.len() >= MIN_COMMIT_PREFIX && current.starts_with(&reference)));

        let mut checked_out = false;
        let commit = if already_there {
            tracing::debug!(stack = %stack.name, commit = %current, "already at release commit");
            current
        } else {
            self.git.checkout(&dir, &reference).await.map_err(|e| {
                RemoteError::checkout_failed(&stack.name, &descriptor.url, &reference, e)
            })?;
            checked_out = true;
            self.git.current_commit(&dir).await.unwrap_or_default()
        };

        tracing::info!(stack = %stack.name, reference = %reference, cloned, refreshed, "remote stack synced");
        Ok(SyncOutcome {
            stack: stack.name.clone(),
            reference,
            cloned,
            refreshed,
            checked_out,
            commit,
        })
    }

    /// Resolve `name` as a remote stack and sync it.
    pub async fn sync(&self, name: &str, env: &BTreeMap<String, String>) -> Result<SyncOutcome> {
        let stack = self.remote_stack(name)?;
        self.ensure_synced(&stack, env).await
    }

    pub async fn status(&self, name: &str, env: &BTreeMap<String, String>) -> Result<RemoteStatus> {
        let stack = self.remote_stack(name)?;
        match &stack.remote {
            Some(descriptor) => Ok(self.status_of(&stack, descriptor, env).await),
            None => Err(StackrError::NotRemote(stack.name.clone())),
        }
    }

    /// Status of every remote stack, sorted by name.
    pub async fn list(&self, env: &BTreeMap<String, String>) -> Result<Vec<RemoteStatus>> {
        let mut out = Vec::new();
        for stack in self.resolver.discover_all()? {
            if let Some(descriptor) = &stack.remote {
                out.push(self.status_of(&stack, descriptor, env).await);
            }
        }
        Ok(out)
    }

    /// Delete the working copy. The next sync clones again.
    pub fn clean(&self, name: &str) -> Result<PathBuf> {
        let stack = self.remote_stack(name)?;
        let dir = self.working_copy(&stack.name);
        if !git::is_cloned(&dir) {
            return Err(StackrError::NotCloned(stack.name));
        }
        std::fs::remove_dir_all(&dir).map_err(|e| RemoteError::clean_failed(&stack.name, e))?;
        tracing::info!(stack = %stack.name, dir = %dir.display(), "removed working copy");
        Ok(dir)
    }

    fn remote_stack(&self, name: &str) -> Result<Stack> {
        let stack = self.resolver.resolve(name)?;
        if !stack.is_remote() {
            return Err(StackrError::NotRemote(stack.name));
        }
        Ok(stack)
    }

    async fn status_of(&self, stack: &Stack, descriptor: &RemoteDescriptor, env: &BTreeMap<String, String>) -> RemoteStatus {
        let dir = self.working_copy(&stack.name);
        let cloned = git::is_cloned(&dir);

        let (current_commit, current_ref, dirty) = if cloned {
            (
                self.git
                    .current_commit(&dir)
                    .await
                    .ok()
                    .map(|c| short_commit(&c)),
                self.git.current_ref(&dir).await.ok(),
                self.git.is_clean(&dir).await.ok().map(|clean| !clean),
            )
        } else {
            (None, None, None)
        };

        RemoteStatus {
            stack: stack.name.clone(),
            url: descriptor.url.clone(),
            branch: descriptor.branch.clone(),
            path: descriptor.path.clone(),
            release_type: descriptor.release.kind,
            configured_ref: descriptor.release.reference.clone(),
            resolved_ref: resolve_version_ref(&descriptor.release.reference, env).ok(),
            cloned,
            current_commit,
            current_ref,
            dirty,
            working_copy: dir,
        }
    }
}

fn short_commit(commit: &str) -> String {
    commit.chars().take(8).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::git::GitError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::TempDir;

    pub(crate) const COMMIT: &str = "0123456789abcdef0123456789abcdef01234567";

    /// In-process git double. `clone_repo` materialises a `.git` directory and
    /// a definition file under `path`.
    #[derive(Default)]
    pub(crate) struct FakeGit {
        pub calls: Mutex<Vec<String>>,
        pub offline: AtomicBool,
        pub missing_refs: Mutex<Vec<String>>,
        pub subdir: Mutex<String>,
    }

    impl FakeGit {
        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        fn unreachable(&self, op: &str) -> std::result::Result<(), GitError> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(GitError::new(
                    op,
                    "ssh: Could not resolve hostname github.com: Name or service not known",
                ));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl GitBackend for FakeGit {
        async fn clone_repo(&self, url: &str, branch: &str, dest: &Path) -> std::result::Result<(), GitError> {
            self.record(format!("clone {url} {branch}"));
            self.unreachable("clone")?;
            std::fs::create_dir_all(dest.join(".git")).unwrap();
            let sub = self.subdir.lock().unwrap().clone();
            let def_dir = if sub.is_empty() { dest.to_path_buf() } else { dest.join(sub) };
            std::fs::create_dir_all(&def_dir).unwrap();
            std::fs::write(
                def_dir.join(paths::COMPOSE_FILE),
                "services:\n  app:\n    image: acme/app:${APP_IMAGE_TAG}\n",
            )
            .unwrap();
            Ok(())
        }

        async fn fetch_tags(&self, _repo: &Path) -> std::result::Result<(), GitError> {
            self.record("fetch".into());
            self.unreachable("fetch")
        }

        async fn pull(&self, _repo: &Path) -> std::result::Result<(), GitError> {
            self.record("pull".into());
            self.unreachable("pull")
        }

        async fn checkout(&self, _repo: &Path, reference: &str) -> std::result::Result<(), GitError> {
            self.record(format!("checkout {reference}"));
            if self.missing_refs.lock().unwrap().iter().any(|r| r == reference) {
                return Err(GitError::new(
                    "checkout",
                    format!("error: pathspec '{reference}' did not match any file(s) known to git"),
                ));
            }
            Ok(())
        }

        async fn current_commit(&self, _repo: &Path) -> std::result::Result<String, GitError> {
            Ok(COMMIT.to_string())
        }

        async fn current_ref(&self, _repo: &Path) -> std::result::Result<String, GitError> {
            Ok("HEAD".to_string())
        }

        async fn is_clean(&self, _repo: &Path) -> std::result::Result<bool, GitError> {
            Ok(true)
        }
    }

    pub(crate) fn remote_stack_fixture(
        root: &Path,
        name: &str,
        kind: &str,
        reference: &str,
    ) -> Resolver {
        let stacks = root.join("stacks");
        std::fs::create_dir_all(stacks.join(name)).unwrap();
        std::fs::write(
            stacks.join(name).join(paths::REMOTE_DESCRIPTOR_FILE),
            format!(
                "remote_repo:\n  url: git@github.com:acme/{name}.git\n  release:\n    type: {kind}\n    ref: \"{reference}\"\n"
            ),
        )
        .unwrap();
        Resolver::new(stacks, root.join(".stackr-repos"))
    }

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn resolves_placeholders() {
        let vars = env(&[("V", "v1.2.3")]);
        assert_eq!(resolve_version_ref("${V}", &vars).unwrap(), "v1.2.3");
        assert_eq!(resolve_version_ref("v1.0.0", &BTreeMap::new()).unwrap(), "v1.0.0");
        assert_eq!(resolve_version_ref(" release-${V} ", &vars).unwrap(), "release-v1.2.3");

        let err = resolve_version_ref("${MISSING}", &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, StackrError::UnresolvedVersionRef(ref v) if v == "MISSING"));
        assert!(matches!(
            resolve_version_ref("   ", &vars),
            Err(StackrError::EmptyVersionRef)
        ));
    }

    #[tokio::test]
    async fn first_sync_clones_and_checks_out() {
        let dir = TempDir::new().unwrap();
        let resolver = remote_stack_fixture(dir.path(), "myapp", "tag", "${APP_VERSION}");
        let git = Arc::new(FakeGit::default());
        let sync = RemoteSync::new(resolver, git.clone());

        let out = sync
            .sync("myapp", &env(&[("APP_VERSION", "v1.0.0")]))
            .await
            .unwrap();
        assert!(out.cloned);
        assert!(out.checked_out);
        assert_eq!(out.reference, "v1.0.0");
        assert_eq!(
            git.calls(),
            vec![
                "clone git@github.com:acme/myapp.git main",
                "fetch",
                "checkout v1.0.0"
            ]
        );
        assert!(git::is_cloned(&sync.working_copy("myapp")));
    }

    #[tokio::test]
    async fn refresh_failure_keeps_stale_copy() {
        let dir = TempDir::new().unwrap();
        let resolver = remote_stack_fixture(dir.path(), "myapp", "tag", "${APP_VERSION}");
        let git = Arc::new(FakeGit::default());
        let sync = RemoteSync::new(resolver, git.clone());
        let vars = env(&[("APP_VERSION", "v1.0.0")]);
        sync.sync("myapp", &vars).await.unwrap();

        git.offline.store(true, Ordering::SeqCst);
        let out = sync.sync("myapp", &vars).await.unwrap();
        assert!(!out.cloned);
        assert!(!out.refreshed);
        assert!(out.checked_out);
    }

    #[tokio::test]
    async fn clone_failure_is_fatal_with_network_hint() {
        let dir = TempDir::new().unwrap();
        let resolver = remote_stack_fixture(dir.path(), "myapp", "tag", "v1.0.0");
        let git = Arc::new(FakeGit::default());
        git.offline.store(true, Ordering::SeqCst);
        let sync = RemoteSync::new(resolver, git);

        let err = sync.sync("myapp", &BTreeMap::new()).await.unwrap_err();
        let StackrError::Remote(remote) = err else {
            panic!("expected remote error, got {err}");
        };
        assert_eq!(remote.operation, RemoteOperation::Clone);
        assert!(remote.hint.contains("unreachable"));
    }

    #[tokio::test]
    async fn matching_commit_skips_checkout() {
        let dir = TempDir::new().unwrap();
        let resolver = remote_stack_fixture(dir.path(), "pinned", "commit", "0123456789ab");
        let git = Arc::new(FakeGit::default());
        let sync = RemoteSync::new(resolver, git.clone());

        let out = sync.sync("pinned", &BTreeMap::new()).await.unwrap();
        assert!(!out.checked_out);
        assert!(!git.calls().iter().any(|c| c.starts_with("checkout")));
    }

    #[tokio::test]
    async fn short_commit_ref_still_checks_out() {
        let dir = TempDir::new().unwrap();
        let resolver = remote_stack_fixture(dir.path(), "pinned", "commit", "01");
        let git = Arc::new(FakeGit::default());
        let sync = RemoteSync::new(resolver, git.clone());

        let out = sync.sync("pinned", &BTreeMap::new()).await.unwrap();
        assert!(out.checked_out);
        assert_eq!(git.calls().last().unwrap(), "checkout 01");
    }

    #[tokio::test]
    async fn missing_ref_fails_checkout() {
        let dir = TempDir::new().unwrap();
        let resolver = remote_stack_fixture(dir.path(), "myapp", "tag", "v9.9.9");
        let git = Arc::new(FakeGit::default());
        git.missing_refs.lock().unwrap().push("v9.9.9".into());
        let sync = RemoteSync::new(resolver, git);

        let err = sync.sync("myapp", &BTreeMap::new()).await.unwrap_err();
        let text = err.to_string();
        assert!(text.contains("checkout failed"), "{text}");
        assert!(text.contains("git ls-remote --tags git@github.com:acme/myapp.git"));
    }

    #[tokio::test]
    async fn unresolved_ref_fails_before_cloning() {
        let dir = TempDir::new().unwrap();
        let resolver = remote_stack_fixture(dir.path(), "myapp", "tag", "${APP_VERSION}");
        let git = Arc::new(FakeGit::default());
        let sync = RemoteSync::new(resolver, git.clone());

        let err = sync.sync("myapp", &BTreeMap::new()).await.unwrap_err();
        assert!(err.to_string().contains("APP_VERSION"));
        assert!(git.calls().is_empty());
    }

    #[tokio::test]
    async fn status_clean_and_not_remote() {
        let dir = TempDir::new().unwrap();
        let resolver = remote_stack_fixture(dir.path(), "myapp", "tag", "${APP_VERSION}");
        std::fs::create_dir_all(resolver.stacks_dir().join("web")).unwrap();
        std::fs::write(
            resolver.stacks_dir().join("web").join(paths::COMPOSE_FILE),
            "services: {}\n",
        )
        .unwrap();
        let sync = RemoteSync::new(resolver, Arc::new(FakeGit::default()));

        let before = sync.status("myapp", &BTreeMap::new()).await.unwrap();
        assert!(!before.cloned);
        assert!(before.resolved_ref.is_none());
        assert!(matches!(sync.clean("myapp"), Err(StackrError::NotCloned(_))));

        let vars = env(&[("APP_VERSION", "v2.0.0")]);
        sync.sync("myapp", &vars).await.unwrap();
        let listed = sync.list(&vars).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].current_commit.as_deref(), Some("01234567"));
        assert_eq!(listed[0].resolved_ref.as_deref(), Some("v2.0.0"));

        sync.clean("myapp").unwrap();
        assert!(!git::is_cloned(&sync.working_copy("myapp")));
        assert!(matches!(sync.clean("web"), Err(StackrError::NotRemote(_))));
    }

    #[tokio::test]
    async fn override_file_wins_over_base() {
        let dir = TempDir::new().unwrap();
        let resolver = remote_stack_fixture(dir.path(), "myapp", "tag", "v1");
        let sync = RemoteSync::new(resolver.clone(), Arc::new(FakeGit::default()));
        sync.sync("myapp", &BTreeMap::new()).await.unwrap();
        let stack = resolver.resolve("myapp").unwrap();

        let base = env(&[("REPLICAS", "1"), ("KEEP", "yes")]);
        assert_eq!(merged_environment(&stack, base.clone()).unwrap(), base);

        std::fs::write(
            stack.compose_path.parent().unwrap().join(paths::DEPLOYMENT_OVERRIDE_FILE),
            "env:\n  REPLICAS: 3\n  DEBUG: true\n  NAME: api\n",
        )
        .unwrap();
        let merged = merged_environment(&stack, base).unwrap();
        assert_eq!(merged["REPLICAS"], "3");
        assert_eq!(merged["DEBUG"], "true");
        assert_eq!(merged["NAME"], "api");
        assert_eq!(merged["KEEP"], "yes");
    }
}
