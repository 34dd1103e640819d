use crate::error::{Result, StackrError};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// File name constants
// ---------------------------------------------------------------------------

pub const COMPOSE_FILE: &str = "docker-compose.yml";
pub const REMOTE_DESCRIPTOR_FILE: &str = "stackr-repo.yml";
pub const DEPLOYMENT_OVERRIDE_FILE: &str = ".stackr-deployment.yaml";

pub const CONFIG_FILE: &str = ".stackr.yaml";
pub const ENV_FILE: &str = ".env";

pub const ARCHIVES_DIR: &str = "archives";

/// Per-stack directories that carry persistent state worth backing up.
pub const PERSISTENT_DIRS: &[&str] = &["config", "dashboards", "dynamic"];

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn stack_dir(stacks_dir: &Path, stack: &str) -> PathBuf {
    stacks_dir.join(stack)
}

pub fn compose_path(stacks_dir: &Path, stack: &str) -> PathBuf {
    stack_dir(stacks_dir, stack).join(COMPOSE_FILE)
}

pub fn descriptor_path(stacks_dir: &Path, stack: &str) -> PathBuf {
    stack_dir(stacks_dir, stack).join(REMOTE_DESCRIPTOR_FILE)
}

pub fn working_copy_dir(remote_root: &Path, stack: &str) -> PathBuf {
    remote_root.join(stack)
}

/// Definition file inside a remote working copy. `subdir` of `""` or `"."`
/// means the repository root.
pub fn remote_compose_path(remote_root: &Path, stack: &str, subdir: &str) -> PathBuf {
    let base = working_copy_dir(remote_root, stack);
    match subdir.trim() {
        "" | "." => base.join(COMPOSE_FILE),
        sub => base.join(sub).join(COMPOSE_FILE),
    }
}

pub fn archive_dir(backup_dir: &Path, stack: &str, timestamp: &str) -> PathBuf {
    backup_dir
        .join(ARCHIVES_DIR)
        .join(format!("{stack}-{timestamp}"))
}

pub fn backup_dest(backup_dir: &Path, timestamp: &str, stack: &str) -> PathBuf {
    backup_dir.join(timestamp).join(stack)
}

pub fn job_log_dir(logs_dir: &Path, stack: &str) -> PathBuf {
    logs_dir.join(stack)
}

/// Resolve `p` against `root` unless it is already absolute. Blank input
/// yields the root itself.
pub fn absolute(root: &Path, p: &str) -> PathBuf {
    let p = p.trim();
    if p.is_empty() {
        return root.to_path_buf();
    }
    let candidate = Path::new(p);
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    }
}

// ---------------------------------------------------------------------------
// Stack name validation
// ---------------------------------------------------------------------------

static STACK_NAME_RE: OnceLock<Regex> = OnceLock::new();

fn stack_name_re() -> &'static Regex {
    STACK_NAME_RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").unwrap())
}

/// Stack names double as directory names and compose project names, so
/// anything that could escape the stacks directory is rejected.
pub fn validate_stack_name(name: &str) -> Result<()> {
    if name.len() > 128 || !stack_name_re().is_match(name) || name.contains("..") {
        return Err(StackrError::InvalidStackName(name.to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_stack_names() {
        for name in ["web", "mx5parts", "my-app_2", "a", "svc.v2"] {
            validate_stack_name(name).unwrap_or_else(|_| panic!("expected valid: {name}"));
        }
    }

    #[test]
    fn invalid_stack_names() {
        for name in ["", "../etc", "a/b", ".hidden", "-dash", "has space", "a..b"] {
            assert!(validate_stack_name(name).is_err(), "expected invalid: {name}");
        }
    }

    #[test]
    fn remote_compose_path_handles_root_subdir() {
        let root = Path::new("/srv/repo/.stackr-repos");
        assert_eq!(
            remote_compose_path(root, "myapp", "."),
            PathBuf::from("/srv/repo/.stackr-repos/myapp/docker-compose.yml")
        );
        assert_eq!(
            remote_compose_path(root, "myapp", ""),
            PathBuf::from("/srv/repo/.stackr-repos/myapp/docker-compose.yml")
        );
        assert_eq!(
            remote_compose_path(root, "myapp", "deploy/prod"),
            PathBuf::from("/srv/repo/.stackr-repos/myapp/deploy/prod/docker-compose.yml")
        );
    }

    #[test]
    fn absolute_resolves_relative_paths() {
        let root = Path::new("/srv/repo");
        assert_eq!(absolute(root, "./backups"), root.join("./backups"));
        assert_eq!(absolute(root, "/mnt/hdd"), PathBuf::from("/mnt/hdd"));
        assert_eq!(absolute(root, "  "), PathBuf::from("/srv/repo"));
    }

    #[test]
    fn archive_dir_layout() {
        assert_eq!(
            archive_dir(Path::new("/b"), "web", "20240101_120000"),
            PathBuf::from("/b/archives/web-20240101_120000")
        );
    }
}
