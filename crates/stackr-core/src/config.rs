use crate::error::{Result, StackrError};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 9000;
pub const DEFAULT_DAEMON_REPO_ROOT: &str = "/srv/stackr_repo";

// ---------------------------------------------------------------------------
// CronConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronConfig {
    #[serde(default = "default_cron_profile")]
    pub profile: String,
    #[serde(default = "default_enable_file_logs")]
    pub enable_file_logs: bool,
    #[serde(default = "default_logs_dir")]
    pub logs_dir: String,
    #[serde(default = "default_container_retention")]
    pub docker_container_retention: usize,
}

fn default_cron_profile() -> String {
    "cron".into()
}

fn default_enable_file_logs() -> bool {
    true
}

fn default_logs_dir() -> String {
    "logs/cron".into()
}

fn default_container_retention() -> usize {
    5
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            profile: default_cron_profile(),
            enable_file_logs: default_enable_file_logs(),
            logs_dir: default_logs_dir(),
            docker_container_retention: default_container_retention(),
        }
    }
}

// ---------------------------------------------------------------------------
// HttpConfig / PathsConfig / RemovalConfig / EnvConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_base_domain")]
    pub base_domain: String,
}

fn default_base_domain() -> String {
    "localhost".into()
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            base_domain: default_base_domain(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_backup_dir")]
    pub backup_dir: String,
    /// Storage pools: NAME -> base path. Each stack gets `<base>/<stack>`.
    #[serde(default)]
    pub pools: BTreeMap<String, String>,
    #[serde(default)]
    pub custom: BTreeMap<String, String>,
}

fn default_backup_dir() -> String {
    "./backups".into()
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            backup_dir: default_backup_dir(),
            pools: BTreeMap::new(),
            custom: BTreeMap::new(),
        }
    }
}

/// Behaviour when a stack disappears from the stacks directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemovalConfig {
    /// Tear the stack down even when archiving its data failed.
    #[serde(default = "default_continue_on_archive_error")]
    pub continue_on_archive_error: bool,
}

fn default_continue_on_archive_error() -> bool {
    true
}

impl Default for RemovalConfig {
    fn default() -> Self {
        Self {
            continue_on_archive_error: default_continue_on_archive_error(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvConfig {
    #[serde(default)]
    pub global: BTreeMap<String, String>,
    #[serde(default)]
    pub stacks: BTreeMap<String, BTreeMap<String, String>>,
}

// ---------------------------------------------------------------------------
// GlobalConfig (.stackr.yaml)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default = "default_stacks_dir")]
    pub stacks_dir: String,
    #[serde(default = "default_remote_stacks_dir")]
    pub remote_stacks_dir: String,
    #[serde(default)]
    pub cron: CronConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub removal: RemovalConfig,
    #[serde(default)]
    pub env: EnvConfig,
}

fn default_stacks_dir() -> String {
    "stacks".into()
}

fn default_remote_stacks_dir() -> String {
    ".stackr-repos".into()
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            stacks_dir: default_stacks_dir(),
            remote_stacks_dir: default_remote_stacks_dir(),
            cron: CronConfig::default(),
            http: HttpConfig::default(),
            paths: PathsConfig::default(),
            removal: RemovalConfig::default(),
            env: EnvConfig::default(),
        }
    }
}

impl GlobalConfig {
    /// Read the global config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(StackrError::InvalidConfig(format!(
                    "failed to read {}: {e}",
                    path.display()
                )))
            }
        };
        if data.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&data).map_err(|e| {
            StackrError::InvalidConfig(format!("failed to parse {}: {e}", path.display()))
        })
    }
}

// ---------------------------------------------------------------------------
// EnvOverrides (STACKR_* process variables)
// ---------------------------------------------------------------------------

/// Process-level settings. Kept separate from [`Config::load`] so tests can
/// build one without touching the real environment.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    pub repo_root: Option<String>,
    pub config_file: Option<String>,
    pub env_file: Option<String>,
    pub stacks_dir: Option<String>,
    pub host_repo_root: Option<String>,
    pub token: Option<String>,
    pub host: Option<String>,
    pub port: Option<String>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        Self {
            repo_root: var("STACKR_REPO_ROOT"),
            config_file: var("STACKR_CONFIG_FILE"),
            env_file: var("STACKR_ENV_FILE"),
            stacks_dir: var("STACKR_STACKS_DIR"),
            host_repo_root: var("STACKR_HOST_REPO_ROOT"),
            token: var("STACKR_TOKEN"),
            host: var("STACKR_HOST"),
            port: var("STACKR_PORT"),
        }
    }
}

fn var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub repo_root: PathBuf,
    pub host_repo_root: PathBuf,
    pub config_path: PathBuf,
    pub env_file: PathBuf,
    pub stacks_dir: PathBuf,
    pub remote_root: PathBuf,
    pub token: Option<String>,
    pub host: String,
    pub port: u16,
    pub global: GlobalConfig,
}

impl Config {
    /// Resolve configuration for `repo_root`. The stacks directory must
    /// exist.
    pub fn load(repo_root: &Path, overrides: &EnvOverrides) -> Result<Self> {
        let config_path = paths::absolute(
            repo_root,
            overrides.config_file.as_deref().unwrap_or(paths::CONFIG_FILE),
        );
        let global = GlobalConfig::load(&config_path)?;

        let env_file = paths::absolute(
            repo_root,
            overrides.env_file.as_deref().unwrap_or(paths::ENV_FILE),
        );

        let stacks_dir = paths::absolute(
            repo_root,
            overrides.stacks_dir.as_deref().unwrap_or(&global.stacks_dir),
        );
        match std::fs::metadata(&stacks_dir) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(StackrError::InvalidConfig(format!(
                    "{} is not a directory",
                    stacks_dir.display()
                )))
            }
            Err(e) => {
                return Err(StackrError::InvalidConfig(format!(
                    "failed to stat stacks dir {}: {e}",
                    stacks_dir.display()
                )))
            }
        }

        let remote_root = paths::absolute(repo_root, &global.remote_stacks_dir);

        let port = match overrides.port.as_deref() {
            Some(raw) => raw
                .parse::<u16>()
                .map_err(|_| StackrError::InvalidConfig(format!("invalid STACKR_PORT '{raw}'")))?,
            None => DEFAULT_PORT,
        };

        Ok(Self {
            repo_root: repo_root.to_path_buf(),
            host_repo_root: overrides
                .host_repo_root
                .as_deref()
                .map(PathBuf::from)
                .unwrap_or_else(|| repo_root.to_path_buf()),
            config_path,
            env_file,
            stacks_dir,
            remote_root,
            token: overrides.token.clone(),
            host: overrides
                .host
                .clone()
                .unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port,
            global,
        })
    }

    /// Like [`Config::load`] but requires a bearer token.
    pub fn load_for_daemon(repo_root: &Path, overrides: &EnvOverrides) -> Result<Self> {
        let config = Self::load(repo_root, overrides)?;
        if config.token.is_none() {
            return Err(StackrError::InvalidConfig("STACKR_TOKEN is required".into()));
        }
        Ok(config)
    }

    pub fn backup_dir(&self) -> PathBuf {
        paths::absolute(&self.repo_root, &self.global.paths.backup_dir)
    }

    pub fn logs_dir(&self) -> PathBuf {
        paths::absolute(&self.repo_root, &self.global.cron.logs_dir)
    }

    /// Storage pools keyed by upper-cased name, resolved to absolute bases.
    pub fn pools(&self) -> Result<BTreeMap<String, PathBuf>> {
        let mut pools = BTreeMap::new();
        for (name, rel) in &self.global.paths.pools {
            let key = name.trim().to_uppercase();
            if key.is_empty() {
                return Err(StackrError::InvalidConfig(
                    "paths.pools contains empty key".into(),
                ));
            }
            pools.insert(key, paths::absolute(&self.repo_root, rel));
        }
        Ok(pools)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Resolve and validate the repository root: an explicit override must be an
/// existing directory, otherwise `fallback` is used.
pub fn resolve_repo_root(explicit: Option<&Path>, fallback: &Path) -> Result<PathBuf> {
    let Some(p) = explicit else {
        return Ok(fallback.to_path_buf());
    };
    let abs = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()?.join(p)
    };
    match std::fs::metadata(&abs) {
        Ok(meta) if meta.is_dir() => Ok(abs),
        Ok(_) => Err(StackrError::InvalidConfig(
            "STACKR_REPO_ROOT must point to a directory".into(),
        )),
        Err(e) => Err(StackrError::InvalidConfig(format!("STACKR_REPO_ROOT: {e}"))),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("stacks")).unwrap();
        dir
    }

    #[test]
    fn missing_config_file_yields_defaults() {
        let dir = repo();
        let cfg = Config::load(dir.path(), &EnvOverrides::default()).unwrap();
        assert_eq!(cfg.global, GlobalConfig::default());
        assert_eq!(cfg.stacks_dir, dir.path().join("stacks"));
        assert_eq!(cfg.env_file, dir.path().join(".env"));
        assert_eq!(cfg.remote_root, dir.path().join(".stackr-repos"));
        assert_eq!(cfg.host, "0.0.0.0");
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.global.cron.docker_container_retention, 5);
        assert!(cfg.global.cron.enable_file_logs);
        assert!(cfg.global.removal.continue_on_archive_error);
    }

    #[test]
    fn partial_yaml_keeps_remaining_defaults() {
        let dir = repo();
        std::fs::write(
            dir.path().join(".stackr.yaml"),
            "cron:\n  docker_container_retention: 2\npaths:\n  pools:\n    hdd: /mnt/hdd\n",
        )
        .unwrap();
        let cfg = Config::load(dir.path(), &EnvOverrides::default()).unwrap();
        assert_eq!(cfg.global.cron.docker_container_retention, 2);
        assert_eq!(cfg.global.cron.profile, "cron");
        assert_eq!(cfg.global.http.base_domain, "localhost");
        let pools = cfg.pools().unwrap();
        assert_eq!(pools.get("HDD"), Some(&PathBuf::from("/mnt/hdd")));
    }

    #[test]
    fn missing_stacks_dir_is_an_error() {
        let dir = TempDir::new().unwrap();
        let err = Config::load(dir.path(), &EnvOverrides::default()).unwrap_err();
        assert!(err.to_string().contains("stacks dir"), "{err}");
    }

    #[test]
    fn stacks_dir_override_wins() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("other")).unwrap();
        let overrides = EnvOverrides {
            stacks_dir: Some("other".into()),
            ..Default::default()
        };
        let cfg = Config::load(dir.path(), &overrides).unwrap();
        assert_eq!(cfg.stacks_dir, dir.path().join("other"));
    }

    #[test]
    fn invalid_yaml_names_the_file() {
        let dir = repo();
        std::fs::write(dir.path().join(".stackr.yaml"), "cron: [unclosed").unwrap();
        let err = Config::load(dir.path(), &EnvOverrides::default()).unwrap_err();
        assert!(err.to_string().contains(".stackr.yaml"), "{err}");
    }

    #[test]
    fn daemon_requires_token() {
        let dir = repo();
        assert!(Config::load_for_daemon(dir.path(), &EnvOverrides::default()).is_err());
        let overrides = EnvOverrides {
            token: Some("secret".into()),
            port: Some("8080".into()),
            ..Default::default()
        };
        let cfg = Config::load_for_daemon(dir.path(), &overrides).unwrap();
        assert_eq!(cfg.token.as_deref(), Some("secret"));
        assert_eq!(cfg.bind_addr(), "0.0.0.0:8080");
    }

    #[test]
    fn invalid_port_is_rejected() {
        let dir = repo();
        let overrides = EnvOverrides {
            port: Some("ninety".into()),
            ..Default::default()
        };
        assert!(Config::load(dir.path(), &overrides).is_err());
    }

    #[test]
    fn resolve_repo_root_rejects_files() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, "").unwrap();
        assert!(resolve_repo_root(Some(&file), dir.path()).is_err());
        assert_eq!(
            resolve_repo_root(Some(dir.path()), Path::new("/nope")).unwrap(),
            dir.path()
        );
        assert_eq!(
            resolve_repo_root(None, Path::new("/fallback")).unwrap(),
            PathBuf::from("/fallback")
        );
    }
}
