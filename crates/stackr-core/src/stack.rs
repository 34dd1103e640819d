use crate::config::Config;
use crate::error::{Result, StackrError};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// StackKind / ReleaseKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StackKind {
    Local,
    Remote,
}

impl fmt::Display for StackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StackKind::Local => f.write_str("local"),
            StackKind::Remote => f.write_str("remote"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseKind {
    Tag,
    Commit,
}

impl fmt::Display for ReleaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReleaseKind::Tag => f.write_str("tag"),
            ReleaseKind::Commit => f.write_str("commit"),
        }
    }
}

// ---------------------------------------------------------------------------
// RemoteDescriptor (stackr-repo.yml)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Release {
    pub kind: ReleaseKind,
    /// Literal ref or a `${VAR}` template resolved from the env file.
    pub reference: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteDescriptor {
    pub url: String,
    pub branch: String,
    /// Subdirectory holding the definition file; `.` is the repository root.
    pub path: String,
    pub release: Release,
}

#[derive(Deserialize)]
struct RawDescriptor {
    remote_repo: Option<RawRepo>,
}

#[derive(Deserialize)]
struct RawRepo {
    #[serde(default)]
    url: String,
    #[serde(default)]
    branch: String,
    #[serde(default)]
    path: String,
    #[serde(default)]
    release: RawRelease,
}

#[derive(Deserialize, Default)]
struct RawRelease {
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default, rename = "ref")]
    reference: String,
}

impl RemoteDescriptor {
    pub fn parse(stack: &str, text: &str) -> Result<Self> {
        let invalid = |reason: &str| StackrError::InvalidDescriptor {
            stack: stack.to_string(),
            reason: reason.to_string(),
        };

        let raw: RawDescriptor = serde_yaml::from_str(text).map_err(|e| invalid(&e.to_string()))?;
        let repo = raw.remote_repo.ok_or_else(|| invalid("missing remote_repo section"))?;

        let url = repo.url.trim();
        if url.is_empty() {
            return Err(invalid("remote_repo.url is required"));
        }
        let kind = match repo.release.kind.trim() {
            "tag" => ReleaseKind::Tag,
            "commit" => ReleaseKind::Commit,
            "" => return Err(invalid("remote_repo.release.type is required")),
            other => {
                return Err(invalid(&format!(
                    "remote_repo.release.type must be 'tag' or 'commit', got '{other}'"
                )))
            }
        };
        let reference = repo.release.reference.trim();
        if reference.is_empty() {
            return Err(invalid("remote_repo.release.ref is required"));
        }

        let branch = match repo.branch.trim() {
            "" => "main",
            b => b,
        };
        let path = match repo.path.trim() {
            "" => ".",
            p => p,
        };

        Ok(Self {
            url: url.to_string(),
            branch: branch.to_string(),
            path: path.to_string(),
            release: Release {
                kind,
                reference: reference.to_string(),
            },
        })
    }

    pub fn load(stacks_dir: &Path, stack: &str) -> Result<Self> {
        let text = std::fs::read_to_string(paths::descriptor_path(stacks_dir, stack))?;
        Self::parse(stack, &text)
    }
}

// ---------------------------------------------------------------------------
// Stack
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stack {
    pub name: String,
    pub kind: StackKind,
    /// The stack's directory under the stacks dir.
    pub dir: PathBuf,
    /// Definition file; for remote stacks this lives in the working copy.
    pub compose_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteDescriptor>,
}

impl Stack {
    pub fn is_remote(&self) -> bool {
        self.kind == StackKind::Remote
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Classifies stack directories as local or remote.
#[derive(Debug, Clone)]
pub struct Resolver {
    stacks_dir: PathBuf,
    remote_root: PathBuf,
}

impl Resolver {
    pub fn new(stacks_dir: impl Into<PathBuf>, remote_root: impl Into<PathBuf>) -> Self {
        Self {
            stacks_dir: stacks_dir.into(),
            remote_root: remote_root.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.stacks_dir, &config.remote_root)
    }

    pub fn stacks_dir(&self) -> &Path {
        &self.stacks_dir
    }

    pub fn remote_root(&self) -> &Path {
        &self.remote_root
    }

    /// Marker-only classification. `Ok(None)` means "not a stack".
    fn classify(&self, name: &str) -> Result<Option<StackKind>> {
        let has_local = paths::compose_path(&self.stacks_dir, name).is_file();
        let has_remote = paths::descriptor_path(&self.stacks_dir, name).is_file();
        match (has_local, has_remote) {
            (true, true) => Err(StackrError::AmbiguousStack(name.to_string())),
            (true, false) => Ok(Some(StackKind::Local)),
            (false, true) => Ok(Some(StackKind::Remote)),
            (false, false) => Ok(None),
        }
    }

    pub fn resolve(&self, name: &str) -> Result<Stack> {
        paths::validate_stack_name(name)?;
        let dir = paths::stack_dir(&self.stacks_dir, name);
        if !dir.is_dir() {
            return Err(StackrError::StackNotFound(name.to_string()));
        }
        match self.classify(name)? {
            Some(StackKind::Local) => Ok(Stack {
                name: name.to_string(),
                kind: StackKind::Local,
                compose_path: paths::compose_path(&self.stacks_dir, name),
                dir,
                remote: None,
            }),
            Some(StackKind::Remote) => {
                let descriptor = RemoteDescriptor::load(&self.stacks_dir, name)?;
                Ok(Stack {
                    name: name.to_string(),
                    kind: StackKind::Remote,
                    compose_path: paths::remote_compose_path(
                        &self.remote_root,
                        name,
                        &descriptor.path,
                    ),
                    dir,
                    remote: Some(descriptor),
                })
            }
            None => Err(StackrError::UnclassifiedStack(name.to_string())),
        }
    }

    fn candidate_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.stacks_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }

    /// Every stack, sorted by name. An ambiguous directory aborts the whole
    /// pass; directories with neither marker are skipped.
    pub fn discover_all(&self) -> Result<Vec<Stack>> {
        let mut stacks = Vec::new();
        for name in self.candidate_names()? {
            if self.classify(&name)?.is_none() {
                continue;
            }
            stacks.push(self.resolve(&name)?);
        }
        Ok(stacks)
    }

    /// Names of all stack directories, without loading remote descriptors.
    pub fn stack_names(&self) -> Result<BTreeSet<String>> {
        let mut names = BTreeSet::new();
        for name in self.candidate_names()? {
            if self.classify(&name)?.is_some() {
                names.insert(name);
            }
        }
        Ok(names)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
