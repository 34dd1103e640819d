use crate::error::StackrError;
use crate::git::GitError;
use std::fmt;

/// Step of remote synchronization that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOperation {
    ResolveRef,
    Clone,
    Pull,
    Checkout,
    Clean,
}

impl fmt::Display for RemoteOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RemoteOperation::ResolveRef => "resolve release ref",
            RemoteOperation::Clone => "clone",
            RemoteOperation::Pull => "pull",
            RemoteOperation::Checkout => "checkout",
            RemoteOperation::Clean => "clean",
        };
        f.write_str(s)
    }
}

/// Coarse cause of a failed clone, used to pick an operator hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneFailure {
    Authentication,
    Network,
    Other,
}

impl CloneFailure {
    pub fn classify(stderr: &str) -> Self {
        let lower = stderr.to_lowercase();
        if lower.contains("permission denied")
            || lower.contains("publickey")
            || lower.contains("authentication failed")
        {
            CloneFailure::Authentication
        } else if lower.contains("could not resolve hostname")
            || lower.contains("could not resolve host")
            || lower.contains("unable to access")
            || lower.contains("connection timed out")
            || lower.contains("network is unreachable")
        {
            CloneFailure::Network
        } else {
            CloneFailure::Other
        }
    }
}

/// Failure of a remote stack operation with an operator-facing hint.
#[derive(Debug)]
pub struct RemoteError {
    pub stack: String,
    pub operation: RemoteOperation,
    pub cause: Box<dyn std::error::Error + Send + Sync>,
    pub hint: String,
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "remote stack '{}': {} failed: {}\n\nHint: {}",
            self.stack, self.operation, self.cause, self.hint
        )
    }
}

impl std::error::Error for RemoteError {}

impl RemoteError {
    pub fn version_ref(stack: &str, cause: StackrError) -> Self {
        let hint = match &cause {
            StackrError::UnresolvedVersionRef(var) => format!(
                "add {var}=<tag or commit> to the env file, or set remote_repo.release.ref to a literal value"
            ),
            _ => "set remote_repo.release.ref in stackr-repo.yml".to_string(),
        };
        Self {
            stack: stack.to_string(),
            operation: RemoteOperation::ResolveRef,
            cause: Box::new(cause),
            hint,
        }
    }

    pub fn clone_failed(stack: &str, url: &str, branch: &str, cause: GitError) -> Self {
        let hint = match CloneFailure::classify(&cause.stderr) {
            CloneFailure::Authentication => format!(
                "check that an SSH key with read access to {url} is loaded (ssh-add -l) and the host key is trusted"
            ),
            CloneFailure::Network => format!(
                "the repository host is unreachable; check DNS and network connectivity for {url}"
            ),
            CloneFailure::Other => {
                format!("verify that {url} exists and has a branch named '{branch}'")
            }
        };
        Self {
            stack: stack.to_string(),
            operation: RemoteOperation::Clone,
            cause: Box::new(cause),
            hint,
        }
    }

    pub fn pull_failed(stack: &str, cause: GitError) -> Self {
        Self {
            stack: stack.to_string(),
            operation: RemoteOperation::Pull,
            cause: Box::new(cause),
            hint: "the existing working copy was kept; check network access to the repository"
                .to_string(),
        }
    }

    pub fn checkout_failed(stack: &str, url: &str, reference: &str, cause: GitError) -> Self {
        Self {
            stack: stack.to_string(),
            operation: RemoteOperation::Checkout,
            cause: Box::new(cause),
            hint: format!(
                "ref '{reference}' may not exist; list available tags with: git ls-remote --tags {url}"
            ),
        }
    }

    pub fn clean_failed(stack: &str, cause: std::io::Error) -> Self {
        Self {
            stack: stack.to_string(),
            operation: RemoteOperation::Clean,
            cause: Box::new(cause),
            hint: "check permissions on the remote stacks directory".to_string(),
        }
    }
}
