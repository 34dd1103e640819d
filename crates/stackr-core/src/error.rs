use std::path::PathBuf;

use thiserror::Error;

use crate::deploy::DeployError;
use crate::git::GitError;
use crate::remote::RemoteError;
use crate::process::ProcessError;

#[derive(Debug, Error)]
pub enum StackrError {
    #[error("stack '{0}' does not exist")]
    StackNotFound(String),

    #[error(
        "stack '{0}' has both docker-compose.yml and stackr-repo.yml; a stack must be either local or remote"
    )]
    AmbiguousStack(String),

    #[error("stack '{0}' has neither docker-compose.yml nor stackr-repo.yml")]
    UnclassifiedStack(String),

    #[error("invalid stack name '{0}'")]
    InvalidStackName(String),

    #[error("definition file for stack '{stack}' not found at {}", .path.display())]
    MissingDefinition { stack: String, path: PathBuf },

    #[error("stack '{0}' is not a remote stack")]
    NotRemote(String),

    #[error("remote stack '{0}' has not been cloned yet")]
    NotCloned(String),

    #[error("invalid stackr-repo.yml for stack '{stack}': {reason}")]
    InvalidDescriptor { stack: String, reason: String },

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("failed to read env file {path}: {source}")]
    EnvFileUnreadable {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("release ref is empty")]
    EmptyVersionRef,

    #[error("release ref references undefined variable '{0}'")]
    UnresolvedVersionRef(String),

    #[error(
        "missing required environment variables for stack '{stack}': {}\nVariables have been added to {} - fill them in and try again",
        .vars.join(", "),
        .env_file.display()
    )]
    MissingVars {
        stack: String,
        vars: Vec<String>,
        env_file: PathBuf,
    },

    #[error("job not found: stack={stack} service={service} (the service needs a stackr.cron.schedule label)")]
    JobNotFound { stack: String, service: String },

    #[error("invalid cron schedule for stack={stack} service={service}: {reason}")]
    InvalidSchedule {
        stack: String,
        service: String,
        reason: String,
    },

    #[error(transparent)]
    Deploy(#[from] DeployError),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, StackrError>;
