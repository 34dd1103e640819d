use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

/// Captured result of a finished child process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputMode {
    /// Collect stdout/stderr into the returned [`CommandOutput`].
    Capture,
    /// Let the child write straight to this process's stdout/stderr.
    Inherit,
    /// Collect output and also append every line to the given file.
    Tee(PathBuf),
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("'{command}' exited with code {}", .output.exit_code)]
    Failed {
        command: String,
        output: CommandOutput,
    },

    #[error("'{command}' timed out after {}s", .timeout.as_secs())]
    TimedOut { command: String, timeout: Duration },

    #[error("'{0}' not found on PATH")]
    NotInstalled(String),

    #[error("failed to open log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl ProcessError {
    /// Output captured before the failure, if the child ran to completion.
    pub fn output(&self) -> Option<&CommandOutput> {
        match self {
            ProcessError::Failed { output, .. } => Some(output),
            _ => None,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.output().map(|o| o.exit_code).unwrap_or(1)
    }
}

// ---------------------------------------------------------------------------
// CommandSpec
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// When set, the child sees exactly this environment.
    pub env: Option<BTreeMap<String, String>>,
    pub timeout: Option<Duration>,
    pub output: OutputMode,
}

impl CommandSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: None,
            env: None,
            timeout: None,
            output: OutputMode::Capture,
        }
    }

    pub fn cwd(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    pub fn env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    pub fn timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }

    pub fn output(mut self, mode: OutputMode) -> Self {
        self.output = mode;
        self
    }

    /// Shell-like rendering for logs and error messages.
    pub fn display(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Run a command to completion. A non-zero exit is an error carrying the
/// captured output; exceeding the timeout kills the child.
pub async fn run(spec: &CommandSpec) -> Result<CommandOutput, ProcessError> {
    let command = spec.display();
    tracing::debug!(command = %command, "running command");

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args).kill_on_drop(true);
    if let Some(ref cwd) = spec.cwd {
        cmd.current_dir(cwd);
    }
    if let Some(ref env) = spec.env {
        cmd.env_clear().envs(env);
    }

    let fut = execute(cmd, &spec.output, &spec.program);
    let output = match spec.timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| ProcessError::TimedOut {
                command: command.clone(),
                timeout: limit,
            })??,
        None => fut.await?,
    };

    if output.exit_code != 0 {
        return Err(ProcessError::Failed { command, output });
    }
    Ok(output)
}

async fn execute(
    mut cmd: Command,
    mode: &OutputMode,
    program: &str,
) -> Result<CommandOutput, ProcessError> {
    let spawn_err = |source| ProcessError::Spawn {
        program: program.to_string(),
        source,
    };

    match mode {
        OutputMode::Capture => {
            let out = cmd
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output()
                .await
                .map_err(spawn_err)?;
            Ok(CommandOutput {
                stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
                exit_code: out.status.code().unwrap_or(-1),
            })
        }
        OutputMode::Inherit => {
            let status = cmd.status().await.map_err(spawn_err)?;
            Ok(CommandOutput {
                exit_code: status.code().unwrap_or(-1),
                ..Default::default()
            })
        }
        OutputMode::Tee(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| ProcessError::LogFile {
                    path: path.clone(),
                    source,
                })?;
            let sink = Arc::new(Mutex::new(file));

            let mut child = cmd
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .map_err(spawn_err)?;

            let stdout_task = tokio::spawn(collect_lines(child.stdout.take(), Arc::clone(&sink)));
            let stderr_task = tokio::spawn(collect_lines(child.stderr.take(), sink));

            let status = child.wait().await.map_err(spawn_err)?;
            let stdout = stdout_task.await.unwrap_or_default();
            let stderr = stderr_task.await.unwrap_or_default();
            Ok(CommandOutput {
                stdout,
                stderr,
                exit_code: status.code().unwrap_or(-1),
            })
        }
    }
}

/// Copy raw lines to the log file and collect them lossily. Undecodable
/// bytes never stop the drain, so the child is not cut off mid-run.
async fn collect_lines<R>(reader: Option<R>, sink: Arc<Mutex<std::fs::File>>) -> String
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return String::new();
    };
    let mut buf = String::new();
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        if let Ok(mut file) = sink.lock() {
            let _ = file.write_all(&line);
            if !line.ends_with(b"\n") {
                let _ = file.write_all(b"\n");
            }
        }
        buf.push_str(&String::from_utf8_lossy(&line));
        if !buf.ends_with('\n') {
            buf.push('\n');
        }
    }
    buf
}

/// Locate `program` on PATH.
pub fn require_binary(program: &str) -> Result<PathBuf, ProcessError> {
    which::which(program).map_err(|_| ProcessError::NotInstalled(program.to_string()))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let out = run(&CommandSpec::new("sh", ["-c", "echo hello; echo oops >&2"]))
            .await
            .unwrap();
        assert_eq!(out.stdout, "hello\n");
        assert_eq!(out.stderr, "oops\n");
        assert_eq!(out.exit_code, 0);
    }

    #[tokio::test]
    async fn non_zero_exit_carries_output() {
        let err = run(&CommandSpec::new("sh", ["-c", "echo partial; exit 3"]))
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 3);
        assert_eq!(err.output().unwrap().stdout, "partial\n");
    }

    #[tokio::test]
    async fn timeout_kills_the_child() {
        let spec = CommandSpec::new("sleep", ["5"]).timeout(Duration::from_millis(50));
        let err = run(&spec).await.unwrap_err();
        assert!(matches!(err, ProcessError::TimedOut { .. }));
    }

    #[tokio::test]
    async fn explicit_env_replaces_inherited_env() {
        let mut env = BTreeMap::new();
        env.insert("ONLY_ME".to_string(), "1".to_string());
        env.insert("PATH".to_string(), std::env::var("PATH").unwrap_or_default());
        let out = run(&CommandSpec::new("sh", ["-c", "echo ${ONLY_ME}-${HOME:-unset}"]).env(env))
            .await
            .unwrap();
        assert_eq!(out.stdout, "1-unset\n");
    }

    #[tokio::test]
    async fn tee_appends_to_log_file() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("run.log");
        std::fs::write(&log, "header\n").unwrap();
        let spec = CommandSpec::new("sh", ["-c", "echo line1"]).output(OutputMode::Tee(log.clone()));
        let out = run(&spec).await.unwrap();
        assert_eq!(out.stdout, "line1\n");
        assert_eq!(std::fs::read_to_string(&log).unwrap(), "header\nline1\n");
    }

    #[tokio::test]
    async fn tee_keeps_draining_past_invalid_utf8() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("run.log");
        let script = "printf 'a\\377b\\n'; i=0; while [ $i -lt 20000 ]; do echo line$i; i=$((i+1)); done; echo done";
        let spec = CommandSpec::new("sh", ["-c", script]).output(OutputMode::Tee(log.clone()));
        let out = run(&spec).await.unwrap();
        assert_eq!(out.exit_code, 0);
        assert!(out.stdout.starts_with("a\u{FFFD}b\n"));
        assert!(out.stdout.ends_with("line19999\ndone\n"));
        let logged = std::fs::read(&log).unwrap();
        assert!(logged.starts_with(b"a\xffb\n"));
        assert!(logged.ends_with(b"done\n"));
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let err = run(&CommandSpec::new("definitely-not-a-real-binary-xyz", Vec::<String>::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
    }
}
